//! `memoh` entry point.
//!
//! Wires the containerd adapter, the Postgres catalogue and the manager,
//! then dispatches the subcommand. Exec forwards the inner process exit
//! code; any other failure exits non-zero with one line on stderr.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use memoh_api::{build_router, ApiServer, ApiState, AuthState};
use memoh_core::config::{Config, LoggingConfig};
use memoh_manager::{ExecRequest, Manager, ManagerConfig};
use memoh_runtime::ContainerdRuntime;
use memoh_store::{Catalogue, PgCatalogue};

use cli::{Cli, Commands};

const STATE_DIR: &str = "/var/lib/memoh/state";

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    if config.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env().context("load configuration")?;
    init_tracing(&config.logging);

    let runtime = ContainerdRuntime::connect(
        config.containerd.socket_path.as_str(),
        config.containerd.namespace.as_str(),
        STATE_DIR,
    )
    .await
    .context("connect containerd")?;
    let runtime = Arc::new(runtime);

    let catalogue: Arc<dyn Catalogue> = Arc::new(
        PgCatalogue::connect(&config.postgres)
            .await
            .context("connect database")?,
    );

    let manager = Arc::new(Manager::new(
        runtime,
        catalogue,
        ManagerConfig::from_config(&config),
    ));

    match cli.command {
        Commands::Init => manager.init().await?,
        Commands::List => {
            for user in manager.list_users().await? {
                println!("{user}");
            }
        }
        Commands::Create { user_id } => manager.ensure_user(&user_id).await?,
        Commands::Start { user_id } => manager.start(&user_id).await?,
        Commands::Stop { user_id, timeout } => manager.stop(&user_id, timeout).await?,
        Commands::Delete { user_id } => manager.delete(&user_id).await?,
        Commands::Exec {
            user_id,
            cwd,
            tty,
            env,
            command,
        } => {
            let result = manager
                .exec(ExecRequest {
                    user_id,
                    command,
                    env,
                    work_dir: cwd,
                    terminal: tty,
                    use_stdio: true,
                })
                .await?;
            if result.exit_code != 0 {
                std::process::exit(result.exit_code as i32);
            }
        }
        Commands::VersionCreate { user_id } => {
            let row = manager.create_version(&user_id).await?;
            println!("version {} -> {}", row.version, row.snapshot_id);
        }
        Commands::VersionList { user_id } => {
            for row in manager.list_versions(&user_id).await? {
                println!(
                    "{}\t{}\t{}",
                    row.version,
                    row.snapshot_id,
                    row.created_at.to_rfc3339()
                );
            }
        }
        Commands::VersionRollback { user_id, version } => {
            manager.rollback(&user_id, version).await?;
        }
        Commands::Serve => {
            let auth_state = AuthState {
                jwt_secret: config.auth.jwt_secret.clone(),
                jwt_expires_in: config.auth.jwt_expiry()?,
            };
            let router = build_router(
                ApiState {
                    manager: manager.clone(),
                },
                auth_state,
                config.http.swagger_enabled,
            );
            ApiServer::new(config.http.listen_addr(), router)
                .run()
                .await?;
        }
    }

    Ok(())
}
