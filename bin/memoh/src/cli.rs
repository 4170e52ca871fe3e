//! CLI argument definitions for the `memoh` entry point.

use clap::{Parser, Subcommand};
use std::time::Duration;

/// Per-user sandbox containers with versioned filesystems.
#[derive(Parser)]
#[command(name = "memoh", version, about = "memoh user sandbox manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull the base image if absent
    Init,

    /// List known users
    List,

    /// Create a user's container
    Create { user_id: String },

    /// Start a user's container
    Start { user_id: String },

    /// Stop a user's container
    Stop {
        user_id: String,

        /// How long to wait before SIGKILL
        #[arg(long, default_value = "10s", value_parser = parse_duration)]
        timeout: Duration,
    },

    /// Delete a user's container and its catalogue rows
    Delete { user_id: String },

    /// Execute a command inside a user's container
    Exec {
        user_id: String,

        /// Working directory inside the container
        #[arg(long)]
        cwd: Option<String>,

        /// Allocate a terminal
        #[arg(long)]
        tty: bool,

        /// Environment variable, repeatable (K=V)
        #[arg(long = "env")]
        env: Vec<String>,

        /// Command and arguments (after --)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Commit the current filesystem state as a new version
    VersionCreate { user_id: String },

    /// List versions of a user's container
    VersionList { user_id: String },

    /// Roll a user's container back to a version
    VersionRollback { user_id: String, version: i32 },

    /// Start the HTTP server
    Serve,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stop_with_timeout() {
        let cli = Cli::try_parse_from(["memoh", "stop", "alice", "--timeout", "30s"]).unwrap();
        match cli.command {
            Commands::Stop { user_id, timeout } => {
                assert_eq!(user_id, "alice");
                assert_eq!(timeout, Duration::from_secs(30));
            }
            _ => panic!("expected stop"),
        }
    }

    #[test]
    fn stop_timeout_defaults_to_ten_seconds() {
        let cli = Cli::try_parse_from(["memoh", "stop", "alice"]).unwrap();
        match cli.command {
            Commands::Stop { timeout, .. } => assert_eq!(timeout, Duration::from_secs(10)),
            _ => panic!("expected stop"),
        }
    }

    #[test]
    fn parses_exec_with_flags_and_command() {
        let cli = Cli::try_parse_from([
            "memoh", "exec", "alice", "--cwd", "/data", "--tty", "--env", "A=1", "--env", "B=2",
            "--", "sh", "-c", "echo hi",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec {
                user_id,
                cwd,
                tty,
                env,
                command,
            } => {
                assert_eq!(user_id, "alice");
                assert_eq!(cwd.as_deref(), Some("/data"));
                assert!(tty);
                assert_eq!(env, vec!["A=1", "B=2"]);
                assert_eq!(command, vec!["sh", "-c", "echo hi"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn exec_requires_command() {
        assert!(Cli::try_parse_from(["memoh", "exec", "alice"]).is_err());
    }

    #[test]
    fn parses_version_rollback() {
        let cli = Cli::try_parse_from(["memoh", "version-rollback", "alice", "2"]).unwrap();
        match cli.command {
            Commands::VersionRollback { user_id, version } => {
                assert_eq!(user_id, "alice");
                assert_eq!(version, 2);
            }
            _ => panic!("expected version-rollback"),
        }
    }
}
