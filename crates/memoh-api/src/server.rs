//! HTTP server.

use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use memoh_core::{Error, Result};

/// API server wrapping an axum router.
pub struct ApiServer {
    addr: String,
    router: Router,
}

impl ApiServer {
    pub fn new(addr: impl Into<String>, router: Router) -> Self {
        Self {
            addr: addr.into(),
            router,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Serve until the process is terminated.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| Error::internal(format!("bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "starting API server");
        axum::serve(listener, self.router)
            .await
            .map_err(|e| Error::internal(format!("serve: {e}")))
    }

    /// Serve until `shutdown` completes.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| Error::internal(format!("bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "starting API server");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::internal(format!("serve: {e}")))?;
        info!("API server shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::time::Duration;

    #[tokio::test]
    async fn starts_and_shuts_down() {
        let router = Router::new().route("/ping", get(|| async { "ok" }));
        let server = ApiServer::new("127.0.0.1:0", router);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run_with_shutdown(async move {
                    let _ = rx.await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(());

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should shut down")
            .expect("server task should not panic");
        assert!(result.is_ok());
    }
}
