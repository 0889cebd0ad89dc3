//! folio interactive workbook server.
//!
//! Provides a WebSocket server for real-time workbook interaction.
//!
//! # Architecture
//!
//! The server consists of:
//! - **Session**: One evaluation service shared by every client
//! - **Protocol**: Client/server message types
//! - **Routes**: HTTP and WebSocket handlers

pub mod error;
pub mod protocol;
pub mod routes;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use folio_core::WorkbookConfig;

pub use error::{ServerError, ServerResult};
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::{AppState, create_router};
pub use session::WorkbookSession;

/// Environment variable overriding the listen port.
pub const PORT_ENV: &str = "FOLIO_PORT";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    /// Defaults, with the port taken from `FOLIO_PORT` when it parses.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = std::env::var(PORT_ENV).ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }

    pub fn address(&self) -> ServerResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }
}

/// Serve an empty workbook until Ctrl+C.
pub async fn serve(config: ServerConfig, workbook: WorkbookConfig) -> ServerResult<()> {
    let addr = config.address()?;

    let (session, _rx) = WorkbookSession::from_config(&workbook);
    let session = Arc::new(session);
    let state = Arc::new(AppState {
        session: session.clone(),
    });
    let app = create_router(state);

    tracing::info!("Starting folio server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    session.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.address().unwrap().port(), 3000);
    }

    #[test]
    fn test_bad_address() {
        let config = ServerConfig {
            host: "not an address".to_string(),
            port: 1,
        };
        assert!(matches!(config.address(), Err(ServerError::InvalidAddress(_))));
    }
}
