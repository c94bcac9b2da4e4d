//! The TCP server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use xtrieve_common::types::SessionId;
use xtrieve_engine::Engine;

use crate::config::ServerConfig;
use crate::session;

/// Accepts connections and spawns one session task per client.
pub struct Server {
    config: ServerConfig,
    engine: Arc<Engine>,
    next_session: AtomicU64,
}

impl Server {
    /// Creates a server around an engine.
    pub fn new(config: ServerConfig, engine: Arc<Engine>) -> Self {
        Self {
            config,
            engine,
            next_session: AtomicU64::new(1),
        }
    }

    /// The engine behind this server.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen))?;
        info!(listen = %self.config.listen, "listening");
        Ok(listener)
    }

    /// Runs the accept loop until the task is cancelled.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    let session = SessionId::new(self.next_session.fetch_add(1, Ordering::SeqCst));
                    let engine = Arc::clone(&self.engine);
                    let data_dir = self.config.data_dir.clone();
                    tokio::spawn(session::run(stream, engine, session, data_dir));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
}
