//! chanfs server - accepts TCP connections and runs one transfer per connection

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use chanfs_core::Config;

use crate::engine::{EngineConfig, TransferEngine};
use crate::storage::Storage;

/// How long shutdown waits for in-flight transfers
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// chanfs transfer server
pub struct TransferServer {
    bind_addr: SocketAddr,
    max_connections: usize,
    engine: Arc<TransferEngine>,
    connection_semaphore: Arc<Semaphore>,
}

impl TransferServer {
    pub fn new(config: &Config, storage: Arc<dyn Storage>) -> Self {
        let max_connections = config.server.max_connections.max(1);

        Self {
            bind_addr: config.server.bind_addr(),
            max_connections,
            engine: Arc::new(TransferEngine::new(storage, EngineConfig::from(config))),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.bind_addr,
                source,
            })
    }

    /// Bind and serve until Ctrl-C
    pub async fn serve(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve connections from `listener` until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr().ok();
        info!(
            "chanfs listening on {} (buffer {} bytes, max {} connections)",
            local.map(|a| a.to_string()).unwrap_or_else(|| self.bind_addr.to_string()),
            self.engine.config().buffer_size,
            self.max_connections
        );

        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer).await,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match self.connection_semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection semaphore closed, dropping {}", peer);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }

        let engine = self.engine.clone();
        tokio::spawn(async move {
            debug!("New connection from {}", peer);
            let peer_name = peer.to_string();

            let transfer = tokio::spawn(async move { engine.run(stream, &peer_name).await });
            match transfer.await {
                Ok(outcome) => debug!(
                    "Connection from {} finished: {} ({} bytes)",
                    peer, outcome.state, outcome.bytes
                ),
                Err(e) if e.is_panic() => error!("Transfer task for {} panicked", peer),
                Err(e) => warn!("Transfer task for {} cancelled: {}", peer, e),
            }

            drop(permit);
        });
    }

    /// Wait for in-flight connections to finish
    async fn drain(&self) {
        let all = self.max_connections as u32;
        match tokio::time::timeout(DRAIN_TIMEOUT, self.connection_semaphore.acquire_many(all)).await
        {
            Ok(_) => debug!("All connections drained"),
            Err(_) => warn!(
                "{} connection(s) still active after {:?}",
                self.max_connections - self.connection_semaphore.available_permits(),
                DRAIN_TIMEOUT
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{recv_message, send_message};
    use crate::storage::FsStorage;
    use chanfs_core::{Action, ErrorCode, FileInfo, Message};
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    async fn start() -> (TempDir, SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".parse().unwrap();
        config.server.port = 0;
        config.storage.root = temp.path().join("fs");

        let storage = FsStorage::from_config(&config.storage);
        storage.prepare().await.unwrap();

        let server = TransferServer::new(&config, Arc::new(storage));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(listener, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        (temp, addr, tx, handle)
    }

    #[tokio::test]
    async fn test_serves_multiple_connections() {
        let (_temp, addr, tx, handle) = start().await;

        for _ in 0..3 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            send_message(&mut conn, &Message::start(Action::Download, FileInfo::new("missing", 0)))
                .await
                .unwrap();
            match recv_message(&mut conn).await.unwrap() {
                Message::Error(e) => assert_eq!(e.code, ErrorCode::NotFound),
                other => panic!("expected Error, got {:?}", other),
            }
        }

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (_temp, addr, tx, handle) = start().await;

        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_error() {
        let temp = TempDir::new().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = Config::default();
        config.server.bind = "127.0.0.1".parse().unwrap();
        config.server.port = taken.local_addr().unwrap().port();

        let storage = FsStorage::new(temp.path(), ["main"]);
        let server = TransferServer::new(&config, Arc::new(storage));
        assert!(matches!(server.bind().await, Err(ServerError::Bind { .. })));
    }
}
