// TCP listener accepting miner connections
use crate::{
    config::DaemonConfig,
    connection::{ConnectionHandler, RelayContext},
    database::LedgerStore,
    error::{Error, Result},
    metrics::RelayMetrics,
    session::MinerSession,
    types::ConnectionId,
    upstream::UpstreamConnector,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Registry = Arc<RwLock<HashMap<ConnectionId, Arc<MinerSession>>>>;

/// TCP server relaying Stratum miners to the node
pub struct StratumServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: RelayContext,
    max_connections: usize,
    connections: Registry,
}

impl StratumServer {
    /// Bind the listening socket. Failing to bind is fatal for the daemon.
    pub async fn bind(
        config: &DaemonConfig,
        store: Arc<dyn LedgerStore>,
        connector: Arc<dyn UpstreamConnector>,
        metrics: RelayMetrics,
    ) -> Result<Self> {
        let bind_address = config.stratum_server.bind_address();
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind to {}: {}", bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        info!("Stratum server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            ctx: RelayContext {
                settings: Arc::new(config.stratum_server.clone()),
                difficulty: config.node.diff,
                store,
                connector,
                metrics,
            },
            max_connections: config.stratum_server.max_connections,
            connections: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the number of live miner connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Accept miners until `shutdown` fires, then cancel every live connection
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down Stratum server");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if self.connection_count().await >= self.max_connections {
                                warn!(peer = %peer_addr, limit = self.max_connections, "Connection limit reached, refusing miner");
                                self.ctx.metrics.connections_rejected.inc();
                                continue;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(error = %e, "Failed to set TCP_NODELAY on miner socket");
                            }
                            self.spawn_connection(stream, peer_addr).await;
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        let connections = self.connections.read().await;
        for (connection_id, session) in connections.iter() {
            debug!("Closing connection: {}", connection_id);
            session.cancel();
        }
        info!(closed = connections.len(), "Stratum server stopped");

        Ok(())
    }

    async fn spawn_connection(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let connection_id = Uuid::new_v4();
        let session = Arc::new(MinerSession::new(connection_id, peer_addr, self.ctx.difficulty));
        self.connections
            .write()
            .await
            .insert(connection_id, Arc::clone(&session));

        debug!("Accepted connection from {}: {}", peer_addr, connection_id);

        let handler = ConnectionHandler::new(self.ctx.clone(), session);
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
                debug!("Connection handler error for {}: {}", connection_id, e);
            }
            connections.write().await.remove(&connection_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameReader;
    use crate::protocol::login_error_reply;
    use crate::testing::{MemoryLedger, PipeConnector};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn loopback_config(max_connections: usize) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.stratum_server.address = "127.0.0.1".parse().unwrap();
        config.stratum_server.port = 0;
        config.stratum_server.max_connections = max_connections;
        config
    }

    async fn start(max_connections: usize) -> (Arc<StratumServer>, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let (connector, nodes) = PipeConnector::new();
        // Keep node ends open for the lifetime of the test
        tokio::spawn(async move {
            let mut nodes = nodes;
            let mut held = Vec::new();
            while let Some(node) = nodes.recv().await {
                held.push(node);
            }
        });

        let server = StratumServer::bind(
            &loopback_config(max_connections),
            Arc::new(MemoryLedger::with_account("alice", "secret")),
            Arc::new(connector),
            RelayMetrics::new().unwrap(),
        )
        .await
        .unwrap();

        let server = Arc::new(server);
        let shutdown = CancellationToken::new();
        let task = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(shutdown).await })
        };
        (server, shutdown, task)
    }

    async fn wait_for_count(server: &StratumServer, expected: usize) {
        for _ in 0..400 {
            if server.connection_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("connection count never reached {}", expected);
    }

    #[tokio::test]
    async fn test_bind_failure_is_network_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = loopback_config(4);
        config.stratum_server.port = taken.local_addr().unwrap().port();

        let (connector, _nodes) = PipeConnector::new();
        let result = StratumServer::bind(
            &config,
            Arc::new(MemoryLedger::new()),
            Arc::new(connector),
            RelayMetrics::new().unwrap(),
        )
        .await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_serves_miner_over_tcp() {
        let (server, shutdown, task) = start(8).await;
        assert_eq!(server.connection_count().await, 0);

        let miner = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read_half, mut write_half) = miner.into_split();
        let mut replies = FrameReader::new(read_half);
        wait_for_count(&server, 1).await;

        write_half
            .write_all(b"{\"id\":\"1\",\"method\":\"login\",\"params\":{\"login\":\"alice\",\"pass\":\"nope\"}}\n")
            .await
            .unwrap();
        assert_eq!(replies.next_frame().await.unwrap().unwrap(), login_error_reply());

        drop(write_half);
        drop(replies);
        wait_for_count(&server, 0).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, shutdown, task) = start(1).await;

        let _first = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_count(&server, 1).await;

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.connection_count().await, 1);
        assert_eq!(server.ctx.metrics.connections_rejected.get(), 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_connections() {
        let (server, shutdown, task) = start(8).await;

        let mut miner = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_count(&server, 1).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), miner.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        wait_for_count(&server, 0).await;
    }
}
