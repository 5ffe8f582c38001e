use crate::mocks::{MockNode, WAIT};
use anyhow::{anyhow, Context};
use bytes::Bytes;
use gpool_core::codec::FrameReader;
use gpool_core::metrics::RelayMetrics;
use gpool_core::testing::MemoryLedger;
use gpool_core::{DaemonConfig, NodeConnector, StratumServer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Relay configuration listening on an ephemeral loopback port and pointing at `node`
pub fn test_config(node: SocketAddr) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.stratum_server.address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.stratum_server.port = 0;
    config.node.address = node.ip().to_string();
    config.node.stratum_port = node.port();
    config.node.connect_timeout_secs = 2;
    config.database.url = "sqlite::memory:".to_string();
    config
}

/// A running relay backed by an in-memory ledger
pub struct TestRelay {
    pub addr: SocketAddr,
    pub ledger: Arc<MemoryLedger>,
    pub metrics: RelayMetrics,
    pub server: Arc<StratumServer>,
    shutdown: CancellationToken,
    task: JoinHandle<gpool_core::Result<()>>,
}

impl TestRelay {
    pub async fn start(config: DaemonConfig, ledger: MemoryLedger) -> anyhow::Result<Self> {
        let ledger = Arc::new(ledger);
        let metrics = RelayMetrics::new()?;
        let connector = Arc::new(NodeConnector::new(&config.node));

        let server = Arc::new(StratumServer::bind(&config, ledger.clone(), connector, metrics.clone()).await?);
        let shutdown = CancellationToken::new();
        let task = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(shutdown).await })
        };

        Ok(Self {
            addr: server.local_addr(),
            ledger,
            metrics,
            server,
            shutdown,
            task,
        })
    }

    /// Relay in front of `node` with default settings
    pub async fn in_front_of(node: &MockNode, ledger: MemoryLedger) -> anyhow::Result<Self> {
        Self::start(test_config(node.addr()), ledger).await
    }

    pub async fn connect_miner(&self) -> anyhow::Result<MinerClient> {
        MinerClient::connect(self.addr).await
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.task.await??;
        Ok(())
    }
}

/// Miner side of a connection to the relay
pub struct MinerClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MinerClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: write_half,
        })
    }

    pub async fn send(&mut self, frame: &str) -> anyhow::Result<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn next_frame(&mut self) -> anyhow::Result<Bytes> {
        timeout(WAIT, self.reader.next_frame())
            .await
            .context("timed out waiting for frame from relay")??
            .ok_or_else(|| anyhow!("relay closed the connection"))
    }

    /// True once the relay has closed this connection
    pub async fn is_closed_by_relay(&mut self) -> bool {
        matches!(timeout(WAIT, self.reader.next_frame()).await, Ok(Ok(None)) | Ok(Err(_)))
    }
}

/// Login request as a miner would send it
pub fn login_frame(id: &str, login: &str, pass: &str, agent: &str) -> String {
    serde_json::json!({
        "id": id,
        "jsonrpc": "2.0",
        "method": "login",
        "params": {"login": login, "pass": pass, "agent": agent},
    })
    .to_string()
}

/// Poll `check` until it holds or the wait limit passes
pub async fn eventually(check: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("condition not reached within {:?}", WAIT))
}
