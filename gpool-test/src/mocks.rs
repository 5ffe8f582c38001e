use anyhow::{anyhow, Context};
use bytes::Bytes;
use gpool_core::codec::FrameReader;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// How long helpers wait for traffic before failing a test
pub const WAIT: Duration = Duration::from_secs(5);

/// Stand-in for the mining node: accepts relay links and lets tests script them
pub struct MockNode {
    addr: SocketAddr,
    links: mpsc::UnboundedReceiver<NodeLink>,
    accept_task: JoinHandle<()>,
}

impl MockNode {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, links) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!(%peer, "Mock node accepted relay link");
                let (read_half, write_half) = stream.into_split();
                let link = NodeLink {
                    reader: FrameReader::new(read_half),
                    writer: write_half,
                };
                if tx.send(link).is_err() {
                    break;
                }
            }
        });

        Ok(Self { addr, links, accept_task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next relay link opened towards the node
    pub async fn next_link(&mut self) -> anyhow::Result<NodeLink> {
        timeout(WAIT, self.links.recv())
            .await
            .context("timed out waiting for relay link")?
            .ok_or_else(|| anyhow!("mock node stopped accepting"))
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Node side of one relay link
pub struct NodeLink {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl NodeLink {
    /// Next frame the relay sent, failing if the link closes first
    pub async fn next_frame(&mut self) -> anyhow::Result<Bytes> {
        self.next_frame_within(WAIT)
            .await?
            .ok_or_else(|| anyhow!("relay closed the link"))
    }

    /// Next frame within `limit`; `None` once the relay closes the link
    pub async fn next_frame_within(&mut self, limit: Duration) -> anyhow::Result<Option<Bytes>> {
        let frame = timeout(limit, self.reader.next_frame())
            .await
            .context("timed out waiting for relay frame")??;
        Ok(frame)
    }

    /// Push one newline-terminated frame to the relay
    pub async fn push(&mut self, frame: &str) -> anyhow::Result<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }
}
