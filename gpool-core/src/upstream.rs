use crate::codec::{FrameReader, JsonFrameCodec, ReadError};
use crate::config::NodeConfig;
use crate::{Error, Result};
use bytes::Bytes;
use futures::SinkExt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SEND_QUEUE_DEPTH: usize = 256;
const PUSH_QUEUE_DEPTH: usize = 256;

/// Opens upstream links; one call per accepted miner
#[async_trait::async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(&self) -> Result<UpstreamHandle>;
}

/// Connects to the node's stratum port over TCP
#[derive(Debug, Clone)]
pub struct NodeConnector {
    endpoint: String,
    connect_timeout: Duration,
}

impl NodeConnector {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            endpoint: config.stratum_endpoint(),
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for NodeConnector {
    async fn open(&self) -> Result<UpstreamHandle> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| Error::Network(format!("Timed out connecting to node at {}", self.endpoint)))?
            .map_err(|e| Error::Network(format!("Failed to connect to node at {}: {}", self.endpoint, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }

        debug!(endpoint = %self.endpoint, "Opened upstream connection");
        Ok(UpstreamHandle::from_stream(stream))
    }
}

/// Cloneable write side of an upstream link
#[derive(Debug, Clone)]
pub struct UpstreamSender {
    tx: mpsc::Sender<Bytes>,
}

impl UpstreamSender {
    /// Sender whose frames land in the returned receiver instead of a socket
    #[cfg(any(test, feature = "test-utils"))]
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Queue one frame for the node. Fails once the link is closed.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Upstream("link is closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One connection's link to the node.
///
/// Sends are queued to a writer task, so relayed and injected frames reach the node in
/// the order they were sent. Pushed frames go one at a time to the [`on_push`](Self::on_push) callback.
pub struct UpstreamHandle {
    sender: UpstreamSender,
    pushed: Option<mpsc::Receiver<Bytes>>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl UpstreamHandle {
    /// Run the link over any byte stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (push_tx, push_rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
        let stop = CancellationToken::new();

        let writer = tokio::spawn(write_loop(write_half, send_rx, stop.clone()));
        let reader = tokio::spawn(read_loop(read_half, push_tx, stop.clone()));

        Self {
            sender: UpstreamSender { tx: send_tx },
            pushed: Some(push_rx),
            stop,
            tasks: vec![writer, reader],
        }
    }

    pub fn sender(&self) -> UpstreamSender {
        self.sender.clone()
    }

    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.sender.send(frame).await
    }

    /// Spawn the push handler. `callback` runs once per pushed frame, serially, until
    /// `scope` is cancelled or the node closes the link.
    pub fn on_push<F, Fut>(&mut self, scope: CancellationToken, mut callback: F) -> Result<JoinHandle<()>>
    where
        F: FnMut(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pushed = self
            .pushed
            .take()
            .ok_or_else(|| Error::Internal("push handler already registered".to_string()))?;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => break,
                    frame = pushed.recv() => match frame {
                        Some(frame) => callback(frame).await,
                        None => break,
                    },
                }
            }
        });
        Ok(task)
    }

    /// Stop both link tasks and drop the socket. Safe to call more than once.
    pub fn close(&self) {
        if !self.stop.is_cancelled() {
            self.stop.cancel();
            for task in &self.tasks {
                task.abort();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop<W>(io: W, mut rx: mpsc::Receiver<Bytes>, stop: CancellationToken)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut sink = FramedWrite::new(io, JsonFrameCodec::new());
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "Failed to write to upstream, closing send side");
                    break;
                }
            }
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Upstream send side did not shut down cleanly");
    }
}

async fn read_loop<R>(io: R, tx: mpsc::Sender<Bytes>, stop: CancellationToken)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = FrameReader::new(io);
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = reader.next_frame() => next,
        };

        match next {
            Ok(Some(frame)) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("Upstream closed the connection");
                break;
            }
            Err(ReadError::Malformed(msg)) => {
                warn!(error = %msg, "Dropped malformed frame from upstream");
            }
            Err(ReadError::Disconnected(e)) => {
                info!(error = %e, "Upstream disconnected");
                break;
            }
            Err(ReadError::Io(e)) => {
                warn!(error = %e, "Upstream read failed");
                break;
            }
        }
    }
}
