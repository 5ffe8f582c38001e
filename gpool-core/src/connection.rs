use crate::classify::{classify, record};
use crate::codec::{FrameReader, JsonFrameCodec, ReadError};
use crate::config::StratumServerConfig;
use crate::database::LedgerStore;
use crate::heartbeat::spawn_heartbeat;
use crate::logging::connection_span;
use crate::metrics::RelayMetrics;
use crate::protocol::{login_error_reply, LoginParams, StratumRequest, StratumResponse};
use crate::session::{LoginCommit, MinerSession};
use crate::types::VerifyResult;
use crate::upstream::{UpstreamConnector, UpstreamHandle, UpstreamSender};
use crate::{Error, Result};
use bytes::Bytes;
use futures::SinkExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, info, warn, Instrument};

/// Collaborators shared by every connection of a server
#[derive(Clone)]
pub struct RelayContext {
    pub settings: Arc<StratumServerConfig>,
    /// Difficulty assigned to new sessions
    pub difficulty: u64,
    pub store: Arc<dyn LedgerStore>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub metrics: RelayMetrics,
}

type MinerSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonFrameCodec>;
type PushFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Write side of the miner socket, shared by the read loop and the push handler
#[derive(Clone)]
struct MinerWriter {
    sink: Arc<Mutex<MinerSink>>,
}

impl MinerWriter {
    fn new(io: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(FramedWrite::new(io, JsonFrameCodec::new()))),
        }
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| Error::Network(format!("Failed to write to miner: {}", e)))
    }
}

/// Cancels the session and closes the upstream link however the read loop exits
struct Teardown {
    session: Arc<MinerSession>,
    upstream: UpstreamHandle,
    metrics: RelayMetrics,
    opened_at: Instant,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.session.cancel();
        self.upstream.close();
        self.metrics.record_connection_close(self.opened_at.elapsed());
        debug!("Connection torn down");
    }
}

/// Connection handler for an individual miner
pub struct ConnectionHandler {
    ctx: RelayContext,
    session: Arc<MinerSession>,
}

impl ConnectionHandler {
    pub fn new(ctx: RelayContext, session: Arc<MinerSession>) -> Self {
        Self { ctx, session }
    }

    /// Serve the miner until it disconnects or the session is cancelled
    pub async fn handle<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = connection_span(self.session.conn_id(), self.session.peer_addr());
        self.serve(stream).instrument(span).await
    }

    async fn serve<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut upstream = match self.ctx.connector.open().await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, "Failed to open upstream link, closing miner connection");
                self.ctx.metrics.record_error(&e);
                self.session.cancel();
                return Err(e);
            }
        };
        self.ctx.metrics.record_connection_open();
        info!("Miner connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let writer = MinerWriter::new(Box::new(write_half));
        let upstream_tx = upstream.sender();

        upstream.on_push(self.session.cancellation(), self.push_handler(writer.clone()))?;

        let _teardown = Teardown {
            session: Arc::clone(&self.session),
            upstream,
            metrics: self.ctx.metrics.clone(),
            opened_at: Instant::now(),
        };

        self.read_loop(read_half, &writer, &upstream_tx).await;
        info!("Miner disconnected");
        Ok(())
    }

    /// Callback run for every frame the node pushes: forward first, then classify
    fn push_handler(
        &self,
        writer: MinerWriter,
    ) -> impl FnMut(Bytes) -> PushFuture + Send + 'static {
        let session = Arc::clone(&self.session);
        let store = Arc::clone(&self.ctx.store);
        let metrics = self.ctx.metrics.clone();
        let span = tracing::Span::current();

        move |frame: Bytes| -> PushFuture {
            let session = Arc::clone(&session);
            let store = Arc::clone(&store);
            let metrics = metrics.clone();
            let writer = writer.clone();

            Box::pin(
                async move {
                    match writer.send(frame.clone()).await {
                        Ok(()) => metrics.frames_forwarded_total.inc(),
                        Err(e) => {
                            debug!(error = %e, "Dropped frame for departed miner");
                            metrics.record_error(&e);
                        }
                    }

                    let response = match StratumResponse::from_slice(&frame) {
                        Ok(response) => response,
                        Err(e) => {
                            warn!(error = %e, "Could not classify frame from node");
                            return;
                        }
                    };

                    let identity = session.snapshot();
                    let classification = classify(&response, &identity);
                    if let Err(e) = record(store.as_ref(), &identity, session.difficulty(), classification, &metrics).await {
                        if e.is_recoverable() {
                            warn!(error = %e, method = %response.method, "Failed to record node response");
                        } else {
                            error!(error = %e, method = %response.method, "Ledger rejected node response");
                        }
                        metrics.record_error(&e);
                    }
                }
                .instrument(span.clone()),
            )
        }
    }

    async fn read_loop<R>(&self, io: R, writer: &MinerWriter, upstream: &UpstreamSender)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = FrameReader::new(io);
        let cancel = self.session.cancellation();
        let max_read_errors = self.ctx.settings.max_read_errors;
        let mut read_errors = 0u32;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Connection cancelled");
                    break;
                }
                next = reader.next_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => {
                    read_errors = 0;
                    frame
                }
                Ok(None) => break,
                Err(ReadError::Disconnected(e)) => {
                    debug!(error = %e, "Miner went away");
                    break;
                }
                Err(ReadError::Malformed(msg)) => {
                    debug!(error = %msg, "Dropped malformed frame");
                    self.ctx.metrics.frames_dropped_total.inc();
                    continue;
                }
                Err(ReadError::Io(e)) => {
                    read_errors += 1;
                    warn!(error = %e, consecutive = read_errors, "Failed to read from miner");
                    if read_errors > max_read_errors {
                        warn!("Too many consecutive read errors, closing connection");
                        break;
                    }
                    continue;
                }
            };

            let request = match StratumRequest::from_slice(&frame) {
                Ok(request) => request,
                Err(e) => {
                    debug!(error = %e, "Dropped frame that is not a request");
                    self.ctx.metrics.frames_dropped_total.inc();
                    continue;
                }
            };

            if request.is_login() {
                self.handle_login(&request, frame, writer, upstream).await;
            } else {
                if !self.session.snapshot().is_authenticated() {
                    warn!(method = %request.method, "Request before login");
                }
                self.relay(frame, upstream).await;
            }
        }
    }

    async fn handle_login(&self, request: &StratumRequest, frame: Bytes, writer: &MinerWriter, upstream: &UpstreamSender) {
        let credentials = LoginParams::from_params(request.params.as_ref()).normalize();
        let metrics = &self.ctx.metrics;

        let verdict = match self.ctx.store.verify(&credentials.login, &credentials.pass).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(login = %credentials.login, error = %e, "Credential check failed, rejecting login");
                metrics.record_error(&e);
                VerifyResult::Wrong
            }
        };

        match verdict {
            VerifyResult::Wrong => {
                info!(login = %credentials.login, "Login incorrect");
                metrics.record_login("wrong");
                self.reply(login_error_reply(), writer).await;
                return;
            }
            VerifyResult::Absent => {
                if let Err(e) = self.ctx.store.register(&credentials.login, &credentials.pass, "").await {
                    warn!(login = %credentials.login, error = %e, "Failed to register miner");
                    metrics.record_error(&e);
                }
                metrics.record_login("registered");
            }
            VerifyResult::Correct => metrics.record_login("correct"),
        }

        let offered_agent = credentials.agent.clone();
        let agent = match self.session.commit_login(credentials.login, credentials.agent) {
            LoginCommit::Committed => {
                let identity = self.session.snapshot();
                info!(login = %identity.login, agent = %identity.agent, "Miner logged in");
                identity.agent
            }
            LoginCommit::AlreadyAuthenticated => {
                debug!("Session already logged in, identity unchanged");
                self.session.snapshot().agent
            }
            LoginCommit::EmptyLogin => {
                info!(agent = %offered_agent, "Login without a login name, session stays unauthenticated");
                offered_agent
            }
        };

        if self.ctx.settings.omits_status_for(&agent) {
            debug!(agent = %agent, "Status polling disabled for agent");
        } else if self.session.claim_heartbeat() {
            spawn_heartbeat(
                upstream.clone(),
                self.session.cancellation(),
                self.ctx.settings.status_interval(),
                metrics.clone(),
            );
        }

        self.relay(frame, upstream).await;
    }

    async fn relay(&self, frame: Bytes, upstream: &UpstreamSender) {
        match upstream.send(frame).await {
            Ok(()) => self.ctx.metrics.frames_relayed_total.inc(),
            Err(e) => {
                warn!(error = %e, "Failed to relay frame upstream");
                self.ctx.metrics.record_error(&e);
            }
        }
    }

    async fn reply(&self, frame: Bytes, writer: &MinerWriter) {
        if let Err(e) = writer.send(frame).await {
            warn!(error = %e, "Failed to reply to miner");
            self.ctx.metrics.record_error(&e);
        }
    }
}
