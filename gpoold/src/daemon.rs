use gpool_core::{
    database::{DatabasePool, LedgerStore},
    metrics::RelayMetrics,
    server::StratumServer,
    upstream::NodeConnector,
    DaemonConfig, Error, Result,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main gpoold daemon implementation
pub struct PoolDaemon {
    config: DaemonConfig,
    metrics: RelayMetrics,
    database: Option<DatabasePool>,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    stratum_server_handle: Option<JoinHandle<Result<()>>>,
}

impl PoolDaemon {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        Ok(Self {
            config,
            metrics: RelayMetrics::new()?,
            database: None,
            shutdown: CancellationToken::new(),
            local_addr: None,
            stratum_server_handle: None,
        })
    }

    /// Initialize database connection
    async fn init_database(&self) -> Result<DatabasePool> {
        info!("Initializing database connection");

        let pool = DatabasePool::new(&self.config.database.url, self.config.database.max_connections).await?;

        if self.config.database.enable_migrations {
            info!("Running database migrations");
            pool.migrate().await?;
        }

        pool.health_check().await?;

        info!("Database initialized successfully");
        Ok(pool)
    }

    /// Open the ledger, bind the listener and start serving miners
    pub async fn start(&mut self) -> Result<()> {
        if self.stratum_server_handle.is_some() {
            return Err(Error::Internal("Daemon already started".to_string()));
        }

        let database = self.init_database().await?;
        let store: Arc<dyn LedgerStore> = Arc::new(database.clone());
        let connector = Arc::new(NodeConnector::new(&self.config.node));
        info!(node = %connector.endpoint(), difficulty = self.config.node.diff, "Relaying miners to node");

        let server = StratumServer::bind(&self.config, store, connector, self.metrics.clone()).await?;
        self.local_addr = Some(server.local_addr());

        let shutdown = self.shutdown.clone();
        self.stratum_server_handle = Some(tokio::spawn(async move { server.run(shutdown).await }));

        if self.config.monitoring.enable_metrics {
            self.start_background_tasks(database.clone());
        }
        self.database = Some(database);

        Ok(())
    }

    /// Periodic metrics and ledger report
    fn start_background_tasks(&self, database: DatabasePool) {
        let shutdown = self.shutdown.clone();
        let metrics = self.metrics.clone();
        let period = Duration::from_secs(self.config.monitoring.report_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let summary = metrics.get_summary();
                        match database.get_stats().await {
                            Ok(ledger) => info!(
                                connections = summary.connections_active,
                                frames_relayed = summary.frames_relayed,
                                shares = summary.shares,
                                shares_rejected = summary.shares_rejected,
                                blocks_found = summary.blocks_found,
                                miners = ledger.miners,
                                ledger_shares = ledger.shares,
                                ledger_blocks = ledger.blocks,
                                "Relay status"
                            ),
                            Err(e) => {
                                error!("Failed to collect ledger statistics: {}", e);
                                metrics.record_error(&e);
                            }
                        }
                        if let Ok(text) = metrics.gather_text() {
                            debug!(metrics = %text, "Prometheus snapshot");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Statistics task shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Block until ctrl-c, SIGTERM or the listener stopping on its own, then shut down
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        let mut server = self
            .stratum_server_handle
            .take()
            .ok_or_else(|| Error::Internal("Daemon not started".to_string()))?;

        let outcome = tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                self.shutdown.cancel();
                join_server(&mut server).await
            }
            result = &mut server => {
                if !self.shutdown.is_cancelled() {
                    warn!("Stratum server stopped unexpectedly");
                    self.shutdown.cancel();
                }
                flatten(result)
            }
        };

        if let Some(database) = self.database.take() {
            database.close().await;
        }
        info!("gpoold stopped");
        outcome
    }
}

async fn join_server(server: &mut JoinHandle<Result<()>>) -> Result<()> {
    flatten(server.await)
}

fn flatten(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    result.map_err(|e| Error::Internal(format!("Stratum server task failed: {}", e)))?
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
