use crate::error::{Error, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Relay metrics collector
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    registry: Registry,
    /// Total miner connections accepted
    pub connections_total: IntCounter,
    /// Miner connections currently open
    pub connections_active: IntGauge,
    /// Connections closed at accept because the server was full
    pub connections_rejected: IntCounter,
    pub connection_duration: Histogram,
    /// Login attempts by outcome (correct, registered, wrong, error)
    pub logins_total: IntCounterVec,
    /// Miner frames relayed to the node
    pub frames_relayed_total: IntCounter,
    /// Miner frames dropped as unparseable
    pub frames_dropped_total: IntCounter,
    /// Node frames forwarded to miners
    pub frames_forwarded_total: IntCounter,
    pub shares_total: IntCounter,
    pub shares_rejected_total: IntCounter,
    pub blocks_found_total: IntCounter,
    pub heartbeats_sent_total: IntCounter,
    /// Errors by `Error::category`
    pub errors_total: IntCounterVec,
    start_time: Instant,
}

impl RelayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let metrics = Self {
            connections_total: IntCounter::with_opts(Opts::new(
                "gpool_connections_total",
                "Total miner connections accepted",
            ))?,
            connections_active: IntGauge::with_opts(Opts::new(
                "gpool_connections_active",
                "Miner connections currently open",
            ))?,
            connections_rejected: IntCounter::with_opts(Opts::new(
                "gpool_connections_rejected_total",
                "Miner connections refused because the server was full",
            ))?,
            connection_duration: Histogram::with_opts(
                HistogramOpts::new("gpool_connection_duration_seconds", "Miner connection duration")
                    .buckets(vec![1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 86400.0]),
            )?,
            logins_total: IntCounterVec::new(
                Opts::new("gpool_logins_total", "Login attempts by outcome"),
                &["outcome"],
            )?,
            frames_relayed_total: IntCounter::with_opts(Opts::new(
                "gpool_frames_relayed_total",
                "Miner frames relayed to the node",
            ))?,
            frames_dropped_total: IntCounter::with_opts(Opts::new(
                "gpool_frames_dropped_total",
                "Miner frames dropped as unparseable",
            ))?,
            frames_forwarded_total: IntCounter::with_opts(Opts::new(
                "gpool_frames_forwarded_total",
                "Node frames forwarded to miners",
            ))?,
            shares_total: IntCounter::with_opts(Opts::new("gpool_shares_total", "Shares recorded"))?,
            shares_rejected_total: IntCounter::with_opts(Opts::new(
                "gpool_shares_rejected_total",
                "Submissions rejected by the node",
            ))?,
            blocks_found_total: IntCounter::with_opts(Opts::new("gpool_blocks_found_total", "Blocks found"))?,
            heartbeats_sent_total: IntCounter::with_opts(Opts::new(
                "gpool_heartbeats_sent_total",
                "Status polls sent to the node",
            ))?,
            errors_total: IntCounterVec::new(Opts::new("gpool_errors_total", "Errors by category"), &["category"])?,
            registry,
            start_time: Instant::now(),
        };

        metrics.registry.register(Box::new(metrics.connections_total.clone()))?;
        metrics.registry.register(Box::new(metrics.connections_active.clone()))?;
        metrics.registry.register(Box::new(metrics.connections_rejected.clone()))?;
        metrics.registry.register(Box::new(metrics.connection_duration.clone()))?;
        metrics.registry.register(Box::new(metrics.logins_total.clone()))?;
        metrics.registry.register(Box::new(metrics.frames_relayed_total.clone()))?;
        metrics.registry.register(Box::new(metrics.frames_dropped_total.clone()))?;
        metrics.registry.register(Box::new(metrics.frames_forwarded_total.clone()))?;
        metrics.registry.register(Box::new(metrics.shares_total.clone()))?;
        metrics.registry.register(Box::new(metrics.shares_rejected_total.clone()))?;
        metrics.registry.register(Box::new(metrics.blocks_found_total.clone()))?;
        metrics.registry.register(Box::new(metrics.heartbeats_sent_total.clone()))?;
        metrics.registry.register(Box::new(metrics.errors_total.clone()))?;

        Ok(metrics)
    }

    pub fn record_connection_open(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_close(&self, duration: Duration) {
        self.connections_active.dec();
        self.connection_duration.observe(duration.as_secs_f64());
    }

    pub fn record_login(&self, outcome: &str) {
        self.logins_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_error(&self, error: &Error) {
        self.errors_total.with_label_values(&[error.category()]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(e.to_string()))
    }

    pub fn get_summary(&self) -> MetricsSummary {
        MetricsSummary {
            connections_active: self.connections_active.get(),
            connections_total: self.connections_total.get(),
            frames_relayed: self.frames_relayed_total.get(),
            shares: self.shares_total.get(),
            shares_rejected: self.shares_rejected_total.get(),
            blocks_found: self.blocks_found_total.get(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

/// Point-in-time view for periodic reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub connections_active: i64,
    pub connections_total: u64,
    pub frames_relayed: u64,
    pub shares: u64,
    pub shares_rejected: u64,
    pub blocks_found: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = RelayMetrics::new().unwrap();
        let summary = metrics.get_summary();
        assert_eq!(summary.connections_active, 0);
        assert_eq!(summary.shares, 0);
    }

    #[test]
    fn test_connection_accounting() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_connection_open();
        metrics.record_connection_open();
        metrics.record_connection_close(Duration::from_secs(3));

        let summary = metrics.get_summary();
        assert_eq!(summary.connections_total, 2);
        assert_eq!(summary.connections_active, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_login("registered");
        metrics.record_error(&Error::Protocol("bad frame".to_string()));
        metrics.blocks_found_total.inc();

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("gpool_logins_total{outcome=\"registered\"} 1"));
        assert!(text.contains("gpool_errors_total{category=\"protocol\"} 1"));
        assert!(text.contains("gpool_blocks_found_total 1"));
    }
}
