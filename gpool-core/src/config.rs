use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub stratum_server: StratumServerConfig,
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
}

/// Miner-facing stratum listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumServerConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Agent name substrings that suppress the periodic status poll
    pub omit_agent_status: Vec<String>,
    pub max_connections: usize,
    pub status_interval_secs: u64,
    /// Consecutive non-disconnect read errors tolerated before the connection is dropped
    pub max_read_errors: u32,
}

/// Upstream node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub address: String,
    pub stratum_port: u16,
    /// Difficulty assigned to every new miner session
    pub diff: u64,
    pub connect_timeout_secs: u64,
}

/// Ledger database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub enable_migrations: bool,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    /// Seconds between metric snapshots written to the log
    pub report_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    pub level: String,
    /// Per-component log levels
    pub component_levels: HashMap<String, String>,
    /// Output format (json, pretty, compact)
    pub format: LogFormat,
    /// Log output destination
    pub output: LogOutput,
    /// Whether to redact credentials from structured fields
    pub redact_sensitive_data: bool,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Log output options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            stratum_server: StratumServerConfig::default(),
            node: NodeConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for StratumServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3416,
            omit_agent_status: vec![],
            max_connections: 4096,
            status_interval_secs: 10,
            max_read_errors: 16,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            stratum_port: 3416,
            diff: 1,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://gpoold.db".to_string(),
            max_connections: 10,
            enable_migrations: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            report_interval_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            component_levels: HashMap::new(),
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            redact_sensitive_data: true,
        }
    }
}

impl StratumServerConfig {
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Whether the periodic status poll should be skipped for this agent
    pub fn omits_status_for(&self, agent: &str) -> bool {
        self.omit_agent_status
            .iter()
            .any(|omit| agent.contains(omit.as_str()))
    }
}

impl NodeConfig {
    pub fn stratum_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.stratum_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DaemonConfig {
    /// Load configuration from file. `.json` files use the JSON layout, anything else is TOML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: Self = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_stratum_server()?;
        self.validate_node()?;
        self.validate_database()?;
        self.validate_logging()?;
        self.validate_monitoring()?;
        Ok(())
    }

    fn validate_stratum_server(&self) -> Result<()> {
        let server = &self.stratum_server;
        if server.port == 0 {
            return Err(Error::Config("stratum_server.port must be greater than 0".to_string()));
        }
        if server.max_connections == 0 {
            return Err(Error::Config("stratum_server.max_connections must be greater than 0".to_string()));
        }
        if server.status_interval_secs == 0 {
            return Err(Error::Config("stratum_server.status_interval_secs must be greater than 0".to_string()));
        }
        if server.omit_agent_status.iter().any(|s| s.is_empty()) {
            // An empty substring matches every agent
            return Err(Error::Config("stratum_server.omit_agent_status cannot contain empty entries".to_string()));
        }
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.address.trim().is_empty() {
            return Err(Error::Config("node.address cannot be empty".to_string()));
        }
        if self.node.stratum_port == 0 {
            return Err(Error::Config("node.stratum_port must be greater than 0".to_string()));
        }
        if self.node.diff == 0 {
            return Err(Error::Config("node.diff must be greater than 0".to_string()));
        }
        Ok(())
    }

    fn validate_database(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(Error::Config("database.url cannot be empty".to_string()));
        }
        if !(self.database.url.starts_with("sqlite:") || self.database.url.starts_with("postgres:")) {
            return Err(Error::Config(format!("Unsupported database URL scheme: {}", self.database.url)));
        }
        if self.database.max_connections == 0 {
            return Err(Error::Config("database.max_connections must be greater than 0".to_string()));
        }
        Ok(())
    }

    fn validate_logging(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!("Invalid log level: {}. Must be one of: {:?}", self.logging.level, valid_levels)));
        }

        if let LogOutput::File(ref path) = self.logging.output {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(Error::Config(format!("Log directory does not exist: {}", parent.display())));
                }
            }
        }

        Ok(())
    }

    fn validate_monitoring(&self) -> Result<()> {
        if self.monitoring.enable_metrics && self.monitoring.report_interval_secs == 0 {
            return Err(Error::Config("report_interval_secs must be greater than 0 when metrics are enabled".to_string()));
        }
        Ok(())
    }

    /// Apply `GPOOLD_*` environment variables on top of the current values
    pub fn merge_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("GPOOLD_BIND_ADDRESS") {
            self.stratum_server.address = addr.parse()
                .map_err(|e| Error::Config(format!("Invalid bind address: {}", e)))?;
        }

        if let Ok(port) = std::env::var("GPOOLD_PORT") {
            self.stratum_server.port = port.parse()
                .map_err(|e| Error::Config(format!("Invalid port: {}", e)))?;
        }

        if let Ok(omit) = std::env::var("GPOOLD_OMIT_AGENT_STATUS") {
            self.stratum_server.omit_agent_status = omit
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(node_addr) = std::env::var("GPOOLD_NODE_ADDRESS") {
            self.node.address = node_addr;
        }

        if let Ok(node_port) = std::env::var("GPOOLD_NODE_STRATUM_PORT") {
            self.node.stratum_port = node_port.parse()
                .map_err(|e| Error::Config(format!("Invalid node stratum port: {}", e)))?;
        }

        if let Ok(diff) = std::env::var("GPOOLD_DIFF") {
            self.node.diff = diff.parse()
                .map_err(|e| Error::Config(format!("Invalid difficulty: {}", e)))?;
        }

        if let Ok(db_url) = std::env::var("GPOOLD_DATABASE_URL") {
            self.database.url = db_url;
        }

        if let Ok(log_level) = std::env::var("GPOOLD_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Load configuration from multiple sources with priority:
    /// 1. Explicit overrides (highest priority)
    /// 2. Environment variables
    /// 3. Configuration file
    /// 4. Default values (lowest priority)
    pub fn load_from_sources(
        config_path: Option<&Path>,
        overrides: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        }

        config.merge_env()?;

        if let Some(overrides) = overrides {
            config.apply_overrides(overrides)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply configuration overrides from a key-value map
    pub fn apply_overrides(&mut self, overrides: HashMap<String, String>) -> Result<()> {
        for (key, value) in overrides {
            self.apply_single_override(&key, &value)?;
        }
        Ok(())
    }

    fn apply_single_override(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "stratum_server.address" => {
                self.stratum_server.address = value.parse()
                    .map_err(|e| Error::Config(format!("Invalid bind address '{}': {}", value, e)))?;
            }
            "stratum_server.port" => {
                self.stratum_server.port = value.parse()
                    .map_err(|e| Error::Config(format!("Invalid port '{}': {}", value, e)))?;
            }
            "node.address" => {
                self.node.address = value.to_string();
            }
            "node.stratum_port" => {
                self.node.stratum_port = value.parse()
                    .map_err(|e| Error::Config(format!("Invalid node stratum port '{}': {}", value, e)))?;
            }
            "node.diff" => {
                self.node.diff = value.parse()
                    .map_err(|e| Error::Config(format!("Invalid difficulty '{}': {}", value, e)))?;
            }
            "database.url" => {
                self.database.url = value.to_string();
            }
            "logging.level" => {
                self.logging.level = value.to_string();
            }
            _ => {
                return Err(Error::Config(format!("Unknown configuration key: {}", key)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_validation() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stratum_server.status_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_file_operations() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("gpoold.toml");

        let mut config = DaemonConfig::default();
        config.stratum_server.omit_agent_status = vec!["NiceHash".to_string()];
        config.node.diff = 4;
        config.to_file(&config_path).unwrap();

        let loaded = DaemonConfig::from_file(&config_path).unwrap();
        assert_eq!(loaded.stratum_server.omit_agent_status, vec!["NiceHash".to_string()]);
        assert_eq!(loaded.node.diff, 4);
        assert_eq!(loaded.database, config.database);
    }

    #[test]
    fn test_json_config_with_partial_sections() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{
                "stratum_server": {"address": "127.0.0.1", "port": 3333, "omit_agent_status": ["bminer"]},
                "node": {"address": "10.0.0.2", "stratum_port": 3416, "diff": 2}
            }"#,
        )
        .unwrap();

        let config = DaemonConfig::from_file(&config_path).unwrap();
        assert_eq!(config.stratum_server.bind_address().to_string(), "127.0.0.1:3333");
        assert_eq!(config.node.stratum_endpoint(), "10.0.0.2:3416");
        assert_eq!(config.node.diff, 2);
        // Unspecified fields fall back to defaults
        assert_eq!(config.stratum_server.status_interval_secs, 10);
    }

    #[test]
    fn test_sample_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../gpoold.toml");
        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.node.stratum_port, 13416);
        assert!(config.stratum_server.omits_status_for("NiceHash/1.0"));
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn test_omit_agent_status_matching() {
        let config = StratumServerConfig {
            omit_agent_status: vec!["bminer".to_string(), "NoStatus".to_string()],
            ..Default::default()
        };
        assert!(config.omits_status_for("bminer-v15.7"));
        assert!(config.omits_status_for("rig-NoStatus-2"));
        assert!(!config.omits_status_for("lolMiner"));
        assert!(!StratumServerConfig::default().omits_status_for("anything"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DaemonConfig::default();
        config.node.diff = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.stratum_server.omit_agent_status = vec!["".to_string()];
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.database.url = "mysql://nope".to_string();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.node.address = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = DaemonConfig::default();

        for level in ["trace", "debug", "info", "warn", "error"] {
            config.logging.level = level.to_string();
            assert!(config.validate_logging().is_ok());
        }

        config.logging.level = "verbose".to_string();
        assert!(config.validate_logging().is_err());
    }

    #[test]
    fn test_environment_variable_override() {
        std::env::set_var("GPOOLD_NODE_ADDRESS", "node.internal");
        std::env::set_var("GPOOLD_OMIT_AGENT_STATUS", "bminer, ,gminer");

        let mut config = DaemonConfig::default();
        config.merge_env().unwrap();

        assert_eq!(config.node.address, "node.internal");
        assert_eq!(config.stratum_server.omit_agent_status, vec!["bminer".to_string(), "gminer".to_string()]);

        std::env::remove_var("GPOOLD_NODE_ADDRESS");
        std::env::remove_var("GPOOLD_OMIT_AGENT_STATUS");
    }

    #[test]
    fn test_load_from_sources() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("gpoold.toml");

        let mut file_config = DaemonConfig::default();
        file_config.node.diff = 8;
        file_config.stratum_server.port = 4000;
        file_config.to_file(&config_path).unwrap();

        std::env::set_var("GPOOLD_DATABASE_URL", "sqlite::memory:");

        let mut overrides = HashMap::new();
        overrides.insert("stratum_server.port".to_string(), "4444".to_string());

        let config = DaemonConfig::load_from_sources(Some(&config_path), Some(overrides)).unwrap();

        assert_eq!(config.stratum_server.port, 4444); // override
        assert_eq!(config.database.url, "sqlite::memory:"); // environment
        assert_eq!(config.node.diff, 8); // file

        std::env::remove_var("GPOOLD_DATABASE_URL");
    }

    #[test]
    fn test_invalid_configuration_overrides() {
        let mut config = DaemonConfig::default();

        let mut overrides = HashMap::new();
        overrides.insert("wallet.owner_api_port".to_string(), "3420".to_string());
        assert!(config.apply_overrides(overrides).is_err());

        let mut overrides = HashMap::new();
        overrides.insert("node.diff".to_string(), "lots".to_string());
        assert!(config.apply_overrides(overrides).is_err());
    }
}
