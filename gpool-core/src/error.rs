use thiserror::Error;

/// Errors raised while relaying miners to the node
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Stratum protocol error: {0}")]
    Protocol(String),

    /// The node link is gone; frames can no longer be relayed
    #[error("Upstream link error: {0}")]
    Upstream(String),

    #[error("Network error: {0}")]
    Network(String),

    /// Ledger store failure not originating from sqlx
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures: the relay logs them and keeps the connection going
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::Network(_) | Error::Ledger(_) | Error::Database(_) | Error::Io(_)
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Protocol(_) => "protocol",
            Error::Upstream(_) => "upstream",
            Error::Network(_) => "network",
            Error::Ledger(_) => "ledger",
            Error::Database(_) => "database",
            Error::Migration(_) => "migration",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
            Error::Metrics(_) => "metrics",
        }
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::Config("x".to_string()).category(), "config");
        assert_eq!(Error::Protocol("x".to_string()).category(), "protocol");
        assert_eq!(Error::Upstream("x".to_string()).category(), "upstream");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(Error::from(io).category(), "io");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Upstream("reset".to_string()).is_recoverable());
        assert!(Error::Ledger("locked".to_string()).is_recoverable());
        assert!(Error::Network("unreachable".to_string()).is_recoverable());
        assert!(!Error::Config("bad port".to_string()).is_recoverable());
        assert!(!Error::Internal("push handler already registered".to_string()).is_recoverable());
    }
}
