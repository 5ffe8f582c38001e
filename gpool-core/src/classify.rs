// Node responses to ledger records
use crate::database::LedgerStore;
use crate::metrics::RelayMetrics;
use crate::protocol::StratumResponse;
use crate::session::SessionIdentity;
use crate::Result;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

const BLOCK_MARKER: &str = "block";
const BLOCK_PREFIX: &str = "block - ";

/// What a pushed response means for the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Status fields reported for the session's agent
    AgentStatus(Map<String, Value>),
    /// A status reply arrived before the miner logged in
    StatusBeforeLogin,
    /// An accepted submission; `block_hash` is set when it found a block
    Share { detail: String, block_hash: Option<String> },
    /// The node refused a submission
    ShareRejected(Map<String, Value>),
    /// An accepted submission whose result is not a detail string
    UnexpectedSubmitResult,
    Ignored,
}

pub fn classify(response: &StratumResponse, identity: &SessionIdentity) -> Classification {
    match response.method.as_str() {
        "status" => {
            if !identity.is_authenticated() {
                return Classification::StatusBeforeLogin;
            }
            match &response.result {
                Some(Value::Object(fields)) => Classification::AgentStatus(fields.clone()),
                _ => Classification::AgentStatus(Map::new()),
            }
        }
        "submit" => {
            if let Some(error) = &response.error {
                return Classification::ShareRejected(error.clone());
            }
            match &response.result {
                Some(Value::String(detail)) => Classification::Share {
                    block_hash: extract_block_hash(detail),
                    detail: detail.clone(),
                },
                _ => Classification::UnexpectedSubmitResult,
            }
        }
        _ => Classification::Ignored,
    }
}

/// Block hash carried in a submit detail such as `"block - 00ab.."`.
///
/// Returns `None` when the detail does not mention a block. The literal prefix is
/// removed when present; otherwise the text after the last `block` token is used.
pub fn extract_block_hash(detail: &str) -> Option<String> {
    if !detail.contains(BLOCK_MARKER) {
        return None;
    }

    let detail = detail.trim();
    let hash = match detail.strip_prefix(BLOCK_PREFIX) {
        Some(rest) => rest.trim(),
        None => {
            let start = detail.rfind(BLOCK_MARKER).map_or(0, |i| i + BLOCK_MARKER.len());
            detail[start..].trim_matches(|c: char| c.is_whitespace() || c == '-' || c == ':')
        }
    };
    Some(hash.to_string())
}

/// Apply a classification to the ledger. Store failures are returned to the caller,
/// which logs them; nothing here tears the connection down.
pub async fn record(
    store: &dyn LedgerStore,
    identity: &SessionIdentity,
    difficulty: u64,
    classification: Classification,
    metrics: &RelayMetrics,
) -> Result<()> {
    match classification {
        Classification::AgentStatus(fields) => {
            debug!(login = %identity.login, agent = %identity.agent, "Recording agent status");
            store
                .record_agent_status(&identity.login, &identity.agent, difficulty, &fields)
                .await?;
        }
        Classification::StatusBeforeLogin => {
            warn!("Received status detail before login");
        }
        Classification::Share { detail, block_hash } => {
            info!(login = %identity.login, agent = %identity.agent, detail = %detail, "Share submitted");
            store.record_share(&identity.login, &identity.agent, difficulty).await?;
            metrics.shares_total.inc();

            if let Some(hash) = block_hash {
                store.record_block_hash(&hash).await?;
                metrics.blocks_found_total.inc();
                warn!(login = %identity.login, block_hash = %hash, "Block found");
            }
        }
        Classification::ShareRejected(error) => {
            metrics.shares_rejected_total.inc();
            let error = Value::Object(error);
            warn!(login = %identity.login, error = %error, "Share rejected by node");
        }
        Classification::UnexpectedSubmitResult => {
            warn!(login = %identity.login, "Submit result is not a detail string, share not recorded");
        }
        Classification::Ignored => {}
    }
    Ok(())
}
