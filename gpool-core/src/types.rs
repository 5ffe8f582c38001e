use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type alias for connection IDs
pub type ConnectionId = Uuid;

/// Outcome of checking a login/password pair against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyResult {
    Correct,
    Wrong,
    /// No account with this login exists yet
    Absent,
}
