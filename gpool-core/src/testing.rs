use crate::database::LedgerStore;
use crate::types::VerifyResult;
use crate::upstream::{UpstreamConnector, UpstreamHandle};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

/// One call made against a [`MemoryLedger`]
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCall {
    Verify { login: String, pass: String },
    Register { login: String, pass: String, contact: String },
    Share { login: String, agent: String, difficulty: u64 },
    BlockHash(String),
    AgentStatus { login: String, agent: String, difficulty: u64, status: Map<String, Value> },
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, String>,
    calls: Vec<LedgerCall>,
    forced_verify: Option<VerifyResult>,
    failing: bool,
}

/// Ledger that keeps accounts in a map and records every call in order
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that already knows one account
    pub fn with_account(login: &str, pass: &str) -> Self {
        let ledger = Self::new();
        ledger.lock().accounts.insert(login.to_string(), pass.to_string());
        ledger
    }

    /// Answer every `verify` with `result` regardless of stored accounts
    pub fn force_verify(&self, result: VerifyResult) {
        self.lock().forced_verify = Some(result);
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.lock().calls.clone()
    }

    pub fn registrations(&self) -> Vec<LedgerCall> {
        self.filtered(|c| matches!(c, LedgerCall::Register { .. }))
    }

    pub fn shares(&self) -> Vec<LedgerCall> {
        self.filtered(|c| matches!(c, LedgerCall::Share { .. }))
    }

    pub fn block_hashes(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                LedgerCall::BlockHash(hash) => Some(hash.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn agent_statuses(&self) -> Vec<LedgerCall> {
        self.filtered(|c| matches!(c, LedgerCall::AgentStatus { .. }))
    }

    fn filtered(&self, keep: impl Fn(&LedgerCall) -> bool) -> Vec<LedgerCall> {
        self.lock().calls.iter().filter(|c| keep(c)).cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A panicking test thread must not hide the calls recorded so far
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, call: LedgerCall) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.failing {
            return Err(Error::Ledger("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedger {
    async fn verify(&self, login: &str, pass: &str) -> Result<VerifyResult> {
        self.push(LedgerCall::Verify { login: login.to_string(), pass: pass.to_string() })?;

        let state = self.lock();
        if let Some(result) = state.forced_verify {
            return Ok(result);
        }
        Ok(match state.accounts.get(login) {
            None => VerifyResult::Absent,
            Some(stored) if stored == pass => VerifyResult::Correct,
            Some(_) => VerifyResult::Wrong,
        })
    }

    async fn register(&self, login: &str, pass: &str, contact: &str) -> Result<()> {
        self.push(LedgerCall::Register {
            login: login.to_string(),
            pass: pass.to_string(),
            contact: contact.to_string(),
        })?;
        self.lock()
            .accounts
            .entry(login.to_string())
            .or_insert_with(|| pass.to_string());
        Ok(())
    }

    async fn record_share(&self, login: &str, agent: &str, difficulty: u64) -> Result<()> {
        self.push(LedgerCall::Share { login: login.to_string(), agent: agent.to_string(), difficulty })
    }

    async fn record_block_hash(&self, hash: &str) -> Result<()> {
        self.push(LedgerCall::BlockHash(hash.to_string()))
    }

    async fn record_agent_status(
        &self,
        login: &str,
        agent: &str,
        difficulty: u64,
        status: &Map<String, Value>,
    ) -> Result<()> {
        self.push(LedgerCall::AgentStatus {
            login: login.to_string(),
            agent: agent.to_string(),
            difficulty,
            status: status.clone(),
        })
    }
}

/// Connector whose upstream links are in-memory pipes.
///
/// The node end of every opened link is handed to the receiver returned by [`PipeConnector::new`].
pub struct PipeConnector {
    nodes: mpsc::UnboundedSender<DuplexStream>,
    refuse: AtomicBool,
}

impl PipeConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (nodes, rx) = mpsc::unbounded_channel();
        let connector = Self {
            nodes,
            refuse: AtomicBool::new(false),
        };
        (connector, rx)
    }

    /// Make every subsequent `open` fail as if the node were down
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for PipeConnector {
    async fn open(&self) -> Result<UpstreamHandle> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Network("node refused connection".to_string()));
        }
        let (local, node) = tokio::io::duplex(PIPE_CAPACITY);
        self.nodes
            .send(node)
            .map_err(|_| Error::Internal("node side of pipe dropped".to_string()))?;
        Ok(UpstreamHandle::from_stream(local))
    }
}
