use crate::types::ConnectionId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Who is mining on this connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Empty until a login is accepted
    pub login: String,
    pub agent: String,
}

impl SessionIdentity {
    pub fn is_authenticated(&self) -> bool {
        !self.login.is_empty()
    }
}

/// Result of trying to publish a login into the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginCommit {
    Committed,
    /// The session already carries a login; it was left untouched
    AlreadyAuthenticated,
    /// An empty login never authenticates a session
    EmptyLogin,
}

/// Identity is written by the read loop and read by the push handler task; the
/// `watch` channel guarantees readers see a whole snapshot.
pub struct MinerSession {
    conn_id: ConnectionId,
    peer_addr: SocketAddr,
    difficulty: u64,
    identity: watch::Sender<SessionIdentity>,
    heartbeat_started: AtomicBool,
    cancel: CancellationToken,
}

impl MinerSession {
    pub fn new(conn_id: ConnectionId, peer_addr: SocketAddr, difficulty: u64) -> Self {
        let (identity, _) = watch::channel(SessionIdentity::default());
        Self {
            conn_id,
            peer_addr,
            difficulty,
            identity,
            heartbeat_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn difficulty(&self) -> u64 {
        self.difficulty
    }

    /// Consistent copy of the current identity
    pub fn snapshot(&self) -> SessionIdentity {
        self.identity.borrow().clone()
    }

    /// Publish the identity of a successful login. The first non-empty login wins.
    pub fn commit_login(&self, login: String, agent: String) -> LoginCommit {
        if login.is_empty() {
            return LoginCommit::EmptyLogin;
        }

        let mut outcome = LoginCommit::AlreadyAuthenticated;
        self.identity.send_if_modified(|identity| {
            if identity.is_authenticated() {
                return false;
            }
            identity.login = login;
            identity.agent = agent;
            outcome = LoginCommit::Committed;
            true
        });
        outcome
    }

    /// True for exactly one caller over the session's lifetime
    pub fn claim_heartbeat(&self) -> bool {
        !self.heartbeat_started.swap(true, Ordering::AcqRel)
    }

    /// Token shared by every task serving this connection
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task of this connection. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for MinerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinerSession")
            .field("conn_id", &self.conn_id)
            .field("peer_addr", &self.peer_addr)
            .field("difficulty", &self.difficulty)
            .field("identity", &*self.identity.borrow())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
