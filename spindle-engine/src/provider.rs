//! Provider connection seams.
//!
//! Establishing real LDAP sessions (TLS, SASL, URI handling) lives outside
//! the engine. The engine sees a connector that yields connections, issues
//! one sync search per session, and drains messages with a bounded timeout.
//!
//! Two test-grade implementations ship here: a scripted connection replaying
//! canned message batches, and a channel-fed connection for live-feeding
//! persist-phase traffic.

use crate::config::SourceConfig;
use spindle_dir::Scope;
use spindle_proto::{DirSyncRequest, ProviderMessage, SyncRequestControl};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Connection-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("server down: {0}")]
    ServerDown(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

/// Controls attached to a sync search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestControls {
    pub sync: Option<SyncRequestControl>,
    pub dirsync: Option<DirSyncRequest>,
    pub manage_dsa_it: bool,
    pub proxy_authz: Option<String>,
    pub show_deleted: bool,
    pub persistent_search: bool,
    pub lazy_commit: bool,
}

/// One sync search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSpec {
    pub base: String,
    pub scope: Scope,
    pub filter: String,
    /// Requested attributes; empty means all.
    pub attrs: Vec<String>,
    pub size_limit: Option<usize>,
    /// Server-side time limit in seconds.
    pub time_limit: Option<u64>,
    pub controls: RequestControls,
}

/// An established provider session. Owned exclusively by one source until
/// unbound.
pub trait ProviderConnection: Send {
    /// Issue the sync search. At most one search is outstanding.
    fn search(&mut self, spec: SearchSpec) -> Result<(), ProviderError>;

    /// Wait up to `timeout` for the next message. `Ok(None)` is a timeout.
    fn recv(&mut self, timeout: Duration) -> Result<Option<ProviderMessage>, ProviderError>;

    /// Read a single-valued attribute off the provider's root DSE.
    fn root_dse_attr(&mut self, attr: &str) -> Result<Option<String>, ProviderError>;

    /// Abandon the outstanding search, keeping the session.
    fn abandon(&mut self);

    /// Tear the session down.
    fn unbind(&mut self);
}

/// Opens provider sessions.
pub trait ProviderConnector: Send + Sync {
    fn connect(&self, cfg: &SourceConfig) -> Result<Box<dyn ProviderConnection>, ProviderError>;
}

// ==================== Scripted connector ====================

#[derive(Default)]
struct ScriptState {
    /// Each session is a queue of message batches; each `search` call on
    /// the session activates the next batch.
    sessions: VecDeque<VecDeque<Vec<ProviderMessage>>>,
    searches: Vec<SearchSpec>,
    connects: usize,
    fail_connects: u32,
    root_dse: HashMap<String, String>,
}

/// Replays canned provider sessions. The workhorse of the engine tests.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session consisting of one batch per expected search.
    pub fn push_session(&self, batches: Vec<Vec<ProviderMessage>>) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .push_back(batches.into_iter().collect());
    }

    /// Make the next `n` connect attempts fail with server-down.
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().unwrap().fail_connects = n;
    }

    pub fn set_root_dse_attr(&self, attr: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .root_dse
            .insert(attr.to_ascii_lowercase(), value.to_string());
    }

    /// Every search issued so far, across all sessions.
    pub fn searches(&self) -> Vec<SearchSpec> {
        self.state.lock().unwrap().searches.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }
}

impl ProviderConnector for ScriptedConnector {
    fn connect(&self, _cfg: &SourceConfig) -> Result<Box<dyn ProviderConnection>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ProviderError::ServerDown("scripted connect failure".into()));
        }
        let batches = state.sessions.pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedConnection {
            state: self.state.clone(),
            batches,
            active: VecDeque::new(),
        }))
    }
}

struct ScriptedConnection {
    state: Arc<Mutex<ScriptState>>,
    batches: VecDeque<Vec<ProviderMessage>>,
    active: VecDeque<ProviderMessage>,
}

impl ProviderConnection for ScriptedConnection {
    fn search(&mut self, spec: SearchSpec) -> Result<(), ProviderError> {
        self.state.lock().unwrap().searches.push(spec);
        self.active = self.batches.pop_front().unwrap_or_default().into();
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Option<ProviderMessage>, ProviderError> {
        Ok(self.active.pop_front())
    }

    fn root_dse_attr(&mut self, attr: &str) -> Result<Option<String>, ProviderError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .root_dse
            .get(&attr.to_ascii_lowercase())
            .cloned())
    }

    fn abandon(&mut self) {
        self.active.clear();
    }

    fn unbind(&mut self) {
        self.active.clear();
        self.batches.clear();
    }
}

// ==================== Channel connector ====================

/// Feeds messages through a channel, for persist-phase tests where traffic
/// arrives while the source is already draining.
pub struct ChannelConnector {
    rx: Mutex<Option<crossbeam_channel::Receiver<ProviderMessage>>>,
    searches: Arc<Mutex<Vec<SearchSpec>>>,
}

impl ChannelConnector {
    pub fn new() -> (Self, crossbeam_channel::Sender<ProviderMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            ChannelConnector {
                rx: Mutex::new(Some(rx)),
                searches: Arc::new(Mutex::new(Vec::new())),
            },
            tx,
        )
    }

    pub fn searches(&self) -> Vec<SearchSpec> {
        self.searches.lock().unwrap().clone()
    }
}

impl ProviderConnector for ChannelConnector {
    fn connect(&self, _cfg: &SourceConfig) -> Result<Box<dyn ProviderConnection>, ProviderError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ProviderError::ServerDown("channel already consumed".into()))?;
        Ok(Box::new(ChannelConnection {
            rx,
            searches: self.searches.clone(),
        }))
    }
}

struct ChannelConnection {
    rx: crossbeam_channel::Receiver<ProviderMessage>,
    searches: Arc<Mutex<Vec<SearchSpec>>>,
}

impl ProviderConnection for ChannelConnection {
    fn search(&mut self, spec: SearchSpec) -> Result<(), ProviderError> {
        self.searches.lock().unwrap().push(spec);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<ProviderMessage>, ProviderError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(ProviderError::Closed),
        }
    }

    fn root_dse_attr(&mut self, _attr: &str) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    fn abandon(&mut self) {}

    fn unbind(&mut self) {}
}
