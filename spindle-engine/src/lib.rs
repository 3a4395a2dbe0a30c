//! Consumer-side directory replication engine.
//!
//! Keeps a local directory tree in sync with remote providers speaking the
//! sync protocol (refresh-only / refresh-and-persist), a dir-sync
//! incremental dialect, or a legacy change-log dialect. Each configured
//! source runs a per-tick state machine on the run queue; all sources on a
//! database share one [`cookie_state::CookieState`] holding the committed
//! and pending context vectors.

pub mod applier;
pub mod config;
pub mod conflict;
pub mod cookie_state;
pub mod decode;
pub mod engine;
pub mod error;
pub mod glue;
pub mod nonpresent;
pub mod provider;
pub mod runqueue;
pub mod source;

pub use config::{SourceConfig, SyncData, SyncMode};
pub use cookie_state::{CookieState, PreCommit, RefreshGrant};
pub use engine::Replicator;
pub use error::EngineError;
pub use provider::{
    ProviderConnection, ProviderConnector, ProviderError, RequestControls, ScriptedConnector,
    SearchSpec,
};
pub use runqueue::{RunQueue, Runnable, TaskId};
pub use source::{NoopScheduler, Scheduler, Source, TickOutcome};
