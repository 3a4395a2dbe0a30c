//! Core data types for the spindle replication consumer.
//!
//! Everything in this crate is pure data and algebra: change stamps (CSNs),
//! the cookie vectors that order them per provider, the present set used
//! during refresh, and the retry schedule. No I/O happens here.

pub mod cookie;
pub mod csn;
pub mod presence;
pub mod retry;
pub mod types;
pub mod vector;

pub use cookie::SyncCookie;
pub use csn::Csn;
pub use presence::PresentSet;
pub use retry::{RetrySchedule, RetryState};
pub use types::{ModelError, Rid, Sid, SyncUuid};
pub use vector::{AgeCheck, CsnVector, VectorOrdering};
