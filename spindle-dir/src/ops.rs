//! The directory operations interface.
//!
//! Everything the engine does to the local tree goes through [`DirOps`].
//! Backends implement these synchronously; the engine calls them from its
//! worker threads.

use crate::dn::Dn;
use crate::entry::Entry;
use crate::filter::Filter;
use crate::modify::Modification;
use spindle_model::Csn;

/// LDAP-shaped error surface the engine matches on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirError {
    #[error("no such object")]
    NoSuchObject,
    #[error("no such attribute")]
    NoSuchAttribute,
    #[error("type or value exists")]
    TypeOrValueExists,
    #[error("already exists")]
    AlreadyExists,
    #[error("not allowed on non-leaf")]
    NotAllowedOnNonLeaf,
    #[error("size limit exceeded")]
    SizeLimitExceeded,
    #[error("busy")]
    Busy,
    #[error("directory error: {0}")]
    Other(String),
}

/// Operation timestamp: seconds plus an in-second increment so back-to-back
/// writes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpTime {
    pub secs: u64,
    pub incr: u32,
}

impl OpTime {
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        OpTime { secs, incr: 0 }
    }

    /// Advance so the next stamped write sorts after this one.
    pub fn tick(&mut self) {
        let now = Self::now();
        if now.secs > self.secs {
            *self = now;
        } else {
            self.incr += 1;
        }
    }

    /// Render for timestamp attributes.
    pub fn render(&self) -> String {
        format!("{}.{:06}Z", self.secs, self.incr)
    }
}

/// Per-operation flags carried alongside every write.
#[derive(Debug, Clone, Default)]
pub struct OpFlags {
    /// Internal write: suppress local change-log emission.
    pub dont_replicate: bool,
    /// Skip schema checks (initial connect, glue materialization).
    pub no_schema_check: bool,
    /// Operation time used for timestamp attributes.
    pub op_time: Option<OpTime>,
    /// Queued change stamp preserved onto the written entry.
    pub queued_csn: Option<Csn>,
}

impl OpFlags {
    pub fn internal() -> Self {
        OpFlags { dont_replicate: true, ..Default::default() }
    }

    pub fn with_csn(mut self, csn: Csn) -> Self {
        self.queued_csn = Some(csn);
        self
    }

    pub fn at(mut self, t: OpTime) -> Self {
        self.op_time = Some(t);
        self
    }
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base,
    One,
    Subtree,
}

/// Parameters of an internal search.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub base: Dn,
    pub scope: Scope,
    pub filter: Filter,
    pub size_limit: Option<usize>,
}

impl SearchParams {
    pub fn subtree(base: Dn, filter: Filter) -> Self {
        SearchParams { base, scope: Scope::Subtree, filter, size_limit: None }
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.size_limit = Some(n);
        self
    }
}

/// Synchronous directory operations.
pub trait DirOps: Send + Sync {
    fn add(&self, entry: Entry, flags: &OpFlags) -> Result<(), DirError>;

    fn modify(&self, dn: &Dn, mods: &[Modification], flags: &OpFlags) -> Result<(), DirError>;

    /// Rename `dn` to `new_rdn` under `new_superior` (or its current
    /// parent), then apply `mods` to the renamed entry.
    fn rename(
        &self,
        dn: &Dn,
        new_rdn: &str,
        new_superior: Option<&Dn>,
        delete_old_rdn: bool,
        mods: &[Modification],
        flags: &OpFlags,
    ) -> Result<(), DirError>;

    fn delete(&self, dn: &Dn, flags: &OpFlags) -> Result<(), DirError>;

    /// Run a search, invoking `visit` per matching entry. A callback error
    /// aborts the search and propagates.
    fn search(
        &self,
        params: &SearchParams,
        visit: &mut dyn FnMut(&Entry) -> Result<(), DirError>,
    ) -> Result<(), DirError>;

    /// Fetch a single entry by DN for reading.
    fn fetch(&self, dn: &Dn) -> Result<Option<Entry>, DirError>;

    /// Read one attribute's values off an entry; empty when absent.
    fn read_attr(&self, dn: &Dn, attr: &str) -> Result<Vec<Vec<u8>>, DirError> {
        match self.fetch(dn)? {
            Some(e) => Ok(e.get(attr).map(|a| a.values.clone()).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }
}
