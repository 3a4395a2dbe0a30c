//! Identifier newtypes shared across the consumer.
//!
//! Semantic wrappers for the small integers and byte arrays that would
//! otherwise travel around as bare `u16`/`[u8; 16]`.

use std::fmt;

/// Errors from parsing or validating model types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("replica id {0} out of range (0..=4095)")]
    RidOutOfRange(u32),
    #[error("server id {0} out of range (0..=4095)")]
    SidOutOfRange(i32),
    #[error("malformed change stamp: {0}")]
    BadCsn(String),
    #[error("malformed sync cookie: {0}")]
    BadCookie(String),
    #[error("malformed uuid: {0}")]
    BadUuid(String),
    #[error("malformed retry schedule: {0}")]
    BadRetry(String),
}

/// Local identifier of a configured replication source.
///
/// Rendered as `rid=NNN` in logs, matching the prefix every source-scoped
/// log line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Rid(u16);

impl Rid {
    pub const MAX: u16 = 4095;

    pub fn new(raw: u32) -> Result<Self, ModelError> {
        if raw > Self::MAX as u32 {
            return Err(ModelError::RidOutOfRange(raw));
        }
        Ok(Rid(raw as u16))
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid={:03}", self.0)
    }
}

/// Server identifier embedded in change stamps.
///
/// `-1` is the hole sentinel: "no sid" in a cookie slot. All vector
/// operations skip holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Sid(i16);

impl Sid {
    pub const MAX: i16 = 4095;
    /// The `-1` sentinel.
    pub const HOLE: Sid = Sid(-1);

    pub fn new(raw: i32) -> Result<Self, ModelError> {
        if raw == -1 {
            return Ok(Sid::HOLE);
        }
        if !(0..=Self::MAX as i32).contains(&raw) {
            return Err(ModelError::SidOutOfRange(raw));
        }
        Ok(Sid(raw as i16))
    }

    pub fn is_hole(&self) -> bool {
        self.0 < 0
    }

    pub fn get(&self) -> i16 {
        self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hole() {
            write!(f, "sid=-1")
        } else {
            write!(f, "sid={:03}", self.0)
        }
    }
}

/// A 16-byte entry UUID as carried in sync-state controls.
///
/// Wire form is the raw 16 bytes; display form is the usual hyphenated
/// 8-4-4-4-12 rendering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncUuid(uuid::Uuid);

impl SyncUuid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SyncUuid(uuid::Uuid::from_bytes(bytes))
    }

    /// Parse the wire form: exactly 16 raw bytes.
    pub fn from_slice(raw: &[u8]) -> Result<Self, ModelError> {
        let arr: [u8; 16] = raw
            .try_into()
            .map_err(|_| ModelError::BadUuid(format!("expected 16 bytes, got {}", raw.len())))?;
        Ok(SyncUuid(uuid::Uuid::from_bytes(arr)))
    }

    /// Parse the hyphenated display form.
    pub fn parse_str(s: &str) -> Result<Self, ModelError> {
        uuid::Uuid::parse_str(s)
            .map(SyncUuid)
            .map_err(|e| ModelError::BadUuid(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn random() -> Self {
        SyncUuid(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SyncUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for SyncUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncUuid({})", self.0.hyphenated())
    }
}

impl From<uuid::Uuid> for SyncUuid {
    fn from(u: uuid::Uuid) -> Self {
        SyncUuid(u)
    }
}
