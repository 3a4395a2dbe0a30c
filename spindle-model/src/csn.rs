//! Change stamps (CSNs).
//!
//! A CSN is a totally ordered opaque byte string produced by a provider,
//! embedding the provider's server id. Ordering is lexicographic on the raw
//! bytes; parsing is only ever needed to extract the sid.
//!
//! The text form is `YYYYMMDDhhmmss.uuuuuuZ#cccccc#sss#oooooo`:
//! wall time, microseconds, a hex change counter, a 3-hex-digit server id,
//! and a hex modification number.

use crate::types::{ModelError, Sid};
use std::cmp::Ordering;
use std::fmt;

/// A change stamp. Comparison never requires parsing.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Csn(String);

impl Csn {
    /// Wrap a raw stamp without validating its shape. Ordering and equality
    /// work on any byte string; `sid()` will fail on junk.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Csn(raw.into())
    }

    /// Build the canonical text form from components.
    pub fn format(
        wall: &str,
        micros: u32,
        count: u32,
        sid: Sid,
        mod_num: u32,
    ) -> Result<Self, ModelError> {
        if sid.is_hole() {
            return Err(ModelError::BadCsn("cannot format a stamp with sid=-1".into()));
        }
        Ok(Csn(format!(
            "{wall}.{micros:06}Z#{count:06x}#{:03x}#{mod_num:06x}",
            sid.get()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extract the embedded server id from the third `#`-field.
    pub fn sid(&self) -> Result<Sid, ModelError> {
        let mut fields = self.0.split('#');
        let _ts = fields.next();
        let _count = fields.next();
        let sid = fields
            .next()
            .ok_or_else(|| ModelError::BadCsn(self.0.clone()))?;
        let raw = i32::from_str_radix(sid, 16).map_err(|_| ModelError::BadCsn(self.0.clone()))?;
        Sid::new(raw)
    }
}

impl Ord for Csn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl PartialOrd for Csn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csn({})", self.0)
    }
}
