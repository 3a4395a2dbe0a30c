//! Sync cookie parse and compose.
//!
//! The cookie is opaque on the wire; this parse/compose pair is canonical
//! within the consumer only. Text form:
//!
//! `rid=NNN[,sid=NNN][,delcsn=<csn>][,csn=<csn>[;<csn>...]]`

use crate::csn::Csn;
use crate::types::{ModelError, Rid, Sid};
use crate::vector::CsnVector;
use std::fmt;

/// A parsed sync cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCookie {
    pub rid: Option<Rid>,
    pub sid: Option<Sid>,
    pub ctxcsn: CsnVector,
    /// Delete stamp for the non-present pass, when the provider supplies one.
    pub delcsn: Option<Csn>,
}

impl SyncCookie {
    pub fn new(rid: Rid, sid: Option<Sid>) -> Self {
        SyncCookie {
            rid: Some(rid),
            sid,
            ctxcsn: CsnVector::new(),
            delcsn: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ctxcsn.is_empty()
    }

    /// Parse the text form. Unknown fields are rejected; a bare CSN list
    /// without `rid=` is tolerated the way stored context vectors are.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let mut cookie = SyncCookie::default();
        if raw.is_empty() {
            return Err(ModelError::BadCookie("empty cookie".into()));
        }
        for field in raw.split(',') {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| ModelError::BadCookie(format!("field without '=': {field}")))?;
            match key {
                "rid" => {
                    let n: u32 = value
                        .parse()
                        .map_err(|_| ModelError::BadCookie(format!("bad rid: {value}")))?;
                    cookie.rid = Some(Rid::new(n)?);
                }
                "sid" => {
                    let n: i32 = value
                        .parse()
                        .map_err(|_| ModelError::BadCookie(format!("bad sid: {value}")))?;
                    cookie.sid = Some(Sid::new(n)?);
                }
                "delcsn" => {
                    cookie.delcsn = Some(Csn::from_raw(value));
                }
                "csn" => {
                    let stamps = value
                        .split(';')
                        .filter(|s| !s.is_empty())
                        .map(Csn::from_raw)
                        .collect();
                    cookie.ctxcsn = CsnVector::from_stamps(stamps);
                }
                other => {
                    return Err(ModelError::BadCookie(format!("unknown field: {other}")));
                }
            }
        }
        Ok(cookie)
    }

    /// Compose the canonical text form, vectors sorted by sid.
    pub fn compose(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SyncCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(rid) = self.rid {
            write!(f, "rid={:03}", rid.get())?;
            wrote = true;
        }
        if let Some(sid) = self.sid {
            if !sid.is_hole() {
                if wrote {
                    write!(f, ",")?;
                }
                write!(f, "sid={:03}", sid.get())?;
                wrote = true;
            }
        }
        if !self.ctxcsn.is_empty() {
            if wrote {
                write!(f, ",")?;
            }
            write!(f, "csn={}", self.ctxcsn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A1: &str = "20240101000000.000001Z#000000#001#000000";
    const B1: &str = "20240101000000.000001Z#000000#003#000000";

    #[test]
    fn test_parse_full() {
        let c = SyncCookie::parse(&format!("rid=001,sid=003,csn={A1};{B1}")).unwrap();
        assert_eq!(c.rid, Some(Rid::new(1).unwrap()));
        assert_eq!(c.sid, Some(Sid::new(3).unwrap()));
        assert_eq!(c.ctxcsn.len(), 2);
        assert_eq!(
            c.ctxcsn.get(Sid::new(1).unwrap()),
            Some(&Csn::from_raw(A1))
        );
    }

    #[test]
    fn test_parse_minimal() {
        let c = SyncCookie::parse("rid=123").unwrap();
        assert!(c.is_empty());
        assert_eq!(c.sid, None);
        assert!(SyncCookie::parse("").is_err());
        assert!(SyncCookie::parse("bogus").is_err());
        assert!(SyncCookie::parse("color=red").is_err());
    }

    #[test]
    fn test_compose_sorts_by_sid() {
        let mut c = SyncCookie::new(Rid::new(1).unwrap(), Some(Sid::new(2).unwrap()));
        c.ctxcsn = CsnVector::from_stamps(vec![Csn::from_raw(B1), Csn::from_raw(A1)]);
        assert_eq!(c.compose(), format!("rid=001,sid=002,csn={A1};{B1}"));
    }

    #[test]
    fn test_roundtrip() {
        let raw = format!("rid=042,sid=001,csn={A1};{B1}");
        let c = SyncCookie::parse(&raw).unwrap();
        assert_eq!(c.compose(), raw);
    }

    #[test]
    fn test_delcsn_parsed_not_composed() {
        let c = SyncCookie::parse(&format!("rid=001,delcsn={A1},csn={A1}")).unwrap();
        assert_eq!(c.delcsn, Some(Csn::from_raw(A1)));
        // delcsn is a provider-side hint; we never send it back.
        assert!(!c.compose().contains("delcsn"));
    }
}
