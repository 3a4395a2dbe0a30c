//! Sync protocol controls and intermediate-response payloads.
//!
//! Encode/decode for the control values the consumer exchanges with a
//! provider: the sync request it sends, the state/done controls attached to
//! provider responses, the sync-info intermediate message, and the dir-sync
//! dialect's request/response pair.

use crate::ber::{
    ctx_constructed, ctx_primitive, BerReader, BerWriter, ProtoError, TAG_BOOLEAN,
    TAG_OCTET_STRING, TAG_SET,
};
use spindle_model::SyncUuid;

// ==================== Control OIDs ====================

pub const OID_SYNC_REQUEST: &str = "1.3.6.1.4.1.4203.1.9.1.1";
pub const OID_SYNC_STATE: &str = "1.3.6.1.4.1.4203.1.9.1.2";
pub const OID_SYNC_DONE: &str = "1.3.6.1.4.1.4203.1.9.1.3";
pub const OID_SYNC_INFO: &str = "1.3.6.1.4.1.4203.1.9.1.4";
pub const OID_MANAGE_DSA_IT: &str = "2.16.840.1.113730.3.4.2";
pub const OID_PROXY_AUTHZ: &str = "2.16.840.1.113730.3.4.18";
pub const OID_PERSIST_REQUEST: &str = "2.16.840.1.113730.3.4.3";
pub const OID_PERSIST_ENTRY_CHANGE: &str = "2.16.840.1.113730.3.4.7";
pub const OID_DIRSYNC: &str = "1.2.840.113556.1.4.841";
pub const OID_SHOW_DELETED: &str = "1.2.840.113556.1.4.417";
pub const OID_LAZY_COMMIT: &str = "1.2.840.113556.1.4.619";

// ==================== Sync request ====================

/// Requested sync mode, as carried in the request control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    RefreshOnly = 1,
    RefreshAndPersist = 3,
}

/// The request control value the consumer sends with its search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequestControl {
    pub mode: SyncMode,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

impl SyncRequestControl {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        w.sequence(|s| {
            s.enumerated(self.mode as i64);
            if let Some(cookie) = &self.cookie {
                s.octet_string(cookie);
            }
            s.boolean(self.reload_hint);
        });
        w.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut r = BerReader::new(raw);
        let mut seq = r.sequence()?;
        let mode = match seq.enumerated()? {
            1 => SyncMode::RefreshOnly,
            3 => SyncMode::RefreshAndPersist,
            other => return Err(ProtoError::BadValue(format!("sync mode {other}"))),
        };
        let mut cookie = None;
        if seq.peek_tag() == Some(TAG_OCTET_STRING) {
            cookie = Some(seq.octet_string()?.to_vec());
        }
        let reload_hint = if seq.peek_tag() == Some(TAG_BOOLEAN) {
            seq.boolean()?
        } else {
            false
        };
        Ok(SyncRequestControl { mode, cookie, reload_hint })
    }
}

// ==================== Sync state ====================

/// Entry state carried on each search entry during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Present = 0,
    Add = 1,
    Modify = 2,
    Delete = 3,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Present => "PRESENT",
            SyncState::Add => "ADD",
            SyncState::Modify => "MODIFY",
            SyncState::Delete => "DELETE",
        }
    }
}

/// The per-entry sync-state control value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateControl {
    pub state: SyncState,
    pub uuid: SyncUuid,
    pub cookie: Option<Vec<u8>>,
}

impl SyncStateControl {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        w.sequence(|s| {
            s.enumerated(self.state as i64);
            s.octet_string(self.uuid.as_bytes());
            if let Some(cookie) = &self.cookie {
                s.octet_string(cookie);
            }
        });
        w.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut r = BerReader::new(raw);
        let mut seq = r.sequence()?;
        let state = match seq.enumerated()? {
            0 => SyncState::Present,
            1 => SyncState::Add,
            2 => SyncState::Modify,
            3 => SyncState::Delete,
            other => return Err(ProtoError::BadValue(format!("sync state {other}"))),
        };
        let uuid = SyncUuid::from_slice(seq.octet_string()?)
            .map_err(|e| ProtoError::BadValue(e.to_string()))?;
        let mut cookie = None;
        if seq.peek_tag() == Some(TAG_OCTET_STRING) {
            cookie = Some(seq.octet_string()?.to_vec());
        }
        Ok(SyncStateControl { state, uuid, cookie })
    }
}

// ==================== Sync done ====================

/// The control attached to the final search result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDoneControl {
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
}

impl SyncDoneControl {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        w.sequence(|s| {
            if let Some(cookie) = &self.cookie {
                s.octet_string(cookie);
            }
            s.boolean(self.refresh_deletes);
        });
        w.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut r = BerReader::new(raw);
        let mut seq = r.sequence()?;
        let mut cookie = None;
        if seq.peek_tag() == Some(TAG_OCTET_STRING) {
            cookie = Some(seq.octet_string()?.to_vec());
        }
        let refresh_deletes = if seq.peek_tag() == Some(TAG_BOOLEAN) {
            seq.boolean()?
        } else {
            false
        };
        Ok(SyncDoneControl { cookie, refresh_deletes })
    }
}

// ==================== Sync info ====================

const TAG_INFO_NEW_COOKIE: u8 = ctx_primitive(0);
const TAG_INFO_REFRESH_DELETE: u8 = ctx_constructed(1);
const TAG_INFO_REFRESH_PRESENT: u8 = ctx_constructed(2);
const TAG_INFO_ID_SET: u8 = ctx_constructed(3);

/// The intermediate-response choices a provider may send mid-search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInfoMessage {
    NewCookie {
        cookie: Vec<u8>,
    },
    RefreshDelete {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    RefreshPresent {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    IdSet {
        cookie: Option<Vec<u8>>,
        refresh_deletes: bool,
        uuids: Vec<SyncUuid>,
    },
}

impl SyncInfoMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        match self {
            SyncInfoMessage::NewCookie { cookie } => {
                w.primitive(TAG_INFO_NEW_COOKIE, cookie);
            }
            SyncInfoMessage::RefreshDelete { cookie, refresh_done } => {
                w.constructed(TAG_INFO_REFRESH_DELETE, |s| {
                    if let Some(cookie) = cookie {
                        s.octet_string(cookie);
                    }
                    s.boolean(*refresh_done);
                });
            }
            SyncInfoMessage::RefreshPresent { cookie, refresh_done } => {
                w.constructed(TAG_INFO_REFRESH_PRESENT, |s| {
                    if let Some(cookie) = cookie {
                        s.octet_string(cookie);
                    }
                    s.boolean(*refresh_done);
                });
            }
            SyncInfoMessage::IdSet { cookie, refresh_deletes, uuids } => {
                w.constructed(TAG_INFO_ID_SET, |s| {
                    if let Some(cookie) = cookie {
                        s.octet_string(cookie);
                    }
                    s.boolean(*refresh_deletes);
                    s.set(|set| {
                        for uuid in uuids {
                            set.octet_string(uuid.as_bytes());
                        }
                    });
                });
            }
        }
        w.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut r = BerReader::new(raw);
        match r.peek_tag() {
            Some(TAG_INFO_NEW_COOKIE) => {
                let cookie = r.expect(TAG_INFO_NEW_COOKIE)?.to_vec();
                Ok(SyncInfoMessage::NewCookie { cookie })
            }
            Some(tag @ (TAG_INFO_REFRESH_DELETE | TAG_INFO_REFRESH_PRESENT)) => {
                let mut seq = r.enter(tag)?;
                let mut cookie = None;
                if seq.peek_tag() == Some(TAG_OCTET_STRING) {
                    cookie = Some(seq.octet_string()?.to_vec());
                }
                // refreshDone defaults to TRUE
                let refresh_done = if seq.peek_tag() == Some(TAG_BOOLEAN) {
                    seq.boolean()?
                } else {
                    true
                };
                if tag == TAG_INFO_REFRESH_DELETE {
                    Ok(SyncInfoMessage::RefreshDelete { cookie, refresh_done })
                } else {
                    Ok(SyncInfoMessage::RefreshPresent { cookie, refresh_done })
                }
            }
            Some(TAG_INFO_ID_SET) => {
                let mut seq = r.enter(TAG_INFO_ID_SET)?;
                let mut cookie = None;
                if seq.peek_tag() == Some(TAG_OCTET_STRING) {
                    cookie = Some(seq.octet_string()?.to_vec());
                }
                let refresh_deletes = if seq.peek_tag() == Some(TAG_BOOLEAN) {
                    seq.boolean()?
                } else {
                    false
                };
                let mut set = seq.enter(TAG_SET)?;
                let mut uuids = Vec::new();
                while !set.is_empty() {
                    let raw = set.octet_string()?;
                    uuids.push(
                        SyncUuid::from_slice(raw)
                            .map_err(|e| ProtoError::BadValue(e.to_string()))?,
                    );
                }
                Ok(SyncInfoMessage::IdSet { cookie, refresh_deletes, uuids })
            }
            Some(got) => Err(ProtoError::UnexpectedTag { wanted: TAG_INFO_NEW_COOKIE, got }),
            None => Err(ProtoError::Truncated),
        }
    }

    /// The cookie payload, for any variant that carries one.
    pub fn cookie(&self) -> Option<&[u8]> {
        match self {
            SyncInfoMessage::NewCookie { cookie } => Some(cookie),
            SyncInfoMessage::RefreshDelete { cookie, .. }
            | SyncInfoMessage::RefreshPresent { cookie, .. }
            | SyncInfoMessage::IdSet { cookie, .. } => cookie.as_deref(),
        }
    }
}

// ==================== DirSync ====================

/// Dir-sync request control value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSyncRequest {
    pub flags: i64,
    pub max_bytes: i64,
    pub cookie: Vec<u8>,
}

impl DirSyncRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        w.sequence(|s| {
            s.integer(self.flags);
            s.integer(self.max_bytes);
            s.octet_string(&self.cookie);
        });
        w.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut r = BerReader::new(raw);
        let mut seq = r.sequence()?;
        Ok(DirSyncRequest {
            flags: seq.integer()?,
            max_bytes: seq.integer()?,
            cookie: seq.octet_string()?.to_vec(),
        })
    }
}

/// Dir-sync response control value from the final result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSyncResponse {
    /// Non-zero when the provider has more changes queued.
    pub more_results: bool,
    pub cookie: Vec<u8>,
}

impl DirSyncResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        w.sequence(|s| {
            s.integer(if self.more_results { 1 } else { 0 });
            s.integer(0);
            s.octet_string(&self.cookie);
        });
        w.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtoError> {
        let mut r = BerReader::new(raw);
        let mut seq = r.sequence()?;
        let more = seq.integer()?;
        let _unused = seq.integer()?;
        Ok(DirSyncResponse {
            more_results: more != 0,
            cookie: seq.octet_string()?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_request_roundtrip() {
        for ctrl in [
            SyncRequestControl {
                mode: SyncMode::RefreshAndPersist,
                cookie: Some(b"rid=001,csn=x".to_vec()),
                reload_hint: false,
            },
            SyncRequestControl {
                mode: SyncMode::RefreshOnly,
                cookie: None,
                reload_hint: true,
            },
        ] {
            let back = SyncRequestControl::decode(&ctrl.encode()).unwrap();
            assert_eq!(back, ctrl);
        }
    }

    #[test]
    fn test_sync_state_roundtrip() {
        let ctrl = SyncStateControl {
            state: SyncState::Add,
            uuid: SyncUuid::from_bytes([0xaa; 16]),
            cookie: Some(b"rid=001".to_vec()),
        };
        assert_eq!(SyncStateControl::decode(&ctrl.encode()).unwrap(), ctrl);
    }

    #[test]
    fn test_sync_state_rejects_bad_uuid() {
        let mut w = BerWriter::new();
        w.sequence(|s| {
            s.enumerated(1);
            s.octet_string(b"short");
        });
        assert!(SyncStateControl::decode(&w.into_bytes()).is_err());
    }

    #[test]
    fn test_sync_done_defaults() {
        let mut w = BerWriter::new();
        w.sequence(|_| {});
        let done = SyncDoneControl::decode(&w.into_bytes()).unwrap();
        assert_eq!(done, SyncDoneControl { cookie: None, refresh_deletes: false });
    }

    #[test]
    fn test_sync_info_refresh_present_default_done() {
        // Cookie only, refreshDone omitted: defaults to true.
        let mut w = BerWriter::new();
        w.constructed(super::TAG_INFO_REFRESH_PRESENT, |s| {
            s.octet_string(b"c");
        });
        let msg = SyncInfoMessage::decode(&w.into_bytes()).unwrap();
        assert_eq!(
            msg,
            SyncInfoMessage::RefreshPresent { cookie: Some(b"c".to_vec()), refresh_done: true }
        );
    }

    #[test]
    fn test_sync_info_roundtrips() {
        let msgs = vec![
            SyncInfoMessage::NewCookie { cookie: b"nc".to_vec() },
            SyncInfoMessage::RefreshDelete { cookie: None, refresh_done: false },
            SyncInfoMessage::IdSet {
                cookie: Some(b"c".to_vec()),
                refresh_deletes: true,
                uuids: vec![SyncUuid::from_bytes([1; 16]), SyncUuid::from_bytes([2; 16])],
            },
        ];
        for msg in msgs {
            assert_eq!(SyncInfoMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_dirsync_roundtrip() {
        let req = DirSyncRequest { flags: 1, max_bytes: 0, cookie: b"dc".to_vec() };
        assert_eq!(DirSyncRequest::decode(&req.encode()).unwrap(), req);

        let resp = DirSyncResponse { more_results: true, cookie: b"dc2".to_vec() };
        assert_eq!(DirSyncResponse::decode(&resp.encode()).unwrap(), resp);
    }
}
