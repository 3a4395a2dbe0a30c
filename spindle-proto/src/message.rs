//! Tagged provider message variants.
//!
//! A connection delivers decoded protocol traffic as one of these variants;
//! the source state machine matches on them instead of switching on raw
//! message-type integers.

use crate::controls::{DirSyncResponse, SyncDoneControl, SyncInfoMessage, SyncStateControl};

/// LDAP result codes the consumer inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    NoSuchAttribute,
    TypeOrValueExists,
    SizeLimitExceeded,
    NoSuchObject,
    Busy,
    NotAllowedOnNonLeaf,
    AlreadyExists,
    /// The provider's log no longer covers our state (e-syncRefreshRequired).
    SyncRefreshRequired,
    Other(u32),
}

impl ResultCode {
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            16 => ResultCode::NoSuchAttribute,
            20 => ResultCode::TypeOrValueExists,
            4 => ResultCode::SizeLimitExceeded,
            32 => ResultCode::NoSuchObject,
            51 => ResultCode::Busy,
            66 => ResultCode::NotAllowedOnNonLeaf,
            68 => ResultCode::AlreadyExists,
            4096 => ResultCode::SyncRefreshRequired,
            other => ResultCode::Other(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

/// One attribute of a received search entry: type name plus raw values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl RawAttribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        RawAttribute { name: name.into(), values }
    }

    /// First value as UTF-8, when present.
    pub fn first_str(&self) -> Option<&str> {
        self.values.first().and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// A search entry from the provider.
///
/// `sync_state` holds every sync-state control attached to the entry; a
/// well-formed provider sends exactly one. Multiples are a protocol error
/// the state machine rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attrs: Vec<RawAttribute>,
    pub sync_state: Vec<SyncStateControl>,
    /// Set when a persistent-search entry-change notice accompanied the
    /// entry (change-log dialect persist phase).
    pub entry_change_notice: bool,
}

impl SearchEntry {
    pub fn attr(&self, name: &str) -> Option<&RawAttribute> {
        self.attrs.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }
}

/// The final result of a sync search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub code: ResultCode,
    pub done: Option<SyncDoneControl>,
    pub dirsync: Option<DirSyncResponse>,
}

/// Everything a provider connection can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderMessage {
    Entry(SearchEntry),
    Result(SearchResult),
    Intermediate(SyncInfoMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResultCode::from_wire(0), ResultCode::Success);
        assert_eq!(ResultCode::from_wire(68), ResultCode::AlreadyExists);
        assert_eq!(ResultCode::from_wire(4096), ResultCode::SyncRefreshRequired);
        assert_eq!(ResultCode::from_wire(80), ResultCode::Other(80));
        assert!(ResultCode::Success.is_success());
        assert!(!ResultCode::Busy.is_success());
    }

    #[test]
    fn test_entry_attr_lookup_is_case_insensitive() {
        let entry = SearchEntry {
            dn: "cn=a,dc=example,dc=com".into(),
            attrs: vec![RawAttribute::new("objectClass", vec![b"person".to_vec()])],
            sync_state: vec![],
            entry_change_notice: false,
        };
        assert!(entry.attr("objectclass").is_some());
        assert_eq!(
            entry.attr("OBJECTCLASS").unwrap().first_str(),
            Some("person")
        );
        assert!(entry.attr("cn").is_none());
    }
}
