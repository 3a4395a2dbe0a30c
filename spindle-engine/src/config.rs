//! Per-source configuration.
//!
//! Parsing of the textual consumer directive happens outside the engine;
//! this is the typed form it produces. `validate` enforces the couplings
//! the directive parser cannot express.

use crate::error::EngineError;
use spindle_dir::Scope;
use spindle_model::{RetrySchedule, Rid};

/// Operating mode of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    RefreshOnly,
    RefreshAndPersist,
    DirSync,
}

/// Shape of the data the provider sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncData {
    Plain,
    AccessLog,
    ChangeLog,
}

/// Search scope in configuration form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    Base,
    One,
    Sub,
}

impl From<SearchScope> for Scope {
    fn from(s: SearchScope) -> Scope {
        match s {
            SearchScope::Base => Scope::Base,
            SearchScope::One => Scope::One,
            SearchScope::Sub => Scope::Subtree,
        }
    }
}

fn default_filter() -> String {
    "(objectClass=*)".to_string()
}

fn default_retry() -> RetrySchedule {
    RetrySchedule::parse("60 +").expect("builtin retry schedule")
}

fn default_interval() -> u64 {
    86400
}

fn default_timeout_ms() -> u64 {
    2000
}

/// Configuration of one replication source.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceConfig {
    pub rid: Rid,
    /// Provider URI; opaque to the engine, consumed by the connector.
    pub provider: String,
    pub base: String,
    #[serde(default = "default_filter")]
    pub filter: String,
    pub scope: SearchScope,
    pub mode: SyncMode,
    #[serde(default = "SourceConfig::default_syncdata")]
    pub syncdata: SyncData,
    /// Polling interval for refresh-only mode, seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_retry")]
    pub retry: RetrySchedule,
    /// Receive timeout while draining messages, milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub network_timeout_ms: u64,
    /// Attributes to replicate; empty means all user attributes.
    #[serde(default)]
    pub attrs: Vec<String>,
    /// Attributes excluded from replication.
    #[serde(default)]
    pub exattrs: Vec<String>,
    /// Include operational attributes (`+` in the directive).
    #[serde(default)]
    pub all_op_attrs: bool,
    /// Log container for the delta dialects.
    #[serde(default)]
    pub logbase: Option<String>,
    #[serde(default)]
    pub logfilter: Option<String>,
    #[serde(default)]
    pub schema_checking: bool,
    #[serde(default)]
    pub size_limit: Option<usize>,
    #[serde(default)]
    pub time_limit: Option<u64>,
    #[serde(default)]
    pub manage_dsa_it: bool,
    #[serde(default)]
    pub lazy_commit: bool,
    /// Drop client listeners during a fallback refresh.
    #[serde(default)]
    pub strict_refresh: bool,
    /// This database participates in a multi-provider cluster.
    #[serde(default)]
    pub multi_provider: bool,
    /// Server id this consumer advertises in its cookies.
    #[serde(default)]
    pub server_id: Option<spindle_model::Sid>,
    /// Source lives on the configuration database; pending-slot
    /// acquisition must never block.
    #[serde(default)]
    pub is_config_db: bool,
    /// Rewrite provider DNs: (provider suffix, local suffix).
    #[serde(default)]
    pub suffix_massage: Option<(String, String)>,
    /// Authorization identity sent as proxy-authz.
    #[serde(default)]
    pub authz_id: Option<String>,
}

impl SourceConfig {
    fn default_syncdata() -> SyncData {
        SyncData::Plain
    }

    /// A minimal valid config for the given source id and base.
    pub fn new(rid: Rid, provider: &str, base: &str) -> Self {
        SourceConfig {
            rid,
            provider: provider.to_string(),
            base: base.to_string(),
            filter: default_filter(),
            scope: SearchScope::Sub,
            mode: SyncMode::RefreshAndPersist,
            syncdata: SyncData::Plain,
            interval: default_interval(),
            retry: default_retry(),
            network_timeout_ms: default_timeout_ms(),
            attrs: Vec::new(),
            exattrs: Vec::new(),
            all_op_attrs: false,
            logbase: None,
            logfilter: None,
            schema_checking: false,
            size_limit: None,
            time_limit: None,
            manage_dsa_it: false,
            lazy_commit: false,
            strict_refresh: false,
            multi_provider: false,
            server_id: None,
            is_config_db: false,
            suffix_massage: None,
            authz_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.base.trim().is_empty() {
            return Err(EngineError::Config("searchbase is required".into()));
        }
        match self.syncdata {
            SyncData::AccessLog => {
                if self.logbase.is_none() || self.logfilter.is_none() {
                    return Err(EngineError::Config(
                        "access-log syncdata requires logbase and logfilter".into(),
                    ));
                }
            }
            SyncData::ChangeLog => {
                if self.logbase.is_none() {
                    return Err(EngineError::Config(
                        "change-log syncdata requires logbase".into(),
                    ));
                }
            }
            SyncData::Plain => {}
        }
        if self.mode == SyncMode::DirSync && self.syncdata != SyncData::Plain {
            return Err(EngineError::Config(
                "dir-sync mode carries its own differential format".into(),
            ));
        }
        spindle_dir::Filter::parse(&self.filter)
            .map_err(|e| EngineError::Config(format!("bad filter: {e}")))?;
        Ok(())
    }

    /// Is this attribute excluded from replication for this source?
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exattrs.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Does the include list admit this attribute?
    pub fn is_included(&self, name: &str, operational: bool) -> bool {
        if operational {
            // Operational attrs ride on the explicit `+` selection.
            if self.all_op_attrs {
                return true;
            }
        } else if self.attrs.is_empty() {
            return true;
        }
        self.attrs.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SourceConfig {
        SourceConfig::new(Rid::new(1).unwrap(), "ldap://provider", "dc=example,dc=com")
    }

    #[test]
    fn test_validate_defaults() {
        cfg().validate().unwrap();
    }

    #[test]
    fn test_validate_delta_requires_log() {
        let mut c = cfg();
        c.syncdata = SyncData::AccessLog;
        assert!(c.validate().is_err());
        c.logbase = Some("cn=log".into());
        c.logfilter = Some("(objectClass=*)".into());
        c.validate().unwrap();
    }

    #[test]
    fn test_validate_dirsync_excludes_syncdata() {
        let mut c = cfg();
        c.mode = SyncMode::DirSync;
        c.syncdata = SyncData::ChangeLog;
        c.logbase = Some("cn=changelog".into());
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_json_fixture_roundtrip() {
        let raw = r#"{
            "rid": 42,
            "provider": "ldap://replica.example.com",
            "base": "dc=example,dc=com",
            "scope": "sub",
            "mode": "refresh-and-persist",
            "syncdata": "access-log",
            "logbase": "cn=accesslog",
            "logfilter": "(objectClass=auditWriteObject)",
            "retry": [[5, {"Finite": 3}], [60, "Forever"]],
            "multi_provider": true
        }"#;
        let c: SourceConfig = serde_json::from_str(raw).unwrap();
        c.validate().unwrap();
        assert_eq!(c.rid.get(), 42);
        assert_eq!(c.mode, SyncMode::RefreshAndPersist);
        assert_eq!(c.syncdata, SyncData::AccessLog);
        assert!(c.multi_provider);
        // Defaults fill the gaps.
        assert_eq!(c.filter, "(objectClass=*)");
        assert_eq!(c.interval, 86400);

        let back: SourceConfig =
            serde_json::from_str(&serde_json::to_string(&c).unwrap()).unwrap();
        assert_eq!(back.rid, c.rid);
        assert_eq!(back.retry, c.retry);
    }

    #[test]
    fn test_attr_selection() {
        let mut c = cfg();
        assert!(c.is_included("cn", false));
        assert!(!c.is_included("entryDN", true));
        c.attrs = vec!["cn".into(), "sn".into()];
        assert!(c.is_included("CN", false));
        assert!(!c.is_included("mail", false));
        c.exattrs = vec!["userPassword".into()];
        assert!(c.is_excluded("USERPASSWORD"));
    }
}
