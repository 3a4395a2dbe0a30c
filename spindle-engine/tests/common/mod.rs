//! Shared harness for engine integration tests.
#![allow(dead_code)]

use spindle_dir::{ads, Dn, DirOps, Entry, MemoryDirectory, Schema};
use spindle_engine::{
    CookieState, ProviderConnector, Scheduler, Source, SourceConfig, SyncMode,
};
use spindle_model::{Rid, SyncUuid};
use spindle_proto::message::{RawAttribute, SearchEntry};
use spindle_proto::{
    ProviderMessage, ResultCode, SearchResult, SyncDoneControl, SyncState, SyncStateControl,
};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Once};

/// Opt-in log output for debugging a failing scenario:
/// `RUST_LOG=spindle_engine=debug cargo test`.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(false)
            .try_init();
    });
}

pub struct TestBed {
    pub schema: Arc<Schema>,
    pub dir: Arc<MemoryDirectory>,
    pub state: Arc<CookieState>,
    pub shutdown: Arc<AtomicBool>,
}

impl TestBed {
    pub fn new() -> Self {
        init_tracing();
        let schema = Schema::with_defaults();
        let suffix = Dn::parse("dc=example,dc=com");
        let dir = Arc::new(MemoryDirectory::new(suffix.clone(), schema.clone()));
        let mut root = Entry::new(suffix.clone());
        root.set(schema.resolve(ads::OBJECT_CLASS), vec![b"organization".to_vec()]);
        dir.seed(root);
        TestBed {
            schema,
            dir,
            state: CookieState::new(suffix, false),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn suffix(&self) -> Dn {
        Dn::parse("dc=example,dc=com")
    }

    /// Store a context vector value directly, as a previous run would have.
    pub fn store_context_csn(&self, stamps: &[&str]) {
        let suffix = self.suffix();
        let mut root = self.dir.fetch(&suffix).unwrap().unwrap();
        root.set(
            self.schema.resolve(ads::CONTEXT_CSN),
            stamps.iter().map(|s| s.as_bytes().to_vec()).collect(),
        );
        self.dir.seed(root);
    }

    pub fn stored_context_csn(&self) -> Vec<String> {
        self.dir
            .read_attr(&self.suffix(), ads::CONTEXT_CSN)
            .unwrap()
            .into_iter()
            .map(|v| String::from_utf8(v).unwrap())
            .collect()
    }

    /// Seed a person entry with replication bookkeeping.
    pub fn seed_person(&self, dn: &str, uuid: SyncUuid, csn: &str) {
        let mut e = Entry::new(Dn::parse(dn));
        e.set(self.schema.resolve(ads::OBJECT_CLASS), vec![b"person".to_vec()]);
        e.set(
            self.schema.resolve("cn"),
            vec![Dn::parse(dn)
                .rdn_attr_value()
                .map(|(_, v)| v.as_bytes().to_vec())
                .unwrap_or_default()],
        );
        e.set(
            self.schema.resolve(ads::ENTRY_UUID),
            vec![uuid.to_string().into_bytes()],
        );
        e.set(self.schema.resolve(ads::ENTRY_CSN), vec![csn.as_bytes().to_vec()]);
        self.dir.seed(e);
    }

    pub fn source(
        &self,
        cfg: SourceConfig,
        connector: Arc<dyn ProviderConnector>,
    ) -> Arc<Source> {
        Source::new(
            cfg,
            self.dir.clone(),
            self.schema.clone(),
            connector,
            self.state.clone(),
            None,
            self.shutdown.clone(),
            None,
        )
        .unwrap()
    }
}

pub fn refresh_only_cfg(rid: u32) -> SourceConfig {
    let mut cfg = SourceConfig::new(Rid::new(rid).unwrap(), "ldap://provider", "dc=example,dc=com");
    cfg.mode = SyncMode::RefreshOnly;
    cfg
}

pub fn persist_cfg(rid: u32) -> SourceConfig {
    SourceConfig::new(Rid::new(rid).unwrap(), "ldap://provider", "dc=example,dc=com")
}

pub fn cookie(csn: &str) -> String {
    format!("rid=001,csn={csn}")
}

/// A provider-side add entry with the usual attributes.
pub fn add_entry(dn: &str, uuid: SyncUuid, csn: Option<&str>, cookie: Option<&str>) -> ProviderMessage {
    let mut attrs = vec![
        RawAttribute::new("objectClass", vec![b"person".to_vec()]),
        RawAttribute::new(
            "cn",
            vec![Dn::parse(dn)
                .rdn_attr_value()
                .map(|(_, v)| v.as_bytes().to_vec())
                .unwrap_or_default()],
        ),
    ];
    if let Some(csn) = csn {
        attrs.push(RawAttribute::new(ads::ENTRY_CSN, vec![csn.as_bytes().to_vec()]));
    }
    ProviderMessage::Entry(SearchEntry {
        dn: dn.to_string(),
        attrs,
        sync_state: vec![SyncStateControl {
            state: SyncState::Add,
            uuid,
            cookie: cookie.map(|c| c.as_bytes().to_vec()),
        }],
        entry_change_notice: false,
    })
}

pub fn delete_entry_msg(uuid: SyncUuid, cookie: Option<&str>) -> ProviderMessage {
    ProviderMessage::Entry(SearchEntry {
        dn: String::from("cn=ignored,dc=example,dc=com"),
        attrs: vec![],
        sync_state: vec![SyncStateControl {
            state: SyncState::Delete,
            uuid,
            cookie: cookie.map(|c| c.as_bytes().to_vec()),
        }],
        entry_change_notice: false,
    })
}

pub fn result_msg(cookie: Option<&str>, refresh_deletes: bool) -> ProviderMessage {
    ProviderMessage::Result(SearchResult {
        code: ResultCode::Success,
        done: Some(SyncDoneControl {
            cookie: cookie.map(|c| c.as_bytes().to_vec()),
            refresh_deletes,
        }),
        dirsync: None,
    })
}

/// Scheduler that records pause/wake calls.
#[derive(Default)]
pub struct RecordingScheduler {
    pub paused: Mutex<Vec<Rid>>,
    pub woken: Mutex<Vec<Rid>>,
}

impl Scheduler for RecordingScheduler {
    fn pause(&self, rid: Rid) {
        self.paused.lock().unwrap().push(rid);
    }

    fn wake(&self, rid: Rid) {
        self.woken.lock().unwrap().push(rid);
    }
}
