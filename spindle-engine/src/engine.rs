//! The replicator: source registry and scheduling glue.
//!
//! Owns the run queue, the shared cookie state for the database, and the
//! configured sources. Maps tick outcomes onto reschedule decisions.

use crate::config::SourceConfig;
use crate::cookie_state::CookieState;
use crate::error::EngineError;
use crate::provider::ProviderConnector;
use crate::runqueue::{RunQueue, Runnable, TaskId};
use crate::source::{NoopScheduler, Scheduler, Source, TickOutcome};
use spindle_dir::{Dn, DirOps, DnRewriter, Schema};
use spindle_model::{Rid, SyncCookie};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a persisting source waits before polling the session again
/// after a read timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

struct SourceSlot {
    source: Arc<Source>,
    task: TaskId,
}

#[derive(Default)]
struct Registry {
    /// Shared vector state; exists while at least one source does.
    cookie_state: Option<Arc<CookieState>>,
    sources: HashMap<Rid, SourceSlot>,
    /// Cookies supplied on the command line, consumed by the first
    /// connect of the matching source.
    overrides: HashMap<Rid, SyncCookie>,
}

/// The consumer engine for one database.
pub struct Replicator {
    dir: Arc<dyn DirOps>,
    schema: Arc<Schema>,
    connector: Arc<dyn ProviderConnector>,
    context_dn: Dn,
    use_subentry: bool,
    rq: RunQueue,
    shutdown: Arc<AtomicBool>,
    registry: Mutex<Registry>,
}

impl Replicator {
    pub fn new(
        dir: Arc<dyn DirOps>,
        schema: Arc<Schema>,
        connector: Arc<dyn ProviderConnector>,
        context_dn: Dn,
        use_subentry: bool,
    ) -> Arc<Self> {
        Arc::new(Replicator {
            dir,
            schema,
            connector,
            context_dn,
            use_subentry,
            rq: RunQueue::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn run_queue(&self) -> &RunQueue {
        &self.rq
    }

    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }

    /// Register a cookie override for a source id, as given on the command
    /// line.
    pub fn add_cookie_override(&self, cookie: SyncCookie) {
        if let Some(rid) = cookie.rid {
            self.registry.lock().unwrap().overrides.insert(rid, cookie);
        }
    }

    /// Accept a source configuration: create its state machine and put it
    /// on the run queue.
    pub fn add_source(
        self: &Arc<Self>,
        cfg: SourceConfig,
        rewriter: Option<Arc<dyn DnRewriter>>,
    ) -> Result<Arc<Source>, EngineError> {
        let mut reg = self.registry.lock().unwrap();
        if reg.sources.contains_key(&cfg.rid) {
            return Err(EngineError::Config(format!("duplicate {}", cfg.rid)));
        }

        // First source on the database creates the shared state.
        let cookie_state = reg
            .cookie_state
            .get_or_insert_with(|| {
                CookieState::new(self.context_dn.clone(), self.use_subentry)
            })
            .clone();

        let rid = cfg.rid;
        let interval = Duration::from_secs(cfg.interval);
        let over = reg.overrides.remove(&rid);
        let source = Source::new(
            cfg,
            self.dir.clone(),
            self.schema.clone(),
            self.connector.clone(),
            cookie_state,
            rewriter,
            self.shutdown.clone(),
            over,
        )?;

        let task = self.rq.insert(
            Arc::new(SourceTask {
                source: source.clone(),
                engine: Arc::downgrade(self),
            }),
            interval,
        );
        info!(%rid, "source registered");
        reg.sources.insert(rid, SourceSlot { source: source.clone(), task });
        Ok(source)
    }

    /// Remove a source. The descriptor itself is freed once no worker runs
    /// it; a running tick observes the defunct mark and exits.
    pub fn remove_source(&self, rid: Rid) {
        let mut reg = self.registry.lock().unwrap();
        let Some(slot) = reg.sources.remove(&rid) else {
            return;
        };
        slot.source.mark_defunct();
        if !self.rq.is_running(slot.task) {
            self.rq.remove(slot.task);
        }
        if let Some(state) = &reg.cookie_state {
            state.forget(rid);
        }
        if reg.sources.is_empty() {
            // Last source gone: the shared state goes with it.
            reg.cookie_state = None;
        }
        info!(%rid, "source removed");
    }

    pub fn source(&self, rid: Rid) -> Option<Arc<Source>> {
        self.registry
            .lock()
            .unwrap()
            .sources
            .get(&rid)
            .map(|s| s.source.clone())
    }

    /// Spawn worker threads; sources start ticking.
    pub fn start(&self, workers: usize) {
        self.rq.start(workers);
    }

    /// Stop everything: workers drain, sources unbind.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.rq.shutdown();
        // Give every source one synchronous tick to observe the flag and
        // release its session.
        let sources: Vec<Arc<Source>> = self
            .registry
            .lock()
            .unwrap()
            .sources
            .values()
            .map(|s| s.source.clone())
            .collect();
        for source in sources {
            let _ = source.tick(&NoopScheduler);
        }
        info!("replicator stopped");
    }

    fn task_of(&self, rid: Rid) -> Option<TaskId> {
        self.registry.lock().unwrap().sources.get(&rid).map(|s| s.task)
    }
}

impl Scheduler for Replicator {
    fn pause(&self, rid: Rid) {
        if let Some(task) = self.task_of(rid) {
            self.rq.stop(task);
        }
    }

    fn wake(&self, rid: Rid) {
        if let Some(task) = self.task_of(rid) {
            self.rq.wake(task);
        }
    }
}

/// Run-queue adapter for one source.
struct SourceTask {
    source: Arc<Source>,
    engine: Weak<Replicator>,
}

impl Runnable for SourceTask {
    fn run(&self, rq: &RunQueue, id: TaskId) {
        let Some(engine) = self.engine.upgrade() else {
            rq.remove(id);
            return;
        };
        let outcome = self.source.tick(engine.as_ref());
        debug!(rid = %self.source.rid(), ?outcome, "tick finished");

        match outcome {
            TickOutcome::Ok | TickOutcome::Repoll => rq.resched(id, false),
            TickOutcome::Timeout => rq.resched_after(id, POLL_INTERVAL),
            TickOutcome::Paused => rq.wake(id),
            TickOutcome::Busy => {
                // Parked; the refreshing sibling wakes us.
            }
            TickOutcome::Shutdown => {
                rq.remove(id);
            }
            TickOutcome::Error => match self.source.consume_retry() {
                Some(delay) => {
                    debug!(rid = %self.source.rid(), ?delay, "retrying after failure");
                    rq.resched_after(id, delay);
                }
                None => {
                    warn!(rid = %self.source.rid(), "retries exhausted, giving up");
                    rq.remove(id);
                    engine.remove_source(self.source.rid());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::provider::ScriptedConnector;
    use spindle_dir::{ads, Entry, MemoryDirectory};

    fn engine() -> (Arc<Replicator>, ScriptedConnector) {
        let schema = Schema::with_defaults();
        let suffix = Dn::parse("dc=example,dc=com");
        let dir = Arc::new(MemoryDirectory::new(suffix.clone(), schema.clone()));
        let mut root = Entry::new(suffix.clone());
        root.set(schema.resolve(ads::OBJECT_CLASS), vec![b"organization".to_vec()]);
        dir.seed(root);
        let connector = ScriptedConnector::new();
        (
            Replicator::new(dir, schema, Arc::new(connector.clone()), suffix, false),
            connector,
        )
    }

    fn cfg(rid: u32) -> SourceConfig {
        let mut cfg = SourceConfig::new(
            Rid::new(rid).unwrap(),
            "ldap://provider",
            "dc=example,dc=com",
        );
        cfg.mode = SyncMode::RefreshOnly;
        cfg
    }

    #[test]
    fn test_sources_share_cookie_state() {
        let (engine, _) = engine();
        let s1 = engine.add_source(cfg(1), None).unwrap();
        let s2 = engine.add_source(cfg(2), None).unwrap();
        assert!(Arc::ptr_eq(s1.cookie_state(), s2.cookie_state()));
        assert!(engine.add_source(cfg(1), None).is_err());
    }

    #[test]
    fn test_cookie_state_dropped_with_last_source() {
        let (engine, _) = engine();
        engine.add_source(cfg(1), None).unwrap();
        engine.add_source(cfg(2), None).unwrap();
        engine.remove_source(Rid::new(1).unwrap());
        assert!(engine.registry.lock().unwrap().cookie_state.is_some());
        engine.remove_source(Rid::new(2).unwrap());
        assert!(engine.registry.lock().unwrap().cookie_state.is_none());
    }

    #[test]
    fn test_removed_source_is_defunct() {
        let (engine, _) = engine();
        let source = engine.add_source(cfg(1), None).unwrap();
        engine.remove_source(Rid::new(1).unwrap());
        assert!(source.is_defunct());
        assert!(engine.source(Rid::new(1).unwrap()).is_none());
    }

    #[test]
    fn test_override_consumed_by_matching_source() {
        let (engine, connector) = engine();
        let over = SyncCookie::parse(
            "rid=001,csn=20240101000000.000009Z#000000#001#000000",
        )
        .unwrap();
        engine.add_cookie_override(over);

        connector.push_session(vec![vec![]]);
        let source = engine.add_source(cfg(1), None).unwrap();
        source.tick(&NoopScheduler);
        let sync = connector.searches()[0].controls.sync.clone().unwrap();
        let cookie = String::from_utf8(sync.cookie.unwrap()).unwrap();
        assert!(cookie.contains("000009Z"), "cookie was {cookie}");
    }
}
