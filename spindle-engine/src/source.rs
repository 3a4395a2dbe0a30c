//! The per-source state machine.
//!
//! Each configured source owns one provider session and drives it through
//! connect, refresh, persist and retry from its `tick`, scheduled on the
//! run queue. The tick returns a single outcome; the scheduler wrapper maps
//! outcomes to reschedule decisions.

use crate::applier::{self, ApplyCtx, ApplyOutcome, IncomingEntry};
use crate::config::{SourceConfig, SyncData, SyncMode};
use crate::cookie_state::{CookieState, PreCommit, RefreshGrant};
use crate::decode::{self, EntryKind};
use crate::error::EngineError;
use crate::nonpresent;
use crate::provider::{ProviderConnection, ProviderConnector, RequestControls, SearchSpec};
use spindle_dir::{ads, Dn, DirError, DirOps, DnRewriter, Modification, OpFlags, OpTime, Schema, Scope};
use spindle_model::{PresentSet, RetryState, Rid, SyncCookie, SyncUuid, VectorOrdering};
use spindle_proto::{
    DirSyncRequest, ProviderMessage, ResultCode, SearchEntry, SearchResult, SyncDoneControl,
    SyncInfoMessage, SyncMode as WireSyncMode, SyncRequestControl,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one tick; the scheduler maps each variant to a reschedule
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work done, wait out the normal interval.
    Ok,
    /// Nothing to read; poll again shortly.
    Timeout,
    /// Refresh round finished; poll again after the interval.
    Repoll,
    /// Blocked on a global pause; reschedule immediately.
    Paused,
    /// Another source holds the refresh; we are parked until woken.
    Busy,
    Shutdown,
    /// Failure; consume the retry schedule.
    Error,
}

/// Scheduling callbacks a tick may need mid-flight.
pub trait Scheduler: Send + Sync {
    /// Park this source's task (told to wait for a refresh slot).
    fn pause(&self, rid: Rid);
    /// Make a sibling's task due immediately.
    fn wake(&self, rid: Rid);
}

/// Scheduler that ignores everything; for driving ticks by hand.
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn pause(&self, _rid: Rid) {}
    fn wake(&self, _rid: Rid) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Logging,
    Fallback,
}

/// Attributes requested from the provider's log container.
const ACCESSLOG_ATTRS: [&str; 8] = [
    "reqDN", "reqType", "reqMod", "reqNewRDN", "reqDeleteOldRDN", "reqNewSuperior", "reqControls",
    "entryCSN",
];
const CHANGELOG_ATTRS: [&str; 8] = [
    "targetDN", "changeType", "changes", "newRDN", "deleteOldRDN", "newSuperior",
    "targetUniqueId", "changeNumber",
];

struct SourceState {
    conn: Option<Box<dyn ProviderConnection>>,
    search_active: bool,
    cookie: SyncCookie,
    /// Cookie-state generation last folded into our cookie.
    cookie_age: Option<u64>,
    refresh_done: bool,
    refresh_present: bool,
    refresh_delete: bool,
    too_old: bool,
    logstate: LogState,
    last_change: u64,
    prev_change: u64,
    dirsync_cookie: Vec<u8>,
    present: Option<PresentSet>,
    retry: RetryState,
    op_time: OpTime,
}

/// One configured replication source.
pub struct Source {
    cfg: SourceConfig,
    dir: Arc<dyn DirOps>,
    schema: Arc<Schema>,
    connector: Arc<dyn ProviderConnector>,
    cookie_state: Arc<CookieState>,
    rewriter: Option<Arc<dyn DnRewriter>>,
    shutdown: Arc<AtomicBool>,
    defunct: AtomicBool,
    /// Local search base (provider base after suffix massage).
    base: Dn,
    suffix: Dn,
    /// Cookie supplied on the command line for this rid, consumed on the
    /// first connect.
    cookie_override: Mutex<Option<SyncCookie>>,
    state: Mutex<SourceState>,
}

enum Step {
    /// Keep draining messages.
    Continue,
    /// Leave the message loop with this outcome.
    Finish(TickOutcome),
    /// Re-issue the search on the same session (fallback/dirsync reload).
    Reload,
}

impl Source {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SourceConfig,
        dir: Arc<dyn DirOps>,
        schema: Arc<Schema>,
        connector: Arc<dyn ProviderConnector>,
        cookie_state: Arc<CookieState>,
        rewriter: Option<Arc<dyn DnRewriter>>,
        shutdown: Arc<AtomicBool>,
        cookie_override: Option<SyncCookie>,
    ) -> Result<Arc<Self>, EngineError> {
        cfg.validate()?;
        let base = match rewriter
            .as_ref()
            .and_then(|r| r.rewrite(&cfg.base))
        {
            Some(local) => Dn::parse(&local),
            None => Dn::parse(&cfg.base),
        };
        let suffix = cookie_state.context_dn().clone();
        let retry = cfg.retry.state();
        let cookie = SyncCookie::new(cfg.rid, cfg.server_id);
        Ok(Arc::new(Source {
            cfg,
            dir,
            schema,
            connector,
            cookie_state,
            rewriter,
            shutdown,
            defunct: AtomicBool::new(false),
            base,
            suffix,
            cookie_override: Mutex::new(cookie_override),
            state: Mutex::new(SourceState {
                conn: None,
                search_active: false,
                cookie,
                cookie_age: None,
                refresh_done: false,
                refresh_present: false,
                refresh_delete: false,
                too_old: false,
                logstate: LogState::Logging,
                last_change: 0,
                prev_change: 0,
                dirsync_cookie: Vec::new(),
                present: None,
                retry,
                op_time: OpTime::now(),
            }),
        }))
    }

    pub fn rid(&self) -> Rid {
        self.cfg.rid
    }

    pub fn config(&self) -> &SourceConfig {
        &self.cfg
    }

    pub fn cookie_state(&self) -> &Arc<CookieState> {
        &self.cookie_state
    }

    /// Configuration removal: the next tick exits and frees the slot.
    pub fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    /// Consume one retry step after an `Error` outcome.
    pub fn consume_retry(&self) -> Option<Duration> {
        self.state.lock().unwrap().retry.next_failure()
    }

    /// Whether the last session latched a too-old stamp.
    pub fn too_old(&self) -> bool {
        self.state.lock().unwrap().too_old
    }

    /// Current cookie text, for diagnostics.
    pub fn cookie_sent(&self) -> String {
        self.state.lock().unwrap().cookie.compose()
    }

    fn ctx(&self) -> ApplyCtx<'_> {
        ApplyCtx {
            dir: self.dir.as_ref(),
            schema: &self.schema,
            cfg: &self.cfg,
            base: self.base.clone(),
            suffix: self.suffix.clone(),
            context_dn: self.cookie_state.context_dn().clone(),
            cookie_state: &self.cookie_state,
        }
    }

    fn delta_logging(&self, st: &SourceState) -> bool {
        self.cfg.syncdata != SyncData::Plain && st.logstate == LogState::Logging
    }

    // ==================== Tick ====================

    /// Run one scheduling quantum.
    pub fn tick(&self, sched: &dyn Scheduler) -> TickOutcome {
        let mut st = self.state.lock().unwrap();

        if self.shutdown.load(Ordering::Acquire) || self.is_defunct() {
            self.disconnect(&mut st);
            self.cookie_state.forget(self.rid());
            return TickOutcome::Shutdown;
        }

        st.too_old = false;

        if st.conn.is_none() {
            st.present = None;
            match self.connect_phase(&mut st) {
                Ok(()) => {}
                Err(EngineError::Dir(DirError::Busy)) => {
                    sched.pause(self.rid());
                    return TickOutcome::Busy;
                }
                Err(e) => {
                    warn!(rid = %self.rid(), error = %e, "connect failed");
                    self.disconnect(&mut st);
                    return TickOutcome::Error;
                }
            }
        } else if !st.search_active {
            // We lost the refresh slot arbitration earlier and were woken.
            match self.issue_search(&mut st) {
                Ok(()) => {}
                Err(EngineError::Dir(DirError::Busy)) => {
                    sched.pause(self.rid());
                    return TickOutcome::Busy;
                }
                Err(e) => {
                    warn!(rid = %self.rid(), error = %e, "search failed");
                    self.finish_refresh(&mut st, sched);
                    self.disconnect(&mut st);
                    return TickOutcome::Error;
                }
            }
        }

        loop {
            let outcome = self.process(&mut st, sched);
            match outcome {
                Ok(Step::Reload) => {
                    // Fallback finished or dirsync wants another round on
                    // the same session.
                    match self.issue_search(&mut st) {
                        Ok(()) => continue,
                        Err(EngineError::Dir(DirError::Busy)) => {
                            sched.pause(self.rid());
                            return TickOutcome::Busy;
                        }
                        Err(e) => {
                            warn!(rid = %self.rid(), error = %e, "reload failed");
                            self.disconnect(&mut st);
                            return TickOutcome::Error;
                        }
                    }
                }
                Ok(Step::Finish(outcome)) => {
                    match outcome {
                        TickOutcome::Timeout => {
                            // Session stays up; poll again shortly.
                        }
                        TickOutcome::Repoll => {
                            st.retry.reset();
                            self.disconnect(&mut st);
                        }
                        TickOutcome::Shutdown | TickOutcome::Error | TickOutcome::Ok => {
                            self.disconnect(&mut st);
                        }
                        TickOutcome::Paused | TickOutcome::Busy => {}
                    }
                    return outcome;
                }
                Ok(Step::Continue) => unreachable!("process only breaks"),
                Err(e) => {
                    warn!(rid = %self.rid(), error = %e, "sync session failed");
                    self.finish_refresh(&mut st, sched);
                    self.disconnect(&mut st);
                    return TickOutcome::Error;
                }
            }
        }
    }

    fn disconnect(&self, st: &mut SourceState) {
        if let Some(conn) = st.conn.as_mut() {
            conn.unbind();
        }
        st.conn = None;
        st.search_active = false;
    }

    /// Release the refresh slot if we hold it; wake a paused sibling.
    fn finish_refresh(&self, st: &mut SourceState, sched: &dyn Scheduler) {
        if st.refresh_done {
            st.retry.reset();
        }
        if let Some(sibling) = self.cookie_state.end_refresh(self.rid(), true) {
            sched.wake(sibling);
        }
    }

    // ==================== Connect (phase 1) ====================

    fn connect_phase(&self, st: &mut SourceState) -> Result<(), EngineError> {
        let conn = self
            .connector
            .connect(&self.cfg)
            .map_err(EngineError::Provider)?;
        st.conn = Some(conn);
        st.search_active = false;
        debug!(rid = %self.rid(), provider = %self.cfg.provider, "connected");

        match self.cfg.mode {
            SyncMode::DirSync => {
                if st.dirsync_cookie.is_empty() {
                    let stored = self
                        .dir
                        .read_attr(self.cookie_state.context_dn(), ads::DIRSYNC_COOKIE)?;
                    if let Some(v) = stored.into_iter().next() {
                        st.dirsync_cookie = v;
                    }
                }
            }
            _ if self.cfg.syncdata == SyncData::ChangeLog => {
                if st.last_change == 0 {
                    let stored = self
                        .dir
                        .read_attr(self.cookie_state.context_dn(), ads::LAST_CHANGE_NUMBER)?;
                    if let Some(v) = stored.first() {
                        if let Some(n) = std::str::from_utf8(v).ok().and_then(|s| s.trim().parse().ok()) {
                            st.last_change = n;
                            st.prev_change = n;
                        }
                    }
                }
            }
            _ => self.seed_cookie(st)?,
        }

        self.issue_search(st)
    }

    fn seed_cookie(&self, st: &mut SourceState) -> Result<(), EngineError> {
        if st.cookie.is_empty() {
            if let Some(over) = self.cookie_override.lock().unwrap().take() {
                info!(rid = %self.rid(), "using supplied cookie override");
                st.cookie.ctxcsn = over.ctxcsn;
                st.cookie.delcsn = over.delcsn;
                return Ok(());
            }
            self.cookie_state.load_from_storage(self.dir.as_ref())?;
            let (vals, age) = self.cookie_state.committed();
            st.cookie.ctxcsn = vals;
            st.cookie_age = Some(age);
            return Ok(());
        }

        // Fold in anything other sources on this database committed since
        // we last looked.
        let (vals, age) = self.cookie_state.committed();
        if st.cookie_age != Some(age) && !vals.is_empty() {
            if st.cookie.ctxcsn.merge(&vals) {
                debug!(rid = %self.rid(), cookie = %st.cookie, "cookie advanced by siblings");
            }
            st.cookie_age = Some(age);
        }
        Ok(())
    }

    // ==================== Search issue ====================

    fn issue_search(&self, st: &mut SourceState) -> Result<(), EngineError> {
        let logging = self.delta_logging(st);

        if self.cfg.syncdata == SyncData::ChangeLog {
            // The change-log dialect always needs the refresh slot: even
            // its logging mode replays whole operations.
            if let RefreshGrant::Busy { .. } = self.cookie_state.try_begin_refresh(self.rid()) {
                return Err(DirError::Busy.into());
            }
            self.changelog_preflight(st)?;
        } else if !logging {
            if let RefreshGrant::Busy { .. } = self.cookie_state.try_begin_refresh(self.rid()) {
                return Err(DirError::Busy.into());
            }
        }

        // Re-evaluate: preflight may have flipped the log state.
        let logging = self.delta_logging(st);

        let mut controls = RequestControls {
            manage_dsa_it: self.cfg.manage_dsa_it,
            proxy_authz: self.cfg.authz_id.clone(),
            lazy_commit: self.cfg.lazy_commit,
            ..Default::default()
        };

        let spec = if self.cfg.mode == SyncMode::DirSync {
            controls.dirsync = Some(DirSyncRequest {
                flags: 1,
                max_bytes: 0,
                cookie: st.dirsync_cookie.clone(),
            });
            controls.show_deleted = !st.dirsync_cookie.is_empty();
            SearchSpec {
                base: self.cfg.base.clone(),
                scope: self.cfg.scope.into(),
                filter: self.cfg.filter.clone(),
                attrs: self.cfg.attrs.clone(),
                size_limit: self.cfg.size_limit,
                time_limit: self.cfg.time_limit,
                controls,
            }
        } else if logging && self.cfg.syncdata == SyncData::ChangeLog {
            if self.cfg.mode == SyncMode::RefreshAndPersist {
                controls.persistent_search = true;
            }
            SearchSpec {
                base: self.cfg.logbase.clone().expect("validated logbase"),
                scope: Scope::One,
                filter: format!("(changeNumber>={})", st.last_change + 1),
                attrs: CHANGELOG_ATTRS.iter().map(|s| s.to_string()).collect(),
                size_limit: self.cfg.size_limit,
                time_limit: self.cfg.time_limit,
                controls,
            }
        } else if logging {
            // Access-log delta mode.
            let mode = match self.cfg.mode {
                SyncMode::RefreshAndPersist => WireSyncMode::RefreshAndPersist,
                _ => WireSyncMode::RefreshOnly,
            };
            controls.sync = Some(SyncRequestControl {
                mode,
                cookie: Some(st.cookie.compose().into_bytes()),
                reload_hint: false,
            });
            SearchSpec {
                base: self.cfg.logbase.clone().expect("validated logbase"),
                scope: Scope::Subtree,
                filter: self.cfg.logfilter.clone().expect("validated logfilter"),
                attrs: ACCESSLOG_ATTRS.iter().map(|s| s.to_string()).collect(),
                size_limit: self.cfg.size_limit,
                time_limit: self.cfg.time_limit,
                controls,
            }
        } else {
            // Plain refresh (or delta fallback, which runs plain
            // refresh-only).
            let mode = if self.cfg.syncdata != SyncData::Plain
                && st.logstate == LogState::Fallback
            {
                WireSyncMode::RefreshOnly
            } else {
                match self.cfg.mode {
                    SyncMode::RefreshAndPersist => WireSyncMode::RefreshAndPersist,
                    _ => WireSyncMode::RefreshOnly,
                }
            };
            controls.sync = Some(SyncRequestControl {
                mode,
                cookie: Some(st.cookie.compose().into_bytes()),
                reload_hint: true,
            });
            SearchSpec {
                base: self.cfg.base.clone(),
                scope: self.cfg.scope.into(),
                filter: self.cfg.filter.clone(),
                attrs: self.cfg.attrs.clone(),
                size_limit: self.cfg.size_limit,
                time_limit: self.cfg.time_limit,
                controls,
            }
        };

        st.refresh_done = false;
        st.refresh_present = false;
        st.refresh_delete = false;

        info!(rid = %self.rid(), cookie = %st.cookie, "starting sync search");
        st.conn
            .as_mut()
            .expect("connected")
            .search(spec)
            .map_err(EngineError::Provider)?;
        st.search_active = true;
        Ok(())
    }

    /// Decide whether our change number is still inside the provider's log.
    fn changelog_preflight(&self, st: &mut SourceState) -> Result<(), EngineError> {
        let conn = st.conn.as_mut().expect("connected");
        let first = conn
            .root_dse_attr("firstchangenumber")
            .map_err(EngineError::Provider)?
            .and_then(|s| s.trim().parse::<u64>().ok());
        let last = conn
            .root_dse_attr("lastchangenumber")
            .map_err(EngineError::Provider)?
            .and_then(|s| s.trim().parse::<u64>().ok());
        match (first, last) {
            (Some(first), Some(last)) => {
                if st.last_change < first || (st.last_change == 0 && !st.refresh_done) {
                    st.logstate = LogState::Fallback;
                }
                if st.logstate == LogState::Fallback {
                    st.last_change = last;
                }
            }
            _ => {
                // No change-log counters on the provider: full refresh.
                st.logstate = LogState::Fallback;
            }
        }
        Ok(())
    }

    // ==================== Message loop (phase 2) ====================

    fn process(&self, st: &mut SourceState, sched: &dyn Scheduler) -> Result<Step, EngineError> {
        let mut refreshing = !st.refresh_done && !self.delta_logging(st);
        let timeout = if self.cfg.mode == SyncMode::RefreshAndPersist && st.refresh_done {
            Duration::ZERO
        } else {
            Duration::from_millis(self.cfg.network_timeout_ms)
        };

        let step = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Step::Finish(TickOutcome::Shutdown);
            }
            let msg = match st.conn.as_mut().expect("connected").recv(timeout) {
                Ok(Some(msg)) => msg,
                Ok(None) => break Step::Finish(TickOutcome::Timeout),
                Err(e) => {
                    warn!(rid = %self.rid(), error = %e, "receive failed");
                    break Step::Finish(TickOutcome::Error);
                }
            };

            let step = match msg {
                ProviderMessage::Entry(se) => self.handle_entry(st, se)?,
                ProviderMessage::Intermediate(info) => {
                    self.handle_intermediate(st, info, &mut refreshing, sched)?
                }
                ProviderMessage::Result(result) => {
                    self.handle_result(st, result, &mut refreshing, sched)?
                }
            };
            match step {
                Step::Continue => continue,
                other => break other,
            }
        };

        if refreshing {
            // A timeout keeps the refresh open; everything else closes it
            // (a reload re-acquires the slot on the next search).
            let closing = !matches!(step, Step::Finish(TickOutcome::Timeout));
            if closing || st.refresh_done {
                self.finish_refresh(st, sched);
            }
        }
        Ok(step)
    }

    // ==================== Entries ====================

    fn handle_entry(&self, st: &mut SourceState, se: SearchEntry) -> Result<Step, EngineError> {
        if self.cfg.mode == SyncMode::DirSync {
            return self.handle_dirsync_entry(st, se);
        }
        if self.cfg.syncdata == SyncData::ChangeLog {
            return self.handle_changelog_entry(st, se);
        }

        // Plain and access-log entries carry exactly one sync-state
        // control.
        if se.sync_state.len() > 1 {
            warn!(rid = %self.rid(), dn = %se.dn, "multiple sync-state controls on one entry");
            return Err(EngineError::Protocol("duplicate sync-state control".into()));
        }
        let Some(ctrl) = se.sync_state.first().cloned() else {
            warn!(rid = %self.rid(), dn = %se.dn, "search entry without sync-state control");
            return Err(EngineError::Protocol("missing sync-state control".into()));
        };

        // Cookie accompanying the entry: age-check against committed and
        // pending state, reserving a pending slot on success.
        let mut received: Option<SyncCookie> = None;
        let mut pending_slot: Option<usize> = None;
        if let Some(raw) = &ctrl.cookie {
            let text = String::from_utf8_lossy(raw);
            let cookie = SyncCookie::parse(&text)?;
            if let Some(slot) = cookie.ctxcsn.slots().first() {
                let csn = slot.csn.clone();
                let sid = csn.sid()?;
                if self.cookie_state.check_age_committed(sid, &csn)
                    == spindle_model::AgeCheck::TooOld
                {
                    st.too_old = true;
                    debug!(rid = %self.rid(), dn = %se.dn, csn = %csn, "stamp too old, dropping");
                    return Ok(Step::Continue);
                }
                st.too_old = false;
                match self.cookie_state.pre_commit(
                    sid,
                    &csn,
                    self.cfg.is_config_db,
                    &self.shutdown,
                )? {
                    PreCommit::TooOld => {
                        debug!(rid = %self.rid(), dn = %se.dn, csn = %csn, "stamp pending elsewhere, dropping");
                        return Ok(Step::Continue);
                    }
                    PreCommit::Ok { slot } => pending_slot = Some(slot),
                }
                received = Some(cookie);
            }
        } else if st.too_old {
            // Cookie-less entries inherit the session's latch.
            debug!(rid = %self.rid(), dn = %se.dn, "no cookie and too-old latched, dropping");
            return Ok(Step::Continue);
        }

        let result = self.apply_plain_entry(st, &se, &ctrl, received.as_ref());

        match result {
            Ok(()) => Ok(Step::Continue),
            Err(e) => {
                if let Some(slot) = pending_slot {
                    self.cookie_state.rollback_pending(slot);
                }
                if self.cfg.syncdata == SyncData::AccessLog
                    && st.logstate == LogState::Logging
                    && lost_sync(&e)
                {
                    // The log replay no longer lines up with our tree.
                    info!(rid = %self.rid(), dn = %se.dn, "delta-sync lost sync, falling back to refresh");
                    st.logstate = LogState::Fallback;
                    if let Some(conn) = st.conn.as_mut() {
                        conn.abandon();
                    }
                    return Ok(Step::Reload);
                }
                Err(e)
            }
        }
    }

    fn apply_plain_entry(
        &self,
        st: &mut SourceState,
        se: &SearchEntry,
        ctrl: &spindle_proto::SyncStateControl,
        received: Option<&SyncCookie>,
    ) -> Result<(), EngineError> {
        let kind = EntryKind::from(ctrl.state);

        if self.cfg.syncdata == SyncData::AccessLog && st.logstate == LogState::Logging {
            let op = decode::accesslog_op(&self.schema, &self.cfg, self.rewriter(), se)?;
            let mut op_time = st.op_time;
            let outcome = applier::apply_log_op(&self.ctx(), &op, &mut op_time);
            st.op_time = op_time;
            match outcome? {
                ApplyOutcome::RestartNeeded => return Err(DirError::NoSuchObject.into()),
                _ => {}
            }
            if let Some(received) = received {
                self.commit_received(st, received, false)?;
            }
            return Ok(());
        }

        // Present and add feed the present set while the present phase is
        // open.
        if matches!(kind, EntryKind::Present | EntryKind::Add)
            && !st.refresh_present
            && !st.refresh_done
        {
            st.present
                .get_or_insert_with(PresentSet::new)
                .insert(&ctrl.uuid);
        }
        if kind == EntryKind::Present {
            return Ok(());
        }

        let entry = if kind == EntryKind::Delete {
            None
        } else {
            Some(decode::plain_entry(
                &self.schema,
                &self.cfg,
                self.rewriter(),
                self.cookie_state.context_dn(),
                se,
                &ctrl.uuid,
            )?)
        };

        let csn = received
            .and_then(|c| c.ctxcsn.slots().first().map(|s| s.csn.clone()))
            .or_else(|| {
                if kind == EntryKind::Delete {
                    st.cookie.ctxcsn.slots().first().map(|s| s.csn.clone())
                } else {
                    None
                }
            });
        let incoming = IncomingEntry {
            kind,
            uuid: ctrl.uuid,
            entry,
            dirsync_mods: Vec::new(),
            csn,
            persisting: self.cfg.mode == SyncMode::RefreshAndPersist && st.refresh_done,
        };

        let mut op_time = st.op_time;
        let outcome = applier::apply_entry(&self.ctx(), &incoming, &mut op_time);
        st.op_time = op_time;
        match outcome? {
            ApplyOutcome::RestartNeeded => {
                st.cookie.ctxcsn.clear();
                st.cookie_age = None;
                return Err(DirError::NoSuchObject.into());
            }
            ApplyOutcome::Applied | ApplyOutcome::Ignored => {}
        }

        if let Some(received) = received {
            self.commit_received(st, received, false)?;
        }
        Ok(())
    }

    fn handle_changelog_entry(
        &self,
        st: &mut SourceState,
        se: SearchEntry,
    ) -> Result<Step, EngineError> {
        if st.logstate == LogState::Logging {
            let op = decode::changelog_op(&self.schema, &self.cfg, self.rewriter(), &se)?;
            let change_number = op.change_number;
            let mut op_time = st.op_time;
            let outcome = applier::apply_log_op(&self.ctx(), &op, &mut op_time);
            st.op_time = op_time;
            match outcome {
                Ok(_) => {
                    if let Some(n) = change_number {
                        st.last_change = n;
                    }
                    if se.entry_change_notice && st.refresh_done {
                        self.persist_last_change(st)?;
                    }
                    Ok(Step::Continue)
                }
                Err(e) if lost_sync(&e) => {
                    info!(rid = %self.rid(), "change-log lost sync, falling back to refresh");
                    st.logstate = LogState::Fallback;
                    if let Some(conn) = st.conn.as_mut() {
                        conn.abandon();
                    }
                    Ok(Step::Reload)
                }
                Err(e) => Err(e),
            }
        } else {
            // Fallback: plain entries, UUID carried in the legacy
            // attribute.
            let uuid = se
                .attr("nsUniqueId")
                .and_then(|a| a.first_str())
                .map(decode::dsee_uuid)
                .transpose()?
                .unwrap_or_else(SyncUuid::random);
            let entry = decode::plain_entry(
                &self.schema,
                &self.cfg,
                self.rewriter(),
                self.cookie_state.context_dn(),
                &se,
                &uuid,
            )?;
            let incoming = IncomingEntry {
                kind: EntryKind::DseeAdd,
                uuid,
                entry: Some(entry),
                dirsync_mods: Vec::new(),
                csn: None,
                persisting: false,
            };
            let mut op_time = st.op_time;
            let outcome = applier::apply_entry(&self.ctx(), &incoming, &mut op_time);
            st.op_time = op_time;
            outcome?;
            Ok(Step::Continue)
        }
    }

    fn handle_dirsync_entry(
        &self,
        st: &mut SourceState,
        se: SearchEntry,
    ) -> Result<Step, EngineError> {
        let change = decode::dirsync_entry(&self.schema, &self.cfg, self.rewriter(), &se)?;
        let Some(uuid) = change.uuid else {
            return Err(EngineError::Protocol("dir-sync entry without objectGUID".into()));
        };
        let incoming = IncomingEntry {
            kind: change.kind,
            uuid,
            entry: change.entry,
            dirsync_mods: change.mods,
            csn: None,
            persisting: false,
        };
        let mut op_time = st.op_time;
        let outcome = applier::apply_entry(&self.ctx(), &incoming, &mut op_time);
        st.op_time = op_time;
        outcome?;
        Ok(Step::Continue)
    }

    // ==================== Intermediates ====================

    fn handle_intermediate(
        &self,
        st: &mut SourceState,
        info: SyncInfoMessage,
        refreshing: &mut bool,
        sched: &dyn Scheduler,
    ) -> Result<Step, EngineError> {
        let received = match info.cookie() {
            Some(raw) => Some(SyncCookie::parse(&String::from_utf8_lossy(raw))?),
            None => None,
        };
        match &info {
            SyncInfoMessage::NewCookie { .. } => {
                // A new cookie only moves the source's own cookie; the
                // shared state commits on entry cookies and final results.
                if let Some(received) = &received {
                    if st.cookie.ctxcsn.merge(&received.ctxcsn) {
                        debug!(rid = %self.rid(), cookie = %st.cookie, "cookie advanced");
                    }
                }
                return Ok(Step::Continue);
            }
            SyncInfoMessage::RefreshDelete { refresh_done, .. }
            | SyncInfoMessage::RefreshPresent { refresh_done, .. } => {
                if st.refresh_done {
                    warn!(rid = %self.rid(), "multiple refreshDone messages, ending session");
                    return Err(EngineError::Protocol("multiple refreshDone".into()));
                }
                if matches!(info, SyncInfoMessage::RefreshDelete { .. }) {
                    debug!(rid = %self.rid(), "intermediate: refresh delete phase");
                    st.refresh_delete = true;
                } else {
                    debug!(rid = %self.rid(), "intermediate: refresh present phase");
                    st.refresh_present = true;
                }
                st.refresh_done = *refresh_done;
                if *refreshing && st.refresh_done {
                    self.finish_refresh(st, sched);
                    *refreshing = false;
                }
            }
            SyncInfoMessage::IdSet { refresh_deletes, uuids, .. } => {
                debug!(rid = %self.rid(), n = uuids.len(), refresh_deletes, "intermediate: uuid set");
                if *refresh_deletes {
                    let which = received
                        .as_ref()
                        .map(|c| st.cookie.ctxcsn.compare(&c.ctxcsn).1)
                        .unwrap_or(0);
                    let mut present = st.present.take();
                    let mut op_time = st.op_time;
                    let own = st.cookie.clone();
                    nonpresent::delete_nonpresent(
                        &self.ctx(),
                        &mut present,
                        Some(uuids.as_slice()),
                        received.as_ref(),
                        which,
                        &own,
                        &self.shutdown,
                        &mut op_time,
                    )?;
                    st.present = present;
                    st.op_time = op_time;
                } else {
                    let set = st.present.get_or_insert_with(PresentSet::new);
                    for uuid in uuids {
                        set.insert(uuid);
                    }
                }
                // Id-set cookies only stamp the reconciliation above; they
                // never advance the shared state on their own.
                return Ok(Step::Continue);
            }
        }

        // Any intermediate that advanced past our cookie closes out the
        // present bookkeeping and commits.
        if let Some(received) = &received {
            if !received.ctxcsn.is_empty() {
                let (ord, which) = st.cookie.ctxcsn.compare(&received.ctxcsn);
                if ord == VectorOrdering::Less || st.cookie.is_empty() {
                    if st.refresh_present {
                        let mut present = st.present.take();
                        let mut op_time = st.op_time;
                        let own = st.cookie.clone();
                        nonpresent::delete_nonpresent(
                            &self.ctx(),
                            &mut present,
                            None,
                            Some(received),
                            which,
                            &own,
                            &self.shutdown,
                            &mut op_time,
                        )?;
                        st.op_time = op_time;
                    }
                    self.commit_received(st, received, true)?;
                    st.present = None;
                }
            }
        }

        Ok(Step::Continue)
    }

    // ==================== Final results ====================

    fn handle_result(
        &self,
        st: &mut SourceState,
        result: SearchResult,
        refreshing: &mut bool,
        sched: &dyn Scheduler,
    ) -> Result<Step, EngineError> {
        debug!(rid = %self.rid(), code = ?result.code, "final search result");

        if result.code == ResultCode::SyncRefreshRequired {
            if self.delta_logging(st) {
                info!(rid = %self.rid(), "provider lost our log position, falling back");
                st.logstate = LogState::Fallback;
                return Ok(Step::Reload);
            }
            return Ok(Step::Finish(TickOutcome::Error));
        }

        if self.cfg.mode == SyncMode::DirSync {
            return self.handle_dirsync_result(st, result);
        }

        if self.cfg.syncdata == SyncData::ChangeLog && result.code.is_success() {
            self.persist_last_change(st)?;
            if st.logstate == LogState::Fallback {
                st.logstate = LogState::Logging;
                st.refresh_done = true;
                self.finish_refresh(st, sched);
                *refreshing = false;
                return Ok(Step::Reload);
            }
            // The change-log dialect holds the refresh slot through its
            // whole round; hand it back before the repoll.
            self.finish_refresh(st, sched);
            *refreshing = false;
            return Ok(Step::Finish(TickOutcome::Repoll));
        }

        let (received, refresh_deletes) = match &result.done {
            Some(SyncDoneControl { cookie, refresh_deletes }) => {
                let parsed = match cookie {
                    Some(raw) => Some(SyncCookie::parse(&String::from_utf8_lossy(raw))?),
                    None => None,
                };
                (parsed, *refresh_deletes)
            }
            None => (None, false),
        };

        let (ord, which) = match &received {
            Some(c) if !c.ctxcsn.is_empty() => {
                if st.cookie.is_empty() {
                    (VectorOrdering::Less, 0)
                } else {
                    st.cookie.ctxcsn.compare(&c.ctxcsn)
                }
            }
            _ => (VectorOrdering::Greater, 0),
        };
        let behind = ord == VectorOrdering::Less;

        if self.cfg.mode != SyncMode::RefreshAndPersist {
            if !refresh_deletes && behind && result.code.is_success() {
                let mut present = st.present.take();
                let mut op_time = st.op_time;
                let own = st.cookie.clone();
                nonpresent::delete_nonpresent(
                    &self.ctx(),
                    &mut present,
                    None,
                    received.as_ref(),
                    which,
                    &own,
                    &self.shutdown,
                    &mut op_time,
                )?;
                st.op_time = op_time;
            } else {
                if let Some(set) = st.present.take() {
                    debug!(leftover = set.into_count(), "present set discarded");
                }
            }
        }

        if behind && result.code.is_success() {
            if let Some(received) = &received {
                self.commit_received(st, received, true)?;
            }
        }

        if result.code.is_success()
            && self.cfg.syncdata == SyncData::AccessLog
            && st.logstate == LogState::Fallback
        {
            // Fallback refresh completed: back to consuming the log.
            st.logstate = LogState::Logging;
            st.refresh_done = true;
            self.finish_refresh(st, sched);
            *refreshing = false;
            return Ok(Step::Reload);
        }

        if self.cfg.mode == SyncMode::RefreshAndPersist {
            // A live persist session never ends with a search result.
            warn!(rid = %self.rid(), "persist session closed by provider");
            return Ok(Step::Finish(TickOutcome::Error));
        }
        Ok(Step::Finish(TickOutcome::Repoll))
    }

    fn handle_dirsync_result(
        &self,
        st: &mut SourceState,
        result: SearchResult,
    ) -> Result<Step, EngineError> {
        let Some(resp) = result.dirsync else {
            return Err(EngineError::Protocol("dir-sync result without control".into()));
        };
        if resp.cookie != st.dirsync_cookie {
            let mut flags = OpFlags::internal();
            flags.op_time = Some({
                st.op_time.tick();
                st.op_time
            });
            self.dir.modify(
                self.cookie_state.context_dn(),
                &[Modification::replace(
                    self.schema.resolve(ads::DIRSYNC_COOKIE),
                    vec![resp.cookie.clone()],
                )],
                &flags,
            )?;
            st.dirsync_cookie = resp.cookie;
        }
        if resp.more_results {
            // More changes queued right now.
            Ok(Step::Reload)
        } else {
            Ok(Step::Finish(TickOutcome::Repoll))
        }
    }

    // ==================== Cookie plumbing ====================

    fn rewriter(&self) -> Option<&dyn DnRewriter> {
        self.rewriter.as_deref()
    }

    /// Merge a received cookie into the shared state, persist, and refresh
    /// our own cookie from the committed result.
    fn commit_received(
        &self,
        st: &mut SourceState,
        received: &SyncCookie,
        save: bool,
    ) -> Result<(), EngineError> {
        if received.ctxcsn.is_empty() {
            return Ok(());
        }
        let changed = self.cookie_state.commit_and_persist(
            self.dir.as_ref(),
            &self.schema,
            &received.ctxcsn,
            save,
        )?;
        if changed {
            let (vals, age) = self.cookie_state.committed();
            st.cookie.ctxcsn = vals;
            st.cookie_age = Some(age);
        }
        Ok(())
    }

    fn persist_last_change(&self, st: &mut SourceState) -> Result<(), EngineError> {
        if st.last_change == st.prev_change {
            return Ok(());
        }
        let mut flags = OpFlags::internal();
        st.op_time.tick();
        flags.op_time = Some(st.op_time);
        self.dir.modify(
            self.cookie_state.context_dn(),
            &[Modification::replace(
                self.schema.resolve(ads::LAST_CHANGE_NUMBER),
                vec![st.last_change.to_string().into_bytes()],
            )],
            &flags,
        )?;
        st.prev_change = st.last_change;
        Ok(())
    }
}

/// Errors that mean the delta log no longer matches the local tree.
fn lost_sync(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::Dir(
            DirError::AlreadyExists
                | DirError::NoSuchObject
                | DirError::NoSuchAttribute
                | DirError::TypeOrValueExists
                | DirError::NotAllowedOnNonLeaf
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedConnector;
    use spindle_dir::{Entry, MemoryDirectory};

    fn harness(cfg: SourceConfig) -> (Arc<Source>, ScriptedConnector, Arc<MemoryDirectory>) {
        let schema = Schema::with_defaults();
        let suffix = Dn::parse("dc=example,dc=com");
        let dir = Arc::new(MemoryDirectory::new(suffix.clone(), schema.clone()));
        let mut root = Entry::new(suffix.clone());
        root.set(schema.resolve(ads::OBJECT_CLASS), vec![b"organization".to_vec()]);
        dir.seed(root);
        let connector = ScriptedConnector::new();
        let state = CookieState::new(suffix, false);
        let source = Source::new(
            cfg,
            dir.clone(),
            schema,
            Arc::new(connector.clone()),
            state,
            None,
            Arc::new(AtomicBool::new(false)),
            None,
        )
        .unwrap();
        (source, connector, dir)
    }

    fn base_cfg() -> SourceConfig {
        let mut cfg = SourceConfig::new(Rid::new(1).unwrap(), "ldap://p", "dc=example,dc=com");
        cfg.mode = SyncMode::RefreshOnly;
        cfg
    }

    #[test]
    fn test_connect_failure_consumes_retry() {
        let mut cfg = base_cfg();
        cfg.retry = spindle_model::RetrySchedule::parse("5 2").unwrap();
        let (source, connector, _) = harness(cfg);
        connector.fail_connects(10);

        assert_eq!(source.tick(&NoopScheduler), TickOutcome::Error);
        assert_eq!(source.consume_retry(), Some(Duration::from_secs(5)));
        assert_eq!(source.tick(&NoopScheduler), TickOutcome::Error);
        assert_eq!(source.consume_retry(), Some(Duration::from_secs(5)));
        assert_eq!(source.tick(&NoopScheduler), TickOutcome::Error);
        assert_eq!(source.consume_retry(), None);
    }

    #[test]
    fn test_search_carries_cookie_and_controls() {
        let (source, connector, _) = harness(base_cfg());
        connector.push_session(vec![vec![ProviderMessage::Result(SearchResult {
            code: ResultCode::Success,
            done: None,
            dirsync: None,
        })]]);
        assert_eq!(source.tick(&NoopScheduler), TickOutcome::Repoll);

        let searches = connector.searches();
        assert_eq!(searches.len(), 1);
        let sync = searches[0].controls.sync.as_ref().unwrap();
        assert_eq!(sync.mode, WireSyncMode::RefreshOnly);
        assert!(sync.reload_hint);
        let cookie = String::from_utf8(sync.cookie.clone().unwrap()).unwrap();
        assert!(cookie.starts_with("rid=001"));
    }

    #[test]
    fn test_empty_session_times_out_and_keeps_connection() {
        let mut cfg = base_cfg();
        cfg.mode = SyncMode::RefreshAndPersist;
        let (source, connector, _) = harness(cfg);
        connector.push_session(vec![vec![]]);
        assert_eq!(source.tick(&NoopScheduler), TickOutcome::Timeout);
        // Next tick reuses the session: no second connect.
        assert_eq!(source.tick(&NoopScheduler), TickOutcome::Timeout);
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn test_defunct_source_exits() {
        let (source, _, _) = harness(base_cfg());
        source.mark_defunct();
        assert_eq!(source.tick(&NoopScheduler), TickOutcome::Shutdown);
    }

    #[test]
    fn test_seed_cookie_from_storage() {
        let cfg = base_cfg();
        let (source, connector, dir) = harness(cfg);
        let csn = "20240101000000.000007Z#000000#001#000000";
        let suffix = Dn::parse("dc=example,dc=com");
        let mut root = dir.fetch(&suffix).unwrap().unwrap();
        root.set(
            source.schema.resolve(ads::CONTEXT_CSN),
            vec![csn.as_bytes().to_vec()],
        );
        dir.seed(root);

        connector.push_session(vec![vec![ProviderMessage::Result(SearchResult {
            code: ResultCode::Success,
            done: None,
            dirsync: None,
        })]]);
        source.tick(&NoopScheduler);

        let sync = connector.searches()[0].controls.sync.clone().unwrap();
        let cookie = String::from_utf8(sync.cookie.unwrap()).unwrap();
        assert!(cookie.contains(csn), "cookie was {cookie}");
    }
}
