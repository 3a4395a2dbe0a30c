//! Shared cookie state.
//!
//! One per database, shared by every source replicating into it. Holds the
//! committed context vector, the pending slots for changes currently being
//! applied, a generation counter, and the refresh arbitration slot.
//!
//! Lock order (must not be violated): refresh mutex -> main mutex ->
//! pending mutex. The pending mutex is never held while taking the main
//! mutex; writers gate on the condition variable tied to the main mutex.

use crate::error::EngineError;
use spindle_dir::{ads, Dn, DirError, DirOps, Entry, Modification, OpFlags, OpTime, Schema};
use spindle_model::{AgeCheck, Csn, CsnVector, Rid, Sid};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info, warn};

/// RDN of the sub-entry some databases keep the context vector under.
pub const SYNC_SUBENTRY_RDN: &str = "cn=ldapsync";

#[derive(Default)]
struct Committed {
    vals: CsnVector,
    age: u64,
    updating: bool,
    loaded: bool,
}

#[derive(Default)]
struct RefreshSlot {
    /// Source currently holding the refresh, if any.
    refreshing: Option<Rid>,
    /// Sources that asked and were told to wait, in arrival order.
    paused: Vec<Rid>,
}

/// Result of asking for the refresh slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshGrant {
    Granted,
    /// Someone else is refreshing; the caller was queued for a wake.
    Busy { holder: Rid },
}

/// Result of reserving a pending slot for an incoming stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCommit {
    /// Slot reserved; pair with `rollback_pending` or a successful commit.
    Ok { slot: usize },
    /// The stamp is not newer than pending state; drop the change.
    TooOld,
}

/// Shared per-database cookie state.
pub struct CookieState {
    context_dn: Dn,
    /// Context vector lives in a `cn=ldapsync` sub-entry instead of the
    /// context entry itself.
    use_subentry: bool,
    main: Mutex<Committed>,
    cond: Condvar,
    pending: Mutex<CsnVector>,
    refresh: Mutex<RefreshSlot>,
}

impl CookieState {
    pub fn new(context_dn: Dn, use_subentry: bool) -> Arc<Self> {
        Arc::new(CookieState {
            context_dn,
            use_subentry,
            main: Mutex::new(Committed::default()),
            cond: Condvar::new(),
            pending: Mutex::new(CsnVector::new()),
            refresh: Mutex::new(RefreshSlot::default()),
        })
    }

    pub fn context_dn(&self) -> &Dn {
        &self.context_dn
    }

    fn vector_dn(&self) -> Dn {
        if self.use_subentry {
            Dn::child_of(SYNC_SUBENTRY_RDN, &self.context_dn)
        } else {
            self.context_dn.clone()
        }
    }

    // ==================== Committed vector ====================

    /// On first use, seed the committed vector from the stored context
    /// vector attribute.
    pub fn load_from_storage(&self, dir: &dyn DirOps) -> Result<(), DirError> {
        let mut main = self.main.lock().unwrap();
        if main.loaded {
            return Ok(());
        }
        let values = dir.read_attr(&self.vector_dn(), ads::CONTEXT_CSN)?;
        if !values.is_empty() {
            let stamps = values
                .into_iter()
                .filter_map(|v| String::from_utf8(v).ok())
                .map(Csn::from_raw)
                .collect();
            main.vals = CsnVector::from_stamps(stamps);
            debug!(ctxcsn = %main.vals, "seeded cookie state from storage");
        }
        main.loaded = true;
        Ok(())
    }

    pub fn committed(&self) -> (CsnVector, u64) {
        let main = self.main.lock().unwrap();
        (main.vals.clone(), main.age)
    }

    pub fn age(&self) -> u64 {
        self.main.lock().unwrap().age
    }

    pub fn check_age_committed(&self, sid: Sid, csn: &Csn) -> AgeCheck {
        self.main.lock().unwrap().vals.check_age(sid, csn)
    }

    /// Drop all committed state. Restart trigger after the provider turned
    /// out not to know our context anymore.
    pub fn invalidate(&self) {
        let mut main = self.main.lock().unwrap();
        main.vals.clear();
        warn!("cookie state invalidated");
    }

    // ==================== Refresh arbitration ====================

    /// Ask to start a refresh. On `Busy` the caller is queued; the current
    /// refresher's `end_refresh` will name it for a wake.
    pub fn try_begin_refresh(&self, rid: Rid) -> RefreshGrant {
        let mut slot = self.refresh.lock().unwrap();
        match slot.refreshing {
            Some(holder) if holder != rid => {
                if !slot.paused.contains(&rid) {
                    slot.paused.push(rid);
                }
                debug!(%rid, %holder, "refresh in progress elsewhere, pausing");
                RefreshGrant::Busy { holder }
            }
            _ => {
                slot.refreshing = Some(rid);
                RefreshGrant::Granted
            }
        }
    }

    /// Release the refresh slot. Returns the first paused sibling to wake
    /// when `reschedule` is set and the caller actually held the slot.
    pub fn end_refresh(&self, rid: Rid, reschedule: bool) -> Option<Rid> {
        let mut slot = self.refresh.lock().unwrap();
        if slot.refreshing != Some(rid) {
            return None;
        }
        slot.refreshing = None;
        if !reschedule {
            return None;
        }
        let next = if slot.paused.is_empty() {
            None
        } else {
            Some(slot.paused.remove(0))
        };
        if let Some(next) = next {
            debug!(%rid, wake = %next, "refresh finished, waking sibling");
        }
        next
    }

    pub fn current_refresher(&self) -> Option<Rid> {
        self.refresh.lock().unwrap().refreshing
    }

    /// Forget a source entirely (configuration removal).
    pub fn forget(&self, rid: Rid) {
        let mut slot = self.refresh.lock().unwrap();
        slot.paused.retain(|r| *r != rid);
        if slot.refreshing == Some(rid) {
            slot.refreshing = None;
        }
    }

    // ==================== Pending slots ====================

    fn lock_pending(
        &self,
        nonblocking: bool,
        shutdown: &AtomicBool,
    ) -> Result<std::sync::MutexGuard<'_, CsnVector>, EngineError> {
        if !nonblocking {
            return Ok(self.pending.lock().unwrap());
        }
        // cn=config sources must not sleep on this lock while a global
        // pause is draining the pool.
        loop {
            match self.pending.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if shutdown.load(Ordering::Acquire) {
                        return Err(EngineError::Shutdown);
                    }
                    std::thread::yield_now();
                }
                Err(std::sync::TryLockError::Poisoned(e)) => return Ok(e.into_inner()),
            }
        }
    }

    /// Reserve a pending slot for an incoming stamp. The caller must pair
    /// a reserved slot with exactly one of: `rollback_pending`, or a
    /// commit that supersedes it.
    pub fn pre_commit(
        &self,
        sid: Sid,
        csn: &Csn,
        nonblocking: bool,
        shutdown: &AtomicBool,
    ) -> Result<PreCommit, EngineError> {
        let mut pending = self.lock_pending(nonblocking, shutdown)?;
        match pending.check_age(sid, csn) {
            AgeCheck::TooOld => Ok(PreCommit::TooOld),
            AgeCheck::Ok { slot } => {
                pending.set_slot(slot, csn.clone());
                Ok(PreCommit::Ok { slot })
            }
            AgeCheck::NewSid { slot } => {
                pending.insert_at(slot, sid, csn.clone());
                Ok(PreCommit::Ok { slot })
            }
        }
    }

    /// Restore a pending slot after a failed apply: back to the committed
    /// value for its sid, or cleared when the committed vector has none.
    /// Pending entries are never treated as durable by readers.
    pub fn rollback_pending(&self, slot: usize) {
        let committed = { self.main.lock().unwrap().vals.clone() };
        let mut pending = self.pending.lock().unwrap();
        let Some(entry) = pending.slot(slot) else {
            return;
        };
        let sid = entry.sid;
        match committed.get(sid) {
            Some(csn) => pending.set_slot(slot, csn.clone()),
            None => pending.set_slot(slot, Csn::from_raw("")),
        }
    }

    /// Age-check against the pending vector without reserving.
    pub fn check_age_pending(&self, sid: Sid, csn: &Csn) -> AgeCheck {
        self.pending.lock().unwrap().check_age(sid, csn)
    }

    // ==================== Commit ====================

    /// Merge `received` into the committed vector and persist the result
    /// onto the context entry. Returns whether anything moved.
    ///
    /// `save` marks the final write of a refresh: it is stamped with the
    /// operation time and replicated like a durable checkpoint rather than
    /// an internal write.
    pub fn commit_and_persist(
        &self,
        dir: &dyn DirOps,
        schema: &Schema,
        received: &CsnVector,
        save: bool,
    ) -> Result<bool, DirError> {
        let (merged, op_csn) = {
            let mut main = self.main.lock().unwrap();
            while main.updating {
                main = self.cond.wait(main).unwrap();
            }
            let mut merged = main.vals.clone();
            let Some(op_csn) = merged.merge_from(received) else {
                return Ok(false);
            };
            main.updating = true;
            (merged, op_csn)
        };

        let result = self.persist(dir, schema, &merged, &op_csn, save);

        let mut main = self.main.lock().unwrap();
        if result.is_ok() {
            main.vals = merged;
            main.age += 1;
            info!(age = main.age, ctxcsn = %main.vals, "context vector committed");
        } else {
            warn!(error = ?result, "context vector write failed");
        }
        main.updating = false;
        self.cond.notify_all();
        drop(main);

        result.map(|_| true)
    }

    fn persist(
        &self,
        dir: &dyn DirOps,
        schema: &Schema,
        merged: &CsnVector,
        op_csn: &Csn,
        save: bool,
    ) -> Result<(), DirError> {
        let desc = schema.resolve(ads::CONTEXT_CSN);
        let values: Vec<Vec<u8>> = merged
            .slots()
            .iter()
            .filter(|s| !s.sid.is_hole() && !s.csn.is_empty())
            .map(|s| s.csn.as_str().as_bytes().to_vec())
            .collect();
        let mods = [Modification::replace(desc.clone(), values.clone())];

        let mut flags = OpFlags {
            dont_replicate: !save,
            ..Default::default()
        }
        .with_csn(op_csn.clone());
        if save {
            flags = flags.at(OpTime::now());
        }

        let target = self.vector_dn();
        match dir.modify(&target, &mods, &flags) {
            Err(DirError::NoSuchObject) if self.use_subentry => {
                // First write: materialize the sub-entry carrying the
                // vector, then the modify is already satisfied by the add.
                let mut entry = Entry::new(target);
                entry.set(
                    schema.resolve(ads::OBJECT_CLASS),
                    vec![b"top".to_vec(), b"subentry".to_vec(), b"syncConsumerSubentry".to_vec()],
                );
                entry.set(schema.resolve("cn"), vec![b"ldapsync".to_vec()]);
                entry.set(desc, values);
                dir.add(entry, &flags)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_dir::MemoryDirectory;

    fn csn(s: &str) -> Csn {
        Csn::from_raw(s)
    }

    fn sid(n: i32) -> Sid {
        Sid::new(n).unwrap()
    }

    fn rid(n: u32) -> Rid {
        Rid::new(n).unwrap()
    }

    const A1: &str = "20240101000000.000001Z#000000#001#000000";
    const A2: &str = "20240101000000.000002Z#000000#001#000000";

    fn setup() -> (Arc<Schema>, MemoryDirectory, Arc<CookieState>) {
        let schema = Schema::with_defaults();
        let suffix = Dn::parse("dc=example,dc=com");
        let dir = MemoryDirectory::new(suffix.clone(), schema.clone());
        let mut root = Entry::new(suffix.clone());
        root.set(schema.resolve(ads::OBJECT_CLASS), vec![b"organization".to_vec()]);
        dir.seed(root);
        let state = CookieState::new(suffix, false);
        (schema, dir, state)
    }

    #[test]
    fn test_load_from_storage_once() {
        let (schema, dir, state) = setup();
        let mut root = dir.fetch(state.context_dn()).unwrap().unwrap();
        root.set(schema.resolve(ads::CONTEXT_CSN), vec![A1.as_bytes().to_vec()]);
        dir.seed(root);

        state.load_from_storage(&dir).unwrap();
        let (vals, age) = state.committed();
        assert_eq!(vals.get(sid(1)), Some(&csn(A1)));
        assert_eq!(age, 0);

        // Second load is a no-op even if storage changed.
        let mut root = dir.fetch(state.context_dn()).unwrap().unwrap();
        root.set(schema.resolve(ads::CONTEXT_CSN), vec![A2.as_bytes().to_vec()]);
        dir.seed(root);
        state.load_from_storage(&dir).unwrap();
        assert_eq!(state.committed().0.get(sid(1)), Some(&csn(A1)));
    }

    #[test]
    fn test_commit_bumps_age_exactly_once() {
        let (schema, dir, state) = setup();
        let received = CsnVector::from_stamps(vec![csn(A1)]);
        assert!(state
            .commit_and_persist(&dir, &schema, &received, false)
            .unwrap());
        assert_eq!(state.age(), 1);

        // Same vector again: nothing moves, age untouched.
        assert!(!state
            .commit_and_persist(&dir, &schema, &received, false)
            .unwrap());
        assert_eq!(state.age(), 1);

        // Stored attribute reflects the committed vector.
        let stored = dir
            .read_attr(state.context_dn(), ads::CONTEXT_CSN)
            .unwrap();
        assert_eq!(stored, vec![A1.as_bytes().to_vec()]);
    }

    #[test]
    fn test_commit_creates_subentry_when_configured() {
        let schema = Schema::with_defaults();
        let suffix = Dn::parse("dc=example,dc=com");
        let dir = MemoryDirectory::new(suffix.clone(), schema.clone());
        let mut root = Entry::new(suffix.clone());
        root.set(schema.resolve(ads::OBJECT_CLASS), vec![b"organization".to_vec()]);
        dir.seed(root);

        let state = CookieState::new(suffix.clone(), true);
        let received = CsnVector::from_stamps(vec![csn(A1)]);
        assert!(state
            .commit_and_persist(&dir, &schema, &received, true)
            .unwrap());
        let sub = Dn::child_of(SYNC_SUBENTRY_RDN, &suffix);
        let stored = dir.read_attr(&sub, ads::CONTEXT_CSN).unwrap();
        assert_eq!(stored, vec![A1.as_bytes().to_vec()]);
    }

    #[test]
    fn test_pre_commit_rollback_pairing() {
        let (schema, dir, state) = setup();
        let shutdown = AtomicBool::new(false);

        // Commit A1 so the committed vector has sid 1.
        state
            .commit_and_persist(&dir, &schema, &CsnVector::from_stamps(vec![csn(A1)]), false)
            .unwrap();

        // Reserve a slot for A2, then roll it back.
        let pc = state.pre_commit(sid(1), &csn(A2), false, &shutdown).unwrap();
        let PreCommit::Ok { slot } = pc else { panic!("expected slot") };
        assert_eq!(state.check_age_pending(sid(1), &csn(A2)), AgeCheck::TooOld);

        state.rollback_pending(slot);
        // After rollback the pending slot is back at A1, so A2 is fresh
        // again.
        assert!(matches!(
            state.check_age_pending(sid(1), &csn(A2)),
            AgeCheck::Ok { .. }
        ));
    }

    #[test]
    fn test_rollback_clears_new_sid_slot() {
        let (_, _, state) = setup();
        let shutdown = AtomicBool::new(false);
        let pc = state.pre_commit(sid(3), &csn(A1), false, &shutdown).unwrap();
        let PreCommit::Ok { slot } = pc else { panic!("expected slot") };
        state.rollback_pending(slot);
        // Cleared slot carries no information.
        assert!(matches!(
            state.check_age_pending(sid(3), &csn(A1)),
            AgeCheck::Ok { .. }
        ));
    }

    #[test]
    fn test_pre_commit_too_old() {
        let (_, _, state) = setup();
        let shutdown = AtomicBool::new(false);
        state.pre_commit(sid(1), &csn(A2), false, &shutdown).unwrap();
        assert_eq!(
            state.pre_commit(sid(1), &csn(A1), false, &shutdown).unwrap(),
            PreCommit::TooOld
        );
    }

    #[test]
    fn test_nonblocking_pre_commit_respects_shutdown() {
        let (_, _, state) = setup();
        let shutdown = AtomicBool::new(true);
        // Hold the pending lock from another handle.
        let guard = state.pending.lock().unwrap();
        let err = state.pre_commit(sid(1), &csn(A1), true, &shutdown);
        assert_eq!(err, Err(EngineError::Shutdown));
        drop(guard);
    }

    #[test]
    fn test_refresh_arbitration() {
        let (_, _, state) = setup();
        assert_eq!(state.try_begin_refresh(rid(1)), RefreshGrant::Granted);
        assert_eq!(
            state.try_begin_refresh(rid(2)),
            RefreshGrant::Busy { holder: rid(1) }
        );
        // Re-entry by the holder stays granted.
        assert_eq!(state.try_begin_refresh(rid(1)), RefreshGrant::Granted);
        assert_eq!(state.current_refresher(), Some(rid(1)));

        // A non-holder release is a no-op.
        assert_eq!(state.end_refresh(rid(2), true), None);
        assert_eq!(state.current_refresher(), Some(rid(1)));

        // Holder release wakes the first paused sibling.
        assert_eq!(state.end_refresh(rid(1), true), Some(rid(2)));
        assert_eq!(state.current_refresher(), None);
    }

    #[test]
    fn test_commit_serialized_by_condvar() {
        let (schema, dir, state) = setup();
        let dir = Arc::new(dir);

        let mut handles = Vec::new();
        for i in 1..=4u32 {
            let state = state.clone();
            let dir = dir.clone();
            let schema = schema.clone();
            handles.push(std::thread::spawn(move || {
                let stamp = format!("20240101000000.{i:06}Z#000000#001#000000");
                let received = CsnVector::from_stamps(vec![Csn::from_raw(stamp)]);
                state
                    .commit_and_persist(dir.as_ref(), &schema, &received, false)
                    .unwrap()
            }));
        }
        let changed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c)
            .count();

        // Every thread that changed the vector bumped the age exactly once.
        assert_eq!(state.age() as usize, changed);
        // Final committed value is the maximum stamp.
        let (vals, _) = state.committed();
        assert_eq!(
            vals.get(sid(1)).unwrap().as_str(),
            "20240101000000.000004Z#000000#001#000000"
        );
    }
}
