//! At most one source per database refreshes at a time; the finisher
//! wakes the first paused sibling.

mod common;

use common::*;
use spindle_engine::provider::ChannelConnector;
use spindle_engine::{ScriptedConnector, TickOutcome};
use spindle_model::Rid;
use spindle_proto::{ProviderMessage, SyncInfoMessage};
use std::sync::Arc;

const CSN_1: &str = "20240101000000.000001Z#000000#001#000000";

#[test]
fn refresh_is_mutually_exclusive_and_handed_over() {
    let bed = TestBed::new();
    let sched = RecordingScheduler::default();
    let rid1 = Rid::new(1).unwrap();
    let rid2 = Rid::new(2).unwrap();

    // R1 streams live over a channel; R2 replays a canned refresh.
    let (chan_connector, tx) = ChannelConnector::new();
    let mut cfg1 = persist_cfg(1);
    cfg1.network_timeout_ms = 10;
    let r1 = bed.source(cfg1, Arc::new(chan_connector));

    let scripted = ScriptedConnector::new();
    scripted.push_session(vec![vec![result_msg(None, false)]]);
    let r2 = bed.source(refresh_only_cfg(2), Arc::new(scripted));

    // R1 connects and starts refreshing; nothing to read yet.
    assert_eq!(r1.tick(&sched), TickOutcome::Timeout);
    assert_eq!(bed.state.current_refresher(), Some(rid1));

    // R2 is told to wait and parks itself.
    assert_eq!(r2.tick(&sched), TickOutcome::Busy);
    assert_eq!(sched.paused.lock().unwrap().as_slice(), &[rid2]);
    assert_eq!(bed.state.current_refresher(), Some(rid1));

    // R1 finishes its refresh; R2 gets woken.
    tx.send(ProviderMessage::Intermediate(SyncInfoMessage::RefreshPresent {
        cookie: Some(cookie(CSN_1).into_bytes()),
        refresh_done: true,
    }))
    .unwrap();
    assert_eq!(r1.tick(&sched), TickOutcome::Timeout);
    assert_eq!(bed.state.current_refresher(), None);
    assert_eq!(sched.woken.lock().unwrap().as_slice(), &[rid2]);
    assert_eq!(bed.state.age(), 1);

    // Woken, R2 acquires the slot and completes its refresh.
    assert_eq!(r2.tick(&sched), TickOutcome::Repoll);
    assert_eq!(bed.state.current_refresher(), None);
}

#[test]
fn holder_reentry_does_not_deadlock() {
    let bed = TestBed::new();
    let sched = RecordingScheduler::default();

    let scripted = ScriptedConnector::new();
    // Two rounds on one session: refresh-only repolls re-acquire the slot.
    scripted.push_session(vec![vec![result_msg(None, false)]]);
    scripted.push_session(vec![vec![result_msg(None, false)]]);
    let r1 = bed.source(refresh_only_cfg(1), Arc::new(scripted));

    assert_eq!(r1.tick(&sched), TickOutcome::Repoll);
    assert_eq!(r1.tick(&sched), TickOutcome::Repoll);
    assert!(sched.paused.lock().unwrap().is_empty());
}
