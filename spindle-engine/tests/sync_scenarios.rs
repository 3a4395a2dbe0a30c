//! End-to-end refresh scenarios over a scripted provider.

mod common;

use common::*;
use spindle_dir::{ads, Dn, DirOps};
use spindle_engine::{NoopScheduler, ScriptedConnector, TickOutcome};
use spindle_model::SyncUuid;
use spindle_proto::message::{RawAttribute, SearchEntry};
use spindle_proto::{ProviderMessage, SyncState, SyncStateControl};
use std::sync::Arc;

const CSN_1: &str = "20240101000000.000001Z#000000#001#000000";
const CSN_2: &str = "20240101000000.000002Z#000000#001#000000";
const CSN_5: &str = "20240101000000.000005Z#000000#001#000000";
const CSN_10: &str = "20240101000000.000010Z#000000#001#000000";

/// Steady state: One add during refresh, final result advances the
/// context vector, generation moves exactly once.
#[test]
fn steady_state_refresh_commits_final_cookie() {
    let bed = TestBed::new();
    let connector = ScriptedConnector::new();
    let uuid = SyncUuid::parse_str("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa").unwrap();

    connector.push_session(vec![vec![
        add_entry("cn=fresh,dc=example,dc=com", uuid, Some(CSN_1), None),
        result_msg(Some(&cookie(CSN_2)), false),
    ]]);

    let source = bed.source(refresh_only_cfg(1), Arc::new(connector));
    assert_eq!(source.tick(&NoopScheduler), TickOutcome::Repoll);

    let added = bed
        .dir
        .fetch(&Dn::parse("cn=fresh,dc=example,dc=com"))
        .unwrap()
        .expect("entry replicated");
    assert_eq!(
        added.first_str(ads::ENTRY_UUID),
        Some("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa")
    );

    assert_eq!(bed.stored_context_csn(), vec![CSN_2.to_string()]);
    assert_eq!(bed.state.age(), 1);
}

/// Stale drop: An entry stamped behind the committed vector is
/// silently dropped and latches too-old.
#[test]
fn stale_entry_dropped_without_local_write() {
    let bed = TestBed::new();
    bed.store_context_csn(&[CSN_10]);
    let connector = ScriptedConnector::new();
    let uuid = SyncUuid::from_bytes([7; 16]);

    connector.push_session(vec![vec![
        add_entry("cn=stale,dc=example,dc=com", uuid, Some(CSN_5), Some(&cookie(CSN_5))),
        result_msg(None, false),
    ]]);

    let source = bed.source(refresh_only_cfg(1), Arc::new(connector));
    assert_eq!(source.tick(&NoopScheduler), TickOutcome::Repoll);

    assert!(bed
        .dir
        .fetch(&Dn::parse("cn=stale,dc=example,dc=com"))
        .unwrap()
        .is_none());
    assert!(source.too_old());
    // Nothing committed: the stored vector is what we started with.
    assert_eq!(bed.stored_context_csn(), vec![CSN_10.to_string()]);
    assert_eq!(bed.state.age(), 0);
}

/// Multi-master merge: Receiving a cookie for new and known sids
/// produces the per-sid maximum union.
#[test]
fn multi_master_cookie_merge() {
    const A_OLD: &str = "20240101000000.000001Z#000000#001#000000";
    const A_NEW: &str = "20240101000000.000002Z#000000#001#000000";
    const C_SID2: &str = "20240101000000.000003Z#000000#002#000000";
    const B_SID3: &str = "20240101000000.000001Z#000000#003#000000";

    let bed = TestBed::new();
    bed.store_context_csn(&[A_OLD, C_SID2]);
    let connector = ScriptedConnector::new();

    connector.push_session(vec![vec![result_msg(
        Some(&format!("rid=001,csn={A_NEW};{B_SID3}")),
        false,
    )]]);

    let source = bed.source(refresh_only_cfg(1), Arc::new(connector));
    assert_eq!(source.tick(&NoopScheduler), TickOutcome::Repoll);

    assert_eq!(
        bed.stored_context_csn(),
        vec![A_NEW.to_string(), C_SID2.to_string(), B_SID3.to_string()]
    );
    assert_eq!(bed.state.age(), 1);
}

/// Delete of a non-leaf peer demotes it to glue and keeps children.
#[test]
fn non_leaf_delete_becomes_glue() {
    let bed = TestBed::new();
    let parent_uuid = SyncUuid::from_bytes([1; 16]);
    bed.seed_person("ou=dept,dc=example,dc=com", parent_uuid, CSN_1);
    bed.seed_person(
        "cn=kid,ou=dept,dc=example,dc=com",
        SyncUuid::from_bytes([2; 16]),
        CSN_1,
    );

    let connector = ScriptedConnector::new();
    connector.push_session(vec![vec![
        delete_entry_msg(parent_uuid, Some(&cookie(CSN_2))),
        result_msg(None, true),
    ]]);

    let source = bed.source(refresh_only_cfg(1), Arc::new(connector));
    source.tick(&NoopScheduler);

    let demoted = bed
        .dir
        .fetch(&Dn::parse("ou=dept,dc=example,dc=com"))
        .unwrap()
        .expect("parent kept as glue");
    assert!(demoted.is_glue());
    assert_eq!(demoted.entry_csn(), Some(CSN_2));
    assert!(bed
        .dir
        .fetch(&Dn::parse("cn=kid,ou=dept,dc=example,dc=com"))
        .unwrap()
        .is_some());
}

/// Non-present reconciliation at the end of a refresh round: the provider
/// no longer announces one of our entries.
#[test]
fn refresh_deletes_unannounced_entries() {
    let bed = TestBed::new();
    bed.store_context_csn(&[CSN_1]);
    let keep = SyncUuid::from_bytes([1; 16]);
    let gone = SyncUuid::from_bytes([2; 16]);
    bed.seed_person("cn=keep,dc=example,dc=com", keep, CSN_1);
    bed.seed_person("cn=gone,dc=example,dc=com", gone, CSN_1);

    let connector = ScriptedConnector::new();
    connector.push_session(vec![vec![
        // Present phase announces only one of the two.
        ProviderMessage::Entry(SearchEntry {
            dn: "cn=keep,dc=example,dc=com".into(),
            attrs: vec![RawAttribute::new("objectClass", vec![b"person".to_vec()])],
            sync_state: vec![SyncStateControl {
                state: SyncState::Present,
                uuid: keep,
                cookie: None,
            }],
            entry_change_notice: false,
        }),
        result_msg(Some(&cookie(CSN_2)), false),
    ]]);

    let source = bed.source(refresh_only_cfg(1), Arc::new(connector));
    assert_eq!(source.tick(&NoopScheduler), TickOutcome::Repoll);

    assert!(bed.dir.fetch(&Dn::parse("cn=keep,dc=example,dc=com")).unwrap().is_some());
    assert!(bed.dir.fetch(&Dn::parse("cn=gone,dc=example,dc=com")).unwrap().is_none());
}

/// Duplicate sync-state controls on one entry are a protocol error.
#[test]
fn duplicate_state_control_is_protocol_error() {
    let bed = TestBed::new();
    let connector = ScriptedConnector::new();
    let uuid = SyncUuid::from_bytes([9; 16]);
    let ctrl = SyncStateControl { state: SyncState::Add, uuid, cookie: None };

    connector.push_session(vec![vec![ProviderMessage::Entry(SearchEntry {
        dn: "cn=dup,dc=example,dc=com".into(),
        attrs: vec![RawAttribute::new("objectClass", vec![b"person".to_vec()])],
        sync_state: vec![ctrl.clone(), ctrl],
        entry_change_notice: false,
    })]]);

    let source = bed.source(refresh_only_cfg(1), Arc::new(connector));
    assert_eq!(source.tick(&NoopScheduler), TickOutcome::Error);
    assert!(bed.dir.fetch(&Dn::parse("cn=dup,dc=example,dc=com")).unwrap().is_none());
}

/// An add that lands before its parent materializes glue ancestors.
#[test]
fn out_of_order_add_goes_through_glue() {
    let bed = TestBed::new();
    let connector = ScriptedConnector::new();
    let uuid = SyncUuid::from_bytes([3; 16]);

    connector.push_session(vec![vec![
        add_entry("cn=leaf,ou=late,dc=example,dc=com", uuid, Some(CSN_1), None),
        result_msg(Some(&cookie(CSN_1)), false),
    ]]);

    let source = bed.source(refresh_only_cfg(1), Arc::new(connector));
    assert_eq!(source.tick(&NoopScheduler), TickOutcome::Repoll);

    assert!(bed
        .dir
        .fetch(&Dn::parse("cn=leaf,ou=late,dc=example,dc=com"))
        .unwrap()
        .is_some());
    let glue = bed.dir.fetch(&Dn::parse("ou=late,dc=example,dc=com")).unwrap().unwrap();
    assert!(glue.is_glue());
}
