//! Non-present reconciliation.
//!
//! After the present phase of a refresh, every local entry the provider
//! did not announce has been deleted upstream. The pass compares the
//! provider's UUID set against the local tree and issues the deletes, under
//! multi-provider safety: only entries whose stamps our cookie horizon
//! covers may go.

use crate::applier::{delete_entry, ApplyCtx};
use crate::error::EngineError;
use spindle_dir::{ads, Dn, Entry, Filter, OpTime, SearchParams};
use spindle_model::{AgeCheck, Csn, PresentSet, SyncCookie, SyncUuid};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Run the reconciliation pass.
///
/// `uuids` carries the provider's explicit delete set when it sent one
/// (sync-id-set with refreshDeletes); otherwise the local tree is walked
/// against `present`. `received` is the cookie that closed the phase,
/// `which` the witness position from the cookie comparison, and `own` the
/// source's cookie for stamp fallback.
pub fn delete_nonpresent(
    ctx: &ApplyCtx,
    present: &mut Option<PresentSet>,
    uuids: Option<&[SyncUuid]>,
    received: Option<&SyncCookie>,
    which: usize,
    own: &SyncCookie,
    shutdown: &AtomicBool,
    op_time: &mut OpTime,
) -> Result<(), EngineError> {
    let mut victims: Vec<Dn> = Vec::new();

    match uuids {
        Some(uuids) => {
            // Explicit delete set: resolve each UUID to its local entry.
            for uuid in uuids {
                let params = SearchParams::subtree(
                    ctx.base.clone(),
                    Filter::eq(ads::ENTRY_UUID, uuid.to_string()),
                )
                .limit(1);
                ctx.dir.search(&params, &mut |e| {
                    if !e.is_glue() {
                        victims.push(e.dn.clone());
                    }
                    Ok(())
                })?;
            }
        }
        None => {
            let mut filter = Filter::parse(&ctx.cfg.filter).map_err(EngineError::Config)?;
            if ctx.cfg.multi_provider {
                // Concurrent local updates may still be arriving; only
                // entries inside our visible horizon are candidates.
                if let Some(max) = received.and_then(|c| c.ctxcsn.max_csn()) {
                    filter = Filter::And(vec![
                        filter,
                        Filter::Le(ads::ENTRY_CSN.into(), max.as_str().as_bytes().to_vec()),
                    ]);
                }
            }
            let params = SearchParams::subtree(ctx.base.clone(), filter);
            let horizon = received.unwrap_or(own);
            ctx.dir.search(&params, &mut |e| {
                let Some(uuid) = e
                    .first_str(ads::ENTRY_UUID)
                    .and_then(|s| SyncUuid::parse_str(s).ok())
                else {
                    return Ok(());
                };
                if e.is_glue() {
                    return Ok(());
                }
                if let Some(set) = present.as_mut() {
                    if set.remove(&uuid) {
                        return Ok(());
                    }
                }
                // Covered by the cookie horizon? Entries stamped past it
                // raced in locally and stay.
                let covered = match e.entry_csn().map(Csn::from_raw) {
                    Some(csn) => match csn.sid() {
                        Ok(sid) => horizon.ctxcsn.check_age(sid, &csn) == AgeCheck::TooOld,
                        Err(_) => true,
                    },
                    None => true,
                };
                if covered {
                    debug!(dn = %e.dn, "entry not present upstream, scheduling delete");
                    victims.push(e.dn.clone());
                }
                Ok(())
            })?;
        }
    }

    if let Some(set) = present.take() {
        let leftover = set.into_count();
        debug!(leftover, "present set destroyed");
    }

    if victims.is_empty() {
        return Ok(());
    }

    // Stamp for the deletes: the provider's delete stamp when supplied,
    // else the witnessed cookie component, else our own first component.
    let stamp = received
        .and_then(|c| c.delcsn.clone())
        .or_else(|| received.and_then(|c| c.ctxcsn.slot(which).map(|s| s.csn.clone())))
        .or_else(|| own.ctxcsn.slots().first().map(|s| s.csn.clone()));

    info!(count = victims.len(), "deleting non-present entries");
    for dn in victims {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        delete_entry(ctx, &Entry::new(dn), stamp.as_ref(), op_time)?;
    }
    Ok(())
}
