//! Conflict resolution for the delta modify path.
//!
//! A delta modify can arrive after newer changes to the same entry have
//! already been applied locally. The modification list is rewritten against
//! every newer record in the local log journal (the applier appends one
//! under `logbase` per replayed operation), then demoted to soft operations
//! so it can no longer collide with state it did not expect.

use crate::config::SourceConfig;
use crate::decode::accesslog_mods_raw;
use crate::error::EngineError;
use spindle_dir::{ads, Dn, DirOps, Entry, Filter, ModOp, Modification, Schema, Scope, SearchParams};
use spindle_model::Csn;
use tracing::debug;

/// What to do with the incoming modify after inspection.
#[derive(Debug)]
pub enum ResolveOutcome {
    /// Apply this (possibly rewritten) modification list.
    Apply(Vec<Modification>),
    /// The incoming stamp equals local state; report the modify as stale.
    Stale,
}

struct Pending {
    m: Modification,
    /// Was a delete-all kept only because newer deletes were value-scoped?
    /// Demoted to a soft delete at the end.
    soften: bool,
}

/// Copy the incoming list for resolution: drop the operational attribute
/// mods (this modification is in the past), split replaces into
/// delete-all + add, and turn valueless replaces into deletes.
fn split_for_resolution(incoming: &[Modification]) -> Vec<Pending> {
    let mut out = Vec::with_capacity(incoming.len());
    for m in incoming {
        if m.desc.is(ads::ENTRY_CSN)
            || m.desc.is(ads::MODIFIERS_NAME)
            || m.desc.is(ads::MODIFY_TIMESTAMP)
        {
            continue;
        }
        match m.op {
            ModOp::Replace if m.values.is_empty() => {
                out.push(Pending {
                    m: Modification::delete_all(m.desc.clone()),
                    soften: false,
                });
            }
            ModOp::Replace => {
                out.push(Pending {
                    m: Modification::delete_all(m.desc.clone()),
                    soften: false,
                });
                out.push(Pending {
                    m: Modification::new(m.desc.clone(), ModOp::Add, m.values.clone()),
                    soften: false,
                });
            }
            _ => out.push(Pending { m: m.clone(), soften: false }),
        }
    }
    out
}

/// Remove from `m1` every value that appears in `m2`.
fn drop_common_values(m1: &mut Modification, m2: &Modification) {
    m1.values
        .retain(|v| !m2.values.iter().any(|w| m1.desc.values_equal(v, w)));
}

/// Rewrite `pending` against one newer modification.
fn resolve_pair(pending: &mut Vec<Pending>, newer: &Modification, local: &Entry) {
    pending.retain_mut(|p| {
        if !std::sync::Arc::ptr_eq(&p.m.desc, &newer.desc) {
            return true;
        }
        match newer.op {
            // A newer replace rewrote the attribute wholesale; nothing of
            // the older change survives.
            ModOp::Replace => false,
            ModOp::Delete | ModOp::SoftDelete => {
                if newer.values.is_empty() {
                    // Newer delete-all cancels everything older.
                    return false;
                }
                match p.m.op {
                    ModOp::Delete | ModOp::SoftDelete => {
                        if p.m.values.is_empty() {
                            // Older delete-all, newer deleted specific
                            // values: keep, but only as a soft delete.
                            p.soften = true;
                            true
                        } else {
                            drop_common_values(&mut p.m, newer);
                            !p.m.values.is_empty()
                        }
                    }
                    ModOp::Add | ModOp::SoftAdd => {
                        drop_common_values(&mut p.m, newer);
                        !p.m.values.is_empty()
                    }
                    _ => true,
                }
            }
            ModOp::Add | ModOp::SoftAdd => {
                match p.m.op {
                    ModOp::Add | ModOp::SoftAdd => {
                        // Competing adds: a single-valued attribute can
                        // only keep the newer one.
                        if p.m.desc.single_valued {
                            return false;
                        }
                        drop_common_values(&mut p.m, newer);
                        !p.m.values.is_empty()
                    }
                    ModOp::Delete | ModOp::SoftDelete => {
                        if p.m.values.is_empty() {
                            // Older delete-all vs newer add: delete only
                            // the values currently present, minus what the
                            // newer add put there.
                            let Some(attr) = local.get(&p.m.desc.name) else {
                                return false;
                            };
                            p.m.values = attr.values.clone();
                        }
                        drop_common_values(&mut p.m, newer);
                        !p.m.values.is_empty()
                    }
                    _ => true,
                }
            }
            _ => true,
        }
    });
}

/// Demotions applied to whatever survived: deletes become soft deletes and
/// adds of single-valued attributes become replaces, since other
/// out-of-order changes may already have landed.
fn demote(pending: Vec<Pending>) -> Vec<Modification> {
    pending
        .into_iter()
        .map(|p| {
            let mut m = p.m;
            if p.soften || m.op == ModOp::Delete {
                m.op = ModOp::SoftDelete;
            } else if m.op == ModOp::Add && m.desc.single_valued {
                m.op = ModOp::Replace;
            }
            m
        })
        .collect()
}

/// Resolve an incoming delta modify against local state.
///
/// `local` is the current peer entry. When the incoming stamp is older than
/// the entry's stamp, the list is reconciled against all newer log records
/// for the same target under `logbase`.
pub fn resolve_modify(
    dir: &dyn DirOps,
    schema: &Schema,
    cfg: &SourceConfig,
    target: &Dn,
    local: &Entry,
    incoming: &[Modification],
    incoming_csn: &Csn,
) -> Result<ResolveOutcome, EngineError> {
    let local_csn = local.entry_csn().map(Csn::from_raw);
    let newer_locally = match &local_csn {
        // No local stamp: assume the incoming change is newer.
        None => true,
        Some(local_csn) => match incoming_csn.cmp(local_csn) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => return Ok(ResolveOutcome::Stale),
            std::cmp::Ordering::Less => false,
        },
    };

    if newer_locally {
        // Still demote: other out-of-order changes may have landed.
        let pending = incoming
            .iter()
            .map(|m| Pending { m: m.clone(), soften: false })
            .collect();
        return Ok(ResolveOutcome::Apply(demote(pending)));
    }

    debug!(dn = %target, csn = %incoming_csn, "modify is older than local state, resolving");
    let mut pending = split_for_resolution(incoming);

    let logbase = cfg
        .logbase
        .as_deref()
        .ok_or_else(|| EngineError::Config("conflict resolution requires logbase".into()))?;
    let mut subs = vec![
        Filter::Ge(ads::ENTRY_CSN.into(), incoming_csn.as_str().as_bytes().to_vec()),
        Filter::eq("reqDN", target.norm()),
    ];
    if let Some(logfilter) = &cfg.logfilter {
        subs.push(Filter::parse(logfilter).map_err(EngineError::Config)?);
    }
    let params = SearchParams {
        base: Dn::parse(logbase),
        scope: Scope::Subtree,
        filter: Filter::And(subs),
        size_limit: None,
    };

    let mut newer_mods: Vec<Modification> = Vec::new();
    dir.search(&params, &mut |log_entry| {
        if let Some(attr) = log_entry.get("reqMod") {
            if let Ok(mods) = accesslog_mods_raw(schema, cfg, &attr.values) {
                newer_mods.extend(mods);
            }
        }
        Ok(())
    })?;

    for newer in &newer_mods {
        resolve_pair(&mut pending, newer, local);
        if pending.is_empty() {
            break;
        }
    }

    Ok(ResolveOutcome::Apply(demote(pending)))
}
