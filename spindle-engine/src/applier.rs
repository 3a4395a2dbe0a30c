//! The entry applier.
//!
//! Takes decoded incoming changes and lands them on the local tree: locate
//! the peer entry by UUID, classify as add / modify / rename / delete, diff
//! where needed, and handle the structural conflicts replication runs into
//! (missing ancestors, recreated entries, deletes of non-leaves).

use crate::config::{SourceConfig, SyncData, SyncMode};
use crate::conflict::{self, ResolveOutcome};
use crate::cookie_state::CookieState;
use crate::decode::{EntryKind, LogOp, LogOpKind};
use crate::error::EngineError;
use crate::glue;
use spindle_dir::{
    ads, diff::diff_entries, Dn, DirError, DirOps, Entry, Filter, ModOp, Modification, OpFlags,
    OpTime, Schema, Scope, SearchParams,
};
use spindle_model::{AgeCheck, Csn, SyncUuid};
use tracing::{debug, info, warn};

/// How an incoming change landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Dropped without touching the tree (stale, duplicate, unchanged).
    Ignored,
    /// The local context is inconsistent with the provider; the caller
    /// must invalidate its cookie and start over.
    RestartNeeded,
}

/// Everything the applier needs about its surroundings.
pub struct ApplyCtx<'a> {
    pub dir: &'a dyn DirOps,
    pub schema: &'a Schema,
    pub cfg: &'a SourceConfig,
    /// Local search base (post-rewrite).
    pub base: Dn,
    /// Database suffix, for glue materialization.
    pub suffix: Dn,
    pub context_dn: Dn,
    pub cookie_state: &'a CookieState,
}

/// One decoded change headed for the tree.
pub struct IncomingEntry {
    pub kind: EntryKind,
    pub uuid: SyncUuid,
    pub entry: Option<Entry>,
    /// Ready-made differential (dir-sync dialect only).
    pub dirsync_mods: Vec<Modification>,
    /// Stamp for this change; also used for delete stamping.
    pub csn: Option<Csn>,
    /// True once a refresh-and-persist session has finished refreshing.
    pub persisting: bool,
}

/// What the peer lookup learned.
struct DnInfo {
    peer: Entry,
    renamed: bool,
    new_superior: Option<Dn>,
    delete_old_rdn: bool,
    mods: Vec<Modification>,
}

impl<'a> ApplyCtx<'a> {
    fn flags(&self, csn: Option<&Csn>, op_time: &mut OpTime) -> OpFlags {
        op_time.tick();
        let mut flags = OpFlags { dont_replicate: true, ..Default::default() }.at(*op_time);
        flags.no_schema_check = !self.cfg.schema_checking;
        if let Some(csn) = csn {
            flags.queued_csn = Some(csn.clone());
        }
        flags
    }

    /// Locate the local peer carrying this UUID.
    fn find_peer(&self, uuid: &SyncUuid) -> Result<Option<Entry>, DirError> {
        let mut found: Option<Entry> = None;
        let params = SearchParams::subtree(
            self.base.clone(),
            Filter::eq(ads::ENTRY_UUID, uuid.to_string()),
        )
        .limit(1);
        self.dir.search(&params, &mut |e| {
            if found.is_some() {
                warn!(%uuid, "entry uuid is not unique");
            } else {
                found = Some(e.clone());
            }
            Ok(())
        })?;
        Ok(found)
    }

    /// Old attributes as the diff should see them: the replicated
    /// selection, plus the sync bookkeeping attributes the engine always
    /// carries.
    fn filter_old_attrs(&self, peer: &Entry) -> Entry {
        let mut out = Entry::new(peer.dn.clone());
        for attr in &peer.attrs {
            let name = &attr.desc.name;
            let keep = attr.desc.is(ads::ENTRY_UUID)
                || attr.desc.is(ads::ENTRY_CSN)
                || (self.cfg.is_included(name, attr.desc.operational)
                    && !self.cfg.is_excluded(name));
            if keep {
                out.attrs.push(attr.clone());
            }
        }
        out
    }

    /// Rebuild the dn-info for a peer entry against the incoming entry.
    fn dn_info(&self, peer: Entry, incoming: &IncomingEntry) -> Option<DnInfo> {
        let new_entry = incoming.entry.as_ref()?;

        if incoming.kind != EntryKind::DirSyncModify && !peer.is_glue() {
            // Make sure the incoming entry is actually newer.
            if let (Some(old), Some(new)) = (peer.entry_csn(), new_entry.entry_csn()) {
                if old >= new {
                    debug!(dn = %peer.dn, old, new, "incoming entry is not newer, ignored");
                    return None;
                }
            }
        }

        let old_parent = peer.dn.parent().unwrap_or_else(Dn::root);
        let new_parent = new_entry.dn.parent().unwrap_or_else(Dn::root);
        let moved = old_parent != new_parent;
        let renamed = moved || peer.dn.rdn_norm() != new_entry.dn.rdn_norm();

        let mut delete_old_rdn = false;
        if renamed {
            if let Some((attr, value)) = peer.dn.rdn_attr_value() {
                delete_old_rdn = !new_entry
                    .get(attr)
                    .map(|a| a.has_value(value.as_bytes()))
                    .unwrap_or(false);
            }
        }

        let mods = if incoming.kind == EntryKind::DirSyncModify {
            incoming.dirsync_mods.clone()
        } else {
            let old = self.filter_old_attrs(&peer);
            let is_ctx = peer.dn == self.context_dn;
            diff_entries(&old, new_entry, is_ctx)
        };

        Some(DnInfo {
            peer,
            renamed,
            new_superior: moved.then_some(new_parent),
            delete_old_rdn,
            mods,
        })
    }
}

/// Apply one incoming full-sync (or dir-sync) change.
pub fn apply_entry(
    ctx: &ApplyCtx,
    incoming: &IncomingEntry,
    op_time: &mut OpTime,
) -> Result<ApplyOutcome, EngineError> {
    debug!(
        kind = incoming.kind.as_str(),
        uuid = %incoming.uuid,
        csn = incoming.csn.as_ref().map(|c| c.as_str()).unwrap_or("(none)"),
        "applying entry"
    );

    let peer = ctx.find_peer(&incoming.uuid)?;

    match incoming.kind {
        EntryKind::Delete => {
            let Some(peer) = peer else {
                return Ok(ApplyOutcome::Ignored);
            };
            delete_entry(ctx, &peer, incoming.csn.as_ref(), op_time)?;
            Ok(ApplyOutcome::Applied)
        }
        EntryKind::Present => Ok(ApplyOutcome::Ignored),
        _ => match peer {
            None => add_missing(ctx, incoming, op_time, true),
            Some(peer) => {
                let Some(dni) = ctx.dn_info(peer, incoming) else {
                    return Ok(ApplyOutcome::Ignored);
                };
                modify_peer(ctx, incoming, dni, op_time)
            }
        },
    }
}

/// The add path: no local peer was found.
fn add_missing(
    ctx: &ApplyCtx,
    incoming: &IncomingEntry,
    op_time: &mut OpTime,
    retry: bool,
) -> Result<ApplyOutcome, EngineError> {
    let entry = match incoming.entry.as_ref() {
        // A differential for an entry we never saw cannot be applied.
        Some(_) if incoming.kind == EntryKind::DirSyncModify => {
            warn!(uuid = %incoming.uuid, "differential for unknown entry, ignored");
            return Ok(ApplyOutcome::Ignored);
        }
        Some(entry) => entry,
        None => {
            warn!(uuid = %incoming.uuid, "change without entry payload, ignored");
            return Ok(ApplyOutcome::Ignored);
        }
    };

    // Covered by the committed context already? Then this add replays
    // history we have.
    let stamp = incoming
        .csn
        .clone()
        .or_else(|| entry.entry_csn().map(Csn::from_raw));
    if let Some(stamp) = &stamp {
        if let Ok(sid) = stamp.sid() {
            if ctx.cookie_state.check_age_committed(sid, stamp) == AgeCheck::TooOld {
                debug!(dn = %entry.dn, csn = %stamp, "add not new enough, ignored");
                return Ok(ApplyOutcome::Ignored);
            }
        }
    }

    let flags = ctx.flags(stamp.as_ref(), op_time);
    match ctx.dir.add(entry.clone(), &flags) {
        Ok(()) => {
            info!(dn = %entry.dn, "entry added");
            Ok(ApplyOutcome::Applied)
        }
        Err(DirError::AlreadyExists) if retry => {
            // Probably a glue placeholder or an entry recreated under the
            // same DN with a different UUID; rework it as a modify.
            let existing = ctx
                .dir
                .fetch(&entry.dn)?
                .ok_or(DirError::AlreadyExists)?;
            match ctx.dn_info(existing, incoming) {
                Some(dni) => modify_peer(ctx, incoming, dni, op_time),
                None => Ok(ApplyOutcome::Ignored),
            }
        }
        Err(DirError::NoSuchObject) => {
            if ctx.cfg.mode == SyncMode::RefreshAndPersist && incoming.persisting {
                // The parent should exist during persist. Something is
                // deeply wrong; force a fresh refresh.
                warn!(dn = %entry.dn, "missing parent during persist, restarting");
                ctx.cookie_state.invalidate();
                return Ok(ApplyOutcome::RestartNeeded);
            }
            match glue::add_with_glue(ctx.dir, ctx.schema, &ctx.suffix, entry.clone(), &flags) {
                Ok(()) | Err(DirError::AlreadyExists) => Ok(ApplyOutcome::Applied),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Names of the operational attributes that ride on the rename when the
/// change is a pure rename.
fn is_op_trio(m: &Modification) -> bool {
    m.desc.is(ads::ENTRY_CSN) || m.desc.is(ads::MODIFIERS_NAME) || m.desc.is(ads::MODIFY_TIMESTAMP)
}

/// The modify path: a peer exists, possibly renamed.
fn modify_peer(
    ctx: &ApplyCtx,
    incoming: &IncomingEntry,
    mut dni: DnInfo,
    op_time: &mut OpTime,
) -> Result<ApplyOutcome, EngineError> {
    let new_entry = incoming.entry.as_ref().expect("modify without entry");

    if dni.renamed {
        strip_rename_mods(&mut dni, new_entry);

        let (op_trio, rest): (Vec<_>, Vec<_>) = dni.mods.into_iter().partition(is_op_trio);
        dni.mods = rest;
        let pure_rename = dni.mods.is_empty();

        // A pure rename carries the stamp and the operational attributes
        // itself; otherwise they ride with the trailing modify.
        let rename_mods: Vec<Modification> = if pure_rename { op_trio.clone() } else { Vec::new() };
        let rename_csn = if pure_rename { incoming.csn.as_ref() } else { None };
        let flags = ctx.flags(rename_csn, op_time);

        let mut result = ctx.dir.rename(
            &dni.peer.dn,
            new_entry.dn.rdn(),
            dni.new_superior.as_ref(),
            dni.delete_old_rdn,
            &rename_mods,
            &flags,
        );
        if result == Err(DirError::NoSuchObject) && dni.new_superior.is_some() {
            // The new superior has not arrived yet.
            glue::add_glue_ancestors(ctx.dir, ctx.schema, &ctx.suffix, &new_entry.dn)?;
            result = ctx.dir.rename(
                &dni.peer.dn,
                new_entry.dn.rdn(),
                dni.new_superior.as_ref(),
                dni.delete_old_rdn,
                &rename_mods,
                &flags,
            );
        }
        result?;
        info!(from = %dni.peer.dn, to = %new_entry.dn, "entry renamed");

        if pure_rename {
            return Ok(ApplyOutcome::Applied);
        }
        dni.mods.extend(op_trio);
        dni.peer.dn = new_entry.dn.clone();
    }

    if dni.mods.is_empty() {
        debug!(dn = %dni.peer.dn, "entry unchanged, ignored");
        return Ok(ApplyOutcome::Ignored);
    }

    let flags = ctx.flags(incoming.csn.as_ref(), op_time);
    ctx.dir.modify(&dni.peer.dn, &dni.mods, &flags)?;
    info!(dn = %dni.peer.dn, nmods = dni.mods.len(), "entry modified");
    Ok(ApplyOutcome::Applied)
}

/// Drop the modifications the rename itself already performs: the delete
/// of the old naming value and the add of the new one.
fn strip_rename_mods(dni: &mut DnInfo, new_entry: &Entry) {
    let old_rdn = dni.peer.dn.rdn_attr_value().map(|(a, v)| (a.to_string(), v.to_string()));
    let new_rdn = new_entry.dn.rdn_attr_value().map(|(a, v)| (a.to_string(), v.to_string()));

    if dni.delete_old_rdn {
        if let Some((old_attr, old_val)) = &old_rdn {
            dni.mods.retain_mut(|m| {
                if !m.desc.is(old_attr) {
                    return true;
                }
                match m.op {
                    ModOp::Delete if m.values.len() <= 1 => false,
                    ModOp::Delete => {
                        m.values.retain(|v| !m.desc.values_equal(v, old_val.as_bytes()));
                        !m.values.is_empty()
                    }
                    ModOp::Replace if m.values.len() == 1 => false,
                    _ => true,
                }
            });
        }
    }
    if let Some((new_attr, new_val)) = &new_rdn {
        dni.mods.retain_mut(|m| {
            if !m.desc.is(new_attr) || !matches!(m.op, ModOp::Add | ModOp::SoftAdd) {
                return true;
            }
            m.values.retain(|v| !m.desc.values_equal(v, new_val.as_bytes()));
            !m.values.is_empty()
        });
    }
}

/// Delete the peer; a populated subtree keeps the entry as glue instead.
pub fn delete_entry(
    ctx: &ApplyCtx,
    peer: &Entry,
    csn: Option<&Csn>,
    op_time: &mut OpTime,
) -> Result<(), EngineError> {
    let flags = ctx.flags(csn, op_time);
    match ctx.dir.delete(&peer.dn, &flags) {
        Ok(()) => {
            info!(dn = %peer.dn, "entry deleted");
            delete_glue_parents(ctx, &peer.dn, op_time)?;
            Ok(())
        }
        Err(DirError::NotAllowedOnNonLeaf) => {
            // Demote to a glue placeholder so the children survive.
            let mut mods = vec![
                Modification::replace(
                    ctx.schema.resolve(ads::OBJECT_CLASS),
                    vec![ads::TOP.as_bytes().to_vec(), ads::GLUE.as_bytes().to_vec()],
                ),
                Modification::replace(
                    ctx.schema.resolve(ads::STRUCTURAL_OBJECT_CLASS),
                    vec![ads::GLUE.as_bytes().to_vec()],
                ),
            ];
            if let Some(csn) = csn {
                mods.push(Modification::replace(
                    ctx.schema.resolve(ads::ENTRY_CSN),
                    vec![csn.as_str().as_bytes().to_vec()],
                ));
            }
            let flags = ctx.flags(csn, op_time);
            ctx.dir.modify(&peer.dn, &mods, &flags)?;
            info!(dn = %peer.dn, "non-leaf delete demoted to glue");
            Ok(())
        }
        Err(DirError::NoSuchObject) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Walk up from a removed entry deleting ancestors that were only glue and
/// are now childless. Each hop gets a fresh operation time so timestamps
/// never collide.
fn delete_glue_parents(ctx: &ApplyCtx, from: &Dn, op_time: &mut OpTime) -> Result<(), EngineError> {
    let mut cur = from.parent();
    while let Some(dn) = cur {
        if !dn.is_under(&ctx.suffix) {
            break;
        }
        let Some(parent) = ctx.dir.fetch(&dn)? else {
            break;
        };
        if !parent.is_glue() || has_children(ctx.dir, &dn)? {
            break;
        }
        let flags = ctx.flags(None, op_time);
        match ctx.dir.delete(&dn, &flags) {
            Ok(()) => debug!(dn = %dn, "removed empty glue parent"),
            Err(DirError::NotAllowedOnNonLeaf) | Err(DirError::NoSuchObject) => break,
            Err(e) => return Err(e.into()),
        }
        cur = dn.parent();
    }
    Ok(())
}

fn has_children(dir: &dyn DirOps, dn: &Dn) -> Result<bool, DirError> {
    let mut any = false;
    let params = SearchParams {
        base: dn.clone(),
        scope: Scope::One,
        filter: Filter::any(),
        size_limit: Some(1),
    };
    dir.search(&params, &mut |_| {
        any = true;
        Ok(())
    })?;
    Ok(any)
}

// ==================== Delta operations ====================

/// Replay one decoded log record against the local tree.
///
/// Applied operations are journaled under the configured log container so
/// later out-of-order records can be reconciled against them.
pub fn apply_log_op(
    ctx: &ApplyCtx,
    op: &LogOp,
    op_time: &mut OpTime,
) -> Result<ApplyOutcome, EngineError> {
    let outcome = replay_log_op(ctx, op, op_time)?;
    if outcome == ApplyOutcome::Applied {
        record_log_op(ctx, op, op_time);
    }
    Ok(outcome)
}

fn replay_log_op(
    ctx: &ApplyCtx,
    op: &LogOp,
    op_time: &mut OpTime,
) -> Result<ApplyOutcome, EngineError> {
    // Stale records are dropped before touching anything.
    if let Some(csn) = &op.csn {
        if let Ok(sid) = csn.sid() {
            if ctx.cookie_state.check_age_committed(sid, csn) == AgeCheck::TooOld {
                debug!(dn = %op.dn, csn = %csn, "log record not new enough, ignored");
                return Ok(ApplyOutcome::Ignored);
            }
        }
    }

    match &op.kind {
        LogOpKind::Add => {
            let mut entry = Entry::new(op.dn.clone());
            for m in &op.mods {
                match m.op {
                    ModOp::Add | ModOp::Replace | ModOp::SoftAdd => {
                        entry.put(m.desc.clone(), m.values.clone())
                    }
                    _ => {}
                }
            }
            let flags = ctx.flags(op.csn.as_ref(), op_time);
            match ctx.dir.add(entry, &flags) {
                Ok(()) => {
                    info!(dn = %op.dn, "log add applied");
                    Ok(ApplyOutcome::Applied)
                }
                Err(DirError::AlreadyExists) => {
                    // Stamp wins: success iff the local entry is at least
                    // as new as the record.
                    let local = ctx.dir.fetch(&op.dn)?;
                    let newer_locally = match (&op.csn, local.as_ref().and_then(|e| e.entry_csn()))
                    {
                        (Some(incoming), Some(local)) => local >= incoming.as_str(),
                        _ => true,
                    };
                    if newer_locally {
                        debug!(dn = %op.dn, "log add already present, ignored");
                        Ok(ApplyOutcome::Ignored)
                    } else {
                        Err(DirError::AlreadyExists.into())
                    }
                }
                Err(e) => Err(e.into()),
            }
        }
        LogOpKind::Modify => {
            let csn = op
                .csn
                .clone()
                .ok_or_else(|| EngineError::Protocol("log modify without stamp".into()))?;
            let local = ctx
                .dir
                .fetch(&op.dn)?
                .ok_or(DirError::NoSuchObject)?;
            let mods = match conflict::resolve_modify(
                ctx.dir,
                ctx.schema,
                ctx.cfg,
                &op.dn,
                &local,
                &op.mods,
                &csn,
            )? {
                ResolveOutcome::Apply(mods) => mods,
                ResolveOutcome::Stale => {
                    // Identical stamps should never happen; report as a
                    // collision so logging mode falls back to refresh.
                    return Err(DirError::TypeOrValueExists.into());
                }
            };
            if mods.is_empty() {
                return Ok(ApplyOutcome::Ignored);
            }
            let flags = ctx.flags(Some(&csn), op_time);
            ctx.dir.modify(&op.dn, &mods, &flags)?;
            info!(dn = %op.dn, nmods = mods.len(), "log modify applied");
            Ok(ApplyOutcome::Applied)
        }
        LogOpKind::Rename { new_rdn, delete_old_rdn, new_superior } => {
            let flags = ctx.flags(op.csn.as_ref(), op_time);
            ctx.dir.rename(
                &op.dn,
                new_rdn,
                new_superior.as_ref(),
                *delete_old_rdn,
                &op.mods,
                &flags,
            )?;
            info!(dn = %op.dn, new_rdn, "log rename applied");
            Ok(ApplyOutcome::Applied)
        }
        LogOpKind::Delete => {
            let flags = ctx.flags(op.csn.as_ref(), op_time);
            match ctx.dir.delete(&op.dn, &flags) {
                Ok(()) | Err(DirError::NoSuchObject) => {
                    info!(dn = %op.dn, "log delete applied");
                    Ok(ApplyOutcome::Applied)
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

// ==================== Local log journal ====================

fn log_op_type(kind: &LogOpKind) -> &'static str {
    match kind {
        LogOpKind::Add => "add",
        LogOpKind::Modify => "modify",
        LogOpKind::Rename { .. } => "modrdn",
        LogOpKind::Delete => "delete",
    }
}

/// Render a modification list back into `attr:OP value` lines, the shape
/// [`crate::decode::accesslog_mods`] parses. A bare `attr:` line separates
/// consecutive modifications.
fn render_req_mods(mods: &[Modification]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    for (i, m) in mods.iter().enumerate() {
        if i > 0 {
            lines.push(b":".to_vec());
        }
        let opch = match m.op {
            ModOp::Add | ModOp::SoftAdd => '+',
            ModOp::Delete | ModOp::SoftDelete => '-',
            ModOp::Replace => '=',
            ModOp::Increment => '#',
        };
        if m.values.is_empty() {
            lines.push(format!("{}:{}", m.desc.name, opch).into_bytes());
        } else {
            for v in &m.values {
                let mut line = format!("{}:{} ", m.desc.name, opch).into_bytes();
                line.extend_from_slice(v);
                lines.push(line);
            }
        }
    }
    lines
}

/// Append an audit record for an applied log operation under the
/// configured log container.
///
/// The conflict resolver reconciles out-of-order modifies against the
/// records accumulated here; in the original deployment a consumer-side
/// log overlay maintained this container, so the engine keeps it itself.
/// Records carry `auditWriteObject` and `reqResult: 0` so conventional log
/// filters match them. Journal failures are logged but never fail the
/// operation that was already applied.
fn record_log_op(ctx: &ApplyCtx, op: &LogOp, op_time: &mut OpTime) {
    if ctx.cfg.syncdata != SyncData::AccessLog {
        return;
    }
    let Some(logbase) = ctx.cfg.logbase.as_deref() else {
        return;
    };
    let logbase = Dn::parse(logbase);

    let flags = {
        op_time.tick();
        OpFlags::internal().at(*op_time)
    };

    // First record materializes the container.
    match ctx.dir.fetch(&logbase) {
        Ok(Some(_)) => {}
        Ok(None) => {
            let mut container = Entry::new(logbase.clone());
            container.set(
                ctx.schema.resolve(ads::OBJECT_CLASS),
                vec![ads::TOP.as_bytes().to_vec(), b"auditContainer".to_vec()],
            );
            if let Some((attr, value)) = logbase.rdn_attr_value() {
                container.put(ctx.schema.resolve(attr), vec![value.as_bytes().to_vec()]);
            }
            match ctx.dir.add(container, &flags) {
                Ok(()) | Err(DirError::AlreadyExists) => {}
                Err(e) => {
                    warn!(base = %logbase, error = %e, "log container create failed");
                    return;
                }
            }
        }
        Err(e) => {
            warn!(base = %logbase, error = %e, "log container probe failed");
            return;
        }
    }

    let stamp = op_time.render();
    let mut record = Entry::new(Dn::parse(&format!("reqStart={stamp},{logbase}")));
    record.set(
        ctx.schema.resolve(ads::OBJECT_CLASS),
        vec![b"auditWriteObject".to_vec()],
    );
    record.set(ctx.schema.resolve("reqStart"), vec![stamp.into_bytes()]);
    record.set(
        ctx.schema.resolve("reqDN"),
        vec![op.dn.norm().as_bytes().to_vec()],
    );
    record.set(
        ctx.schema.resolve("reqType"),
        vec![log_op_type(&op.kind).as_bytes().to_vec()],
    );
    record.set(ctx.schema.resolve("reqResult"), vec![b"0".to_vec()]);
    if let Some(csn) = &op.csn {
        record.set(
            ctx.schema.resolve(ads::ENTRY_CSN),
            vec![csn.as_str().as_bytes().to_vec()],
        );
    }
    if !op.mods.is_empty() {
        record.set(ctx.schema.resolve("reqMod"), render_req_mods(&op.mods));
    }

    match ctx.dir.add(record, &flags) {
        Ok(()) => debug!(dn = %op.dn, "log operation journaled"),
        Err(e) => warn!(dn = %op.dn, error = %e, "log journal write failed"),
    }
}
