//! Message decoding: provider traffic into applier input.
//!
//! Three dialects produce a common internal representation. Plain entries
//! become full [`Entry`] values for the applier to diff; the delta dialects
//! (access-log, change-log) become operation records replayed against the
//! local tree; dir-sync entries arrive as ready-made differentials.

use crate::config::{SourceConfig, SyncData};
use crate::error::EngineError;
use spindle_dir::{ads, Dn, DnRewriter, Entry, ModOp, Modification, Schema};
use spindle_model::{Csn, SyncUuid};
use spindle_proto::message::SearchEntry;

/// Dir-sync range tags marking incremental multi-valued changes.
const MSAD_RANGE_ADD: &str = "range=1-1";
const MSAD_RANGE_DEL: &str = "range=0-0";

/// How an incoming entry relates to the local tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Present,
    Add,
    Modify,
    Delete,
    /// Dir-sync entries carry a differential, not a full entry.
    DirSyncModify,
    /// Change-log fallback refresh: plain entries treated as adds.
    DseeAdd,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Present => "PRESENT",
            EntryKind::Add => "ADD",
            EntryKind::Modify => "MODIFY",
            EntryKind::Delete => "DELETE",
            EntryKind::DirSyncModify => "DIRSYNC_MOD",
            EntryKind::DseeAdd => "DSEE_ADD",
        }
    }
}

impl From<spindle_proto::SyncState> for EntryKind {
    fn from(s: spindle_proto::SyncState) -> Self {
        match s {
            spindle_proto::SyncState::Present => EntryKind::Present,
            spindle_proto::SyncState::Add => EntryKind::Add,
            spindle_proto::SyncState::Modify => EntryKind::Modify,
            spindle_proto::SyncState::Delete => EntryKind::Delete,
        }
    }
}

/// A decoded dir-sync differential.
pub struct DirSyncChange {
    pub kind: EntryKind,
    pub uuid: Option<SyncUuid>,
    pub entry: Option<Entry>,
    pub mods: Vec<Modification>,
}

/// Write operation recovered from a delta-dialect log record.
#[derive(Debug, Clone)]
pub enum LogOpKind {
    Add,
    Modify,
    Rename {
        new_rdn: String,
        delete_old_rdn: bool,
        new_superior: Option<Dn>,
    },
    Delete,
}

/// One replayable log record.
pub struct LogOp {
    pub dn: Dn,
    pub kind: LogOpKind,
    pub mods: Vec<Modification>,
    pub csn: Option<Csn>,
    pub uuid: Option<SyncUuid>,
    pub change_number: Option<u64>,
    /// The original write carried the relax control.
    pub relax: bool,
}

fn rewrite_dn(rewriter: Option<&dyn DnRewriter>, raw: &str) -> Dn {
    match rewriter.and_then(|r| r.rewrite(raw)) {
        Some(s) => Dn::parse(&s),
        None => Dn::parse(raw),
    }
}

fn rewrite_values(rewriter: Option<&dyn DnRewriter>, values: &mut [Vec<u8>]) {
    let Some(rw) = rewriter else { return };
    for v in values {
        if let Ok(s) = std::str::from_utf8(v) {
            if let Some(out) = rw.rewrite(s) {
                *v = out.into_bytes();
            }
        }
    }
}

// ==================== Plain entries ====================

/// Decode a full-sync search entry into a local entry.
///
/// Drops context-vector updates aimed at the context entry, dynamic
/// attributes, and everything on the exclusion list. The entry's UUID
/// attribute is forced to agree with the sync-state control.
pub fn plain_entry(
    schema: &Schema,
    cfg: &SourceConfig,
    rewriter: Option<&dyn DnRewriter>,
    context_dn: &Dn,
    se: &SearchEntry,
    uuid: &SyncUuid,
) -> Result<Entry, EngineError> {
    if se.dn.is_empty() {
        return Err(EngineError::Protocol("search entry with empty dn".into()));
    }
    let dn = rewrite_dn(rewriter, &se.dn);
    let is_ctx = &dn == context_dn;
    let mut entry = Entry::new(dn);

    for raw in &se.attrs {
        if is_ctx && raw.name.eq_ignore_ascii_case(ads::CONTEXT_CSN) {
            continue;
        }
        if cfg.syncdata == SyncData::ChangeLog && raw.name.eq_ignore_ascii_case("nsUniqueId") {
            // Mapped onto the standard UUID attribute below via the
            // sync-state UUID the caller derived.
            continue;
        }
        let desc = schema.resolve(&raw.name);
        if desc.dynamic || cfg.is_excluded(&desc.name) {
            continue;
        }
        let mut values = raw.values.clone();
        if desc.dn_syntax {
            rewrite_values(rewriter, &mut values);
        }
        entry.attrs.push(spindle_dir::Attribute::new(desc, values));
    }

    if entry.attrs.is_empty() {
        return Err(EngineError::Protocol(format!(
            "entry {} carried no attributes",
            entry.dn
        )));
    }

    let uuid_text = uuid.to_string().into_bytes();
    let uuid_desc = schema.resolve(ads::ENTRY_UUID);
    match entry.get_mut(ads::ENTRY_UUID) {
        None => entry.set(uuid_desc, vec![uuid_text]),
        Some(attr) => {
            if !attr.has_value(&uuid_text) {
                attr.values = vec![uuid_text];
            }
        }
    }
    Ok(entry)
}

// ==================== Access-log records ====================

/// Parse access-log `reqMod` style values (`attr:OP value`) into mods.
///
/// `OP` is one of `+ - = #`. A bare `attr:` line starts a new grouped
/// modification. Single-valued attributes get their ADD rewritten to a
/// REPLACE and their DELETE to a soft-delete, since a concurrent replace
/// may already have changed the value.
pub fn accesslog_mods(
    schema: &Schema,
    cfg: &SourceConfig,
    values: &[Vec<u8>],
) -> Result<Vec<Modification>, EngineError> {
    accesslog_mods_inner(schema, cfg, values, true)
}

/// Like [`accesslog_mods`] but without the single-valued rewrites; the
/// conflict resolver wants the operations exactly as logged.
pub fn accesslog_mods_raw(
    schema: &Schema,
    cfg: &SourceConfig,
    values: &[Vec<u8>],
) -> Result<Vec<Modification>, EngineError> {
    accesslog_mods_inner(schema, cfg, values, false)
}

fn accesslog_mods_inner(
    schema: &Schema,
    cfg: &SourceConfig,
    values: &[Vec<u8>],
    single_value_rewrites: bool,
) -> Result<Vec<Modification>, EngineError> {
    let mut mods: Vec<Modification> = Vec::new();
    let mut open = false;

    for raw in values {
        let line = std::str::from_utf8(raw)
            .map_err(|_| EngineError::Protocol("non-utf8 log mod".into()))?;
        let Some(colon) = line.find(':') else {
            continue;
        };
        if colon == 0 {
            // Group separator.
            open = false;
            continue;
        }
        let name = &line[..colon];
        let rest = &line[colon + 1..];
        let Some(opch) = rest.chars().next() else {
            continue;
        };
        let op = match opch {
            '+' => ModOp::Add,
            '-' => ModOp::Delete,
            '=' => ModOp::Replace,
            '#' => ModOp::Increment,
            _ => continue,
        };

        let desc = schema.resolve(name);
        if desc.dynamic || cfg.is_excluded(&desc.name) {
            continue;
        }

        let effective = if single_value_rewrites && desc.single_valued {
            match op {
                ModOp::Add => ModOp::Replace,
                ModOp::Delete => ModOp::SoftDelete,
                other => other,
            }
        } else {
            op
        };

        let same_group = open
            && mods
                .last()
                .map(|m| std::sync::Arc::ptr_eq(&m.desc, &desc) && m.op == effective)
                .unwrap_or(false);
        if !same_group {
            mods.push(Modification::new(desc.clone(), effective, Vec::new()));
            open = true;
        }

        // `attr:+ value` — value begins after "OP ".
        if rest.len() > 1 && rest.as_bytes()[1] == b' ' {
            let value = rest[2..].as_bytes().to_vec();
            mods.last_mut().expect("group exists").values.push(value);
        }
    }
    Ok(mods)
}

fn parse_req_type(raw: &str) -> Result<LogOpKind, EngineError> {
    match raw {
        "add" => Ok(LogOpKind::Add),
        "modify" => Ok(LogOpKind::Modify),
        "delete" => Ok(LogOpKind::Delete),
        "modrdn" => Ok(LogOpKind::Rename {
            new_rdn: String::new(),
            delete_old_rdn: false,
            new_superior: None,
        }),
        other => Err(EngineError::Protocol(format!("unknown op {other:?}"))),
    }
}

/// Relax control OID, as rendered into `reqControls`.
const OID_RELAX: &str = "1.3.6.1.4.1.4203.666.5.12";

/// Decode one access-log record into a replayable operation.
pub fn accesslog_op(
    schema: &Schema,
    cfg: &SourceConfig,
    rewriter: Option<&dyn DnRewriter>,
    se: &SearchEntry,
) -> Result<LogOp, EngineError> {
    let target = se
        .attr("reqDN")
        .and_then(|a| a.first_str())
        .ok_or_else(|| EngineError::Protocol("log record without reqDN".into()))?;
    let dn = rewrite_dn(rewriter, target);

    let mut kind = se
        .attr("reqType")
        .and_then(|a| a.first_str())
        .map(parse_req_type)
        .transpose()?
        .ok_or_else(|| EngineError::Protocol("log record without reqType".into()))?;

    if let LogOpKind::Rename { new_rdn, delete_old_rdn, new_superior } = &mut kind {
        *new_rdn = se
            .attr("reqNewRDN")
            .and_then(|a| a.first_str())
            .ok_or_else(|| EngineError::Protocol("modrdn record without reqNewRDN".into()))?
            .to_string();
        *delete_old_rdn = se
            .attr("reqDeleteOldRDN")
            .and_then(|a| a.first_str())
            .map(|v| v.eq_ignore_ascii_case("TRUE"))
            .unwrap_or(false);
        *new_superior = se
            .attr("reqNewSuperior")
            .and_then(|a| a.first_str())
            .map(|s| rewrite_dn(rewriter, s));
    }

    let mods = match se.attr("reqMod") {
        Some(attr) => accesslog_mods(schema, cfg, &attr.values)?,
        None => Vec::new(),
    };

    let relax = se
        .attr("reqControls")
        .map(|a| {
            a.values.iter().any(|v| {
                std::str::from_utf8(v)
                    .map(|s| s.contains(OID_RELAX))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);

    let csn = se
        .attr(ads::ENTRY_CSN)
        .and_then(|a| a.first_str())
        .map(Csn::from_raw);

    Ok(LogOp {
        dn,
        kind,
        mods,
        csn,
        uuid: None,
        change_number: None,
        relax,
    })
}

// ==================== Change-log records ====================

/// Map the legacy 35-character unique id (`8-8-8-8` hex groups) onto a
/// standard UUID.
pub fn dsee_uuid(raw: &str) -> Result<SyncUuid, EngineError> {
    let hex_digits: String = raw.chars().filter(|c| *c != '-').collect();
    if raw.len() != 35 || hex_digits.len() != 32 {
        return Err(EngineError::Protocol(format!("malformed unique id {raw:?}")));
    }
    let bytes = hex::decode(&hex_digits)
        .map_err(|_| EngineError::Protocol(format!("malformed unique id {raw:?}")))?;
    SyncUuid::from_slice(&bytes).map_err(|e| EngineError::Protocol(e.to_string()))
}

/// Parse a change-log `changes` blob.
///
/// Modify records use `op: attr` headers with value lines and `-`
/// separators; add records are plain `attr: value` lines.
fn changelog_changes(
    schema: &Schema,
    cfg: &SourceConfig,
    is_add: bool,
    blob: &str,
) -> Result<Vec<Modification>, EngineError> {
    let mut mods: Vec<Modification> = Vec::new();

    if is_add {
        for line in blob.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let desc = schema.resolve(name.trim());
            if desc.dynamic || cfg.is_excluded(&desc.name) {
                continue;
            }
            let value = value.trim_start().as_bytes().to_vec();
            match mods.iter_mut().find(|m| std::sync::Arc::ptr_eq(&m.desc, &desc)) {
                Some(m) => m.values.push(value),
                None => mods.push(Modification::new(desc, ModOp::Replace, vec![value])),
            }
        }
        return Ok(mods);
    }

    let mut current: Option<std::sync::Arc<spindle_dir::AttrDesc>> = None;
    for line in blob.lines() {
        let line = line.trim_end();
        if line == "-" {
            current = None;
            continue;
        }
        let Some((head, rest)) = line.split_once(':') else {
            continue;
        };
        let rest = rest.trim_start();
        let op = match head.trim() {
            "add" => Some(ModOp::Add),
            "delete" => Some(ModOp::Delete),
            "replace" => Some(ModOp::Replace),
            "increment" => Some(ModOp::Increment),
            _ => None,
        };
        if let Some(op) = op {
            let desc = schema.resolve(rest);
            if desc.dynamic || cfg.is_excluded(&desc.name) {
                current = None;
                continue;
            }
            current = Some(desc.clone());
            mods.push(Modification::new(desc, op, Vec::new()));
            continue;
        }
        // Value line for the open modification.
        let Some(desc) = &current else {
            continue;
        };
        if !desc.is(head.trim()) {
            return Err(EngineError::Protocol(format!(
                "change record value for {head:?} under {} block",
                desc.name
            )));
        }
        mods.last_mut()
            .expect("open modification")
            .values
            .push(rest.as_bytes().to_vec());
    }
    Ok(mods)
}

/// Decode one change-log record.
pub fn changelog_op(
    schema: &Schema,
    cfg: &SourceConfig,
    rewriter: Option<&dyn DnRewriter>,
    se: &SearchEntry,
) -> Result<LogOp, EngineError> {
    let target = se
        .attr("targetDN")
        .and_then(|a| a.first_str())
        .ok_or_else(|| EngineError::Protocol("change record without targetDN".into()))?;
    let dn = rewrite_dn(rewriter, target);

    let mut kind = se
        .attr("changeType")
        .and_then(|a| a.first_str())
        .map(parse_req_type)
        .transpose()?
        .ok_or_else(|| EngineError::Protocol("change record without changeType".into()))?;

    if let LogOpKind::Rename { new_rdn, delete_old_rdn, new_superior } = &mut kind {
        *new_rdn = se
            .attr("newRDN")
            .and_then(|a| a.first_str())
            .unwrap_or_default()
            .to_string();
        *delete_old_rdn = se
            .attr("deleteOldRDN")
            .and_then(|a| a.first_str())
            .map(|v| v.eq_ignore_ascii_case("TRUE"))
            .unwrap_or(false);
        *new_superior = se
            .attr("newSuperior")
            .and_then(|a| a.first_str())
            .map(|s| rewrite_dn(rewriter, s));
    }

    let uuid = se
        .attr("targetUniqueId")
        .and_then(|a| a.first_str())
        .map(dsee_uuid)
        .transpose()?;

    let mut mods = match se.attr("changes").and_then(|a| a.first_str()) {
        Some(blob) => {
            changelog_changes(schema, cfg, matches!(kind, LogOpKind::Add), blob)?
        }
        None => Vec::new(),
    };

    if matches!(kind, LogOpKind::Add) {
        if let Some(uuid) = &uuid {
            mods.push(Modification::new(
                schema.resolve(ads::ENTRY_UUID),
                ModOp::Add,
                vec![uuid.to_string().into_bytes()],
            ));
        }
    }

    let change_number = se
        .attr("changeNumber")
        .and_then(|a| a.first_str())
        .and_then(|s| s.trim().parse().ok());

    Ok(LogOp {
        dn,
        kind,
        mods,
        csn: None,
        uuid,
        change_number,
        relax: false,
    })
}

// ==================== Dir-sync entries ====================

/// Decode one dir-sync differential.
pub fn dirsync_entry(
    schema: &Schema,
    cfg: &SourceConfig,
    rewriter: Option<&dyn DnRewriter>,
    se: &SearchEntry,
) -> Result<DirSyncChange, EngineError> {
    if se.dn.is_empty() {
        return Err(EngineError::Protocol("dir-sync entry with empty dn".into()));
    }
    let dn = rewrite_dn(rewriter, &se.dn);

    let mut kind = EntryKind::DirSyncModify;
    let mut uuid = None;
    let mut mods: Vec<Modification> = Vec::new();

    for raw in &se.attrs {
        // Range tags mark incremental multi-valued changes.
        let (name, range) = match raw.name.split_once(';') {
            Some((base, tag)) => (base, Some(tag)),
            None => (raw.name.as_str(), None),
        };
        let desc = schema.resolve(name);
        if desc.dynamic || cfg.is_excluded(&desc.name) {
            continue;
        }

        let op = match range {
            Some(tag) if tag.eq_ignore_ascii_case(MSAD_RANGE_ADD) => ModOp::SoftAdd,
            Some(tag) if tag.eq_ignore_ascii_case(MSAD_RANGE_DEL) => ModOp::SoftDelete,
            _ => ModOp::Replace,
        };

        if desc.is("objectGUID") {
            let first = raw
                .values
                .first()
                .ok_or_else(|| EngineError::Protocol("objectGUID without value".into()))?;
            uuid = Some(
                SyncUuid::from_slice(first).map_err(|e| EngineError::Protocol(e.to_string()))?,
            );
            continue;
        }
        if desc.is("isDeleted") {
            kind = EntryKind::Delete;
            continue;
        }
        if desc.is("whenCreated") {
            kind = EntryKind::Add;
            mods.push(Modification::new(desc.clone(), ModOp::Replace, raw.values.clone()));
            // Mirror the provider's creation time into the standard attr.
            mods.push(Modification::new(
                schema.resolve(ads::CREATE_TIMESTAMP),
                ModOp::Replace,
                raw.values.clone(),
            ));
            continue;
        }
        if desc.is("instanceType") {
            continue;
        }

        let mut values = raw.values.clone();
        if desc.dn_syntax {
            rewrite_values(rewriter, &mut values);
        }
        mods.push(Modification::new(desc, op, values));
    }

    if kind == EntryKind::Delete {
        return Ok(DirSyncChange { kind, uuid, entry: None, mods: Vec::new() });
    }
    if mods.is_empty() {
        return Err(EngineError::Protocol(format!("dir-sync entry {dn} carried no attributes")));
    }

    let entry = if kind == EntryKind::Add {
        let mut e = Entry::new(dn);
        for m in &mods {
            e.put(m.desc.clone(), m.values.clone());
        }
        if let Some(uuid) = &uuid {
            e.set(
                schema.resolve(ads::ENTRY_UUID),
                vec![uuid.to_string().into_bytes()],
            );
        }
        Some(e)
    } else {
        // Modify: the entry is only a DN carrier; the differential rides
        // in `mods`.
        Some(Entry::new(dn))
    };

    Ok(DirSyncChange { kind, uuid, entry, mods })
}
