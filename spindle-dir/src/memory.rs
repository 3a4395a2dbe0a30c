//! In-memory directory backend.
//!
//! Implements [`DirOps`] over an ordered map keyed by normalized DN. Used
//! by the engine's tests and by embedders that want a directory without a
//! storage backend. Not built for scale; built for faithful error surface:
//! parent checks, leaf checks, duplicate detection.

use crate::dn::Dn;
use crate::entry::Entry;
use crate::modify::{apply_mods, Modification};
use crate::ops::{DirError, DirOps, OpFlags, Scope, SearchParams};
use crate::schema::{ads, Schema};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub struct MemoryDirectory {
    suffix: Dn,
    schema: Arc<Schema>,
    inner: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryDirectory {
    pub fn new(suffix: Dn, schema: Arc<Schema>) -> Self {
        MemoryDirectory {
            suffix,
            schema,
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn suffix(&self) -> &Dn {
        &self.suffix
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert without parent/duplicate checks. Seeding helper for tests
    /// and bootstrap.
    pub fn seed(&self, entry: Entry) {
        self.inner
            .write()
            .unwrap()
            .insert(entry.dn.norm().to_string(), entry);
    }

    fn stamp(&self, entry: &mut Entry, flags: &OpFlags, creating: bool) {
        if let Some(csn) = &flags.queued_csn {
            entry.set(
                self.schema.resolve(ads::ENTRY_CSN),
                vec![csn.as_str().as_bytes().to_vec()],
            );
        }
        if let Some(t) = flags.op_time {
            entry.set(
                self.schema.resolve(ads::MODIFY_TIMESTAMP),
                vec![t.render().into_bytes()],
            );
            if creating {
                entry.set(
                    self.schema.resolve(ads::CREATE_TIMESTAMP),
                    vec![t.render().into_bytes()],
                );
            }
        }
    }

    fn parent_ok(&self, map: &BTreeMap<String, Entry>, dn: &Dn) -> bool {
        if dn == &self.suffix {
            return true;
        }
        match dn.parent() {
            Some(parent) if parent.is_root() => true,
            Some(parent) => map.contains_key(parent.norm()),
            None => true,
        }
    }
}

impl DirOps for MemoryDirectory {
    fn add(&self, mut entry: Entry, flags: &OpFlags) -> Result<(), DirError> {
        let mut map = self.inner.write().unwrap();
        if map.contains_key(entry.dn.norm()) {
            return Err(DirError::AlreadyExists);
        }
        if !self.parent_ok(&map, &entry.dn) {
            return Err(DirError::NoSuchObject);
        }
        self.stamp(&mut entry, flags, true);
        debug!(dn = %entry.dn, "memory add");
        map.insert(entry.dn.norm().to_string(), entry);
        Ok(())
    }

    fn modify(&self, dn: &Dn, mods: &[Modification], flags: &OpFlags) -> Result<(), DirError> {
        let mut map = self.inner.write().unwrap();
        let entry = map.get_mut(dn.norm()).ok_or(DirError::NoSuchObject)?;
        apply_mods(entry, mods)?;
        self.stamp(entry, flags, false);
        debug!(dn = %dn, nmods = mods.len(), "memory modify");
        Ok(())
    }

    fn rename(
        &self,
        dn: &Dn,
        new_rdn: &str,
        new_superior: Option<&Dn>,
        delete_old_rdn: bool,
        mods: &[Modification],
        flags: &OpFlags,
    ) -> Result<(), DirError> {
        let mut map = self.inner.write().unwrap();
        let mut entry = map.remove(dn.norm()).ok_or(DirError::NoSuchObject)?;

        let parent = match new_superior {
            Some(sup) => sup.clone(),
            None => dn.parent().unwrap_or_else(Dn::root),
        };
        if !parent.is_root() && parent != self.suffix && !map.contains_key(parent.norm()) {
            map.insert(dn.norm().to_string(), entry);
            return Err(DirError::NoSuchObject);
        }
        let new_dn = Dn::child_of(new_rdn, &parent);
        if map.contains_key(new_dn.norm()) {
            map.insert(dn.norm().to_string(), entry);
            return Err(DirError::AlreadyExists);
        }

        // Naming attribute upkeep.
        if let Some((old_attr, old_val)) = dn.rdn_attr_value() {
            if delete_old_rdn {
                if let Some(a) = entry.get_mut(old_attr) {
                    a.remove_value(old_val.as_bytes());
                    if a.values.is_empty() {
                        entry.remove_attr(old_attr);
                    }
                }
            }
        }
        if let Some((new_attr, new_val)) = new_dn.rdn_attr_value() {
            let desc = self.schema.resolve(new_attr);
            match entry.get_mut(new_attr) {
                Some(a) => {
                    if !a.has_value(new_val.as_bytes()) {
                        a.values.push(new_val.as_bytes().to_vec());
                    }
                }
                None => entry.put(desc, vec![new_val.as_bytes().to_vec()]),
            }
        }

        // Move descendants along, keeping their relative RDNs.
        let moved: Vec<String> = map
            .keys()
            .filter(|k| Dn::parse(k).is_under(dn))
            .cloned()
            .collect();
        for key in moved {
            let mut child = map.remove(&key).unwrap();
            let rel = child.dn.num_rdns() - dn.num_rdns();
            let mut head = Vec::with_capacity(rel + 1);
            let mut cur = child.dn.clone();
            for _ in 0..rel {
                head.push(cur.rdn().to_string());
                cur = cur.parent().unwrap_or_else(Dn::root);
            }
            head.push(new_dn.display().to_string());
            child.dn = Dn::parse(&head.join(","));
            map.insert(child.dn.norm().to_string(), child);
        }

        entry.dn = new_dn;
        apply_mods(&mut entry, mods)?;
        self.stamp(&mut entry, flags, false);
        debug!(from = %dn, to = %entry.dn, "memory rename");
        map.insert(entry.dn.norm().to_string(), entry);
        Ok(())
    }

    fn delete(&self, dn: &Dn, _flags: &OpFlags) -> Result<(), DirError> {
        let mut map = self.inner.write().unwrap();
        if !map.contains_key(dn.norm()) {
            return Err(DirError::NoSuchObject);
        }
        if map.keys().any(|k| Dn::parse(k).is_under(dn)) {
            return Err(DirError::NotAllowedOnNonLeaf);
        }
        debug!(dn = %dn, "memory delete");
        map.remove(dn.norm());
        Ok(())
    }

    fn search(
        &self,
        params: &SearchParams,
        visit: &mut dyn FnMut(&Entry) -> Result<(), DirError>,
    ) -> Result<(), DirError> {
        let map = self.inner.read().unwrap();
        let mut seen = 0usize;
        for entry in map.values() {
            let in_scope = match params.scope {
                Scope::Base => entry.dn == params.base,
                Scope::One => entry
                    .dn
                    .parent()
                    .map(|p| p == params.base)
                    .unwrap_or(false),
                Scope::Subtree => entry.dn.is_within(&params.base),
            };
            if !in_scope || !params.filter.matches(entry) {
                continue;
            }
            visit(entry)?;
            seen += 1;
            if let Some(limit) = params.size_limit {
                if seen >= limit {
                    break;
                }
            }
        }
        Ok(())
    }

    fn fetch(&self, dn: &Dn) -> Result<Option<Entry>, DirError> {
        Ok(self.inner.read().unwrap().get(dn.norm()).cloned())
    }
}
