//! Entry diffing.
//!
//! Turns (local entry, incoming entry) into the minimal modification list
//! that rewrites the local entry into the incoming one. Deleting and
//! re-adding the entry would be simpler but fails on non-leaf entries, so
//! modifies it is.

use crate::entry::{Attribute, Entry};
use crate::modify::{ModOp, Modification};
use crate::schema::ads;

/// Operational attributes that ride along with any real modification so
/// they stay colocated with the change that produced them.
const COLOCATED: [&str; 3] = [ads::MODIFIERS_NAME, ads::MODIFY_TIMESTAMP, ads::ENTRY_CSN];

fn is_colocated(name: &str) -> bool {
    COLOCATED.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// Compute modifications turning `old` into `new`.
///
/// `is_ctx` marks the database's context entry, whose context vector
/// attribute is never touched by replication.
pub fn diff_entries(old: &Entry, new: &Entry, is_ctx: bool) -> Vec<Modification> {
    let mut mods = Vec::new();

    for na in &new.attrs {
        if is_colocated(&na.desc.name) {
            continue;
        }
        if is_ctx && na.desc.is(ads::CONTEXT_CSN) {
            continue;
        }
        let oa = old.get(&na.desc.name);
        attr_mods(oa, na, &mut mods);
    }

    // Attributes missing from the provider's entry get a full delete.
    for oa in &old.attrs {
        if is_colocated(&oa.desc.name) {
            continue;
        }
        if is_ctx && oa.desc.is(ads::CONTEXT_CSN) {
            continue;
        }
        if new.get(&oa.desc.name).is_none() {
            mods.push(Modification::delete_all(oa.desc.clone()));
        }
    }

    // Keep the standard operational attributes riding with real changes.
    if !mods.is_empty() {
        for name in COLOCATED {
            if let Some(na) = new.get(name) {
                mods.push(Modification::replace(na.desc.clone(), na.values.clone()));
            }
        }
    }

    mods
}

fn attr_mods(old: Option<&Attribute>, new: &Attribute, mods: &mut Vec<Modification>) {
    let Some(old) = old else {
        mods.push(Modification::new(new.desc.clone(), ModOp::Add, new.values.clone()));
        return;
    };

    if new.desc.sorted_values {
        sorted_attr_mods(old, new, mods);
        return;
    }

    // objectClass and attributes without an equality rule always go as a
    // single replace; value-level surgery can break implicit superclasses.
    if new.desc.is(ads::OBJECT_CLASS) || new.desc.equality.is_none() {
        if !values_equal_sets(old, new) {
            mods.push(Modification::replace(new.desc.clone(), new.values.clone()));
        }
        return;
    }

    let dels: Vec<Vec<u8>> = old
        .values
        .iter()
        .filter(|v| !new.has_value(v))
        .cloned()
        .collect();
    let adds: Vec<Vec<u8>> = new
        .values
        .iter()
        .filter(|v| !old.has_value(v))
        .cloned()
        .collect();

    if dels.is_empty() && adds.is_empty() {
        return;
    }

    // All old values gone: a single replace covers both halves. This is
    // also the single-valued "both sides present" case.
    if dels.len() == old.values.len() {
        mods.push(Modification::replace(new.desc.clone(), new.values.clone()));
        return;
    }

    if !dels.is_empty() {
        mods.push(Modification::new(new.desc.clone(), ModOp::Delete, dels));
    }
    if !adds.is_empty() {
        let op = if new.desc.single_valued { ModOp::Replace } else { ModOp::Add };
        mods.push(Modification::new(new.desc.clone(), op, adds));
    }
}

/// Merge walk over an attribute whose values are kept sorted.
fn sorted_attr_mods(old: &Attribute, new: &Attribute, mods: &mut Vec<Modification>) {
    let desc = &new.desc;
    let mut dels: Vec<Vec<u8>> = Vec::new();
    let mut adds: Vec<Vec<u8>> = Vec::new();
    let (mut o, mut n) = (0, 0);
    while o < old.values.len() || n < new.values.len() {
        if n == new.values.len() {
            dels.push(old.values[o].clone());
            o += 1;
        } else if o == old.values.len() {
            adds.push(new.values[n].clone());
            n += 1;
        } else {
            match desc.cmp_values(&old.values[o], &new.values[n]) {
                std::cmp::Ordering::Equal => {
                    o += 1;
                    n += 1;
                }
                std::cmp::Ordering::Less => {
                    dels.push(old.values[o].clone());
                    o += 1;
                }
                std::cmp::Ordering::Greater => {
                    adds.push(new.values[n].clone());
                    n += 1;
                }
            }
        }
    }

    if dels.len() == old.values.len() && !old.values.is_empty() {
        // Everything old went away: one replace.
        mods.push(Modification::replace(desc.clone(), new.values.clone()));
        return;
    }
    if !dels.is_empty() {
        mods.push(Modification::new(desc.clone(), ModOp::Delete, dels));
    }
    if !adds.is_empty() {
        mods.push(Modification::new(desc.clone(), ModOp::Add, adds));
    }
}

fn values_equal_sets(a: &Attribute, b: &Attribute) -> bool {
    a.values.len() == b.values.len()
        && a.values.iter().all(|v| b.has_value(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::modify::apply_mods;
    use crate::schema::{AttrDesc, Schema};
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        let s = Schema::with_defaults();
        s.register(AttrDesc::user("displayName").single());
        s.register(AttrDesc::user("memberUid").sorted());
        s
    }

    fn entry(schema: &Schema, pairs: &[(&str, &[&str])]) -> Entry {
        let mut e = Entry::new(Dn::parse("cn=a,dc=t"));
        for (name, values) in pairs {
            e.set(
                schema.resolve(name),
                values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            );
        }
        e
    }

    fn entries_match(a: &Entry, b: &Entry) -> bool {
        a.attrs.len() == b.attrs.len()
            && a.attrs.iter().all(|attr| {
                b.get(&attr.desc.name)
                    .map(|other| {
                        attr.values.len() == other.values.len()
                            && attr.values.iter().all(|v| other.has_value(v))
                    })
                    .unwrap_or(false)
            })
    }

    #[test]
    fn test_no_change_no_mods() {
        let s = schema();
        let old = entry(&s, &[("cn", &["a"]), ("mail", &["x@t", "y@t"])]);
        let new = old.clone();
        assert!(diff_entries(&old, &new, false).is_empty());
    }

    #[test]
    fn test_value_add_and_delete() {
        let s = schema();
        let old = entry(&s, &[("mail", &["x@t", "y@t"])]);
        let new = entry(&s, &[("mail", &["y@t", "z@t"])]);
        let mods = diff_entries(&old, &new, false);
        // One delete (x@t), one add (z@t).
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].op, ModOp::Delete);
        assert_eq!(mods[0].values, vec![b"x@t".to_vec()]);
        assert_eq!(mods[1].op, ModOp::Add);
        assert_eq!(mods[1].values, vec![b"z@t".to_vec()]);

        let mut applied = old.clone();
        apply_mods(&mut applied, &mods).unwrap();
        assert!(entries_match(&applied, &new));
    }

    #[test]
    fn test_all_old_gone_becomes_replace() {
        let s = schema();
        let old = entry(&s, &[("mail", &["x@t"])]);
        let new = entry(&s, &[("mail", &["z@t", "w@t"])]);
        let mods = diff_entries(&old, &new, false);
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].op, ModOp::Replace);
    }

    #[test]
    fn test_single_valued_replace() {
        let s = schema();
        let old = entry(&s, &[("displayName", &["Old"])]);
        let new = entry(&s, &[("displayName", &["New"])]);
        let mods = diff_entries(&old, &new, false);
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].op, ModOp::Replace);
        assert_eq!(mods[0].values, vec![b"New".to_vec()]);
    }

    #[test]
    fn test_object_class_always_replaced_wholesale() {
        let s = schema();
        let old = entry(&s, &[("objectClass", &["top", "person"])]);
        let new = entry(&s, &[("objectClass", &["top", "person", "inetOrgPerson"])]);
        let mods = diff_entries(&old, &new, false);
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].op, ModOp::Replace);
        assert_eq!(mods[0].values.len(), 3);
    }

    #[test]
    fn test_attr_appears_and_disappears() {
        let s = schema();
        let old = entry(&s, &[("cn", &["a"]), ("sn", &["gone"])]);
        let new = entry(&s, &[("cn", &["a"]), ("mail", &["x@t"])]);
        let mods = diff_entries(&old, &new, false);
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].op, ModOp::Add);
        assert!(mods[0].desc.is("mail"));
        assert_eq!(mods[1].op, ModOp::Delete);
        assert!(mods[1].desc.is("sn"));
        assert!(mods[1].values.is_empty());

        let mut applied = old.clone();
        apply_mods(&mut applied, &mods).unwrap();
        assert!(entries_match(&applied, &new));
    }

    #[test]
    fn test_sorted_merge_walk() {
        let s = schema();
        let old = entry(&s, &[("memberUid", &["alice", "bob", "dave"])]);
        let new = entry(&s, &[("memberUid", &["bob", "carol", "dave"])]);
        let mods = diff_entries(&old, &new, false);
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].op, ModOp::Delete);
        assert_eq!(mods[0].values, vec![b"alice".to_vec()]);
        assert_eq!(mods[1].op, ModOp::Add);
        assert_eq!(mods[1].values, vec![b"carol".to_vec()]);

        let mut applied = old.clone();
        apply_mods(&mut applied, &mods).unwrap();
        assert!(entries_match(&applied, &new));
    }

    #[test]
    fn test_operational_attrs_ride_along() {
        let s = schema();
        let old = entry(
            &s,
            &[("cn", &["a"]), ("entryCSN", &["20240101000000.000001Z#000000#001#000000"])],
        );
        let new = entry(
            &s,
            &[("cn", &["b"]), ("entryCSN", &["20240101000000.000002Z#000000#001#000000"])],
        );
        let mods = diff_entries(&old, &new, false);
        assert!(mods.iter().any(|m| m.desc.is("entryCSN")));

        // Operational drift alone produces nothing.
        let new2 = entry(
            &s,
            &[("cn", &["a"]), ("entryCSN", &["20240101000000.000009Z#000000#001#000000"])],
        );
        assert!(diff_entries(&old, &new2, false).is_empty());
    }

    #[test]
    fn test_context_entry_skips_context_vector() {
        let s = schema();
        let old = entry(&s, &[("cn", &["a"]), ("contextCSN", &["old"])]);
        let new = entry(&s, &[("cn", &["b"]), ("contextCSN", &["new"])]);
        let mods = diff_entries(&old, &new, true);
        assert!(mods.iter().all(|m| !m.desc.is("contextCSN")));
        assert!(!mods.is_empty());
    }
}
