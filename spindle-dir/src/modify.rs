//! Modifications.
//!
//! The usual four LDAP modify operations plus the two soft variants the
//! replication paths need: soft-add tolerates existing values, soft-delete
//! tolerates missing ones. Both exist because out-of-order changes may have
//! already put the entry in the target state.

use crate::entry::{Attribute, Entry};
use crate::ops::DirError;
use crate::schema::AttrDesc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
    Increment,
    SoftAdd,
    SoftDelete,
}

/// One modification of one attribute.
#[derive(Debug, Clone)]
pub struct Modification {
    pub desc: Arc<AttrDesc>,
    pub op: ModOp,
    pub values: Vec<Vec<u8>>,
}

impl Modification {
    pub fn new(desc: Arc<AttrDesc>, op: ModOp, values: Vec<Vec<u8>>) -> Self {
        Modification { desc, op, values }
    }

    pub fn replace(desc: Arc<AttrDesc>, values: Vec<Vec<u8>>) -> Self {
        Modification::new(desc, ModOp::Replace, values)
    }

    pub fn delete_all(desc: Arc<AttrDesc>) -> Self {
        Modification::new(desc, ModOp::Delete, Vec::new())
    }
}

/// Apply a modification list to an entry in place.
pub fn apply_mods(entry: &mut Entry, mods: &[Modification]) -> Result<(), DirError> {
    for m in mods {
        apply_one(entry, m)?;
    }
    Ok(())
}

fn apply_one(entry: &mut Entry, m: &Modification) -> Result<(), DirError> {
    let soft = matches!(m.op, ModOp::SoftAdd | ModOp::SoftDelete);
    match m.op {
        ModOp::Add | ModOp::SoftAdd => {
            match entry.get_mut(&m.desc.name) {
                Some(attr) => {
                    for v in &m.values {
                        if attr.has_value(v) {
                            if soft {
                                continue;
                            }
                            return Err(DirError::TypeOrValueExists);
                        }
                        attr.values.push(v.clone());
                    }
                }
                None => {
                    entry
                        .attrs
                        .push(Attribute::new(m.desc.clone(), m.values.clone()));
                }
            }
            if m.desc.single_valued {
                if let Some(attr) = entry.get(&m.desc.name) {
                    if attr.values.len() > 1 {
                        return Err(DirError::TypeOrValueExists);
                    }
                }
            }
        }
        ModOp::Delete | ModOp::SoftDelete => {
            let Some(attr) = entry.get_mut(&m.desc.name) else {
                if soft {
                    return Ok(());
                }
                return Err(DirError::NoSuchAttribute);
            };
            if m.values.is_empty() {
                entry.remove_attr(&m.desc.name);
            } else {
                for v in &m.values {
                    if !attr.remove_value(v) && !soft {
                        return Err(DirError::NoSuchAttribute);
                    }
                }
                if attr.values.is_empty() {
                    entry.remove_attr(&m.desc.name);
                }
            }
        }
        ModOp::Replace => {
            if m.values.is_empty() {
                entry.remove_attr(&m.desc.name);
            } else {
                entry.set(m.desc.clone(), m.values.clone());
            }
        }
        ModOp::Increment => {
            let Some(attr) = entry.get_mut(&m.desc.name) else {
                return Err(DirError::NoSuchAttribute);
            };
            let delta: i64 = m
                .values
                .first()
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(1);
            let current: i64 = attr
                .first_str()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| DirError::Other("increment on non-integer value".into()))?;
            attr.values = vec![(current + delta).to_string().into_bytes()];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::schema::Schema;

    fn entry_with_cn() -> (Arc<Schema>, Entry) {
        let schema = Schema::with_defaults();
        let mut e = Entry::new(Dn::parse("cn=a,dc=t"));
        e.set(schema.resolve("cn"), vec![b"a".to_vec()]);
        (schema, e)
    }

    #[test]
    fn test_add_and_duplicate() {
        let (schema, mut e) = entry_with_cn();
        let mail = schema.resolve("mail");
        apply_mods(
            &mut e,
            &[Modification::new(mail.clone(), ModOp::Add, vec![b"x@t".to_vec()])],
        )
        .unwrap();
        assert_eq!(e.first_str("mail"), Some("x@t"));

        let dup = Modification::new(mail.clone(), ModOp::Add, vec![b"x@t".to_vec()]);
        assert_eq!(apply_mods(&mut e, &[dup]), Err(DirError::TypeOrValueExists));

        // Soft add tolerates it.
        let soft = Modification::new(mail, ModOp::SoftAdd, vec![b"x@t".to_vec()]);
        apply_mods(&mut e, &[soft]).unwrap();
        assert_eq!(e.get("mail").unwrap().values.len(), 1);
    }

    #[test]
    fn test_delete_variants() {
        let (schema, mut e) = entry_with_cn();
        let cn = schema.resolve("cn");

        let missing = Modification::new(cn.clone(), ModOp::Delete, vec![b"zz".to_vec()]);
        assert_eq!(apply_mods(&mut e, &[missing]), Err(DirError::NoSuchAttribute));

        let soft = Modification::new(cn.clone(), ModOp::SoftDelete, vec![b"zz".to_vec()]);
        apply_mods(&mut e, &[soft]).unwrap();

        apply_mods(&mut e, &[Modification::delete_all(cn.clone())]).unwrap();
        assert!(e.get("cn").is_none());

        assert_eq!(
            apply_mods(&mut e, &[Modification::delete_all(cn.clone())]),
            Err(DirError::NoSuchAttribute)
        );
        apply_mods(&mut e, &[Modification::new(cn, ModOp::SoftDelete, vec![])]).unwrap();
    }

    #[test]
    fn test_replace_and_increment() {
        let (schema, mut e) = entry_with_cn();
        let n = schema.resolve("uidNumber");
        apply_mods(&mut e, &[Modification::replace(n.clone(), vec![b"41".to_vec()])]).unwrap();
        apply_mods(
            &mut e,
            &[Modification::new(n.clone(), ModOp::Increment, vec![b"1".to_vec()])],
        )
        .unwrap();
        assert_eq!(e.first_str("uidNumber"), Some("42"));

        // Replace with no values removes the attribute.
        apply_mods(&mut e, &[Modification::replace(n.clone(), vec![])]).unwrap();
        assert!(e.get("uidNumber").is_none());
    }

    #[test]
    fn test_single_valued_add_conflict() {
        let schema = Schema::with_defaults();
        let sv = schema.register(crate::schema::AttrDesc::user("displayName").single());
        let mut e = Entry::new(Dn::parse("cn=a,dc=t"));
        apply_mods(&mut e, &[Modification::new(sv.clone(), ModOp::Add, vec![b"one".to_vec()])])
            .unwrap();
        assert_eq!(
            apply_mods(&mut e, &[Modification::new(sv, ModOp::Add, vec![b"two".to_vec()])]),
            Err(DirError::TypeOrValueExists)
        );
    }
}
