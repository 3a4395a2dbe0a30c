//! Attribute descriptors and the schema registry.
//!
//! The engine needs just enough schema to diff and apply entries: equality
//! behavior, single-valued / sorted-values / dynamic / operational flags,
//! and whether values are DNs (for the rewrite pass). Unknown attributes
//! resolve to a default case-ignore user attribute.

use crate::dn::Dn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Equality matching behavior for attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Equality {
    CaseIgnore,
    CaseExact,
    Octet,
    DistinguishedName,
    Integer,
}

/// An attribute type descriptor.
#[derive(Debug, Clone)]
pub struct AttrDesc {
    pub name: String,
    /// `None` means no equality rule: the diff always replaces wholesale.
    pub equality: Option<Equality>,
    pub single_valued: bool,
    /// Values kept sorted; the diff uses a merge walk.
    pub sorted_values: bool,
    /// Dynamically generated; never replicated.
    pub dynamic: bool,
    pub operational: bool,
    /// Values are DNs and pass through the configured rewriter.
    pub dn_syntax: bool,
}

impl AttrDesc {
    pub fn user(name: &str) -> Self {
        AttrDesc {
            name: name.to_string(),
            equality: Some(Equality::CaseIgnore),
            single_valued: false,
            sorted_values: false,
            dynamic: false,
            operational: false,
            dn_syntax: false,
        }
    }

    pub fn single(mut self) -> Self {
        self.single_valued = true;
        self
    }

    pub fn sorted(mut self) -> Self {
        self.sorted_values = true;
        self
    }

    pub fn operational(mut self) -> Self {
        self.operational = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn equality(mut self, eq: Option<Equality>) -> Self {
        self.equality = eq;
        self
    }

    pub fn dn_valued(mut self) -> Self {
        self.dn_syntax = true;
        self.equality = Some(Equality::DistinguishedName);
        self
    }

    /// Normalize a value under this descriptor's equality rule.
    pub fn normalize(&self, value: &[u8]) -> Vec<u8> {
        match self.equality {
            Some(Equality::CaseIgnore) => match std::str::from_utf8(value) {
                Ok(s) => s.trim().to_ascii_lowercase().into_bytes(),
                Err(_) => value.to_vec(),
            },
            Some(Equality::CaseExact) => match std::str::from_utf8(value) {
                Ok(s) => s.trim().as_bytes().to_vec(),
                Err(_) => value.to_vec(),
            },
            Some(Equality::DistinguishedName) => match std::str::from_utf8(value) {
                Ok(s) => Dn::parse(s).norm().as_bytes().to_vec(),
                Err(_) => value.to_vec(),
            },
            Some(Equality::Integer) => match std::str::from_utf8(value) {
                Ok(s) => {
                    let t = s.trim();
                    let t = t.trim_start_matches('0');
                    if t.is_empty() { b"0".to_vec() } else { t.as_bytes().to_vec() }
                }
                Err(_) => value.to_vec(),
            },
            Some(Equality::Octet) | None => value.to_vec(),
        }
    }

    pub fn values_equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.normalize(a) == self.normalize(b)
    }

    pub fn cmp_values(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        self.normalize(a).cmp(&self.normalize(b))
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Well-known attribute names the engine touches by name.
pub mod ads {
    pub const OBJECT_CLASS: &str = "objectClass";
    pub const STRUCTURAL_OBJECT_CLASS: &str = "structuralObjectClass";
    pub const ENTRY_UUID: &str = "entryUUID";
    pub const ENTRY_CSN: &str = "entryCSN";
    pub const CONTEXT_CSN: &str = "contextCSN";
    pub const CREATE_TIMESTAMP: &str = "createTimestamp";
    pub const MODIFY_TIMESTAMP: &str = "modifyTimestamp";
    pub const MODIFIERS_NAME: &str = "modifiersName";
    pub const CREATORS_NAME: &str = "creatorsName";
    pub const DIRSYNC_COOKIE: &str = "dirSyncCookie";
    pub const LAST_CHANGE_NUMBER: &str = "lastChangeNumber";
    pub const GLUE: &str = "glue";
    pub const TOP: &str = "top";
}

/// Registry of attribute descriptors, keyed case-insensitively.
///
/// Lookups for unknown names register a default user attribute, so callers
/// always get a descriptor back; strictness lives with schema checking on
/// the write path, not here.
pub struct Schema {
    map: Mutex<HashMap<String, Arc<AttrDesc>>>,
}

impl Schema {
    pub fn new() -> Self {
        Schema { map: Mutex::new(HashMap::new()) }
    }

    /// A schema pre-seeded with the operational attributes the engine uses.
    pub fn with_defaults() -> Arc<Self> {
        let schema = Schema::new();
        for desc in [
            AttrDesc::user(ads::OBJECT_CLASS),
            AttrDesc::user(ads::STRUCTURAL_OBJECT_CLASS).single().operational(),
            AttrDesc::user(ads::ENTRY_UUID)
                .single()
                .operational()
                .equality(Some(Equality::Octet)),
            AttrDesc::user(ads::ENTRY_CSN)
                .single()
                .operational()
                .equality(Some(Equality::Octet)),
            AttrDesc::user(ads::CONTEXT_CSN).operational().equality(Some(Equality::Octet)),
            AttrDesc::user(ads::CREATE_TIMESTAMP).single().operational(),
            AttrDesc::user(ads::MODIFY_TIMESTAMP).single().operational(),
            AttrDesc::user(ads::MODIFIERS_NAME).single().operational().dn_valued(),
            AttrDesc::user(ads::CREATORS_NAME).single().operational().dn_valued(),
            AttrDesc::user(ads::DIRSYNC_COOKIE)
                .single()
                .operational()
                .equality(Some(Equality::Octet)),
            AttrDesc::user(ads::LAST_CHANGE_NUMBER)
                .single()
                .operational()
                .equality(Some(Equality::Integer)),
            AttrDesc::user("entryDN").single().operational().dynamic().dn_valued(),
            AttrDesc::user("hasSubordinates").single().operational().dynamic(),
            AttrDesc::user("subschemaSubentry").single().operational().dynamic().dn_valued(),
            AttrDesc::user("member").dn_valued(),
            AttrDesc::user("seeAlso").dn_valued(),
        ] {
            schema.register(desc);
        }
        Arc::new(schema)
    }

    pub fn register(&self, desc: AttrDesc) -> Arc<AttrDesc> {
        let key = desc.name.to_ascii_lowercase();
        let arc = Arc::new(desc);
        self.map.lock().unwrap().insert(key, arc.clone());
        arc
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<AttrDesc>> {
        self.map.lock().unwrap().get(&name.to_ascii_lowercase()).cloned()
    }

    /// Resolve a name, registering a default user attribute when unknown.
    pub fn resolve(&self, name: &str) -> Arc<AttrDesc> {
        let key = name.to_ascii_lowercase();
        let mut map = self.map.lock().unwrap();
        if let Some(desc) = map.get(&key) {
            return desc.clone();
        }
        let arc = Arc::new(AttrDesc::user(name));
        map.insert(key, arc.clone());
        arc
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_registers_default() {
        let schema = Schema::new();
        let desc = schema.resolve("mail");
        assert!(!desc.single_valued);
        assert_eq!(desc.equality, Some(Equality::CaseIgnore));
        // Same descriptor back, case-insensitively.
        let again = schema.resolve("MAIL");
        assert!(Arc::ptr_eq(&desc, &again));
    }

    #[test]
    fn test_defaults_flags() {
        let schema = Schema::with_defaults();
        let csn = schema.lookup(ads::ENTRY_CSN).unwrap();
        assert!(csn.single_valued && csn.operational);
        assert_eq!(csn.equality, Some(Equality::Octet));
        assert!(schema.lookup("entrydn").unwrap().dynamic);
    }

    #[test]
    fn test_normalization_rules() {
        let ci = AttrDesc::user("cn");
        assert!(ci.values_equal(b"Alice ", b"alice"));

        let octet = AttrDesc::user("x").equality(Some(Equality::Octet));
        assert!(!octet.values_equal(b"A", b"a"));

        let dn = AttrDesc::user("member").dn_valued();
        assert!(dn.values_equal(b"CN=A, DC=B", b"cn=a,dc=b"));

        let int = AttrDesc::user("n").equality(Some(Equality::Integer));
        assert!(int.values_equal(b"007", b"7"));
        assert!(int.values_equal(b"0", b"000"));
    }
}
