//! Entries and attributes.
//!
//! Attribute order is preserved: the diff algorithm walks two entries in
//! lock step and relies on providers sending attributes in a stable order.

use crate::dn::Dn;
use crate::schema::{ads, AttrDesc};
use std::sync::Arc;

/// One attribute: descriptor plus raw values.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub desc: Arc<AttrDesc>,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(desc: Arc<AttrDesc>, values: Vec<Vec<u8>>) -> Self {
        Attribute { desc, values }
    }

    pub fn single(desc: Arc<AttrDesc>, value: impl Into<Vec<u8>>) -> Self {
        Attribute { desc, values: vec![value.into()] }
    }

    pub fn first_str(&self) -> Option<&str> {
        self.values.first().and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn has_value(&self, value: &[u8]) -> bool {
        self.values.iter().any(|v| self.desc.values_equal(v, value))
    }

    pub fn remove_value(&mut self, value: &[u8]) -> bool {
        let before = self.values.len();
        let desc = self.desc.clone();
        self.values.retain(|v| !desc.values_equal(v, value));
        self.values.len() != before
    }
}

/// A directory entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub dn: Dn,
    pub attrs: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Entry { dn, attrs: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.desc.is(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attrs.iter_mut().find(|a| a.desc.is(name))
    }

    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|a| a.first_str())
    }

    /// Append values to an attribute, creating it if missing.
    pub fn put(&mut self, desc: Arc<AttrDesc>, values: Vec<Vec<u8>>) {
        match self.get_mut(&desc.name) {
            Some(attr) => attr.values.extend(values),
            None => self.attrs.push(Attribute::new(desc, values)),
        }
    }

    /// Replace an attribute's values wholesale.
    pub fn set(&mut self, desc: Arc<AttrDesc>, values: Vec<Vec<u8>>) {
        match self.get_mut(&desc.name) {
            Some(attr) => attr.values = values,
            None => self.attrs.push(Attribute::new(desc, values)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| !a.desc.is(name));
        self.attrs.len() != before
    }

    /// Glue entries are local placeholders holding the tree together.
    /// The object classes decide when present; the structural class is the
    /// fallback for entries replicated without them.
    pub fn is_glue(&self) -> bool {
        if let Some(oc) = self.get(ads::OBJECT_CLASS) {
            return oc.has_value(ads::GLUE.as_bytes());
        }
        self.first_str(ads::STRUCTURAL_OBJECT_CLASS)
            .map(|soc| soc.eq_ignore_ascii_case(ads::GLUE))
            .unwrap_or(false)
    }

    pub fn entry_csn(&self) -> Option<&str> {
        self.first_str(ads::ENTRY_CSN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[test]
    fn test_put_set_remove() {
        let schema = Schema::with_defaults();
        let mut e = Entry::new(Dn::parse("cn=a,dc=t"));
        e.put(schema.resolve("cn"), vec![b"a".to_vec()]);
        e.put(schema.resolve("cn"), vec![b"alias".to_vec()]);
        assert_eq!(e.get("cn").unwrap().values.len(), 2);

        e.set(schema.resolve("cn"), vec![b"only".to_vec()]);
        assert_eq!(e.first_str("cn"), Some("only"));

        assert!(e.remove_attr("CN"));
        assert!(e.get("cn").is_none());
    }

    #[test]
    fn test_has_value_uses_equality() {
        let schema = Schema::with_defaults();
        let attr = Attribute::new(schema.resolve("cn"), vec![b"Alice".to_vec()]);
        assert!(attr.has_value(b"alice"));
        assert!(!attr.has_value(b"bob"));
    }

    #[test]
    fn test_glue_detection() {
        let schema = Schema::with_defaults();
        let mut e = Entry::new(Dn::parse("ou=x,dc=t"));
        assert!(!e.is_glue());
        e.set(
            schema.resolve(ads::OBJECT_CLASS),
            vec![b"top".to_vec(), b"glue".to_vec()],
        );
        assert!(e.is_glue());

        let mut e2 = Entry::new(Dn::parse("ou=y,dc=t"));
        e2.set(schema.resolve(ads::STRUCTURAL_OBJECT_CLASS), vec![b"Glue".to_vec()]);
        assert!(e2.is_glue());
    }
}
