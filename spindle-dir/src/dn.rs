//! Distinguished names.
//!
//! A `Dn` keeps both the display form as received and a normalized form used
//! for equality and tree placement. Normalization lowercases, strips spaces
//! around separators, and leaves values otherwise intact. Escaped commas
//! (`\,`) are honored when splitting RDNs.

use std::cmp::Ordering;
use std::fmt;

/// A distinguished name with cached normalized form.
#[derive(Clone)]
pub struct Dn {
    display: String,
    norm: String,
}

/// Split a DN into RDN components on unescaped commas.
fn split_rdns(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == b',' {
            parts.push(&s[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    parts.push(&s[start..]);
    parts
}

fn normalize_rdn(rdn: &str) -> String {
    match rdn.split_once('=') {
        Some((attr, value)) => format!(
            "{}={}",
            attr.trim().to_ascii_lowercase(),
            value.trim().to_ascii_lowercase()
        ),
        None => rdn.trim().to_ascii_lowercase(),
    }
}

impl Dn {
    /// The empty DN (root of everything).
    pub fn root() -> Self {
        Dn { display: String::new(), norm: String::new() }
    }

    pub fn parse(raw: &str) -> Self {
        let display = raw.trim().to_string();
        if display.is_empty() {
            return Dn::root();
        }
        let norm = split_rdns(&display)
            .iter()
            .map(|r| normalize_rdn(r))
            .collect::<Vec<_>>()
            .join(",");
        Dn { display, norm }
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn norm(&self) -> &str {
        &self.norm
    }

    pub fn is_root(&self) -> bool {
        self.norm.is_empty()
    }

    pub fn num_rdns(&self) -> usize {
        if self.is_root() {
            0
        } else {
            split_rdns(&self.norm).len()
        }
    }

    /// First RDN in display form.
    pub fn rdn(&self) -> &str {
        split_rdns(&self.display).first().copied().unwrap_or("")
    }

    /// First RDN in normalized form.
    pub fn rdn_norm(&self) -> &str {
        split_rdns(&self.norm).first().copied().unwrap_or("")
    }

    /// First RDN split into `(attribute, value)`, display form.
    pub fn rdn_attr_value(&self) -> Option<(&str, &str)> {
        let rdn = self.rdn();
        rdn.split_once('=').map(|(a, v)| (a.trim(), v.trim()))
    }

    /// Everything above the first RDN, or `None` at the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            return None;
        }
        let parts = split_rdns(&self.display);
        if parts.len() <= 1 {
            return Some(Dn::root());
        }
        Some(Dn::parse(&parts[1..].join(",")))
    }

    /// True when `self` sits strictly below `ancestor`.
    pub fn is_under(&self, ancestor: &Dn) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        self.norm.len() > ancestor.norm.len()
            && self.norm.ends_with(&ancestor.norm)
            && self.norm.as_bytes()[self.norm.len() - ancestor.norm.len() - 1] == b','
    }

    /// True when `self` equals `base` or sits below it.
    pub fn is_within(&self, base: &Dn) -> bool {
        self == base || self.is_under(base)
    }

    /// Build `<rdn>,<parent>`.
    pub fn child_of(rdn: &str, parent: &Dn) -> Dn {
        if parent.is_root() {
            Dn::parse(rdn)
        } else {
            Dn::parse(&format!("{},{}", rdn, parent.display))
        }
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Dn {}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.norm.cmp(&other.norm)
    }
}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.norm.hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({})", self.display)
    }
}
