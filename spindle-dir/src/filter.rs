//! Search filters.
//!
//! The engine emits a small filter vocabulary: presence, equality, ordering
//! comparisons, and conjunction. That subset is modeled directly rather
//! than round-tripping through filter strings.

use crate::entry::Entry;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(attr=*)`
    Present(String),
    /// `(attr=value)`
    Eq(String, Vec<u8>),
    /// `(attr>=value)` — raw byte comparison, as for change stamps.
    Ge(String, Vec<u8>),
    /// `(attr<=value)`
    Le(String, Vec<u8>),
    And(Vec<Filter>),
}

impl Filter {
    /// Match-everything filter.
    pub fn any() -> Filter {
        Filter::Present("objectClass".into())
    }

    pub fn eq(attr: &str, value: impl Into<Vec<u8>>) -> Filter {
        Filter::Eq(attr.to_string(), value.into())
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::Present(attr) => entry.get(attr).is_some(),
            Filter::Eq(attr, value) => entry
                .get(attr)
                .map(|a| a.has_value(value))
                .unwrap_or(false),
            Filter::Ge(attr, value) => entry
                .get(attr)
                .map(|a| a.values.iter().any(|v| v.as_slice() >= value.as_slice()))
                .unwrap_or(false),
            Filter::Le(attr, value) => entry
                .get(attr)
                .map(|a| a.values.iter().any(|v| v.as_slice() <= value.as_slice()))
                .unwrap_or(false),
            Filter::And(subs) => subs.iter().all(|f| f.matches(entry)),
        }
    }

    /// Parse the subset the configuration surface uses. Anything beyond it
    /// is rejected.
    pub fn parse(raw: &str) -> Result<Filter, String> {
        let s = raw.trim();
        let inner = s
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| format!("filter must be parenthesized: {raw:?}"))?;

        if let Some(rest) = inner.strip_prefix('&') {
            let mut subs = Vec::new();
            let mut depth = 0;
            let mut start = 0;
            for (i, c) in rest.char_indices() {
                match c {
                    '(' => {
                        if depth == 0 {
                            start = i;
                        }
                        depth += 1;
                    }
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            subs.push(Filter::parse(&rest[start..=i])?);
                        }
                    }
                    _ => {}
                }
            }
            if depth != 0 || subs.is_empty() {
                return Err(format!("malformed conjunction: {raw:?}"));
            }
            return Ok(Filter::And(subs));
        }

        for (op, make) in [
            (">=", Filter::Ge as fn(String, Vec<u8>) -> Filter),
            ("<=", Filter::Le as fn(String, Vec<u8>) -> Filter),
        ] {
            if let Some(pos) = inner.find(op) {
                let attr = inner[..pos].trim().to_string();
                let value = inner[pos + 2..].as_bytes().to_vec();
                return Ok(make(attr, value));
            }
        }

        if let Some((attr, value)) = inner.split_once('=') {
            let attr = attr.trim().to_string();
            if value == "*" {
                return Ok(Filter::Present(attr));
            }
            return Ok(Filter::Eq(attr, value.as_bytes().to_vec()));
        }

        Err(format!("unsupported filter: {raw:?}"))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Present(a) => write!(f, "({a}=*)"),
            Filter::Eq(a, v) => write!(f, "({a}={})", String::from_utf8_lossy(v)),
            Filter::Ge(a, v) => write!(f, "({a}>={})", String::from_utf8_lossy(v)),
            Filter::Le(a, v) => write!(f, "({a}<={})", String::from_utf8_lossy(v)),
            Filter::And(subs) => {
                write!(f, "(&")?;
                for s in subs {
                    write!(f, "{s}")?;
                }
                write!(f, ")")
            }
        }
    }
}
