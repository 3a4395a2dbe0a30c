//! DN rewriting seam.
//!
//! Suffix massage itself lives outside the core; the engine only needs a
//! hook to pass provider-side DNs through on the way in.

/// Rewrites DNs received from a provider into the local namespace.
pub trait DnRewriter: Send + Sync {
    /// Returns the rewritten DN, or `None` to keep the input unchanged.
    fn rewrite(&self, dn: &str) -> Option<String>;
}

/// Keeps every DN as-is.
pub struct IdentityRewriter;

impl DnRewriter for IdentityRewriter {
    fn rewrite(&self, _dn: &str) -> Option<String> {
        None
    }
}

/// Replaces a provider-side suffix with the local one. The only rewriter
/// the consumer configures itself.
pub struct SuffixRewriter {
    from: String,
    to: String,
}

impl SuffixRewriter {
    pub fn new(from: &str, to: &str) -> Self {
        SuffixRewriter {
            from: crate::dn::Dn::parse(from).norm().to_string(),
            to: to.to_string(),
        }
    }
}

impl DnRewriter for SuffixRewriter {
    fn rewrite(&self, dn: &str) -> Option<String> {
        let parsed = crate::dn::Dn::parse(dn);
        let from = crate::dn::Dn::parse(&self.from);
        if &parsed == &from {
            return Some(self.to.clone());
        }
        if !parsed.is_under(&from) {
            return None;
        }
        // Peel the suffix off one RDN at a time, keeping the head's
        // display form.
        let mut head = Vec::new();
        let mut cur = parsed;
        for _ in 0..cur.num_rdns().saturating_sub(from.num_rdns()) {
            head.push(cur.rdn().to_string());
            cur = cur.parent()?;
        }
        head.push(self.to.clone());
        Some(head.join(","))
    }
}
