//! Glue entry materialization.
//!
//! During refresh, adds can arrive before their ancestors. Missing levels
//! between the database suffix and the target are filled with placeholder
//! glue entries so the add can land; the real ancestors overwrite the glue
//! when they arrive.

use spindle_dir::{ads, Dn, DirError, DirOps, Entry, OpFlags, Schema};
use tracing::debug;

/// Create glue entries for every missing ancestor of `target` strictly
/// between the suffix and the target itself. "Already exists" at any level
/// is not a failure.
pub fn add_glue_ancestors(
    dir: &dyn DirOps,
    schema: &Schema,
    suffix: &Dn,
    target: &Dn,
) -> Result<(), DirError> {
    let mut chain = Vec::new();
    let mut cur = target.parent();
    while let Some(dn) = cur {
        if !dn.is_under(suffix) && &dn != suffix {
            break;
        }
        if &dn == suffix {
            break;
        }
        cur = dn.parent();
        chain.push(dn);
    }

    // Topmost missing ancestor first.
    for dn in chain.into_iter().rev() {
        let mut glue = Entry::new(dn);
        glue.set(
            schema.resolve(ads::OBJECT_CLASS),
            vec![ads::TOP.as_bytes().to_vec(), ads::GLUE.as_bytes().to_vec()],
        );
        glue.set(
            schema.resolve(ads::STRUCTURAL_OBJECT_CLASS),
            vec![ads::GLUE.as_bytes().to_vec()],
        );
        // Glue is locally originated: never replicated, never schema-checked.
        let flags = OpFlags { dont_replicate: true, no_schema_check: true, ..Default::default() };
        match dir.add(glue, &flags) {
            Ok(()) => debug!(dn = %target, "materialized glue ancestor"),
            Err(DirError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Add an entry, materializing glue ancestors first.
pub fn add_with_glue(
    dir: &dyn DirOps,
    schema: &Schema,
    suffix: &Dn,
    entry: Entry,
    flags: &OpFlags,
) -> Result<(), DirError> {
    add_glue_ancestors(dir, schema, suffix, &entry.dn)?;
    dir.add(entry, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_dir::MemoryDirectory;

    fn setup() -> (std::sync::Arc<Schema>, MemoryDirectory) {
        let schema = Schema::with_defaults();
        let suffix = Dn::parse("dc=example,dc=com");
        let dir = MemoryDirectory::new(suffix.clone(), schema.clone());
        let mut root = Entry::new(suffix);
        root.set(schema.resolve(ads::OBJECT_CLASS), vec![b"organization".to_vec()]);
        dir.seed(root);
        (schema, dir)
    }

    #[test]
    fn test_deep_add_creates_glue_chain() {
        let (schema, dir) = setup();
        let suffix = dir.suffix().clone();

        let mut e = Entry::new(Dn::parse("cn=leaf,ou=b,ou=a,dc=example,dc=com"));
        e.set(schema.resolve(ads::OBJECT_CLASS), vec![b"person".to_vec()]);
        add_with_glue(&dir, &schema, &suffix, e, &OpFlags::default()).unwrap();

        let glue = dir.fetch(&Dn::parse("ou=a,dc=example,dc=com")).unwrap().unwrap();
        assert!(glue.is_glue());
        let glue2 = dir.fetch(&Dn::parse("ou=b,ou=a,dc=example,dc=com")).unwrap().unwrap();
        assert!(glue2.is_glue());
        assert!(dir
            .fetch(&Dn::parse("cn=leaf,ou=b,ou=a,dc=example,dc=com"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_existing_ancestors_untouched() {
        let (schema, dir) = setup();
        let suffix = dir.suffix().clone();

        let mut real = Entry::new(Dn::parse("ou=a,dc=example,dc=com"));
        real.set(schema.resolve(ads::OBJECT_CLASS), vec![b"organizationalUnit".to_vec()]);
        dir.add(real, &OpFlags::default()).unwrap();

        let mut e = Entry::new(Dn::parse("cn=leaf,ou=a,dc=example,dc=com"));
        e.set(schema.resolve(ads::OBJECT_CLASS), vec![b"person".to_vec()]);
        add_with_glue(&dir, &schema, &suffix, e, &OpFlags::default()).unwrap();

        let kept = dir.fetch(&Dn::parse("ou=a,dc=example,dc=com")).unwrap().unwrap();
        assert!(!kept.is_glue());
    }
}
