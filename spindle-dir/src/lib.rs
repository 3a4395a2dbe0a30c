//! Directory data model and operations interface.
//!
//! The replication engine never talks to a storage backend directly; it goes
//! through the [`ops::DirOps`] trait defined here. This crate also carries
//! the entry/attribute/modification model, the diff algorithm that turns an
//! incoming entry into a minimal modification list, and an in-memory
//! directory used by tests and embedders.

pub mod diff;
pub mod dn;
pub mod entry;
pub mod filter;
pub mod memory;
pub mod modify;
pub mod ops;
pub mod rewrite;
pub mod schema;

pub use dn::Dn;
pub use entry::{Attribute, Entry};
pub use filter::Filter;
pub use memory::MemoryDirectory;
pub use modify::{ModOp, Modification};
pub use ops::{DirError, DirOps, OpFlags, OpTime, Scope, SearchParams};
pub use rewrite::DnRewriter;
pub use schema::{ads, AttrDesc, Equality, Schema};
