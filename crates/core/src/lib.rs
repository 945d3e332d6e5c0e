//! Domain layer of the store directory.
//!
//! Holds the store model, the hierarchy walkers shared by every backend, and
//! an in-memory [`StoreDirectory`].

pub mod directory;
pub mod tree;
pub mod types;

pub use directory::{DirectoryError, StoreDirectory};
pub use tree::{AncestorStep, AncestorWalk, DescendantWalk};
pub use types::{Domains, NewStore, Store, StoreId, StoreParts, StoreUpdate};
