//! B-tree implementation.
//!
//! This module provides the user-facing tree handle with operations for
//! point lookups, insert-or-replace, delete with rebalancing, in-order
//! traversal, bulk loading, and diagnostic snapshots.

mod bulk;
mod registry;
mod tree;

pub use tree::{Btree, Stats};
