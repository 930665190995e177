//! # BTree Index
//!
//! A persistent, ordered map from fixed-size keys to fixed-size values,
//! backed by a single file of fixed-size pages.
//!
//! ## Architecture
//!
//! The index is composed of modular layers:
//!
//! - **Types** (`types`): addresses, page kinds, geometry parameters, and
//!   the fixed-size [`Key`]/[`Value`] codec traits
//! - **Page Layer** (`page`): in-page layouts for leaves and routing nodes,
//!   with split and merge protocols
//! - **Storage Layer** (`storage`): the page store — file I/O, page cache
//!   with RAII leases, persistent freelist, root pointer, and the
//!   bulk-load migration mode
//! - **B-Tree Layer** (`btree`): descent, rebalancing, traversal, and the
//!   process-wide cache of open trees
//!
//! ## Usage
//!
//! ```rust,ignore
//! use btree_index::{Btree, Params};
//!
//! let params = Params::compute::<u64, u64>(4096);
//! let tree: Btree<u64, u64> = Btree::create("my_index", params)?;
//!
//! // Insert or replace a binding
//! tree.add(1, 100)?;
//!
//! // Look up a key
//! let value = tree.find(&1)?;
//!
//! // Delete a binding
//! tree.remove(&1)?;
//!
//! // In-order traversal
//! tree.iter(|key, value| println!("{key:?} -> {value:?}"))?;
//!
//! // Durability barrier, then hand the tree back
//! tree.flush()?;
//! tree.close()?;
//! ```
//!
//! Within one tree, operations are single-writer and run to completion;
//! handles returned by [`Btree::create`] for the same root directory share
//! state. `flush` is the durability barrier: every mutation that returned
//! before it is on disk after it returns.

pub mod btree;
pub mod error;
pub mod page;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
pub use types::{Address, Key, Kind, Params, Value, FORMAT_VERSION};

// Re-export main public API
pub use btree::{Btree, Stats};
pub use storage::Store;
