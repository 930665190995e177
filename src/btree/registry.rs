//! Process-wide registry of open trees.
//!
//! Maps the canonical root directory to the live tree with that root, so
//! opening an already-open path yields the same tree. Entries are
//! type-erased; a caller asking for a live path with different key/value
//! types gets an error instead of a second store over the same file.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Registry = HashMap<PathBuf, Box<dyn Any + Send>>;

static OPEN_TREES: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Lock the registry for the duration of a create/close sequence
pub(crate) fn lock() -> MutexGuard<'static, Registry> {
    OPEN_TREES.lock()
}

/// Look up a live tree, downcasting to the caller's shared type
pub(crate) fn get<T: Send + Sync + 'static>(
    registry: &Registry,
    path: &Path,
) -> Result<Option<Arc<T>>> {
    match registry.get(path) {
        None => Ok(None),
        Some(entry) => match entry.downcast_ref::<Arc<T>>() {
            Some(shared) => Ok(Some(Arc::clone(shared))),
            None => Err(Error::invalid_operation(format!(
                "tree at {} is already open with different key/value types",
                path.display()
            ))),
        },
    }
}

/// Register a freshly opened tree
pub(crate) fn insert<T: Send + Sync + 'static>(
    registry: &mut Registry,
    path: PathBuf,
    shared: Arc<T>,
) {
    registry.insert(path, Box::new(shared));
}

/// Whether the path has a live tree
pub(crate) fn is_open(registry: &Registry, path: &Path) -> bool {
    registry.contains_key(path)
}

/// Drop the entry for a fully closed tree
pub(crate) fn evict(registry: &mut Registry, path: &Path) {
    registry.remove(path);
}
