//! Tree geometry and runtime configuration.

use crate::error::{Error, Result};
use crate::page::PAGE_HEADER_SIZE;
use crate::types::{Key, Value, ADDR_SIZE};
use serde::{Deserialize, Serialize};

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Default page size in bytes (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of page frames held by the store cache
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Tree configuration.
///
/// `page_size` and `fanout` are on-disk geometry and must match the file on
/// reopen; `cache_capacity` and `debug` are runtime-only switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    /// Size of every page in bytes
    pub page_size: usize,
    /// Maximum number of records per node or leaf
    pub fanout: usize,
    /// Number of page frames kept in memory
    pub cache_capacity: usize,
    /// Format version written to and checked against the file header
    pub version: u32,
    /// Emit extra structural logging through the `log` facade
    pub debug: bool,
}

impl Params {
    /// Derive the largest fanout that fits `page_size` for the given record types.
    pub fn compute<K: Key, V: Value>(page_size: usize) -> Self {
        let width = record_width::<K, V>();
        let fanout = page_size.saturating_sub(PAGE_HEADER_SIZE) / width.max(1);
        Self {
            page_size,
            fanout,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            version: FORMAT_VERSION,
            debug: false,
        }
    }

    /// Override the fanout (useful for small trees in tests and tools)
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Override the cache capacity
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Enable debug logging
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Check that a full page of either kind fits `page_size`.
    pub fn validate<K: Key, V: Value>(&self) -> Result<()> {
        if self.fanout < 2 {
            return Err(Error::invariant(format!(
                "fanout {} too small, need at least 2",
                self.fanout
            )));
        }
        if self.cache_capacity == 0 {
            return Err(Error::invariant("cache capacity must be non-zero"));
        }
        let width = record_width::<K, V>();
        let need = PAGE_HEADER_SIZE + self.fanout * width;
        if need > self.page_size {
            return Err(Error::invariant(format!(
                "page size {} cannot hold {} records of width {} ({} bytes needed)",
                self.page_size, self.fanout, width, need
            )));
        }
        Ok(())
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fanout: 0, // derived lazily by Btree::create via compute()
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            version: FORMAT_VERSION,
            debug: false,
        }
    }
}

/// Widest record a page of these types can hold
pub(crate) fn record_width<K: Key, V: Value>() -> usize {
    (K::SIZE + V::SIZE).max(K::SIZE + ADDR_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computed_fanout_fits() {
        let params = Params::compute::<u64, u64>(4096);
        assert!(params.fanout > 0);
        params.validate::<u64, u64>().unwrap();
        // One more record would spill over the page
        let too_big = params.clone().with_fanout(params.fanout + 1);
        assert!(too_big.validate::<u64, u64>().is_err());
    }

    #[test]
    fn test_tiny_fanout_rejected() {
        let params = Params::compute::<u32, u32>(4096).with_fanout(1);
        assert!(params.validate::<u32, u32>().is_err());
    }

    #[test]
    fn test_override_fanout() {
        let params = Params::compute::<u32, u32>(4096).with_fanout(4);
        assert_eq!(params.fanout, 4);
        params.validate::<u32, u32>().unwrap();
    }
}
