//! Leaf pages.
//!
//! A leaf is a sorted array of `(key, value)` records in one page. The view
//! decodes the records on load, mutates in memory, and encodes back through
//! a write lease on `save`. Callers never persist an overflowing leaf: `add`
//! is followed by either `save` or `split`.

use crate::error::{Error, Result};
use crate::page::{Merge, PageHeader, PAGE_HEADER_SIZE};
use crate::storage::Store;
use crate::types::{Address, Key, Kind, Value};

/// Decoded view over a leaf page
#[derive(Debug)]
pub struct Leaf<K: Key, V: Value> {
    addr: Address,
    entries: Vec<(K, V)>,
}

impl<K: Key, V: Value> Leaf<K, V> {
    const RECORD_SIZE: usize = K::SIZE + V::SIZE;

    /// Stamp an empty leaf header at `addr`
    pub fn init(store: &Store, addr: Address) -> Result<()> {
        let leaf: Leaf<K, V> = Leaf {
            addr,
            entries: Vec::new(),
        };
        leaf.save(store)
    }

    /// Decode the leaf at `addr`
    pub fn load(store: &Store, addr: Address) -> Result<Self> {
        let guard = store.fetch(addr)?;
        let page = guard.read();

        let header = PageHeader::read(&page)
            .ok_or_else(|| Error::corruption(format!("unreadable page header at {addr}")))?;
        if !header.kind.is_leaf() {
            return Err(Error::corruption(format!(
                "expected a leaf at {addr}, found {:?}",
                header.kind
            )));
        }

        let count = header.count as usize;
        let end = PAGE_HEADER_SIZE + count * Self::RECORD_SIZE;
        if end > page.len() {
            return Err(Error::corruption(format!(
                "leaf {addr} claims {count} records, page too small"
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = PAGE_HEADER_SIZE + i * Self::RECORD_SIZE;
            let key = K::read_from(&page[off..off + K::SIZE]);
            let value = V::read_from(&page[off + K::SIZE..off + Self::RECORD_SIZE]);
            entries.push((key, value));
        }

        Ok(Self { addr, entries })
    }

    /// Encode back into the page through a write lease
    pub fn save(&self, store: &Store) -> Result<()> {
        let need = PAGE_HEADER_SIZE + self.entries.len() * Self::RECORD_SIZE;
        if need > store.page_size() {
            return Err(Error::invariant(format!(
                "packed leaf {} would span {} bytes, page is {}",
                self.addr,
                need,
                store.page_size()
            )));
        }

        let guard = store.fetch_mut(self.addr)?;
        let mut page = guard.write();
        page.as_bytes_mut().fill(0);

        let header = PageHeader {
            kind: Kind::Leaf,
            count: self.entries.len() as u16,
        };
        header.write(page.as_bytes_mut());

        for (i, (key, value)) in self.entries.iter().enumerate() {
            let off = PAGE_HEADER_SIZE + i * Self::RECORD_SIZE;
            key.write_to(&mut page[off..off + K::SIZE]);
            value.write_to(&mut page[off + K::SIZE..off + Self::RECORD_SIZE]);
        }

        Ok(())
    }

    /// Address of this leaf's page
    pub fn address(&self) -> Address {
        self.addr
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the leaf holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key. Fails with [`Error::NotFound`] if absent.
    pub fn find(&self, key: &K) -> Result<&V> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => Ok(&self.entries[idx].1),
            Err(_) => Err(Error::NotFound),
        }
    }

    /// Whether the key is bound
    pub fn mem(&self, key: &K) -> bool {
        self.entries.binary_search_by(|(k, _)| k.cmp(key)).is_ok()
    }

    /// Insert or replace at the sorted position
    pub fn add(&mut self, key: K, value: V) {
        match self.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(idx) => self.entries[idx].1 = value,
            Err(idx) => self.entries.insert(idx, (key, value)),
        }
    }

    /// Delete the key if present; returns whether a record was removed
    pub fn remove(&mut self, key: &K) -> bool {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => {
                self.entries.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// Invoke `f` on every record in ascending key order
    pub fn iter<F: FnMut(&K, &V)>(&self, mut f: F) {
        for (k, v) in &self.entries {
            f(k, v);
        }
    }

    /// The smallest key, if any
    pub fn leftmost(&self) -> Option<&K> {
        self.entries.first().map(|(k, _)| k)
    }

    /// More records than the fanout allows
    pub fn overflow(&self, fanout: usize) -> bool {
        self.entries.len() > fanout
    }

    /// Strictly below half occupancy (root exemption is the caller's)
    pub fn underflow(&self, fanout: usize) -> bool {
        2 * self.entries.len() < fanout
    }

    /// Split into two halves: `len/2` records stay here, the rest move to a
    /// freshly allocated leaf. Returns the promoted key (the new leaf's
    /// leftmost) and the new leaf. Both pages are saved.
    pub fn split(&mut self, store: &Store) -> Result<(K, Leaf<K, V>)> {
        let keep = self.entries.len() / 2;
        if keep == 0 {
            return Err(Error::invariant(format!(
                "splitting leaf {} with {} records",
                self.addr,
                self.entries.len()
            )));
        }

        let upper = self.entries.split_off(keep);
        let addr = store.alloc(Kind::Leaf)?;
        let right = Leaf {
            addr,
            entries: upper,
        };
        let promoted = right.entries[0].0.clone();

        self.save(store)?;
        right.save(store)?;
        Ok((promoted, right))
    }

    /// Absorb the right sibling.
    ///
    /// `Total` drains `right` and frees its page; `Partial` rebalances so
    /// both halves stay at or above half occupancy and returns the right
    /// page's new leftmost key for the parent separator.
    pub fn merge(&mut self, mut right: Leaf<K, V>, store: &Store) -> Result<Merge<K>> {
        let fanout = store.fanout();
        self.entries.append(&mut right.entries);

        if self.entries.len() <= fanout {
            store.free(right.addr)?;
            self.save(store)?;
            return Ok(Merge::Total);
        }

        let keep = (self.entries.len() + 1) / 2;
        right.entries = self.entries.split_off(keep);
        let separator = right.entries[0].0.clone();

        self.save(store)?;
        right.save(store)?;
        Ok(Merge::Partial { separator })
    }
}
