//! Node pages.
//!
//! A node is a sorted array of `(key, address)` routing records in one page.
//! The first key of every node is the `min` sentinel, so the child for a
//! lookup key is always the one under the greatest stored key at or below
//! it — no leftmost special case anywhere on the descent.

use crate::error::{Error, Result};
use crate::page::{Merge, PageHeader, PAGE_HEADER_SIZE};
use crate::storage::Store;
use crate::types::{Address, Key, Kind, ADDR_SIZE};

/// Which side the chosen sibling lies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// The sibling is the entry to the right of the match
    Higher,
    /// The match is the last entry; the sibling is to its left
    Lower,
}

/// Result of a sibling-aware routing step
#[derive(Debug, Clone)]
pub struct Route<K> {
    /// The entry the lookup key routes to
    pub main: (K, Address),
    /// An adjacent entry, right-preferred; `None` on a single-entry node
    pub neighbour: Option<((K, Address), Order)>,
}

/// Decoded view over a node page
#[derive(Debug)]
pub struct Node<K: Key> {
    addr: Address,
    depth: u8,
    entries: Vec<(K, Address)>,
}

impl<K: Key> Node<K> {
    const RECORD_SIZE: usize = K::SIZE + ADDR_SIZE;

    /// Allocate an empty node of the given depth
    pub fn create(store: &Store, depth: u8) -> Result<Self> {
        let addr = store.alloc(Kind::Node(depth))?;
        Ok(Self {
            addr,
            depth,
            entries: Vec::new(),
        })
    }

    /// Decode the node at `addr`
    pub fn load(store: &Store, addr: Address) -> Result<Self> {
        let guard = store.fetch(addr)?;
        let page = guard.read();

        let header = PageHeader::read(&page)
            .ok_or_else(|| Error::corruption(format!("unreadable page header at {addr}")))?;
        let depth = match header.kind {
            Kind::Node(d) => d,
            Kind::Leaf => {
                return Err(Error::corruption(format!(
                    "expected a node at {addr}, found a leaf"
                )))
            }
        };

        let count = header.count as usize;
        let end = PAGE_HEADER_SIZE + count * Self::RECORD_SIZE;
        if end > page.len() {
            return Err(Error::corruption(format!(
                "node {addr} claims {count} records, page too small"
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = PAGE_HEADER_SIZE + i * Self::RECORD_SIZE;
            let key = K::read_from(&page[off..off + K::SIZE]);
            let child = u32::from_be_bytes([
                page[off + K::SIZE],
                page[off + K::SIZE + 1],
                page[off + K::SIZE + 2],
                page[off + K::SIZE + 3],
            ]);
            entries.push((key, Address::new(child)));
        }

        Ok(Self {
            addr,
            depth,
            entries,
        })
    }

    /// Encode back into the page through a write lease
    pub fn save(&self, store: &Store) -> Result<()> {
        if let Some((first, _)) = self.entries.first() {
            if *first != <K as Key>::min() {
                return Err(Error::invariant(format!(
                    "node {} leftmost key is not the sentinel",
                    self.addr
                )));
            }
        }

        let need = PAGE_HEADER_SIZE + self.entries.len() * Self::RECORD_SIZE;
        if need > store.page_size() {
            return Err(Error::invariant(format!(
                "packed node {} would span {} bytes, page is {}",
                self.addr,
                need,
                store.page_size()
            )));
        }

        let guard = store.fetch_mut(self.addr)?;
        let mut page = guard.write();
        page.as_bytes_mut().fill(0);

        let header = PageHeader {
            kind: Kind::Node(self.depth),
            count: self.entries.len() as u16,
        };
        header.write(page.as_bytes_mut());

        for (i, (key, child)) in self.entries.iter().enumerate() {
            let off = PAGE_HEADER_SIZE + i * Self::RECORD_SIZE;
            key.write_to(&mut page[off..off + K::SIZE]);
            page[off + K::SIZE..off + Self::RECORD_SIZE]
                .copy_from_slice(&child.value().to_be_bytes());
        }

        Ok(())
    }

    /// Address of this node's page
    pub fn address(&self) -> Address {
        self.addr
    }

    /// Depth of this node (leaves are at 0)
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Number of routing records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the node holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The routing records in key order
    pub fn entries(&self) -> &[(K, Address)] {
        &self.entries
    }

    /// The smallest stored key (the sentinel on a well-formed node)
    pub fn leftmost(&self) -> Option<&K> {
        self.entries.first().map(|(k, _)| k)
    }

    /// Index of the entry with the greatest key at or below `key`
    fn route_index(&self, key: &K) -> Result<usize> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => Ok(idx),
            Err(0) => Err(Error::invariant(format!(
                "node {} cannot route below its leftmost key",
                self.addr
            ))),
            Err(idx) => Ok(idx - 1),
        }
    }

    /// Child address for the lookup key
    pub fn find(&self, key: &K) -> Result<Address> {
        let idx = self.route_index(key)?;
        Ok(self.entries[idx].1)
    }

    /// Child for the lookup key, plus an adjacent sibling entry.
    ///
    /// The right neighbour is preferred; the left is used only when the
    /// match is the last entry. A single-entry node has no neighbour.
    pub fn find_with_neighbour(&self, key: &K) -> Result<Route<K>> {
        let idx = self.route_index(key)?;
        let main = self.entries[idx].clone();

        let neighbour = if idx + 1 < self.entries.len() {
            Some((self.entries[idx + 1].clone(), Order::Higher))
        } else if idx > 0 {
            Some((self.entries[idx - 1].clone(), Order::Lower))
        } else {
            None
        };

        Ok(Route { main, neighbour })
    }

    /// Insert a routing record in sorted order
    pub fn add(&mut self, key: K, child: Address) -> Result<()> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(_) => Err(Error::invariant(format!(
                "separator already present in node {}",
                self.addr
            ))),
            Err(idx) => {
                self.entries.insert(idx, (key, child));
                Ok(())
            }
        }
    }

    /// Delete the record with exactly this key
    pub fn remove(&mut self, key: &K) -> Result<()> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => {
                self.entries.remove(idx);
                Ok(())
            }
            Err(_) => Err(Error::invariant(format!(
                "separator missing from node {}",
                self.addr
            ))),
        }
    }

    /// Rename a separator in place, keeping its child
    pub fn replace(&mut self, old: &K, new: K) -> Result<()> {
        match self.entries.binary_search_by(|(k, _)| k.cmp(old)) {
            Ok(idx) => {
                self.entries[idx].0 = new;
                Ok(())
            }
            Err(_) => Err(Error::invariant(format!(
                "separator missing from node {}",
                self.addr
            ))),
        }
    }

    /// Invoke `f` on every routing record in key order
    pub fn iter<F: FnMut(&K, Address)>(&self, mut f: F) {
        for (k, child) in &self.entries {
            f(k, *child);
        }
    }

    /// Fold `f` over the routing records in key order
    pub fn fold<A, F: FnMut(A, &K, Address) -> A>(&self, init: A, mut f: F) -> A {
        let mut acc = init;
        for (k, child) in &self.entries {
            acc = f(acc, k, *child);
        }
        acc
    }

    /// More records than the fanout allows
    pub fn overflow(&self, fanout: usize) -> bool {
        self.entries.len() > fanout
    }

    /// Strictly below half occupancy (root exemption is the caller's)
    pub fn underflow(&self, fanout: usize) -> bool {
        2 * self.entries.len() < fanout
    }

    /// Split into two halves, as for leaves. The promoted key is captured
    /// from the new right node's first record, which is then rewritten to
    /// the sentinel so the node invariant holds on both halves.
    pub fn split(&mut self, store: &Store) -> Result<(K, Node<K>)> {
        let keep = self.entries.len() / 2;
        if keep == 0 {
            return Err(Error::invariant(format!(
                "splitting node {} with {} records",
                self.addr,
                self.entries.len()
            )));
        }

        let mut upper = self.entries.split_off(keep);
        let promoted = upper[0].0.clone();
        upper[0].0 = <K as Key>::min();

        let addr = store.alloc(Kind::Node(self.depth))?;
        let right = Node {
            addr,
            depth: self.depth,
            entries: upper,
        };

        self.save(store)?;
        right.save(store)?;
        Ok((promoted, right))
    }

    /// Absorb the right sibling.
    ///
    /// `separator` is the parent key under which `right` was reached; it
    /// replaces the right node's sentinel so the records interleave in key
    /// order. Outcomes are as for [`Leaf::merge`](crate::page::Leaf::merge).
    pub fn merge(&mut self, mut right: Node<K>, separator: &K, store: &Store) -> Result<Merge<K>> {
        if right.depth != self.depth {
            return Err(Error::invariant(format!(
                "merging node {} of depth {} with sibling {} of depth {}",
                self.addr, self.depth, right.addr, right.depth
            )));
        }
        if right.entries.is_empty() {
            return Err(Error::invariant(format!("merging empty node {}", right.addr)));
        }

        right.entries[0].0 = separator.clone();
        self.entries.append(&mut right.entries);

        let fanout = store.fanout();
        if self.entries.len() <= fanout {
            store.free(right.addr)?;
            self.save(store)?;
            return Ok(Merge::Total);
        }

        let keep = (self.entries.len() + 1) / 2;
        let mut upper = self.entries.split_off(keep);
        let new_separator = upper[0].0.clone();
        upper[0].0 = <K as Key>::min();
        right.entries = upper;

        self.save(store)?;
        right.save(store)?;
        Ok(Merge::Partial {
            separator: new_separator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Params;
    use tempfile::tempdir;

    fn test_store(fanout: usize) -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let params = Params::compute::<u32, u32>(4096).with_fanout(fanout);
        let store = Store::open::<u32, u32>(dir.path(), params).unwrap();
        (store, dir)
    }

    fn filled(store: &Store, keys: &[u32]) -> Node<u32> {
        let mut node = Node::create(store, 1).unwrap();
        for (i, &k) in keys.iter().enumerate() {
            node.add(k, Address::new(100 + i as u32)).unwrap();
        }
        node.save(store).unwrap();
        node
    }

    #[test]
    fn test_routing_greatest_at_or_below() {
        let (store, _dir) = test_store(4);
        let node = filled(&store, &[0, 10, 20]);

        assert_eq!(node.find(&5).unwrap(), Address::new(100));
        assert_eq!(node.find(&10).unwrap(), Address::new(101));
        assert_eq!(node.find(&15).unwrap(), Address::new(101));
        assert_eq!(node.find(&99).unwrap(), Address::new(102));
    }

    #[test]
    fn test_neighbour_prefers_right() {
        let (store, _dir) = test_store(4);
        let node = filled(&store, &[0, 10, 20]);

        let route = node.find_with_neighbour(&5).unwrap();
        assert_eq!(route.main.1, Address::new(100));
        let (entry, order) = route.neighbour.unwrap();
        assert_eq!(entry.1, Address::new(101));
        assert_eq!(order, Order::Higher);
    }

    #[test]
    fn test_neighbour_falls_back_left() {
        let (store, _dir) = test_store(4);
        let node = filled(&store, &[0, 10, 20]);

        let route = node.find_with_neighbour(&25).unwrap();
        assert_eq!(route.main.1, Address::new(102));
        let (entry, order) = route.neighbour.unwrap();
        assert_eq!(entry.1, Address::new(101));
        assert_eq!(order, Order::Lower);
    }

    #[test]
    fn test_single_entry_has_no_neighbour() {
        let (store, _dir) = test_store(4);
        let node = filled(&store, &[0]);
        let route = node.find_with_neighbour(&7).unwrap();
        assert!(route.neighbour.is_none());
    }

    #[test]
    fn test_fold_visits_in_order() {
        let (store, _dir) = test_store(4);
        let node = filled(&store, &[0, 10, 20]);
        let keys = node.fold(Vec::new(), |mut acc, k, _| {
            acc.push(*k);
            acc
        });
        assert_eq!(keys, vec![0, 10, 20]);
    }

    #[test]
    fn test_replace_and_remove() {
        let (store, _dir) = test_store(4);
        let mut node = filled(&store, &[0, 10, 20]);

        node.replace(&10, 12).unwrap();
        assert_eq!(node.find(&12).unwrap(), Address::new(101));
        assert!(node.replace(&10, 13).is_err());

        node.remove(&12).unwrap();
        assert_eq!(node.len(), 2);
        assert!(node.remove(&12).is_err());
    }

    #[test]
    fn test_save_rejects_missing_sentinel() {
        let (store, _dir) = test_store(4);
        let mut node: Node<u32> = Node::create(&store, 1).unwrap();
        node.add(10, Address::new(100)).unwrap();
        assert!(node.save(&store).is_err());
    }

    #[test]
    fn test_split_resentinels_right() {
        let (store, _dir) = test_store(4);
        let mut node = filled(&store, &[0, 10, 20, 30]);
        node.add(40, Address::new(104)).unwrap();

        let (promoted, right) = node.split(&store).unwrap();
        assert_eq!(promoted, 20);
        assert_eq!(node.len(), 2);
        assert_eq!(right.len(), 3);
        assert_eq!(right.leftmost(), Some(&0));
        // The promoted key's child survived under the sentinel
        assert_eq!(right.entries()[0].1, Address::new(102));
    }

    #[test]
    fn test_merge_total_renames_sentinel() {
        let (store, _dir) = test_store(4);
        let mut left = filled(&store, &[0, 10]);
        let right = filled(&store, &[0, 40]);

        let outcome = left.merge(right, &30, &store).unwrap();
        assert_eq!(outcome, Merge::Total);
        assert_eq!(left.len(), 4);
        // The right node's sentinel record now carries the old parent separator
        assert_eq!(left.find(&30).unwrap(), Address::new(100));
        assert_eq!(left.find(&40).unwrap(), Address::new(101));
    }

    #[test]
    fn test_merge_partial_returns_new_separator() {
        let (store, _dir) = test_store(4);
        let mut left = filled(&store, &[0, 10, 20, 30]);
        let right = filled(&store, &[0]);

        match left.merge(right, &40, &store).unwrap() {
            Merge::Partial { separator } => {
                assert_eq!(separator, 30);
                assert_eq!(left.len(), 3);
            }
            Merge::Total => panic!("expected a partial merge"),
        }
    }
}
