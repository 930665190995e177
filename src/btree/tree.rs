//! B-tree core implementation.
//!
//! The tree handle ties a page store to the page protocols: descent through
//! routing nodes, insertion with split-and-promote, deletion with
//! merge-and-pull, root growth and shrink, in-order traversal, bulk loading,
//! and diagnostic snapshots. Handles for the same root directory share one
//! underlying tree through the process-wide registry.

use crate::btree::{bulk, registry};
use crate::error::{Error, Result};
use crate::page::{Leaf, Merge, Node, Order, PageBuf, PageHeader, Route};
use crate::storage::{Store, FILE_NAME};
use crate::types::{Address, Key, Kind, Params, Value};
use log::debug;
use serde::Serialize;
use std::io::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// State shared by every handle opened on the same root directory
struct Shared<K: Key, V: Value> {
    store: Store,
    dir: PathBuf,
    instances: AtomicUsize,
    _records: PhantomData<fn() -> (K, V)>,
}

/// A persistent, ordered map from fixed-size keys to fixed-size values.
///
/// `create` on an already-open root directory returns a handle to the same
/// tree; the tree physically closes when the last handle is closed. Within
/// one tree, operations are single-writer: interleaving mutations from
/// several threads requires external synchronization.
pub struct Btree<K: Key, V: Value> {
    shared: Arc<Shared<K, V>>,
    closed: bool,
}

/// Point-in-time counters about a tree
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Pages in the file, header included
    pub page_count: u32,
    /// Pages on the freelist
    pub free_pages: u32,
    /// Depth of the root (0 for a leaf root)
    pub depth: u8,
    /// Number of bindings
    pub entries: u64,
}

impl<K: Key, V: Value> Btree<K, V> {
    /// Open or create the tree at `root_dir`.
    ///
    /// A `params.fanout` of 0 derives the largest fanout that fits the page
    /// size. If the path is already open, the live tree is shared and its
    /// geometry must match.
    pub fn create<P: AsRef<Path>>(root_dir: P, params: Params) -> Result<Self> {
        let params = resolve_params::<K, V>(params);
        std::fs::create_dir_all(root_dir.as_ref())?;
        let dir = root_dir.as_ref().canonicalize()?;

        let mut reg = registry::lock();
        if let Some(shared) = registry::get::<Shared<K, V>>(&reg, &dir)? {
            let live = shared.store.params();
            if live.page_size != params.page_size
                || live.fanout != params.fanout
                || live.version != params.version
            {
                return Err(Error::invalid_operation(format!(
                    "tree at {} is already open with different geometry",
                    dir.display()
                )));
            }
            shared.instances.fetch_add(1, AtomicOrdering::SeqCst);
            return Ok(Self {
                shared,
                closed: false,
            });
        }

        let store = Store::open::<K, V>(&dir, params)?;
        let shared = Arc::new(Shared {
            store,
            dir: dir.clone(),
            instances: AtomicUsize::new(1),
            _records: PhantomData,
        });
        registry::insert(&mut reg, dir, Arc::clone(&shared));
        Ok(Self {
            shared,
            closed: false,
        })
    }

    /// Bulk-build a fresh tree of `n` bindings read in strictly ascending
    /// key order, replacing any previous file at `root_dir`.
    pub fn init<P, F>(root_dir: P, params: Params, n: u64, read: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnMut() -> Result<(K, V)>,
    {
        let params = resolve_params::<K, V>(params);
        std::fs::create_dir_all(root_dir.as_ref())?;
        let dir = root_dir.as_ref().canonicalize()?;

        let mut reg = registry::lock();
        if registry::is_open(&reg, &dir) {
            return Err(Error::invalid_operation(format!(
                "cannot bulk-load {}: the tree is open",
                dir.display()
            )));
        }

        let file = dir.join(FILE_NAME);
        if file.exists() {
            std::fs::remove_file(&file)?;
        }

        let store = Store::open::<K, V>(&dir, params)?;
        bulk::load::<K, V, F>(&store, n, read)?;

        let shared = Arc::new(Shared {
            store,
            dir: dir.clone(),
            instances: AtomicUsize::new(1),
            _records: PhantomData,
        });
        registry::insert(&mut reg, dir, Arc::clone(&shared));
        Ok(Self {
            shared,
            closed: false,
        })
    }

    fn store(&self) -> &Store {
        &self.shared.store
    }

    /// Number of handles currently sharing this tree
    pub fn instances(&self) -> usize {
        self.shared.instances.load(AtomicOrdering::SeqCst)
    }

    /// Close this handle. The last close flushes and releases the file.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.close_inner()
    }

    fn close_inner(&self) -> Result<()> {
        let mut reg = registry::lock();
        let remaining = self.shared.instances.fetch_sub(1, AtomicOrdering::SeqCst) - 1;
        if remaining == 0 {
            registry::evict(&mut reg, &self.shared.dir);
            self.shared.store.close()?;
        }
        Ok(())
    }

    /// Durability barrier: every mutation that returned before this call is
    /// on disk when it returns.
    pub fn flush(&self) -> Result<()> {
        self.store().flush()
    }

    /// Reset to an empty tree; durable at the next flush
    pub fn clear(&self) -> Result<()> {
        self.store().clear()
    }

    /// Look up a key. Fails with [`Error::NotFound`] if absent.
    pub fn find(&self, key: &K) -> Result<V> {
        let store = self.store();
        let leaf_addr = self.leaf_for(key)?;
        let leaf: Leaf<K, V> = Leaf::load(store, leaf_addr)?;
        leaf.find(key).cloned()
    }

    /// Whether the key is bound
    pub fn mem(&self, key: &K) -> Result<bool> {
        let store = self.store();
        let leaf_addr = self.leaf_for(key)?;
        let leaf: Leaf<K, V> = Leaf::load(store, leaf_addr)?;
        Ok(leaf.mem(key))
    }

    /// Descend to the leaf covering `key`
    fn leaf_for(&self, key: &K) -> Result<Address> {
        let store = self.store();
        let mut cur = store.root();
        loop {
            match store.page_kind(cur)? {
                Kind::Leaf => return Ok(cur),
                Kind::Node(_) => {
                    let node: Node<K> = Node::load(store, cur)?;
                    cur = node.find(key)?;
                }
            }
        }
    }

    /// Insert or replace a binding.
    pub fn add(&self, key: K, value: V) -> Result<()> {
        let store = self.store();
        let fanout = store.fanout();

        // Descend, remembering the node addresses root-to-leaf
        let mut path = Vec::new();
        let mut cur = store.root();
        loop {
            match store.page_kind(cur)? {
                Kind::Leaf => break,
                Kind::Node(_) => {
                    let node: Node<K> = Node::load(store, cur)?;
                    path.push(cur);
                    cur = node.find(&key)?;
                }
            }
        }

        let mut leaf: Leaf<K, V> = Leaf::load(store, cur)?;
        leaf.add(key, value);
        if !leaf.overflow(fanout) {
            return leaf.save(store);
        }

        // Split and carry the promoted separator upward
        let (promoted, right) = leaf.split(store)?;
        if store.params().debug {
            debug!("leaf {} split, promoted {:?}", cur, promoted);
        }
        let (mut promoted, mut new_addr) = (promoted, right.address());

        for node_addr in path.iter().rev() {
            let mut node: Node<K> = Node::load(store, *node_addr)?;
            node.add(promoted, new_addr)?;
            if !node.overflow(fanout) {
                return node.save(store);
            }
            let (p, right) = node.split(store)?;
            if store.params().debug {
                debug!("node {} split, promoted {:?}", node_addr, p);
            }
            promoted = p;
            new_addr = right.address();
        }

        // The split reached the top: grow a new root
        let old_root = store.root();
        let old_depth = store.page_kind(old_root)?.depth();
        let mut new_root: Node<K> = Node::create(store, old_depth + 1)?;
        new_root.add(<K as Key>::min(), old_root)?;
        new_root.add(promoted, new_addr)?;
        new_root.save(store)?;
        store.reroot(new_root.address())
    }

    /// Delete a binding if present.
    pub fn remove(&self, key: &K) -> Result<()> {
        let store = self.store();
        let fanout = store.fanout();

        // Sibling-aware descent: every level records the node address and
        // the chosen child with its merge partner.
        let mut path: Vec<(Address, Route<K>)> = Vec::new();
        let mut cur = store.root();
        loop {
            match store.page_kind(cur)? {
                Kind::Leaf => break,
                Kind::Node(_) => {
                    let node: Node<K> = Node::load(store, cur)?;
                    let route = node.find_with_neighbour(key)?;
                    cur = route.main.1;
                    path.push((node.address(), route));
                }
            }
        }

        let mut leaf: Leaf<K, V> = Leaf::load(store, cur)?;
        if !leaf.remove(key) {
            return Ok(());
        }
        leaf.save(store)?;

        // A root leaf may run arbitrarily small
        if path.is_empty() || !leaf.underflow(fanout) {
            return Ok(());
        }
        drop(leaf);

        // Merge with the recorded sibling at each underflowing level
        for (level, (parent_addr, route)) in path.iter().rev().enumerate() {
            let mut parent: Node<K> = Node::load(store, *parent_addr)?;

            let Some((neighbour, order)) = route.neighbour.clone() else {
                // A single-entry node is only ever the root with one child
                if *parent_addr != store.root() {
                    return Err(Error::invariant(format!(
                        "non-root node {} has a single record",
                        parent_addr
                    )));
                }
                store.reroot(route.main.1)?;
                store.free(*parent_addr)?;
                return Ok(());
            };

            // Order the pair so the left page absorbs the right one
            let ((_, left_addr), (separator, right_addr)) = match order {
                Order::Higher => (route.main.clone(), neighbour),
                Order::Lower => (neighbour, route.main.clone()),
            };

            let outcome = match store.page_kind(left_addr)? {
                Kind::Leaf => {
                    let mut left: Leaf<K, V> = Leaf::load(store, left_addr)?;
                    let right: Leaf<K, V> = Leaf::load(store, right_addr)?;
                    left.merge(right, store)?
                }
                Kind::Node(_) => {
                    let mut left: Node<K> = Node::load(store, left_addr)?;
                    let right: Node<K> = Node::load(store, right_addr)?;
                    left.merge(right, &separator, store)?
                }
            };

            match outcome {
                Merge::Total => {
                    if store.params().debug {
                        debug!("level {}: {} absorbed {}", level, left_addr, right_addr);
                    }
                    parent.remove(&separator)?;
                }
                Merge::Partial { separator: new_sep } => {
                    if store.params().debug {
                        debug!(
                            "level {}: rebalanced {} and {}, separator {:?} -> {:?}",
                            level, left_addr, right_addr, separator, new_sep
                        );
                    }
                    parent.replace(&separator, new_sep)?;
                }
            }
            parent.save(store)?;

            if *parent_addr == store.root() {
                // Root shrink: a root with one child hands the root over
                if parent.len() == 1 {
                    let child = parent.entries()[0].1;
                    store.reroot(child)?;
                    store.free(*parent_addr)?;
                }
                return Ok(());
            }
            if !parent.underflow(fanout) {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Invoke `f` on every binding in ascending key order
    pub fn iter<F: FnMut(&K, &V)>(&self, mut f: F) -> Result<()> {
        self.iter_page(self.store().root(), &mut f)
    }

    /// Like [`iter`](Self::iter), threading a 1-based counter
    pub fn iteri<F: FnMut(u64, &K, &V)>(&self, mut f: F) -> Result<()> {
        let mut i = 0u64;
        self.iter(|k, v| {
            i += 1;
            f(i, k, v);
        })
    }

    fn iter_page<F: FnMut(&K, &V)>(&self, addr: Address, f: &mut F) -> Result<()> {
        let store = self.store();
        match store.page_kind(addr)? {
            Kind::Leaf => {
                let leaf: Leaf<K, V> = Leaf::load(store, addr)?;
                leaf.iter(|k, v| f(k, v));
                Ok(())
            }
            Kind::Node(_) => {
                let node: Node<K> = Node::load(store, addr)?;
                for (_, child) in node.entries() {
                    self.iter_page(*child, f)?;
                }
                Ok(())
            }
        }
    }

    /// Number of bindings. Sums leaf counts without decoding records.
    pub fn length(&self) -> Result<u64> {
        self.length_page(self.store().root())
    }

    fn length_page(&self, addr: Address) -> Result<u64> {
        let store = self.store();
        match store.page_kind(addr)? {
            Kind::Leaf => {
                let guard = store.fetch(addr)?;
                let header = PageHeader::read(&guard.read())
                    .ok_or_else(|| Error::corruption(format!("unreadable page header at {addr}")))?;
                Ok(header.count as u64)
            }
            Kind::Node(_) => {
                let node: Node<K> = Node::load(store, addr)?;
                let mut total = 0;
                for (_, child) in node.entries() {
                    total += self.length_page(*child)?;
                }
                Ok(total)
            }
        }
    }

    /// Depth of the root page (0 when the root is a leaf)
    pub fn depth(&self) -> Result<u8> {
        let store = self.store();
        Ok(store.page_kind(store.root())?.depth())
    }

    /// Point-in-time counters
    pub fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            page_count: self.store().page_count(),
            free_pages: self.store().free_count(),
            depth: self.depth()?,
            entries: self.length()?,
        })
    }

    /// Write human-readable dumps of the header and of every live page with
    /// depth at or above `min_depth` into the root directory. Diagnostic
    /// only; nothing depends on these files.
    pub fn snapshot(&self, min_depth: u8) -> Result<()> {
        let store = self.store();
        let dir = self.shared.dir.clone();

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct HeaderDump {
            version: u32,
            page_size: usize,
            fanout: usize,
            page_count: u32,
            free_pages: u32,
            root: u32,
        }

        let dump = HeaderDump {
            version: store.params().version,
            page_size: store.page_size(),
            fanout: store.fanout(),
            page_count: store.page_count(),
            free_pages: store.free_count(),
            root: store.root().value(),
        };
        let mut out = std::fs::File::create(dir.join("pp_header.ansi"))?;
        serde_json::to_writer_pretty(&mut out, &dump)
            .map_err(|e| Error::invalid_operation(format!("header dump failed: {e}")))?;
        writeln!(out)?;

        store.for_each_page(|addr, buf| {
            let header = PageHeader::read(buf)
                .ok_or_else(|| Error::corruption(format!("unreadable page header at {addr}")))?;
            if header.kind.depth() < min_depth {
                return Ok(());
            }

            let mut out = std::fs::File::create(dir.join(format!("pp_page_{}.ansi", addr)))?;
            write_page_dump::<K, V>(&mut out, addr, header, buf)?;
            Ok(())
        })
    }
}

/// Render one page for a snapshot
fn write_page_dump<K: Key, V: Value>(
    out: &mut std::fs::File,
    addr: Address,
    header: PageHeader,
    buf: &PageBuf,
) -> Result<()> {
    use crate::page::PAGE_HEADER_SIZE;
    use crate::types::ADDR_SIZE;

    match header.kind {
        Kind::Leaf => {
            writeln!(out, "page {}: leaf, {} records", addr, header.count)?;
            let record = K::SIZE + V::SIZE;
            for i in 0..header.count as usize {
                let off = PAGE_HEADER_SIZE + i * record;
                let key = K::read_from(&buf[off..off + K::SIZE]);
                let value = V::read_from(&buf[off + K::SIZE..off + record]);
                writeln!(out, "  {:?} -> {:?}", key, value)?;
            }
        }
        Kind::Node(depth) => {
            writeln!(
                out,
                "page {}: node at depth {}, {} records",
                addr, depth, header.count
            )?;
            let record = K::SIZE + ADDR_SIZE;
            for i in 0..header.count as usize {
                let off = PAGE_HEADER_SIZE + i * record;
                let key = K::read_from(&buf[off..off + K::SIZE]);
                let child = u32::from_be_bytes([
                    buf[off + K::SIZE],
                    buf[off + K::SIZE + 1],
                    buf[off + K::SIZE + 2],
                    buf[off + K::SIZE + 3],
                ]);
                writeln!(out, "  {:?} -> page {}", key, child)?;
            }
        }
    }
    Ok(())
}

fn resolve_params<K: Key, V: Value>(params: Params) -> Params {
    if params.fanout == 0 {
        let derived = Params::compute::<K, V>(params.page_size).fanout;
        Params {
            fanout: derived,
            ..params
        }
    } else {
        params
    }
}

impl<K: Key, V: Value> Drop for Btree<K, V> {
    fn drop(&mut self) {
        if !self.closed {
            // Best-effort: flush errors cannot surface from a drop
            let _ = self.close_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn small_params() -> Params {
        Params::compute::<u32, u32>(4096).with_fanout(4)
    }

    fn open(dir: &Path) -> Btree<u32, u32> {
        Btree::create(dir, small_params()).unwrap()
    }

    /// Walk the whole tree checking the structural invariants: strict key
    /// order, the sentinel in every node, uniform leaf depth, declared
    /// depths matching heights, and fanout bounds on non-root pages.
    fn check_invariants(tree: &Btree<u32, u32>) {
        let store = tree.store();
        let fanout = store.fanout();
        let root = store.root();
        check_page(store, root, fanout, true, store.page_kind(root).unwrap().depth());
    }

    fn check_page(store: &Store, addr: Address, fanout: usize, is_root: bool, expect_depth: u8) {
        match store.page_kind(addr).unwrap() {
            Kind::Leaf => {
                assert_eq!(expect_depth, 0, "leaf {addr} at the wrong height");
                let leaf: Leaf<u32, u32> = Leaf::load(store, addr).unwrap();
                let mut last = None;
                leaf.iter(|k, _| {
                    if let Some(prev) = last {
                        assert!(prev < *k, "leaf {addr} keys out of order");
                    }
                    last = Some(*k);
                });
                if !is_root {
                    assert!(!leaf.underflow(fanout), "leaf {addr} underflows");
                    assert!(!leaf.overflow(fanout), "leaf {addr} overflows");
                }
            }
            Kind::Node(depth) => {
                assert_eq!(depth, expect_depth, "node {addr} at the wrong height");
                let node: Node<u32> = Node::load(store, addr).unwrap();
                assert_eq!(node.leftmost(), Some(&u32::MIN), "node {addr} lost its sentinel");
                let mut last = None;
                for (k, child) in node.entries() {
                    if let Some(prev) = last {
                        assert!(prev < *k, "node {addr} keys out of order");
                    }
                    last = Some(*k);
                    check_page(store, *child, fanout, false, depth - 1);
                }
                if !is_root {
                    assert!(!node.underflow(fanout), "node {addr} underflows");
                    assert!(!node.overflow(fanout), "node {addr} overflows");
                }
            }
        }
    }

    fn collect(tree: &Btree<u32, u32>) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        tree.iter(|k, v| out.push((*k, *v))).unwrap();
        out
    }

    #[test]
    fn test_basic_bindings() {
        let dir = tempdir().unwrap();
        let tree: Btree<u32, [u8; 1]> = Btree::create(dir.path(), small_params()).unwrap();

        tree.add(1, *b"a").unwrap();
        tree.add(2, *b"b").unwrap();

        assert_eq!(tree.find(&2).unwrap(), *b"b");
        assert!(!tree.mem(&3).unwrap());
        assert_eq!(tree.length().unwrap(), 2);
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        assert!(matches!(tree.find(&1), Err(Error::NotFound)));
        assert!(!tree.mem(&1).unwrap());
        assert_eq!(tree.length().unwrap(), 0);
        tree.remove(&1).unwrap();
        assert_eq!(tree.depth().unwrap(), 0);
    }

    #[test]
    fn test_leaf_split_promotes_midpoint() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in 1..=5 {
            tree.add(k, k * 10).unwrap();
        }

        assert_eq!(tree.depth().unwrap(), 1);
        assert_eq!(tree.length().unwrap(), 5);

        let store = tree.store();
        let root: Node<u32> = Node::load(store, store.root()).unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(root.entries()[0].0, u32::MIN);
        assert_eq!(root.entries()[1].0, 3);

        let left: Leaf<u32, u32> = Leaf::load(store, root.entries()[0].1).unwrap();
        let right: Leaf<u32, u32> = Leaf::load(store, root.entries()[1].1).unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 3);
        assert_eq!(right.leftmost(), Some(&3));
        check_invariants(&tree);
    }

    #[test]
    fn test_grow_to_depth_two() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in 1..=17 {
            tree.add(k, k).unwrap();
        }

        assert_eq!(tree.depth().unwrap(), 2);
        let keys: Vec<u32> = collect(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=17).collect::<Vec<_>>());
        check_invariants(&tree);
    }

    #[test]
    fn test_add_replaces_value() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        tree.add(7, 1).unwrap();
        tree.add(7, 2).unwrap();
        assert_eq!(tree.find(&7).unwrap(), 2);
        assert_eq!(tree.length().unwrap(), 1);
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        tree.add(5, 50).unwrap();
        tree.add(5, 50).unwrap();
        assert_eq!(tree.length().unwrap(), 1);
        assert_eq!(tree.find(&5).unwrap(), 50);
    }

    #[test]
    fn test_remove_merges_back_to_leaf_root() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in 1..=5 {
            tree.add(k, k * 10).unwrap();
        }
        assert_eq!(tree.depth().unwrap(), 1);

        tree.remove(&5).unwrap();
        tree.remove(&4).unwrap();

        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(collect(&tree), vec![(1, 10), (2, 20), (3, 30)]);
        check_invariants(&tree);
    }

    #[test]
    fn test_remove_and_mem() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in 1..=10 {
            tree.add(k, k).unwrap();
        }
        tree.remove(&6).unwrap();
        assert!(!tree.mem(&6).unwrap());
        assert_eq!(tree.length().unwrap(), 9);
        check_invariants(&tree);
    }

    #[test]
    fn test_shrink_from_depth_two_to_empty() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in 1..=17 {
            tree.add(k, k).unwrap();
        }
        assert_eq!(tree.depth().unwrap(), 2);

        for k in 1..=17 {
            tree.remove(&k).unwrap();
            check_invariants(&tree);
        }

        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(tree.length().unwrap(), 0);
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let tree = open(dir.path());
            for k in 1..=17 {
                tree.add(k, k * 100).unwrap();
            }
            tree.flush().unwrap();
            tree.close().unwrap();
        }

        let tree = open(dir.path());
        assert_eq!(tree.length().unwrap(), 17);
        assert_eq!(tree.find(&9).unwrap(), 900);
        let keys: Vec<u32> = collect(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=17).collect::<Vec<_>>());
    }

    #[test]
    fn test_iteri_counts_from_one() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in [3, 1, 2] {
            tree.add(k, k).unwrap();
        }

        let mut seen = Vec::new();
        tree.iteri(|i, k, _| seen.push((i, *k))).unwrap();
        assert_eq!(seen, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_clear_resets_tree() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in 1..=17 {
            tree.add(k, k).unwrap();
        }
        tree.clear().unwrap();

        assert_eq!(tree.length().unwrap(), 0);
        assert_eq!(tree.depth().unwrap(), 0);
        assert!(matches!(tree.find(&9), Err(Error::NotFound)));

        tree.add(1, 1).unwrap();
        assert_eq!(tree.length().unwrap(), 1);
    }

    #[test]
    fn test_shared_handles_and_instances() {
        let dir = tempdir().unwrap();
        let a = open(dir.path());
        let b = open(dir.path());

        assert_eq!(a.instances(), 2);
        a.add(1, 10).unwrap();
        assert_eq!(b.find(&1).unwrap(), 10);

        b.close().unwrap();
        assert_eq!(a.instances(), 1);
        a.add(2, 20).unwrap();
        a.close().unwrap();

        // Fully closed: a fresh open reads from disk
        let c = open(dir.path());
        assert_eq!(c.instances(), 1);
        assert_eq!(c.find(&2).unwrap(), 20);
    }

    #[test]
    fn test_open_with_other_types_is_rejected() {
        let dir = tempdir().unwrap();
        let _a = open(dir.path());
        let b: Result<Btree<u64, u64>> =
            Btree::create(dir.path(), Params::compute::<u64, u64>(4096).with_fanout(4));
        assert!(matches!(b, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_open_with_other_geometry_is_rejected() {
        let dir = tempdir().unwrap();
        let _a = open(dir.path());
        let b: Result<Btree<u32, u32>> = Btree::create(dir.path(), small_params().with_fanout(8));
        assert!(matches!(b, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_random_ops_match_oracle() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());
        let mut oracle = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..400 {
            let key = rng.gen_range(0..60u32);
            if rng.gen_bool(0.6) {
                let value = rng.gen_range(0..1000u32);
                tree.add(key, value).unwrap();
                oracle.insert(key, value);
            } else {
                tree.remove(&key).unwrap();
                oracle.remove(&key);
            }
        }

        check_invariants(&tree);
        assert_eq!(tree.length().unwrap(), oracle.len() as u64);
        let got = collect(&tree);
        let want: Vec<(u32, u32)> = oracle.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(got, want);

        for k in 0..60u32 {
            assert_eq!(tree.mem(&k).unwrap(), oracle.contains_key(&k));
        }
    }

    #[test]
    fn test_oracle_survives_flush_reopen() {
        let dir = tempdir().unwrap();
        let mut oracle = BTreeMap::new();
        {
            let tree = open(dir.path());
            let mut rng = StdRng::seed_from_u64(7);
            for _ in 0..200 {
                let key = rng.gen_range(0..40u32);
                let value = rng.gen_range(0..1000u32);
                tree.add(key, value).unwrap();
                oracle.insert(key, value);
            }
            tree.flush().unwrap();
            tree.close().unwrap();
        }

        let tree = open(dir.path());
        let want: Vec<(u32, u32)> = oracle.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(collect(&tree), want);
        check_invariants(&tree);
    }

    #[test]
    fn test_bulk_load_equivalence() {
        let dir_bulk = tempdir().unwrap();
        let dir_add = tempdir().unwrap();
        let pairs: Vec<(u32, u32)> = (1..=17).map(|k| (k, k * 3)).collect();

        let mut feed = pairs.clone().into_iter();
        let bulk: Btree<u32, u32> = Btree::init(dir_bulk.path(), small_params(), 17, move || {
            Ok(feed.next().expect("reader called past n"))
        })
        .unwrap();

        let added = open(dir_add.path());
        for (k, v) in &pairs {
            added.add(*k, *v).unwrap();
        }

        assert_eq!(collect(&bulk), collect(&added));
        assert_eq!(bulk.length().unwrap(), 17);
        assert_eq!(bulk.depth().unwrap(), 2);
        assert_eq!(bulk.find(&9).unwrap(), 27);
    }

    #[test]
    fn test_bulk_load_durability() {
        let dir = tempdir().unwrap();
        {
            let mut feed = (1..=16u32).map(|k| (k, k));
            let tree: Btree<u32, u32> =
                Btree::init(dir.path(), small_params(), 16, move || Ok(feed.next().unwrap()))
                    .unwrap();
            tree.flush().unwrap();
            tree.close().unwrap();
        }

        let tree = open(dir.path());
        assert_eq!(tree.length().unwrap(), 16);
        let keys: Vec<u32> = collect(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn test_bulk_load_small_inputs() {
        let dir = tempdir().unwrap();
        let tree: Btree<u32, u32> = Btree::init(dir.path(), small_params(), 0, || {
            Err(Error::invariant("reader must not be called for n = 0"))
        })
        .unwrap();
        assert_eq!(tree.length().unwrap(), 0);
        tree.close().unwrap();

        let dir = tempdir().unwrap();
        let tree: Btree<u32, u32> =
            Btree::init(dir.path(), small_params(), 1, || Ok((5, 50))).unwrap();
        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(tree.find(&5).unwrap(), 50);
    }

    #[test]
    fn test_bulk_load_rejects_unsorted() {
        let dir = tempdir().unwrap();
        let mut feed = [(2u32, 2u32), (1, 1)].into_iter();
        let result: Result<Btree<u32, u32>> =
            Btree::init(dir.path(), small_params(), 2, move || Ok(feed.next().unwrap()));
        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[test]
    fn test_bulk_load_keeps_mutating() {
        // A bulk-built tree must accept regular adds afterwards
        let dir = tempdir().unwrap();
        let mut feed = (1..=16u32).map(|k| (k, k));
        let tree: Btree<u32, u32> =
            Btree::init(dir.path(), small_params(), 16, move || Ok(feed.next().unwrap())).unwrap();

        for k in 17..=40 {
            tree.add(k, k).unwrap();
        }
        assert_eq!(tree.length().unwrap(), 40);
        let keys: Vec<u32> = collect(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=40).collect::<Vec<_>>());
    }

    #[test]
    fn test_snapshot_writes_dumps() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());
        for k in 1..=5 {
            tree.add(k, k).unwrap();
        }

        tree.snapshot(0).unwrap();
        assert!(dir.path().join("pp_header.ansi").exists());
        let root = tree.store().root();
        assert!(dir.path().join(format!("pp_page_{}.ansi", root)).exists());

        let header_dump = std::fs::read_to_string(dir.path().join("pp_header.ansi")).unwrap();
        assert!(header_dump.contains("\"fanout\": 4"));
    }

    #[test]
    fn test_snapshot_depth_filter() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());
        for k in 1..=5 {
            tree.add(k, k).unwrap();
        }

        tree.snapshot(1).unwrap();
        let store = tree.store();
        let root = store.root();
        let root_node: Node<u32> = Node::load(store, root).unwrap();
        let leaf_addr = root_node.entries()[0].1;

        assert!(dir.path().join(format!("pp_page_{}.ansi", root)).exists());
        assert!(!dir.path().join(format!("pp_page_{}.ansi", leaf_addr)).exists());
    }

    #[test]
    fn test_freed_pages_are_reused_by_adds() {
        let dir = tempdir().unwrap();
        let tree = open(dir.path());

        for k in 1..=17 {
            tree.add(k, k).unwrap();
        }
        let grown = tree.store().page_count();
        for k in 1..=17 {
            tree.remove(&k).unwrap();
        }

        // Rebuilding the same tree reuses freed pages instead of growing
        for k in 1..=17 {
            tree.add(k, k).unwrap();
        }
        assert_eq!(tree.store().page_count(), grown);
        check_invariants(&tree);
    }
}
