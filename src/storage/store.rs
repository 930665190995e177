//! The page store.
//!
//! Owns the backing file and presents it as an array of fixed-size pages.
//! Pages are served through the cache under RAII leases; released pages go
//! on a persistent freelist chain; the root pointer lives in the file
//! header and only moves through [`Store::reroot`]. `flush` is the
//! durability barrier. A sequential-append migration mode backs bulk loads.

use crate::error::{Error, Result};
use crate::page::{PageBuf, PageHeader};
use crate::storage::cache::{Frame, PageCache, PageGuard, PageGuardMut};
use crate::storage::{FileHeader, FreeList};
use crate::types::{Address, Key, Kind, Params, Value, FREE_TAG};
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the index file inside the root directory
pub const FILE_NAME: &str = "b.tree";

/// The page store backing one tree
#[derive(Debug)]
pub struct Store {
    file: RwLock<File>,
    header: RwLock<FileHeader>,
    freelist: Mutex<FreeList>,
    cache: PageCache,
    params: Params,
    dir: PathBuf,
}

impl Store {
    /// Open `root_dir/b.tree`, creating the directory and file if absent.
    ///
    /// A fresh file gets a header page and an empty leaf root at address 1.
    /// An existing file must match the requested version and geometry.
    pub fn open<K: Key, V: Value>(root_dir: &Path, params: Params) -> Result<Self> {
        params.validate::<K, V>()?;
        std::fs::create_dir_all(root_dir)?;
        let path = root_dir.join(FILE_NAME);

        let exists =
            path.exists() && path.metadata().map(|m| m.len()).unwrap_or(0) >= params.page_size as u64;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let (header, freelist) = if exists {
            let mut buf = vec![0u8; params.page_size];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let header = FileHeader::read(&buf)?;

            if header.version != params.version {
                return Err(Error::VersionMismatch {
                    found: header.version,
                    expected: params.version,
                });
            }
            if header.page_size != params.page_size as u32 {
                return Err(Error::invalid_db(format!(
                    "page size {} does not match requested {}",
                    header.page_size, params.page_size
                )));
            }
            if header.fanout != params.fanout as u32 {
                return Err(Error::invalid_db(format!(
                    "fanout {} does not match requested {}",
                    header.fanout, params.fanout
                )));
            }
            if header.key_size != K::SIZE as u32 || header.value_size != V::SIZE as u32 {
                return Err(Error::invalid_db(format!(
                    "record geometry {}+{} does not match requested {}+{}",
                    header.key_size,
                    header.value_size,
                    K::SIZE,
                    V::SIZE
                )));
            }

            let freelist = walk_freelist(&mut file, &header, params.page_size)?;
            (header, freelist)
        } else {
            let header = FileHeader::new(
                params.version,
                params.page_size as u32,
                params.fanout as u32,
                K::SIZE as u32,
                V::SIZE as u32,
            );

            let mut buf = vec![0u8; params.page_size];
            header.write(&mut buf);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;

            // Empty leaf root at address 1
            buf.fill(0);
            PageHeader::new(Kind::Leaf).write(&mut buf);
            file.write_all(&buf)?;
            file.sync_all()?;

            (header, FreeList::new())
        };

        Ok(Self {
            file: RwLock::new(file),
            header: RwLock::new(header),
            freelist: Mutex::new(freelist),
            cache: PageCache::new(params.cache_capacity),
            params,
            dir: root_dir.to_path_buf(),
        })
    }

    /// The store's configuration
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.params.page_size
    }

    /// Maximum records per node or leaf
    pub fn fanout(&self) -> usize {
        self.params.fanout
    }

    /// The directory this store lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of pages in the file, header included
    pub fn page_count(&self) -> u32 {
        self.header.read().page_count
    }

    /// Number of pages on the freelist
    pub fn free_count(&self) -> u32 {
        self.header.read().free_count
    }

    /// The current root address
    pub fn root(&self) -> Address {
        self.header.read().root
    }

    /// Move the root pointer. The only way the root changes.
    pub fn reroot(&self, addr: Address) -> Result<()> {
        self.check_data_addr(addr)?;
        if self.params.debug {
            debug!("reroot {} -> {}", self.header.read().root, addr);
        }
        self.header.write().root = addr;
        Ok(())
    }

    fn check_data_addr(&self, addr: Address) -> Result<()> {
        if !addr.is_data() {
            return Err(Error::invalid_operation(
                "the header page cannot be used as a data page",
            ));
        }
        if addr.value() >= self.header.read().page_count {
            return Err(Error::PageNotFound(addr));
        }
        Ok(())
    }

    /// Resident frame for `addr`, loading from disk on a miss
    fn frame_for(&self, addr: Address) -> Result<Arc<RwLock<Frame>>> {
        if let Some(frame) = self.cache.get(addr) {
            return Ok(frame);
        }

        let buf = self.read_page_raw(addr)?;
        let frame = self.cache.insert(addr, buf, false);
        self.evict_over_capacity()?;
        Ok(frame)
    }

    fn evict_over_capacity(&self) -> Result<()> {
        while self.cache.over_capacity() {
            let Some((addr, frame)) = self.cache.take_eviction_candidate() else {
                // Everything is pinned; let the cache run over until leases drop
                break;
            };
            let mut frame = frame.write();
            if frame.dirty {
                self.write_page_raw(addr, &frame.buf)?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Take a read lease on a live page
    pub fn fetch(&self, addr: Address) -> Result<PageGuard> {
        self.check_data_addr(addr)?;
        let frame = self.frame_for(addr)?;
        if frame.read().buf[0] == FREE_TAG {
            return Err(Error::corruption(format!(
                "page {addr} is a freelist member"
            )));
        }
        Ok(PageGuard::new(frame))
    }

    /// Take a write lease on a page
    pub fn fetch_mut(&self, addr: Address) -> Result<PageGuardMut> {
        self.check_data_addr(addr)?;
        let frame = self.frame_for(addr)?;
        Ok(PageGuardMut::new(frame))
    }

    /// Kind of the page at `addr`
    pub fn page_kind(&self, addr: Address) -> Result<Kind> {
        let guard = self.fetch(addr)?;
        let byte = guard.read()[0];
        Kind::from_byte(byte)
            .ok_or_else(|| Error::corruption(format!("unknown kind byte {byte:#x} at {addr}")))
    }

    /// Obtain a fresh page, preferring the freelist; the page is zeroed and
    /// stamped with an empty header of the given kind.
    pub fn alloc(&self, kind: Kind) -> Result<Address> {
        let addr = {
            let mut freelist = self.freelist.lock();
            match freelist.pop() {
                Some(addr) => {
                    let mut header = self.header.write();
                    header.first_free = freelist.head().unwrap_or(Address::HEADER);
                    header.free_count -= 1;
                    addr
                }
                None => {
                    let addr = self.header.write().grow();
                    // Extend the file so reads within page_count always succeed
                    let zeros = vec![0u8; self.params.page_size];
                    let mut file = self.file.write();
                    file.seek(SeekFrom::Start(addr.file_offset(self.params.page_size)))?;
                    file.write_all(&zeros)?;
                    addr
                }
            }
        };

        let guard = self.fetch_mut(addr)?;
        {
            let mut page = guard.write();
            page.as_bytes_mut().fill(0);
            PageHeader::new(kind).write(page.as_bytes_mut());
        }

        if self.params.debug {
            debug!("alloc {} as {:?}", addr, kind);
        }
        Ok(addr)
    }

    /// Push a page onto the freelist chain
    pub fn free(&self, addr: Address) -> Result<()> {
        self.check_data_addr(addr)?;
        if addr == self.root() {
            return Err(Error::invariant(format!("freeing the root page {addr}")));
        }

        let mut freelist = self.freelist.lock();
        if freelist.contains(addr) {
            return Err(Error::invariant(format!("double free of page {addr}")));
        }

        let old_head = {
            let mut header = self.header.write();
            let old = header.first_free;
            header.first_free = addr;
            header.free_count += 1;
            old
        };

        let guard = self.fetch_mut(addr)?;
        {
            let mut page = guard.write();
            page.as_bytes_mut().fill(0);
            page[0] = FREE_TAG;
            page[1..5].copy_from_slice(&old_head.value().to_be_bytes());
        }
        freelist.push(addr);

        if self.params.debug {
            debug!("free {}", addr);
        }
        Ok(())
    }

    /// Write every dirty page and the header, then sync to disk
    pub fn flush(&self) -> Result<()> {
        for (addr, frame) in self.cache.frames() {
            let mut frame = frame.write();
            if frame.dirty {
                self.write_page_raw(addr, &frame.buf)?;
                frame.dirty = false;
            }
        }

        self.write_header()?;
        self.file.write().sync_all()?;
        Ok(())
    }

    /// Reset to a single empty leaf root and an empty freelist.
    ///
    /// In-memory state changes immediately; the next `flush` persists it.
    pub fn clear(&self) -> Result<()> {
        self.cache.reset();
        self.freelist.lock().clear();

        {
            let mut header = self.header.write();
            header.page_count = 2;
            header.first_free = Address::HEADER;
            header.free_count = 0;
            header.root = Address::new(1);
        }

        self.file.write().set_len(2 * self.params.page_size as u64)?;

        let mut buf = PageBuf::new(self.params.page_size);
        PageHeader::new(Kind::Leaf).write(buf.as_bytes_mut());
        self.cache.insert(Address::new(1), buf, true);

        if self.params.debug {
            debug!("clear");
        }
        Ok(())
    }

    /// Invoke `f` on every live page in address order, skipping the header
    /// page and freelist members.
    pub fn for_each_page<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Address, &PageBuf) -> Result<()>,
    {
        let page_count = self.page_count();
        for raw in 1..page_count {
            let addr = Address::new(raw);
            if self.freelist.lock().contains(addr) {
                continue;
            }
            let guard = self.fetch(addr)?;
            f(addr, &guard.read())?;
        }
        Ok(())
    }

    /// Flush and let the file handle close with the store
    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Enter migration mode: dirty state is flushed, then pages are appended
    /// sequentially past the current end of the file, bypassing the cache.
    pub fn begin_migration(&self) -> Result<Migration<'_>> {
        self.flush()?;
        let next = self.page_count();
        Ok(Migration { store: self, next })
    }

    fn read_page_raw(&self, addr: Address) -> Result<PageBuf> {
        let mut buf = vec![0u8; self.params.page_size];
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(addr.file_offset(self.params.page_size)))?;
        file.read_exact(&mut buf)?;
        Ok(PageBuf::from_bytes(&buf, self.params.page_size))
    }

    fn write_page_raw(&self, addr: Address, buf: &PageBuf) -> Result<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(addr.file_offset(self.params.page_size)))?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = vec![0u8; self.params.page_size];
        self.header.read().write(&mut buf);
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        Ok(())
    }
}

/// Sequential page appender for bulk loads.
///
/// Pages land contiguously after the pre-migration end of the file; nothing
/// becomes reachable until [`Migration::finish`] commits the new page count
/// and root in a single header update.
pub struct Migration<'a> {
    store: &'a Store,
    next: u32,
}

impl Migration<'_> {
    /// Append one page; content must fit the page size and is zero-padded.
    pub fn write_page(&mut self, bytes: &[u8]) -> Result<Address> {
        let page_size = self.store.params.page_size;
        if bytes.len() > page_size {
            return Err(Error::invariant(format!(
                "migration page of {} bytes exceeds page size {}",
                bytes.len(),
                page_size
            )));
        }

        let addr = Address::new(self.next);
        let buf = PageBuf::from_bytes(bytes, page_size);
        self.store.write_page_raw(addr, &buf)?;
        self.next += 1;
        Ok(addr)
    }

    /// The address the next written page will get
    pub fn next_address(&self) -> Address {
        Address::new(self.next)
    }

    /// Commit: the header is updated once with the new page count and root.
    pub fn finish(self, new_root: Address) -> Result<()> {
        if !new_root.is_data() || new_root.value() >= self.next {
            return Err(Error::invariant(format!(
                "migration root {new_root} outside the written range"
            )));
        }

        {
            let mut header = self.store.header.write();
            header.page_count = self.next;
            header.root = new_root;
        }
        self.store.write_header()?;
        self.store.file.write().sync_all()?;
        Ok(())
    }
}

/// Rebuild the in-memory freelist mirror by walking the on-disk chain
fn walk_freelist(file: &mut File, header: &FileHeader, page_size: usize) -> Result<FreeList> {
    let mut chain = Vec::new();
    let mut cur = header.first_free;
    let mut buf = vec![0u8; page_size];

    while cur.is_data() {
        if chain.len() as u32 >= header.free_count {
            return Err(Error::corruption("freelist chain longer than recorded"));
        }
        if cur.value() >= header.page_count {
            return Err(Error::corruption(format!(
                "freelist member {cur} outside the file"
            )));
        }

        file.seek(SeekFrom::Start(cur.file_offset(page_size)))?;
        file.read_exact(&mut buf)?;
        if buf[0] != FREE_TAG {
            return Err(Error::corruption(format!(
                "freelist member {cur} is not tagged free"
            )));
        }

        chain.push(cur);
        cur = Address::new(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]));
    }

    if chain.len() as u32 != header.free_count {
        return Err(Error::corruption("freelist chain shorter than recorded"));
    }

    let mut freelist = FreeList::new();
    for addr in chain.into_iter().rev() {
        freelist.push(addr);
    }
    Ok(freelist)
}
