#![forbid(unsafe_code)]
//! Embedded filesystem engine.
//!
//! A container is one seekable byte device holding many independently
//! resizable pseudo-files. [`Filesystem`] owns the device and all cache
//! state; it is created by [`Filesystem::mkfs`] (fresh container) or
//! [`Filesystem::open`] (existing container), and torn down by
//! [`Filesystem::finalize`], which consumes it and hands the device back.
//!
//! The instance is not internally synchronized. Concurrent use from
//! multiple threads requires external serialization; the optional advisory
//! lock is a cross-process guard only.

pub mod block;
pub mod cache;
pub mod file;
pub mod inode;
pub mod layout;

pub use block::Block;
pub use cache::{NameHashCache, StringCache, UsedBitset};
pub use file::{FileHandle, OpenMode};
pub use inode::Inode;
pub use layout::{calculate_size, Layout, CONTAINER_MAGIC};

use crate::file::OpenEntry;
use crate::inode::{blank_name_record, decode_name_record, encode_name_record};
use crate::layout::{BLOCK_HEADER_SIZE, INODE_RECORD_SIZE};
use nestfs_codec as codec;
use nestfs_device::{Device, Fence};
use nestfs_error::{EfsError, Result};
use nestfs_types::{block_flags, inode_flags, BlockId, EngineConfig, FsOptions, InodeId};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

fn expect_cursor(dev: &mut dyn Device, expect: u64, wrote: &str) -> Result<()> {
    let at = dev.tell()?;
    if at != expect {
        return Err(EfsError::Consistency(format!(
            "cursor at {at} after writing {wrote}, layout expects {expect}"
        )));
    }
    Ok(())
}

fn write_options_block(dev: &mut dyn Device, options: &FsOptions) -> Result<()> {
    codec::write_u32_to(dev, options.block_size)?;
    codec::write_u32_to(dev, options.block_count)?;
    codec::write_u32_to(dev, options.inode_count)?;
    codec::write_u16_to(dev, options.filename_length)?;
    Ok(())
}

struct Fences {
    name: Fence,
    inode: Fence,
    block_head: Fence,
    block_data: Fence,
}

fn build_fences(layout: &Layout, options: &FsOptions) -> Result<Fences> {
    let blank_name = blank_name_record(layout.name_record_size);
    Ok(Fences {
        name: Fence::new(
            layout.name_table_offset,
            layout.name_record_size,
            options.inode_count,
            Some(&blank_name),
        )?,
        inode: Fence::new(
            layout.inode_table_offset,
            INODE_RECORD_SIZE,
            options.inode_count,
            None,
        )?,
        block_head: Fence::with_stride(
            layout.block_table_offset,
            BLOCK_HEADER_SIZE,
            layout.block_record_size,
            options.block_count,
            None,
        )?,
        block_data: Fence::with_stride(
            layout.block_table_offset + u64::from(BLOCK_HEADER_SIZE),
            options.block_size,
            layout.block_record_size,
            options.block_count,
            None,
        )?,
    })
}

/// One mounted container.
pub struct Filesystem {
    options: FsOptions,
    layout: Layout,
    config: EngineConfig,
    dev: Box<dyn Device>,
    read_only: bool,
    locked: bool,
    fences: Fences,
    inode_used: UsedBitset,
    block_used: UsedBitset,
    hash_cache: NameHashCache,
    string_cache: StringCache,
    /// Whether the bitsets reflect on-disk truth. False until the open
    /// scan runs; the engine falls back to record reads while false.
    caches_loaded: bool,
    open_inodes: BTreeMap<InodeId, OpenEntry>,
    inode_hint: u32,
    block_hint: u32,
}

impl Filesystem {
    /// Create a fresh container on `dev` and mount it read-write.
    ///
    /// The device is truncated to the computed size and every region is
    /// written in layout order, with a cursor self-check after each. The
    /// declared size goes in last, so an interrupted mkfs leaves a
    /// container that later opens reject with a size mismatch.
    pub fn mkfs(options: FsOptions, dev: Box<dyn Device>) -> Result<Self> {
        Self::mkfs_with_config(options, EngineConfig::default(), dev)
    }

    pub fn mkfs_with_config(
        options: FsOptions,
        config: EngineConfig,
        mut dev: Box<dyn Device>,
    ) -> Result<Self> {
        options.validate()?;
        let layout = Layout::compute(&options)?;
        let fences = build_fences(&layout, &options)?;

        dev.truncate(layout.total_size)?;
        dev.seek(SeekFrom::Start(0))?;

        let n = codec::write_u32_array_to(dev.as_mut(), &CONTAINER_MAGIC)?;
        if n != CONTAINER_MAGIC.len() {
            return Err(EfsError::Consistency(format!(
                "wrote {n} of {} magic words",
                CONTAINER_MAGIC.len()
            )));
        }
        expect_cursor(dev.as_mut(), layout.size_field_offset, "core magic")?;

        // Placeholder; the realized size is written after the tables.
        codec::write_u32_to(dev.as_mut(), 0)?;
        expect_cursor(dev.as_mut(), layout.client_magic_offset, "size field")?;

        let magic_len = u16::try_from(options.magic.len()).map_err(|_| {
            EfsError::Range(format!(
                "client magic of {} bytes overflows u16",
                options.magic.len()
            ))
        })?;
        codec::write_u16_to(dev.as_mut(), magic_len)?;
        dev.write_all(&options.magic)?;
        expect_cursor(dev.as_mut(), layout.options_offset, "client magic")?;

        write_options_block(dev.as_mut(), &options)?;
        expect_cursor(dev.as_mut(), layout.name_table_offset, "options block")?;

        for index in 0..options.inode_count {
            fences.name.wipe(dev.as_mut(), index)?;
        }
        expect_cursor(dev.as_mut(), layout.inode_table_offset, "name table")?;

        let mut rec = [0_u8; INODE_RECORD_SIZE as usize];
        for raw in 1..=options.inode_count {
            let mut node = Inode::unused(InodeId(raw));
            if raw == InodeId::ROOT.0 {
                node.flags = inode_flags::USED;
            }
            node.encode(&mut rec)?;
            fences.inode.write(dev.as_mut(), raw - 1, &rec)?;
        }
        expect_cursor(dev.as_mut(), layout.block_table_offset, "inode table")?;

        let mut head = [0_u8; BLOCK_HEADER_SIZE as usize];
        for raw in 1..=options.block_count {
            Block::unused(BlockId(raw)).encode(&mut head)?;
            fences.block_head.write(dev.as_mut(), raw - 1, &head)?;
            fences.block_data.wipe(dev.as_mut(), raw - 1)?;
        }
        expect_cursor(dev.as_mut(), layout.total_size, "block table")?;

        let realized = dev.size()?;
        if realized != layout.total_size {
            return Err(EfsError::Consistency(format!(
                "device is {realized} bytes after mkfs, layout expects {}",
                layout.total_size
            )));
        }
        let declared = u32::try_from(layout.total_size)
            .map_err(|_| EfsError::Internal("computed size overflows u32".to_owned()))?;
        dev.seek(SeekFrom::Start(layout.size_field_offset))?;
        codec::write_u32_to(dev.as_mut(), declared)?;
        dev.flush()?;

        let mut fs = Self::assemble(options, layout, config, dev, fences, false);
        // A fresh container has exactly the root in use; no scan needed.
        fs.inode_used.set(InodeId::ROOT.0, true)?;
        fs.caches_loaded = true;
        tracing::debug!(
            size = fs.layout.total_size,
            inodes = fs.options.inode_count,
            blocks = fs.options.block_count,
            "created container"
        );
        Ok(fs)
    }

    /// Mount an existing container read-write.
    pub fn open(dev: Box<dyn Device>) -> Result<Self> {
        Self::open_impl(dev, EngineConfig::default(), false)
    }

    pub fn open_with_config(dev: Box<dyn Device>, config: EngineConfig) -> Result<Self> {
        Self::open_impl(dev, config, false)
    }

    /// Mount read-write but refuse every mutating operation.
    pub fn open_read_only(dev: Box<dyn Device>) -> Result<Self> {
        Self::open_impl(dev, EngineConfig::default(), true)
    }

    fn open_impl(mut dev: Box<dyn Device>, config: EngineConfig, read_only: bool) -> Result<Self> {
        dev.seek(SeekFrom::Start(0))?;
        let mut magic = [0_u32; CONTAINER_MAGIC.len()];
        let n = codec::read_u32_array_from(dev.as_mut(), &mut magic)?;
        if n != magic.len() || magic != CONTAINER_MAGIC {
            return Err(EfsError::BadMagic(format!(
                "core magic {magic:08x?} does not match {CONTAINER_MAGIC:08x?}"
            )));
        }

        let declared = u64::from(codec::read_u32_from(dev.as_mut())?);
        let actual = dev.size()?;
        if actual != declared {
            // A memory buffer may carry trailing bytes past the container.
            let tolerated = dev.as_bytes().is_some() && actual > declared;
            if !tolerated {
                return Err(EfsError::Consistency(format!(
                    "declared size {declared} but device is {actual} bytes"
                )));
            }
        }

        let magic_len = usize::from(codec::read_u16_from(dev.as_mut())?);
        let mut client_magic = vec![0; magic_len];
        dev.read_exact(&mut client_magic)?;

        let block_size = codec::read_u32_from(dev.as_mut())?;
        let block_count = codec::read_u32_from(dev.as_mut())?;
        let inode_count = codec::read_u32_from(dev.as_mut())?;
        let filename_length = codec::read_u16_from(dev.as_mut())?;
        let options = FsOptions {
            magic: client_magic,
            block_size,
            block_count,
            inode_count,
            filename_length,
        };
        options.validate()?;

        let layout = Layout::compute(&options)?;
        if layout.total_size != declared {
            return Err(EfsError::Consistency(format!(
                "declared size {declared} but options compute to {}",
                layout.total_size
            )));
        }
        expect_cursor(dev.as_mut(), layout.name_table_offset, "header regions")?;

        let fences = build_fences(&layout, &options)?;
        let mut fs = Self::assemble(options, layout, config, dev, fences, read_only);
        if fs.config.load_caches_on_open {
            fs.load_caches()?;
        }
        tracing::debug!(
            size = fs.layout.total_size,
            read_only = fs.read_only,
            "opened container"
        );
        Ok(fs)
    }

    fn assemble(
        options: FsOptions,
        layout: Layout,
        config: EngineConfig,
        dev: Box<dyn Device>,
        fences: Fences,
        read_only: bool,
    ) -> Self {
        let inode_used = UsedBitset::new(options.inode_count);
        let block_used = UsedBitset::new(options.block_count);
        let hash_cache = NameHashCache::new(options.inode_count);
        let string_cache = StringCache::new(options.filename_length);
        Self {
            options,
            layout,
            config,
            dev,
            read_only,
            locked: false,
            fences,
            inode_used,
            block_used,
            hash_cache,
            string_cache,
            caches_loaded: false,
            open_inodes: BTreeMap::new(),
            inode_hint: InodeId::ROOT.0 + 1,
            block_hint: 1,
        }
    }

    /// One pass over the inode table, populating both bitsets and the
    /// name caches. Inodes are visited from the highest id down so the
    /// string cache grows exactly once.
    fn load_caches(&mut self) -> Result<()> {
        for raw in (1..=self.options.inode_count).rev() {
            let id = InodeId(raw);
            let node = self.read_inode_rec(id)?;
            if !node.is_used() {
                continue;
            }
            self.inode_used.set(raw, true)?;

            let mut cur = node.first_block;
            let mut steps = 0_u32;
            while !cur.is_none() {
                steps += 1;
                if steps > self.options.block_count {
                    return Err(EfsError::Consistency(format!(
                        "cyclic block chain reachable from inode {id}"
                    )));
                }
                let head = self.read_block_head(cur)?;
                if !head.is_used() {
                    return Err(EfsError::Consistency(format!(
                        "inode {id} references block {cur} which is not marked used"
                    )));
                }
                self.block_used.set(cur.0, true)?;
                cur = head.next;
            }

            if self.config.use_name_cache {
                let (owner, name) = self.read_name_rec_disk(id)?;
                if owner == id && !name.is_empty() {
                    self.hash_cache.insert(codec::name_hash(&name), id)?;
                    self.string_cache.set(id, &name)?;
                }
            }
        }
        self.hash_cache.sort();
        self.caches_loaded = true;
        tracing::debug!(names = self.hash_cache.len(), "caches loaded");
        Ok(())
    }

    #[must_use]
    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of distinct inodes currently open.
    #[must_use]
    pub fn open_inode_count(&self) -> usize {
        self.open_inodes.len()
    }

    /// Bitset view of inode `id`. Meaningful once caches are loaded.
    #[must_use]
    pub fn inode_id_used(&self, id: InodeId) -> bool {
        self.inode_used.is_used(id.0)
    }

    /// Bitset view of block `id`. Meaningful once caches are loaded.
    #[must_use]
    pub fn block_id_used(&self, id: BlockId) -> bool {
        self.block_used.is_used(id.0)
    }

    /// Flush buffered writes through to the backing store.
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Err(EfsError::Access("filesystem opened read-only"));
        }
        self.dev.flush()
    }

    /// Take the device's advisory lock. Cross-process only; `Unsupported`
    /// on devices without a native file.
    pub fn lock(&mut self, exclusive: bool) -> Result<()> {
        self.dev.lock(exclusive)?;
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.dev.unlock()?;
        self.locked = false;
        Ok(())
    }

    /// Flush, force-close anything still open, release the lock, and hand
    /// the device back. Consuming `self` makes reuse a compile error.
    pub fn finalize(mut self) -> Result<Box<dyn Device>> {
        let survivors: Vec<InodeId> = self.open_inodes.keys().copied().collect();
        for id in survivors {
            tracing::warn!(inode = %id, "finalize with inode still open; forcing close");
            if let Some(entry) = self.open_inodes.remove(&id) {
                let mut node = entry.inode;
                node.flags &=
                    !(inode_flags::OPENED | inode_flags::READ | inode_flags::WRITE);
                if !self.read_only {
                    self.write_inode_rec(&node)?;
                }
            }
        }
        if !self.read_only {
            self.dev.flush()?;
        }
        if self.locked {
            self.dev.unlock()?;
        }
        Ok(self.dev)
    }

    /// Grow the container by `count` block slots, all or nothing.
    ///
    /// The larger geometry is staged first (device grown, new block slots
    /// wiped, options rewritten); the new declared size is committed last
    /// and flushed. Any staging failure rolls the device back to the old
    /// geometry and leaves the in-memory state untouched.
    pub fn append_blocks(&mut self, count: u32) -> Result<()> {
        if self.read_only {
            return Err(EfsError::Access("filesystem opened read-only"));
        }
        if count == 0 {
            return Ok(());
        }
        let old_options = self.options.clone();
        let old_layout = self.layout;
        let mut new_options = self.options.clone();
        new_options.block_count = old_options.block_count.checked_add(count).ok_or_else(|| {
            EfsError::Range(format!(
                "block count {} + {count} overflows u32",
                old_options.block_count
            ))
        })?;
        let new_layout = Layout::compute(&new_options)?;

        match self.apply_append(&new_options, &new_layout, old_options.block_count) {
            Ok(()) => {
                self.fences = build_fences(&new_layout, &new_options)?;
                self.options = new_options;
                self.layout = new_layout;
                self.block_used.resize(self.options.block_count);
                tracing::debug!(
                    blocks = self.options.block_count,
                    size = self.layout.total_size,
                    "container grown"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "container growth failed, rolling back");
                if let Err(rb) = self.rollback_append(&old_options, &old_layout) {
                    return Err(EfsError::Consistency(format!(
                        "growth failed ({err}) and rollback failed ({rb}); container may be inconsistent"
                    )));
                }
                Err(err)
            }
        }
    }

    fn apply_append(
        &mut self,
        new_options: &FsOptions,
        new_layout: &Layout,
        old_count: u32,
    ) -> Result<()> {
        self.dev.truncate(new_layout.total_size)?;
        let head_fence = Fence::with_stride(
            new_layout.block_table_offset,
            BLOCK_HEADER_SIZE,
            new_layout.block_record_size,
            new_options.block_count,
            None,
        )?;
        let data_fence = Fence::with_stride(
            new_layout.block_table_offset + u64::from(BLOCK_HEADER_SIZE),
            new_options.block_size,
            new_layout.block_record_size,
            new_options.block_count,
            None,
        )?;
        let mut head = [0_u8; BLOCK_HEADER_SIZE as usize];
        for raw in old_count + 1..=new_options.block_count {
            Block::unused(BlockId(raw)).encode(&mut head)?;
            head_fence.write(self.dev.as_mut(), raw - 1, &head)?;
            data_fence.wipe(self.dev.as_mut(), raw - 1)?;
        }
        self.dev.seek(SeekFrom::Start(new_layout.options_offset))?;
        write_options_block(self.dev.as_mut(), new_options)?;

        // Commit point: the declared size goes in last.
        let declared = u32::try_from(new_layout.total_size)
            .map_err(|_| EfsError::Internal("computed size overflows u32".to_owned()))?;
        self.dev.seek(SeekFrom::Start(new_layout.size_field_offset))?;
        codec::write_u32_to(self.dev.as_mut(), declared)?;
        self.dev.flush()?;
        Ok(())
    }

    fn rollback_append(&mut self, old_options: &FsOptions, old_layout: &Layout) -> Result<()> {
        self.dev.truncate(old_layout.total_size)?;
        self.dev.seek(SeekFrom::Start(old_layout.options_offset))?;
        write_options_block(self.dev.as_mut(), old_options)?;
        let declared = u32::try_from(old_layout.total_size)
            .map_err(|_| EfsError::Internal("old size overflows u32".to_owned()))?;
        self.dev.seek(SeekFrom::Start(old_layout.size_field_offset))?;
        codec::write_u32_to(self.dev.as_mut(), declared)?;
        self.dev.flush()?;
        Ok(())
    }

    // ── Pseudo-file operations ──────────────────────────────────────────

    /// Open `name`, creating it when missing and `mode` is writable.
    pub fn open_file(&mut self, name: &[u8], mode: OpenMode) -> Result<FileHandle> {
        self.check_name(name)?;
        if mode.is_writable() && self.read_only {
            return Err(EfsError::Access("filesystem opened read-only"));
        }
        let id = match self.resolve_name(name)? {
            Some(id) => id,
            None => {
                if !mode.is_writable() {
                    return Err(EfsError::Range(format!(
                        "no entry named {:?}",
                        String::from_utf8_lossy(name)
                    )));
                }
                self.create_entry(name)?
            }
        };

        if !self.open_inodes.contains_key(&id) {
            let node = self.read_inode_rec(id)?;
            self.open_inodes.insert(id, OpenEntry::new(node));
        }
        let entry = self
            .open_inodes
            .get_mut(&id)
            .ok_or_else(|| EfsError::Internal(format!("inode {id} vanished from open table")))?;
        if mode.is_writable() {
            if entry.writer {
                return Err(EfsError::Access("inode already opened for writing"));
            }
            entry.writer = true;
            entry.inode.flags |= inode_flags::WRITE;
        } else {
            entry.inode.flags |= inode_flags::READ;
        }
        entry.inode.flags |= inode_flags::USED | inode_flags::OPENED;
        entry.open_count += 1;
        let node = entry.inode;

        if !self.read_only {
            self.write_inode_rec(&node)?;
        }
        tracing::trace!(inode = %id, ?mode, "opened");
        Ok(FileHandle::new(id, mode))
    }

    /// Close `handle`. The inode's resources are released only when its
    /// last handle closes.
    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        let id = handle.inode;
        let entry = self
            .open_inodes
            .get_mut(&id)
            .ok_or_else(|| EfsError::Internal(format!("close of unopened inode {id}")))?;
        if handle.mode.is_writable() {
            entry.writer = false;
            entry.inode.flags &= !inode_flags::WRITE;
        }
        entry.open_count -= 1;
        let last = entry.open_count == 0;
        let mut node = entry.inode;

        if last {
            self.open_inodes.remove(&id);
            node.flags &= !(inode_flags::OPENED | inode_flags::READ | inode_flags::WRITE);
        }
        if !self.read_only && (last || handle.mode.is_writable()) {
            self.write_inode_rec(&node)?;
            if last {
                self.dev.flush()?;
            }
        }
        tracing::trace!(inode = %id, last, "closed");
        Ok(())
    }

    /// Read at the handle's cursor. Returns the bytes read; 0 at end of
    /// file.
    pub fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        let node = self.open_entry_inode(handle.inode)?;
        let size = u64::from(node.data_size);
        if buf.is_empty() || handle.cursor >= size {
            return Ok(0);
        }
        let want = usize::try_from((size - handle.cursor).min(buf.len() as u64))
            .map_err(|_| EfsError::Range("read length overflows usize".to_owned()))?;
        let bs = u64::from(self.options.block_size);

        let mut cur = self.chain_nth(node.first_block, handle.cursor / bs)?;
        let mut at = (handle.cursor % bs) as u32;
        let mut done = 0;
        while done < want {
            let n = (want - done).min(self.options.block_size as usize - at as usize);
            self.fences
                .block_data
                .read_at(self.dev.as_mut(), cur.0 - 1, at, &mut buf[done..done + n])?;
            done += n;
            at = 0;
            if done < want {
                cur = self.next_in_chain(cur)?;
            }
        }
        handle.cursor += want as u64;
        Ok(want)
    }

    /// Write at the handle's cursor, growing the chain as needed. A cursor
    /// past the end produces an intervening zero-filled gap.
    pub fn write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        self.check_writable(handle)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut node = self.open_entry_inode(handle.inode)?;
        let end = handle
            .cursor
            .checked_add(buf.len() as u64)
            .ok_or_else(|| EfsError::Range("write end overflows u64".to_owned()))?;
        let new_size = u32::try_from(end.max(u64::from(node.data_size))).map_err(|_| {
            EfsError::Range(format!("file size {end} exceeds the 32-bit size field"))
        })?;
        let bs = u64::from(self.options.block_size);
        self.ensure_chain(&mut node, end.div_ceil(bs))?;

        let mut cur = self.chain_nth(node.first_block, handle.cursor / bs)?;
        let mut at = (handle.cursor % bs) as u32;
        let mut done = 0;
        while done < buf.len() {
            let n = (buf.len() - done).min(self.options.block_size as usize - at as usize);
            self.fences
                .block_data
                .write_at(self.dev.as_mut(), cur.0 - 1, at, &buf[done..done + n])?;
            done += n;
            at = 0;
            if done < buf.len() {
                cur = self.next_in_chain(cur)?;
            }
        }

        node.data_size = new_size;
        node.mtime = unix_now();
        self.write_inode_rec(&node)?;
        self.store_entry_inode(node)?;
        handle.cursor = end;
        Ok(buf.len())
    }

    /// Reposition the handle's cursor. Seeking past the end is legal; the
    /// gap materializes as zeroes on the next write.
    pub fn seek(&mut self, handle: &mut FileHandle, pos: SeekFrom) -> Result<u64> {
        let size = u64::from(self.open_entry_inode(handle.inode)?.data_size);
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::Current(d) => i128::from(handle.cursor) + i128::from(d),
            SeekFrom::End(d) => i128::from(size) + i128::from(d),
        };
        if target < 0 {
            return Err(EfsError::Range(format!("seek before start ({target})")));
        }
        handle.cursor = u64::try_from(target)
            .map_err(|_| EfsError::Range("seek overflows u64".to_owned()))?;
        Ok(handle.cursor)
    }

    /// Resize the pseudo-file to `new_size` bytes.
    ///
    /// Shrinking within the last retained block zero-fills only the bytes
    /// past `new_size`; shrinking across a block boundary deep-wipes and
    /// frees the trailing chain. Growth appends zeroed blocks.
    pub fn truncate(&mut self, handle: &mut FileHandle, new_size: u64) -> Result<()> {
        self.check_writable(handle)?;
        let size32 = u32::try_from(new_size).map_err(|_| {
            EfsError::Range(format!("file size {new_size} exceeds the 32-bit size field"))
        })?;
        let mut node = self.open_entry_inode(handle.inode)?;
        let old = u64::from(node.data_size);
        if new_size == old {
            return Ok(());
        }
        let bs = u64::from(self.options.block_size);

        if new_size > old {
            self.ensure_chain(&mut node, new_size.div_ceil(bs))?;
        } else {
            let keep = new_size.div_ceil(bs);
            if keep == 0 {
                if !node.first_block.is_none() {
                    self.wipe_block(node.first_block, true, true, true)?;
                }
                node.first_block = BlockId::NONE;
            } else {
                let last = self.chain_nth(node.first_block, keep - 1)?;
                let mut last_head = self.read_block_head(last)?;
                let tail = last_head.next;
                if !tail.is_none() {
                    last_head.next = BlockId::NONE;
                    self.write_block_head(&last_head)?;
                    self.wipe_block(tail, true, true, true)?;
                }
                // Preserve the retained bytes; zero only the unused tail.
                let kept_in_last = (new_size - (keep - 1) * bs) as u32;
                if u64::from(kept_in_last) < bs {
                    let zeros = vec![0_u8; (bs - u64::from(kept_in_last)) as usize];
                    self.fences.block_data.write_at(
                        self.dev.as_mut(),
                        last.0 - 1,
                        kept_in_last,
                        &zeros,
                    )?;
                }
            }
        }

        node.data_size = size32;
        node.mtime = unix_now();
        self.write_inode_rec(&node)?;
        self.store_entry_inode(node)?;
        Ok(())
    }

    /// Remove `name`: deep-wipe its chain, blank its records, clear its
    /// cache entries. The inode must not be open.
    pub fn unlink(&mut self, name: &[u8]) -> Result<()> {
        self.check_name(name)?;
        if self.read_only {
            return Err(EfsError::Access("filesystem opened read-only"));
        }
        let id = self.resolve_name(name)?.ok_or_else(|| {
            EfsError::Range(format!("no entry named {:?}", String::from_utf8_lossy(name)))
        })?;
        if self.open_inodes.contains_key(&id) {
            return Err(EfsError::Access("inode is open"));
        }
        let node = self.read_inode_rec(id)?;
        if !node.first_block.is_none() {
            self.wipe_block(node.first_block, true, true, true)?;
        }
        self.fences.name.wipe(self.dev.as_mut(), id.0 - 1)?;
        self.write_inode_rec(&Inode::unused(id))?;
        self.release_inode_id(id.0)?;
        if self.config.use_name_cache {
            self.hash_cache.remove(codec::name_hash(name));
            self.string_cache.forget(id);
        }
        self.dev.flush()?;
        tracing::trace!(inode = %id, "unlinked");
        Ok(())
    }

    /// Whether `name` resolves to an entry.
    pub fn exists(&mut self, name: &[u8]) -> Result<bool> {
        self.check_name(name)?;
        Ok(self.resolve_name(name)?.is_some())
    }

    /// Current size of the handle's pseudo-file.
    pub fn file_size(&self, handle: &FileHandle) -> Result<u64> {
        Ok(u64::from(self.open_entry_inode(handle.inode)?.data_size))
    }

    /// Clear block state: `data` zeroes the payload, `meta` blanks the
    /// header and frees the id, `deep` follows the chain.
    ///
    /// A meta wipe without `deep` on a block with successors strands those
    /// successors as lost blocks; internal chain releases always pass
    /// `deep`.
    pub fn wipe_block(&mut self, id: BlockId, data: bool, meta: bool, deep: bool) -> Result<()> {
        let mut cur = id;
        let mut steps = 0_u32;
        loop {
            self.check_block_id(cur)?;
            let head = self.read_block_head(cur)?;
            if data {
                self.fences.block_data.wipe(self.dev.as_mut(), cur.0 - 1)?;
            }
            if meta {
                self.write_block_head(&Block::unused(cur))?;
                self.release_block_id(cur.0)?;
            }
            cur = head.next;
            if !deep || cur.is_none() {
                return Ok(());
            }
            steps += 1;
            if steps > self.options.block_count {
                return Err(EfsError::Consistency(
                    "cycle detected while wiping a block chain".to_owned(),
                ));
            }
        }
    }

    // ── Name resolution ─────────────────────────────────────────────────

    fn check_name(&self, name: &[u8]) -> Result<()> {
        if name.is_empty() {
            return Err(EfsError::Arg("name must not be empty"));
        }
        if name.len() > usize::from(self.options.filename_length) {
            return Err(EfsError::Range(format!(
                "name of {} bytes exceeds filename length {}",
                name.len(),
                self.options.filename_length
            )));
        }
        Ok(())
    }

    fn resolve_name(&mut self, name: &[u8]) -> Result<Option<InodeId>> {
        if self.config.use_name_cache && self.caches_loaded {
            let hash = codec::name_hash(name);
            if let Some(id) = self.hash_cache.lookup(hash) {
                let (owner, stored) = self.read_name_rec(id)?;
                if owner == id && stored == name {
                    return Ok(Some(id));
                }
                tracing::warn!(inode = %id, "stale name cache entry dropped");
                self.hash_cache.remove(hash);
            }
        }
        for raw in 1..=self.options.inode_count {
            let id = InodeId(raw);
            let (owner, stored) = self.read_name_rec(id)?;
            if owner == id && stored == name {
                if self.config.use_name_cache && self.caches_loaded {
                    self.cache_name(id, name)?;
                }
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn cache_name(&mut self, id: InodeId, name: &[u8]) -> Result<()> {
        self.hash_cache.insert(codec::name_hash(name), id)?;
        self.string_cache.set(id, name)
    }

    fn create_entry(&mut self, name: &[u8]) -> Result<InodeId> {
        let id = self.next_free_inode()?;
        let mut node = Inode::unused(id);
        node.flags = inode_flags::USED;
        node.mtime = unix_now();
        self.write_inode_rec(&node)?;
        self.write_name_rec(id, name)?;
        if self.caches_loaded {
            self.inode_used.set(id.0, true)?;
        }
        if self.config.use_name_cache && self.caches_loaded {
            self.cache_name(id, name)?;
        }
        tracing::trace!(inode = %id, "created");
        Ok(id)
    }

    // ── Record I/O ──────────────────────────────────────────────────────

    fn check_inode_id(&self, id: InodeId) -> Result<()> {
        if !self.options.inode_id_in_range(id) {
            return Err(EfsError::Range(format!(
                "inode id {id} outside 1..={}",
                self.options.inode_count
            )));
        }
        Ok(())
    }

    fn check_block_id(&self, id: BlockId) -> Result<()> {
        if !self.options.block_id_in_range(id) {
            return Err(EfsError::Range(format!(
                "block id {id} outside 1..={}",
                self.options.block_count
            )));
        }
        Ok(())
    }

    fn read_inode_rec(&mut self, id: InodeId) -> Result<Inode> {
        self.check_inode_id(id)?;
        let mut buf = [0_u8; INODE_RECORD_SIZE as usize];
        self.fences
            .inode
            .read(self.dev.as_mut(), id.0 - 1, &mut buf)?;
        Inode::decode(&buf, id)
    }

    fn write_inode_rec(&mut self, node: &Inode) -> Result<()> {
        self.check_inode_id(node.id)?;
        let mut buf = [0_u8; INODE_RECORD_SIZE as usize];
        node.encode(&mut buf)?;
        self.fences.inode.write(self.dev.as_mut(), node.id.0 - 1, &buf)
    }

    fn read_name_rec(&mut self, id: InodeId) -> Result<(InodeId, Vec<u8>)> {
        if self.config.use_name_cache && self.caches_loaded {
            if let Some(name) = self.string_cache.get(id) {
                if !name.is_empty() {
                    return Ok((id, name.to_vec()));
                }
            }
        }
        self.read_name_rec_disk(id)
    }

    fn read_name_rec_disk(&mut self, id: InodeId) -> Result<(InodeId, Vec<u8>)> {
        self.check_inode_id(id)?;
        let mut buf = vec![0; self.layout.name_record_size as usize];
        self.fences
            .name
            .read(self.dev.as_mut(), id.0 - 1, &mut buf)?;
        decode_name_record(&buf)
    }

    fn write_name_rec(&mut self, id: InodeId, name: &[u8]) -> Result<()> {
        self.check_inode_id(id)?;
        let mut buf = vec![0; self.layout.name_record_size as usize];
        encode_name_record(&mut buf, id, name)?;
        self.fences.name.write(self.dev.as_mut(), id.0 - 1, &buf)
    }

    fn read_block_head(&mut self, id: BlockId) -> Result<Block> {
        self.check_block_id(id)?;
        let mut buf = [0_u8; BLOCK_HEADER_SIZE as usize];
        self.fences
            .block_head
            .read(self.dev.as_mut(), id.0 - 1, &mut buf)?;
        Block::decode(&buf, id)
    }

    fn write_block_head(&mut self, head: &Block) -> Result<()> {
        self.check_block_id(head.id)?;
        let mut buf = [0_u8; BLOCK_HEADER_SIZE as usize];
        head.encode(&mut buf)?;
        self.fences
            .block_head
            .write(self.dev.as_mut(), head.id.0 - 1, &buf)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    fn inode_in_use(&mut self, raw: u32) -> Result<bool> {
        if self.caches_loaded {
            Ok(self.inode_used.is_used(raw))
        } else {
            Ok(self.read_inode_rec(InodeId(raw))?.is_used())
        }
    }

    fn block_in_use(&mut self, raw: u32) -> Result<bool> {
        if self.caches_loaded {
            Ok(self.block_used.is_used(raw))
        } else {
            Ok(self.read_block_head(BlockId(raw))?.is_used())
        }
    }

    /// Next free inode id, scanning from the hint and wrapping. Id 1 is
    /// the reserved root and never allocated.
    fn next_free_inode(&mut self) -> Result<InodeId> {
        let count = self.options.inode_count;
        let first = InodeId::ROOT.0 + 1;
        let mut raw = self.inode_hint.clamp(first, count);
        for _ in first..=count {
            if !self.inode_in_use(raw)? {
                self.inode_hint = if raw >= count { first } else { raw + 1 };
                return Ok(InodeId(raw));
            }
            raw = if raw >= count { first } else { raw + 1 };
        }
        Err(EfsError::Alloc(format!(
            "all {count} inode slots are in use"
        )))
    }

    fn next_free_block(&mut self) -> Result<BlockId> {
        let count = self.options.block_count;
        let mut raw = self.block_hint.clamp(1, count);
        for _ in 1..=count {
            if !self.block_in_use(raw)? {
                self.block_hint = if raw >= count { 1 } else { raw + 1 };
                return Ok(BlockId(raw));
            }
            raw = if raw >= count { 1 } else { raw + 1 };
        }
        Err(EfsError::Alloc(format!(
            "all {count} block slots are in use"
        )))
    }

    fn release_inode_id(&mut self, raw: u32) -> Result<()> {
        if self.caches_loaded {
            self.inode_used.set(raw, false)?;
        }
        if raw < self.inode_hint {
            self.inode_hint = raw;
        }
        Ok(())
    }

    fn release_block_id(&mut self, raw: u32) -> Result<()> {
        if self.caches_loaded {
            self.block_used.set(raw, false)?;
        }
        if raw < self.block_hint {
            self.block_hint = raw;
        }
        Ok(())
    }

    // ── Chain walking ───────────────────────────────────────────────────

    /// Block `n` steps down the chain from `start` (0 = `start` itself).
    fn chain_nth(&mut self, start: BlockId, n: u64) -> Result<BlockId> {
        if n >= u64::from(self.options.block_count) {
            return Err(EfsError::Consistency(format!(
                "chain index {n} beyond block count {}",
                self.options.block_count
            )));
        }
        let mut cur = start;
        for _ in 0..n {
            cur = self.next_in_chain(cur)?;
        }
        if cur.is_none() {
            return Err(EfsError::Consistency(
                "block chain ends before the data size".to_owned(),
            ));
        }
        Ok(cur)
    }

    /// Successor of `id`, failing when the chain ends where data is still
    /// expected.
    fn next_in_chain(&mut self, id: BlockId) -> Result<BlockId> {
        if id.is_none() {
            return Err(EfsError::Consistency(
                "block chain ends before the data size".to_owned(),
            ));
        }
        let next = self.read_block_head(id)?.next;
        if next.is_none() {
            return Err(EfsError::Consistency(
                "block chain ends before the data size".to_owned(),
            ));
        }
        Ok(next)
    }

    /// Extend the inode's chain to `needed` blocks, linking freshly
    /// allocated (zeroed) blocks at the tail.
    fn ensure_chain(&mut self, node: &mut Inode, needed: u64) -> Result<()> {
        if needed == 0 {
            return Ok(());
        }
        if needed > u64::from(self.options.block_count) {
            return Err(EfsError::Alloc(format!(
                "{needed} blocks needed but the container has {}",
                self.options.block_count
            )));
        }
        let mut have = 0_u64;
        let mut tail = BlockId::NONE;
        let mut cur = node.first_block;
        while !cur.is_none() && have < needed {
            have += 1;
            if have > u64::from(self.options.block_count) {
                return Err(EfsError::Consistency(
                    "cycle detected while walking a block chain".to_owned(),
                ));
            }
            tail = cur;
            cur = self.read_block_head(cur)?.next;
        }
        while have < needed {
            let id = self.next_free_block()?;
            let head = Block {
                id,
                flags: block_flags::USED,
                next: BlockId::NONE,
            };
            self.write_block_head(&head)?;
            if self.caches_loaded {
                self.block_used.set(id.0, true)?;
            }
            if tail.is_none() {
                node.first_block = id;
            } else {
                let mut prev = self.read_block_head(tail)?;
                prev.next = id;
                self.write_block_head(&prev)?;
            }
            tail = id;
            have += 1;
        }
        Ok(())
    }

    // ── Open table ──────────────────────────────────────────────────────

    fn open_entry_inode(&self, id: InodeId) -> Result<Inode> {
        self.open_inodes
            .get(&id)
            .map(|entry| entry.inode)
            .ok_or_else(|| EfsError::Internal(format!("inode {id} is not in the open table")))
    }

    fn store_entry_inode(&mut self, node: Inode) -> Result<()> {
        let entry = self
            .open_inodes
            .get_mut(&node.id)
            .ok_or_else(|| EfsError::Internal(format!("inode {} is not in the open table", node.id)))?;
        entry.inode = node;
        Ok(())
    }

    fn check_writable(&self, handle: &FileHandle) -> Result<()> {
        if self.read_only {
            return Err(EfsError::Access("filesystem opened read-only"));
        }
        if !handle.mode.is_writable() {
            return Err(EfsError::Access("handle opened read-only"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestfs_device::MemoryDevice;

    fn small_options() -> FsOptions {
        FsOptions {
            magic: b"unit".to_vec(),
            block_size: 64,
            block_count: 8,
            inode_count: 4,
            filename_length: 16,
        }
    }

    #[test]
    fn mkfs_produces_exactly_the_calculated_size() {
        let opt = small_options();
        let expected = calculate_size(&opt).expect("size");
        let fs = Filesystem::mkfs(opt, Box::new(MemoryDevice::new())).expect("mkfs");
        let dev = fs.finalize().expect("finalize");
        assert_eq!(dev.as_bytes().expect("bytes").len() as u64, expected);
    }

    #[test]
    fn open_rejects_foreign_bytes() {
        let dev = MemoryDevice::from_vec(vec![0xAB; 256]);
        assert!(matches!(
            Filesystem::open(Box::new(dev)),
            Err(EfsError::BadMagic(_))
        ));
    }

    #[test]
    fn open_rejects_truncated_container() {
        let fs = Filesystem::mkfs(small_options(), Box::new(MemoryDevice::new())).expect("mkfs");
        let dev = fs.finalize().expect("finalize");
        let mut image = match dev.as_bytes() {
            Some(bytes) => bytes.to_vec(),
            None => panic!("memory device"),
        };
        image.truncate(image.len() - 10);
        assert!(matches!(
            Filesystem::open(Box::new(MemoryDevice::from_vec(image))),
            Err(EfsError::Consistency(_))
        ));
    }

    #[test]
    fn memory_device_may_be_larger_than_declared() {
        let fs = Filesystem::mkfs(small_options(), Box::new(MemoryDevice::new())).expect("mkfs");
        let dev = fs.finalize().expect("finalize");
        let mut image = dev.as_bytes().expect("bytes").to_vec();
        image.extend_from_slice(&[0; 64]);
        Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("open tolerates slack");
    }

    #[test]
    fn read_only_mount_refuses_mutation() {
        let fs = Filesystem::mkfs(small_options(), Box::new(MemoryDevice::new())).expect("mkfs");
        let dev = fs.finalize().expect("finalize");

        let mut fs = Filesystem::open_read_only(dev).expect("open");
        assert!(matches!(fs.flush(), Err(EfsError::Access(_))));
        assert!(matches!(
            fs.open_file(b"f", OpenMode::ReadWrite),
            Err(EfsError::Access(_))
        ));
        assert!(matches!(fs.append_blocks(1), Err(EfsError::Access(_))));
        assert!(matches!(fs.unlink(b"f"), Err(EfsError::Access(_))));
    }

    #[test]
    fn root_inode_is_reserved() {
        let mut fs =
            Filesystem::mkfs(small_options(), Box::new(MemoryDevice::new())).expect("mkfs");
        assert!(fs.inode_id_used(InodeId::ROOT));

        let h = fs.open_file(b"first", OpenMode::ReadWrite).expect("open");
        assert_eq!(h.inode(), InodeId(2));
        fs.close(h).expect("close");
    }

    #[test]
    fn double_writer_on_one_inode_is_rejected() {
        let mut fs =
            Filesystem::mkfs(small_options(), Box::new(MemoryDevice::new())).expect("mkfs");
        let h1 = fs.open_file(b"shared", OpenMode::ReadWrite).expect("open");
        assert!(matches!(
            fs.open_file(b"shared", OpenMode::ReadWrite),
            Err(EfsError::Access(_))
        ));
        let h2 = fs.open_file(b"shared", OpenMode::ReadOnly).expect("open");
        fs.close(h1).expect("close writer");
        fs.close(h2).expect("close reader");
        assert_eq!(fs.open_inode_count(), 0);
    }

    #[test]
    fn allocation_hint_retreats_on_release() {
        let mut fs =
            Filesystem::mkfs(small_options(), Box::new(MemoryDevice::new())).expect("mkfs");
        let a = fs.open_file(b"a", OpenMode::ReadWrite).expect("open");
        let b = fs.open_file(b"b", OpenMode::ReadWrite).expect("open");
        let a_id = a.inode();
        fs.close(a).expect("close");
        fs.close(b).expect("close");

        fs.unlink(b"a").expect("unlink");
        let c = fs.open_file(b"c", OpenMode::ReadWrite).expect("open");
        // The freed lower id is reused.
        assert_eq!(c.inode(), a_id);
        fs.close(c).expect("close");
    }
}
