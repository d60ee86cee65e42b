//! # File-Backed Mapper Backend
//!
//! `FileMapper` implements `ViewMapper` on real files via `memmap2`. Each
//! mapping is one file under a spool directory; each mapped window is an
//! independent `MmapMut` of one window-aligned slice of that file. Windows of
//! the same mapping are deliberately separate mappings: the engine never
//! assumes adjacency, and separate mappings keep unmap of one window from
//! disturbing its neighbors.
//!
//! ## Durability
//!
//! `flush_mapping` flushes the intersecting mapped windows with `msync`
//! semantics (`MmapMut::flush_range`). Pages of the range that are not
//! currently mapped have either never been written through this mapper or
//! were flushed when their window was unmapped, so flushing the live windows
//! is sufficient.
//!
//! ## Purge Semantics
//!
//! The file itself is the backing store, so there is no second copy to
//! discard: `purge_mapping` succeeds trivially. (An engine purge still
//! destroys the *cache's* buffers and windows; that happens above this
//! layer.)

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use super::{MappedWindow, MappingId, ViewMapper, WindowToken};
use crate::config::WINDOW_SIZE;

#[derive(Debug)]
struct FileMapping {
    file: File,
    path: PathBuf,
    size: u64,
}

struct FileWindow {
    mapping: MappingId,
    offset: u64,
    mmap: MmapMut,
}

#[derive(Default)]
struct FileInner {
    mappings: HashMap<MappingId, FileMapping>,
    windows: HashMap<u64, FileWindow>,
    next_mapping: u64,
    next_window: u64,
}

/// Mapper backend that spools each mapping into a file under `root`.
pub struct FileMapper {
    root: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileMapper {
    /// Creates a mapper spooling into `root`. The directory must exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(FileInner::default()),
        }
    }

    /// Number of currently mapped windows.
    pub fn active_windows(&self) -> usize {
        self.inner.lock().windows.len()
    }
}

impl ViewMapper for FileMapper {
    fn create_mapping(&self, size: u64) -> Result<MappingId> {
        let mut inner = self.inner.lock();
        let id = inner.next_mapping;
        inner.next_mapping += 1;

        let path = self.root.join(format!("mapping-{:06}.bin", id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create backing file '{}'", path.display()))?;

        file.set_len(size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), size))?;

        inner.mappings.insert(id, FileMapping { file, path, size });
        Ok(id)
    }

    fn extend_mapping(&self, mapping: MappingId, new_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let backing = inner
            .mappings
            .get_mut(&mapping)
            .ok_or_else(|| eyre::eyre!("extend of unknown mapping {}", mapping))?;

        if new_size <= backing.size {
            return Ok(());
        }

        backing.file.set_len(new_size).wrap_err_with(|| {
            format!(
                "failed to extend '{}' to {} bytes",
                backing.path.display(),
                new_size
            )
        })?;
        backing.size = new_size;
        Ok(())
    }

    fn map_window(&self, mapping: MappingId, offset: u64) -> Result<MappedWindow> {
        let mut inner = self.inner.lock();
        let backing = inner
            .mappings
            .get(&mapping)
            .ok_or_else(|| eyre::eyre!("map_window of unknown mapping {}", mapping))?;

        ensure!(
            offset < backing.size,
            "window offset {} beyond mapping size {}",
            offset,
            backing.size
        );
        ensure!(
            offset % WINDOW_SIZE == 0,
            "window offset {} is not window-aligned",
            offset
        );

        let len = WINDOW_SIZE.min(backing.size - offset) as usize;

        // SAFETY: mapping a file mutably is unsafe because external processes
        // could modify it underneath us. This is safe because:
        // 1. The backing file was created by this mapper under its private
        //    spool directory and is not shared with other processes
        // 2. The window range [offset, offset + len) was bounds-checked
        //    against the file size above, and offset is window-aligned
        //    (a multiple of the OS page size)
        // 3. The MmapMut's lifetime is owned by the window table; the token
        //    handed out is invalidated before the map is dropped
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len)
                .map_mut(&backing.file)
                .wrap_err_with(|| {
                    format!(
                        "failed to map window at {} of '{}'",
                        offset,
                        backing.path.display()
                    )
                })?
        };

        let token = inner.next_window;
        inner.next_window += 1;
        inner.windows.insert(
            token,
            FileWindow {
                mapping,
                offset,
                mmap,
            },
        );

        Ok(MappedWindow {
            token: WindowToken(token),
            len,
        })
    }

    fn unmap_window(&self, token: WindowToken, _unmap_behind: bool) {
        let mut inner = self.inner.lock();
        if let Some(window) = inner.windows.remove(&token.0) {
            // Dirty pages of a dropped MmapMut reach the file eventually, but
            // an explicit flush keeps unmap-then-read-back deterministic.
            let _ = window.mmap.flush();
        }
    }

    fn read_window(&self, token: WindowToken, at: usize, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let window = inner
            .windows
            .get(&token.0)
            .ok_or_else(|| eyre::eyre!("read through unmapped window"))?;
        ensure!(
            at + buf.len() <= window.mmap.len(),
            "read of {} bytes at {} exceeds window length {}",
            buf.len(),
            at,
            window.mmap.len()
        );

        buf.copy_from_slice(&window.mmap[at..at + buf.len()]);
        Ok(())
    }

    fn write_window(&self, token: WindowToken, at: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let window = inner
            .windows
            .get_mut(&token.0)
            .ok_or_else(|| eyre::eyre!("write through unmapped window"))?;
        ensure!(
            at + data.len() <= window.mmap.len(),
            "write of {} bytes at {} exceeds window length {}",
            data.len(),
            at,
            window.mmap.len()
        );

        window.mmap[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn zero_window(&self, token: WindowToken, at: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let window = inner
            .windows
            .get_mut(&token.0)
            .ok_or_else(|| eyre::eyre!("zero through unmapped window"))?;
        ensure!(
            at + len <= window.mmap.len(),
            "zero of {} bytes at {} exceeds window length {}",
            len,
            at,
            window.mmap.len()
        );

        window.mmap[at..at + len].fill(0);
        Ok(())
    }

    fn flush_mapping(&self, mapping: MappingId, offset: u64, len: u64) -> Result<()> {
        let inner = self.inner.lock();
        let end = offset.saturating_add(len);

        for window in inner.windows.values() {
            if window.mapping != mapping {
                continue;
            }
            let w_end = window.offset + window.mmap.len() as u64;
            if window.offset >= end || w_end <= offset {
                continue;
            }
            let from = offset.max(window.offset) - window.offset;
            let to = end.min(w_end) - window.offset;
            window
                .mmap
                .flush_range(from as usize, (to - from) as usize)
                .wrap_err("failed to flush mapped window")?;
        }
        Ok(())
    }

    fn purge_mapping(&self, _mapping: MappingId, _offset: u64, _len: u64) -> bool {
        true
    }

    fn delete_mapping(&self, mapping: MappingId) {
        let mut inner = self.inner.lock();
        debug_assert!(
            !inner.windows.values().any(|w| w.mapping == mapping),
            "mapping deleted while windows remain mapped"
        );
        if let Some(backing) = inner.mappings.remove(&mapping) {
            drop(backing.file);
            let _ = std::fs::remove_file(&backing.path);
        }
    }
}
