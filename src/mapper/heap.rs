//! # In-Memory Mapper Backend
//!
//! `HeapMapper` backs each mapping with a plain `Vec<u8>`. It exists for
//! tests and for embedders that want a purely in-memory cache; it is also the
//! reference implementation of the `ViewMapper` contract: every behavior the
//! engine relies on (short final windows, idempotent extend, window-token
//! lifetime) is easiest to read here.
//!
//! Purging is a no-op returning success: there is no cache between the
//! "mapped" windows and the backing vector, so there is never anything to
//! discard.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{MappedWindow, MappingId, ViewMapper, WindowToken};
use crate::config::WINDOW_SIZE;

#[derive(Debug)]
struct Window {
    mapping: MappingId,
    offset: u64,
    len: usize,
}

#[derive(Debug, Default)]
struct HeapInner {
    mappings: HashMap<MappingId, Vec<u8>>,
    windows: HashMap<u64, Window>,
    next_mapping: u64,
    next_window: u64,
}

/// Anonymous-memory mapper backend.
#[derive(Debug, Default)]
pub struct HeapMapper {
    inner: Mutex<HeapInner>,
}

impl HeapMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently mapped windows, across all mappings. Tests use
    /// this to check that the pool really bounds address-space consumption.
    pub fn active_windows(&self) -> usize {
        self.inner.lock().windows.len()
    }

    /// Number of live mappings.
    pub fn active_mappings(&self) -> usize {
        self.inner.lock().mappings.len()
    }
}

impl ViewMapper for HeapMapper {
    fn create_mapping(&self, size: u64) -> Result<MappingId> {
        let mut inner = self.inner.lock();
        let id = inner.next_mapping;
        inner.next_mapping += 1;
        inner.mappings.insert(id, vec![0u8; size as usize]);
        Ok(id)
    }

    fn extend_mapping(&self, mapping: MappingId, new_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let backing = inner
            .mappings
            .get_mut(&mapping)
            .ok_or_else(|| eyre::eyre!("extend of unknown mapping {}", mapping))?;
        if new_size as usize > backing.len() {
            backing.resize(new_size as usize, 0);
        }
        Ok(())
    }

    fn map_window(&self, mapping: MappingId, offset: u64) -> Result<MappedWindow> {
        let mut inner = self.inner.lock();
        let size = inner
            .mappings
            .get(&mapping)
            .ok_or_else(|| eyre::eyre!("map_window of unknown mapping {}", mapping))?
            .len() as u64;

        ensure!(
            offset < size,
            "window offset {} beyond mapping size {}",
            offset,
            size
        );
        ensure!(
            offset % WINDOW_SIZE == 0,
            "window offset {} is not window-aligned",
            offset
        );

        let len = WINDOW_SIZE.min(size - offset) as usize;
        let token = inner.next_window;
        inner.next_window += 1;
        inner.windows.insert(
            token,
            Window {
                mapping,
                offset,
                len,
            },
        );

        Ok(MappedWindow {
            token: WindowToken(token),
            len,
        })
    }

    fn unmap_window(&self, token: WindowToken, _unmap_behind: bool) {
        self.inner.lock().windows.remove(&token.0);
    }

    fn read_window(&self, token: WindowToken, at: usize, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let window = inner
            .windows
            .get(&token.0)
            .ok_or_else(|| eyre::eyre!("read through unmapped window"))?;
        ensure!(
            at + buf.len() <= window.len,
            "read of {} bytes at {} exceeds window length {}",
            buf.len(),
            at,
            window.len
        );

        let backing = &inner.mappings[&window.mapping];
        let start = window.offset as usize + at;
        buf.copy_from_slice(&backing[start..start + buf.len()]);
        Ok(())
    }

    fn write_window(&self, token: WindowToken, at: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let window = inner
            .windows
            .get(&token.0)
            .ok_or_else(|| eyre::eyre!("write through unmapped window"))?;
        ensure!(
            at + data.len() <= window.len,
            "write of {} bytes at {} exceeds window length {}",
            data.len(),
            at,
            window.len
        );

        let start = window.offset as usize + at;
        let mapping = window.mapping;
        let backing = inner
            .mappings
            .get_mut(&mapping)
            .ok_or_else(|| eyre::eyre!("window names a deleted mapping"))?;
        backing[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn zero_window(&self, token: WindowToken, at: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let window = inner
            .windows
            .get(&token.0)
            .ok_or_else(|| eyre::eyre!("zero through unmapped window"))?;
        ensure!(
            at + len <= window.len,
            "zero of {} bytes at {} exceeds window length {}",
            len,
            at,
            window.len
        );

        let start = window.offset as usize + at;
        let mapping = window.mapping;
        let backing = inner
            .mappings
            .get_mut(&mapping)
            .ok_or_else(|| eyre::eyre!("window names a deleted mapping"))?;
        backing[start..start + len].fill(0);
        Ok(())
    }

    fn flush_mapping(&self, _mapping: MappingId, _offset: u64, _len: u64) -> Result<()> {
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
        inner.mappings.remove(&mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_read_write_round_trip() {
        let mapper = HeapMapper::new();
        let mapping = mapper.create_mapping(WINDOW_SIZE * 2).unwrap();

        let w = mapper.map_window(mapping, 0).unwrap();
        assert_eq!(w.len, WINDOW_SIZE as usize);

        mapper.write_window(w.token, 100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        mapper.read_window(w.token, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn final_window_maps_short() {
        let mapper = HeapMapper::new();
        let mapping = mapper.create_mapping(WINDOW_SIZE + 4096).unwrap();

        let w = mapper.map_window(mapping, WINDOW_SIZE).unwrap();
        assert_eq!(w.len, 4096);
    }

    #[test]
    fn unaligned_offset_is_rejected() {
        let mapper = HeapMapper::new();
        let mapping = mapper.create_mapping(WINDOW_SIZE * 2).unwrap();

        assert!(mapper.map_window(mapping, 4096).is_err());
    }

    #[test]
    fn extend_then_map_new_window() {
        let mapper = HeapMapper::new();
        let mapping = mapper.create_mapping(WINDOW_SIZE).unwrap();

        assert!(mapper.map_window(mapping, WINDOW_SIZE).is_err());
        mapper.extend_mapping(mapping, WINDOW_SIZE * 2).unwrap();

        let w = mapper.map_window(mapping, WINDOW_SIZE).unwrap();
        assert_eq!(w.len, WINDOW_SIZE as usize);
    }

    #[test]
    fn unmap_invalidates_token() {
        let mapper = HeapMapper::new();
        let mapping = mapper.create_mapping(WINDOW_SIZE).unwrap();

        let w = mapper.map_window(mapping, 0).unwrap();
        mapper.unmap_window(w.token, false);

        let mut buf = [0u8; 1];
        assert!(mapper.read_window(w.token, 0, &mut buf).is_err());
        assert_eq!(mapper.active_windows(), 0);
    }

    #[test]
    fn zero_clears_previous_contents() {
        let mapper = HeapMapper::new();
        let mapping = mapper.create_mapping(WINDOW_SIZE).unwrap();

        let w = mapper.map_window(mapping, 0).unwrap();
        mapper.write_window(w.token, 0, &[0xFF; 64]).unwrap();
        mapper.zero_window(w.token, 0, 64).unwrap();

        let mut buf = [0xAAu8; 64];
        mapper.read_window(w.token, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
