//! Trunk container files: large append-only files holding many packed
//! slices, addressed by `(trunk_id, offset, length)` (spec.md §4.D/§4.E,
//! GLOSSARY "Trunk"). Plain positioned file I/O, matching the original's
//! raw preallocated-file-plus-offset model — there is no KV store
//! underneath a trunk, so this intentionally does not reach for an
//! embedded-database crate.

use faststore_common::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// The physical location of a slice's bytes within a trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkSpace {
    pub trunk_id: u64,
    pub offset: u64,
    pub length: u32,
}

pub struct Trunk {
    id: u64,
    file: Mutex<File>,
    next_offset: AtomicU64,
    /// Bytes still referenced by a live slice; approaches zero as a
    /// trunk's content migrates elsewhere during reclaim.
    live_bytes: AtomicI64,
    /// Fixed capacity (spec.md §3 TrunkFile); a new trunk is opened once
    /// appends would exceed it rather than growing this one without bound.
    capacity: u64,
}

impl Trunk {
    fn open(id: u64, path: &Path, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            id,
            file: Mutex::new(file),
            next_offset: AtomicU64::new(0),
            live_bytes: AtomicI64::new(0),
            capacity,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn live_bytes(&self) -> i64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether `len` more bytes still fit before `capacity`.
    pub fn has_room_for(&self, len: usize) -> bool {
        self.next_offset.load(Ordering::Relaxed) + len as u64 <= self.capacity
    }

    /// Appends `data` at the trunk's current write cursor, returning the
    /// space it now occupies. Callers must check [`Trunk::has_room_for`]
    /// first; a trunk never silently grows past `capacity`.
    pub fn append(&self, data: &[u8]) -> Result<TrunkSpace> {
        let offset = self.next_offset.fetch_add(data.len() as u64, Ordering::SeqCst);
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
        }
        self.live_bytes.fetch_add(data.len() as i64, Ordering::Relaxed);
        Ok(TrunkSpace {
            trunk_id: self.id,
            offset,
            length: data.len() as u32,
        })
    }

    pub fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Marks `length` bytes as no longer referenced. Once a trunk's
    /// `live_bytes` reaches zero it is a reclaim candidate, but nothing
    /// in this crate deletes the backing file automatically — that is
    /// the owning `Engine`'s housekeeping decision.
    pub fn release(&self, length: u32) {
        self.live_bytes.fetch_sub(length as i64, Ordering::Relaxed);
    }
}

/// Owns every trunk file under a data directory and hands out fresh
/// trunks for the reclaimer (and, eventually, the normal write path) to
/// append into.
pub struct TrunkPool {
    dir: PathBuf,
    trunks: Mutex<std::collections::HashMap<u64, Arc<Trunk>>>,
    next_id: AtomicU64,
    capacity: u64,
    /// The trunk new writes append into until it runs out of room
    /// (spec.md §4.E "a fresh trunk extent"); `None` until the first
    /// write or reclaim allocates one.
    current: Mutex<Option<Arc<Trunk>>>,
}

impl TrunkPool {
    pub fn new(dir: PathBuf) -> Self {
        Self::with_capacity(dir, DEFAULT_TRUNK_CAPACITY)
    }

    pub fn with_capacity(dir: PathBuf, capacity: u64) -> Self {
        Self {
            dir,
            trunks: Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
            current: Mutex::new(None),
        }
    }

    pub fn create_trunk(&self) -> Result<Arc<Trunk>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("trunk-{id:016x}.dat"));
        let trunk = Arc::new(Trunk::open(id, &path, self.capacity)?);
        self.trunks.lock().insert(id, trunk.clone());
        Ok(trunk)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Trunk>> {
        self.trunks.lock().get(&id).cloned()
    }

    /// Appends `data` to the pool's current write trunk, opening a fresh
    /// trunk when the current one has no room left (spec.md §3 "sum of
    /// live-slice lengths ≤ capacity − holes"). Used by the live write
    /// path, by `SLICE_ALLOCATE`, and by recovery replay — anything that
    /// materialises new slice content rather than migrating existing
    /// content during reclaim (which targets a specific destination
    /// trunk instead).
    pub fn write(&self, data: &[u8]) -> Result<TrunkSpace> {
        let mut current = self.current.lock();
        if let Some(trunk) = current.as_ref() {
            if trunk.has_room_for(data.len()) {
                return trunk.append(data);
            }
        }
        let trunk = self.create_trunk()?;
        let space = trunk.append(data)?;
        *current = Some(trunk);
        Ok(space)
    }
}

/// Default trunk capacity (64 MiB), matching the original's typical
/// `trunk_file_size` default order of magnitude.
pub const DEFAULT_TRUNK_CAPACITY: u64 = 64 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TrunkPool::new(dir.path().to_path_buf());
        let trunk = pool.create_trunk().unwrap();

        let space_a = trunk.append(b"hello").unwrap();
        let space_b = trunk.append(b"world!").unwrap();
        assert_eq!(space_a.offset, 0);
        assert_eq!(space_b.offset, 5);

        assert_eq!(trunk.read_at(space_a.offset, space_a.length).unwrap(), b"hello");
        assert_eq!(trunk.read_at(space_b.offset, space_b.length).unwrap(), b"world!");
    }

    #[test]
    fn release_tracks_live_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TrunkPool::new(dir.path().to_path_buf());
        let trunk = pool.create_trunk().unwrap();
        let space = trunk.append(b"payload").unwrap();
        assert_eq!(trunk.live_bytes(), 7);
        trunk.release(space.length);
        assert_eq!(trunk.live_bytes(), 0);
    }

    #[test]
    fn pool_write_rolls_over_when_trunk_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TrunkPool::with_capacity(dir.path().to_path_buf(), 10);
        let a = pool.write(b"12345").unwrap();
        let b = pool.write(b"67890").unwrap();
        assert_eq!(a.trunk_id, b.trunk_id, "both fit in the first trunk");

        let c = pool.write(b"x").unwrap();
        assert_ne!(c.trunk_id, a.trunk_id, "first trunk is full, rolls to a new one");
        assert_eq!(c.offset, 0);
    }
}
