//! File-hash cache layer
//!
//! One cache instance wraps one engine environment and records
//! `(mtime, ctime, size, hash)` entries keyed by file path. An exclusive
//! non-blocking lock on `<path>.lock` keeps other processes out entirely;
//! inside the process the engine runs with `INTRAPROCESS_LOCK`. Garbage
//! collection is mark-and-sweep: callers mark the paths they saw, and
//! `sweep` deletes everything else in one write transaction.

use fs2::FileExt;
use parking_lot::Mutex;
use static_assertions::const_assert;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use crate::env::{EnvBuilder, EnvFlags, Environment};
use crate::error::{Error, Result};
use crate::txn::{mode, Read, Transaction, Write};

/// Map size for cache databases (10 GiB)
const CACHE_MAP_SIZE: usize = 10 << 30;

/// One cache record: 40 bytes packed, stored as the entry value and handed
/// back zero-copy out of the map.
#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    mtime: u64,
    ctime: u64,
    size: u64,
    hash: [u8; 16],
}

const_assert!(size_of::<CacheEntry>() == 40);

impl CacheEntry {
    /// Build a record from file metadata and a content hash
    pub fn new(mtime: u64, ctime: u64, size: u64, hash: [u8; 16]) -> Self {
        Self { mtime, ctime, size, hash }
    }

    /// Modification time
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Change time
    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// 128-bit content hash
    pub fn hash(&self) -> [u8; 16] {
        self.hash
    }

    /// View the record as its on-disk bytes
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: packed repr(C), no padding, size asserted to 40.
        unsafe { std::slice::from_raw_parts(self as *const _ as *const u8, size_of::<Self>()) }
    }

    /// Reinterpret stored bytes as a record without copying
    pub fn from_bytes(buf: &[u8]) -> Result<&Self> {
        if buf.len() != size_of::<Self>() {
            return Err(Error::Corruption { details: "cache entry is not 40 bytes".into() });
        }
        // SAFETY: packed repr gives the type alignment 1 and every bit
        // pattern of the right length is a valid value.
        Ok(unsafe { &*(buf.as_ptr() as *const Self) })
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("mtime", &self.mtime())
            .field("ctime", &self.ctime())
            .field("size", &self.size())
            .field("hash", &self.hash())
            .finish()
    }
}

/// A file-hash cache over one engine environment
pub struct Cache {
    env: Environment,
    lock_file: File,
    visited: Mutex<HashSet<Vec<u8>>>,
}

impl Cache {
    /// Open the cache at `path`, taking `<path>.lock` exclusively.
    ///
    /// Fails with [`Error::Busy`] when another process holds the lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let lock_path = {
            let mut name = path.as_os_str().to_os_string();
            name.push(".lock");
            PathBuf::from(name)
        };
        let lock_file = OpenOptions::new().read(true).write(true).create(true).open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::Busy);
        }

        let env = match EnvBuilder::new()
            .map_size(CACHE_MAP_SIZE)
            .flags(EnvFlags::CREATE | EnvFlags::INTRAPROCESS_LOCK)
            .open(path)
        {
            Ok(env) => env,
            Err(e) => {
                let _ = fs2::FileExt::unlock(&lock_file);
                return Err(e);
            }
        };

        tracing::debug!(path = %path.display(), "cache opened");
        Ok(Self { env, lock_file, visited: Mutex::new(HashSet::new()) })
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<Transaction<'_, Read>> {
        self.env.read_txn()
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<Transaction<'_, Write>> {
        self.env.write_txn()
    }

    /// Look up `path`, returning a zero-copy view of its record
    pub fn lookup<'txn, M: mode::Mode>(
        &self,
        txn: &'txn Transaction<'_, M>,
        path: &[u8],
    ) -> Result<Option<&'txn CacheEntry>> {
        match txn.get(path)? {
            Some(value) => Ok(Some(CacheEntry::from_bytes(value)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the record for `path`
    pub fn upsert(
        &self,
        txn: &mut Transaction<'_, Write>,
        path: &[u8],
        entry: &CacheEntry,
    ) -> Result<()> {
        match txn.del(path) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        txn.put(path, entry.as_bytes())
    }

    /// Record that `path` was seen this scan; idempotent
    pub fn mark_visited(&self, path: &[u8]) {
        self.visited.lock().insert(path.to_vec());
    }

    /// Delete every record whose path was not marked since the last sweep,
    /// commit, and clear the visited set. Returns the number of records
    /// removed.
    pub fn sweep(&self) -> Result<usize> {
        let visited = self.visited.lock().clone();
        let mut txn = self.env.write_txn()?;

        let mut stale: Vec<Vec<u8>> = Vec::new();
        {
            let mut cursor = txn.cursor();
            let mut item = cursor.first()?;
            while let Some((key, _)) = item {
                if !visited.contains(key) {
                    stale.push(key.to_vec());
                }
                item = cursor.next()?;
            }
        }
        for key in &stale {
            txn.del(key)?;
        }
        txn.commit()?;

        self.visited.lock().clear();
        tracing::debug!(removed = stale.len(), "cache sweep finished");
        Ok(stale.len())
    }

    /// Close the cache, releasing the exclusive lock. The first error wins.
    pub fn close(self) -> Result<()> {
        let Cache { env, lock_file, .. } = self;
        let mut first_err: Option<Error> = None;
        if let Err(e) = env.close() {
            first_err = Some(e);
        }
        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            first_err.get_or_insert(Error::from(e));
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        assert_eq!(size_of::<CacheEntry>(), 40);
        let entry = CacheEntry::new(1_700_000_000, 1_700_000_001, 4096, [7u8; 16]);
        let bytes = entry.as_bytes();
        assert_eq!(bytes.len(), 40);
        let back = CacheEntry::from_bytes(bytes).unwrap();
        assert_eq!(back.mtime(), 1_700_000_000);
        assert_eq!(back.ctime(), 1_700_000_001);
        assert_eq!(back.size(), 4096);
        assert_eq!(back.hash(), [7u8; 16]);
        assert!(CacheEntry::from_bytes(&bytes[..39]).is_err());
    }
}
