//! Environment management
//!
//! The environment owns the file, the memory map, the reader table and the
//! writer lock. It is built once with [`EnvBuilder`] and shared behind an
//! `Arc`; transactions borrow it.

use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Pgno, Result, TxnId};
use crate::io::MmapBackend;
use crate::meta::{self, MetaPage, META_PAGE_0, META_PAGE_1};
use crate::reader::{ReaderTable, MAX_READERS};
use crate::txn::{Read, Transaction, Write};

bitflags::bitflags! {
    /// Environment open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Create the file if it does not exist
        const CREATE = 0x01;
        /// Open read-only; write transactions fail with `ReadOnly`
        const RDONLY = 0x02;
        /// Serialize writers with an in-process mutex only, instead of the
        /// default interprocess lock file
        const INTRAPROCESS_LOCK = 0x04;
    }
}

/// Default map size (1 GiB)
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;

/// Shared environment state
pub(crate) struct EnvInner {
    #[allow(dead_code)]
    path: PathBuf,
    /// I/O backend
    pub(crate) io: MmapBackend,
    flags: EnvFlags,
    /// Txnid of the last committed write transaction
    pub(crate) txn_id: AtomicU64,
    /// In-process writer serialization
    write_lock: Mutex<()>,
    /// Interprocess writer lock target; `None` under `INTRAPROCESS_LOCK`
    lock_file: Option<File>,
    /// Reader table
    pub(crate) readers: ReaderTable,
}

impl EnvInner {
    /// Read the live meta page.
    ///
    /// The live slot is derived from the committed-txnid word rather than by
    /// comparing both pages: the slot a txnid maps to is never rewritten
    /// while that txnid is the latest commit, so the read cannot tear.
    pub(crate) fn live_meta(&self) -> Result<MetaPage> {
        let txnid = TxnId(self.txn_id.load(Ordering::Acquire));
        let meta = self.io.read_meta(MetaPage::slot_for(txnid))?;
        meta.validate()?;
        Ok(meta)
    }

    /// Acquire the writer lock, blocking until the current writer finishes
    pub(crate) fn lock_writer(&self) -> Result<WriterGuard<'_>> {
        let guard = self.write_lock.lock();
        if let Some(file) = &self.lock_file {
            file.lock_exclusive()?;
        }
        Ok(WriterGuard { _guard: guard, lock_file: self.lock_file.as_ref() })
    }
}

/// Holds writer exclusivity for the lifetime of a write transaction
pub(crate) struct WriterGuard<'env> {
    _guard: MutexGuard<'env, ()>,
    lock_file: Option<&'env File>,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.lock_file {
            let _ = fs2::FileExt::unlock(file);
        }
    }
}

/// Builder for creating environments
pub struct EnvBuilder {
    map_size: usize,
    max_readers: usize,
    flags: EnvFlags,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvBuilder {
    /// Create a new environment builder
    pub fn new() -> Self {
        Self { map_size: DEFAULT_MAP_SIZE, max_readers: MAX_READERS, flags: EnvFlags::empty() }
    }

    /// Set the map size in bytes. This is the hard ceiling on database
    /// growth; the file starts at two pages and is extended on demand.
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    /// Set the maximum number of concurrent readers
    pub fn max_readers(mut self, readers: usize) -> Self {
        self.max_readers = readers;
        self
    }

    /// Set the open flags
    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Open the environment at `path` (a single database file)
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment> {
        let path = path.as_ref().to_path_buf();
        let readonly = self.flags.contains(EnvFlags::RDONLY);
        let create = self.flags.contains(EnvFlags::CREATE);

        let (io, fresh) = MmapBackend::open(&path, self.map_size, readonly, create)?;

        if fresh {
            io.write_meta(META_PAGE_0, &MetaPage::initial(0))?;
            io.write_meta(META_PAGE_1, &MetaPage::initial(1))?;
            io.sync()?;
            tracing::debug!(path = %path.display(), "created database file");
        }

        let meta0 = io.read_meta(META_PAGE_0)?;
        let meta1 = io.read_meta(META_PAGE_1)?;
        let live = meta::select_live(&meta0, &meta1)?;

        let lock_file = if readonly || self.flags.contains(EnvFlags::INTRAPROCESS_LOCK) {
            None
        } else {
            let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
            name.push("-lock");
            Some(OpenOptions::new().read(true).write(true).create(true).open(path.with_file_name(name))?)
        };

        tracing::debug!(
            path = %path.display(),
            txnid = live.txnid,
            last_pgno = live.last_pgno,
            "opened environment"
        );

        Ok(Environment {
            inner: Arc::new(EnvInner {
                path,
                io,
                flags: self.flags,
                txn_id: AtomicU64::new(live.txnid),
                write_lock: Mutex::new(()),
                lock_file,
                readers: ReaderTable::new(self.max_readers),
            }),
        })
    }
}

/// Snapshot of the live meta page plus environment counters
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    /// Txnid of the last committed transaction
    pub txnid: TxnId,
    /// Root page of the main tree (0 = empty)
    pub root: Pgno,
    /// Root page of the free DB (0 = empty)
    pub free_db_root: Pgno,
    /// Highest page number in use
    pub last_pgno: Pgno,
    /// Configured map size in bytes
    pub map_size: usize,
    /// Number of active readers
    pub readers: usize,
}

/// Database environment
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    pub(crate) fn inner(&self) -> &EnvInner {
        &self.inner
    }

    /// Begin a read transaction on the current snapshot
    pub fn read_txn(&self) -> Result<Transaction<'_, Read>> {
        Transaction::new_read(self)
    }

    /// Begin a write transaction, blocking until the previous writer is done
    pub fn write_txn(&self) -> Result<Transaction<'_, Write>> {
        if self.inner.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        Transaction::new_write(self)
    }

    /// Live meta values and reader count
    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.inner.live_meta()?;
        Ok(EnvInfo {
            txnid: meta.txnid(),
            root: Pgno(meta.root),
            free_db_root: Pgno(meta.free_db_root),
            last_pgno: Pgno(meta.last_pgno),
            map_size: self.inner.io.map_size(),
            readers: self.inner.readers.active(),
        })
    }

    /// Flush the map and close the environment
    pub fn close(self) -> Result<()> {
        self.inner.io.sync()?;
        Ok(())
    }
}
