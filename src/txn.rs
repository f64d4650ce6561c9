//! Transaction management with compile-time mode safety
//!
//! Readers claim a slot in the reader table and capture a snapshot
//! `(root, free_db_root, last_pgno, txnid)`; they never block and never see
//! a partial commit. The single writer holds the writer lock, builds its
//! changes in a private dirty-page table via copy-on-write, and publishes
//! them atomically by writing the stale meta page at commit.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crate::btree;
use crate::cursor::Cursor;
use crate::env::{Environment, WriterGuard};
use crate::error::{Error, Pgno, Result, TxnId};
use crate::freelist::{self, ReclaimList};
use crate::meta::{MetaPage, DB_VERSION, MAGIC};
use crate::page::{leaf_need, Page, PageFlags, PageHeader, MAX_KEY_SIZE, PAGE_SIZE};

/// Transaction mode marker traits
pub mod mode {
    /// Sealed trait for transaction modes
    pub(crate) mod sealed {
        pub trait Sealed {}
    }

    /// Transaction mode trait
    pub trait Mode: sealed::Sealed {
        /// Whether this is a write transaction
        const IS_WRITE: bool;
    }
}

/// Read-only transaction mode
#[derive(Debug)]
pub struct Read;

impl mode::sealed::Sealed for Read {}
impl mode::Mode for Read {
    const IS_WRITE: bool = false;
}

/// Read-write transaction mode
#[derive(Debug)]
pub struct Write;

impl mode::sealed::Sealed for Write {}
impl mode::Mode for Write {
    const IS_WRITE: bool = true;
}

/// Which B+ tree an operation targets. The free DB shares all of the tree
/// machinery; only the root differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dbi {
    /// The main key-value tree
    Main,
    /// The tree of `(txnid -> retired pgnos)` entries
    Free,
}

/// The tree roots and allocation horizon a transaction works against
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    pub(crate) root: Pgno,
    pub(crate) free_root: Pgno,
    pub(crate) last_pgno: Pgno,
    pub(crate) txnid: TxnId,
}

/// Writer-only transaction state
pub(crate) struct WriteState<'env> {
    /// Keeps writer exclusivity until the transaction ends
    _guard: WriterGuard<'env>,
    /// CoW buffers keyed by their assigned physical pgno
    pub(crate) dirty: HashMap<Pgno, Box<Page>>,
    /// Pages of the inherited committed tree retired by this transaction
    pub(crate) freed: Vec<Pgno>,
    /// Free-DB entries eligible for reuse, loaded at begin
    pub(crate) reclaim: ReclaimList,
}

enum ModeData<'env> {
    Read { slot: usize },
    Write(Box<WriteState<'env>>),
}

/// A database transaction; `M` is [`Read`] or [`Write`]
pub struct Transaction<'env, M: mode::Mode> {
    env: &'env Environment,
    snapshot: Snapshot,
    mode_data: ModeData<'env>,
    _mode: PhantomData<M>,
}

/// Type alias for read-only transactions
pub type ReadTransaction<'env> = Transaction<'env, Read>;

/// Type alias for read-write transactions
pub type WriteTransaction<'env> = Transaction<'env, Write>;

impl<'env> Transaction<'env, Read> {
    pub(crate) fn new_read(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();

        // Claim a slot, then make sure the meta we read matches the txnid we
        // published; retry if a commit slid in between. A slot published with
        // an older txnid than the tree actually read would let the allocator
        // hand out pages the tree still references.
        let mut txnid = TxnId(inner.txn_id.load(Ordering::Acquire));
        let slot = inner.readers.claim(txnid)?;
        let meta = loop {
            let result = inner.io.read_meta(MetaPage::slot_for(txnid)).and_then(|meta| {
                meta.validate()?;
                if meta.txnid != txnid.0 {
                    return Err(Error::Corruption {
                        details: format!("meta txnid {} does not match live {}", meta.txnid, txnid),
                    });
                }
                Ok(meta)
            });
            let current = TxnId(inner.txn_id.load(Ordering::Acquire));
            if current != txnid {
                // A commit slid in while we were reading; republish and retry.
                txnid = current;
                inner.readers.update(slot, txnid);
                continue;
            }
            match result {
                Ok(meta) => break meta,
                Err(e) => {
                    inner.readers.release(slot);
                    return Err(e);
                }
            }
        };

        Ok(Self {
            env,
            snapshot: Snapshot {
                root: Pgno(meta.root),
                free_root: Pgno(meta.free_db_root),
                last_pgno: Pgno(meta.last_pgno),
                txnid,
            },
            mode_data: ModeData::Read { slot },
            _mode: PhantomData,
        })
    }

    /// Finish the read transaction, releasing its reader slot
    pub fn commit(self) {}

    /// Alias of [`commit`](Self::commit); readers have nothing to roll back
    pub fn abort(self) {}
}

impl<'env> Transaction<'env, Write> {
    pub(crate) fn new_write(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();
        let guard = inner.lock_writer()?;
        // Under the writer lock the live meta is stable.
        let meta = inner.live_meta()?;

        let mut txn = Self {
            env,
            snapshot: Snapshot {
                root: Pgno(meta.root),
                free_root: Pgno(meta.free_db_root),
                last_pgno: Pgno(meta.last_pgno),
                txnid: TxnId(meta.txnid + 1),
            },
            mode_data: ModeData::Write(Box::new(WriteState {
                _guard: guard,
                dirty: HashMap::new(),
                freed: Vec::new(),
                reclaim: ReclaimList::default(),
            })),
            _mode: PhantomData,
        };

        let oldest = inner.readers.oldest_reader();
        let reclaim = freelist::load_reclaimable(&txn, oldest)?;
        txn.write_state_mut().reclaim = reclaim;
        tracing::trace!(txnid = txn.snapshot.txnid.0, "write transaction started");
        Ok(txn)
    }

    pub(crate) fn write_state(&self) -> &WriteState<'env> {
        match &self.mode_data {
            ModeData::Write(ws) => ws,
            ModeData::Read { .. } => unreachable!("write state on a read transaction"),
        }
    }

    pub(crate) fn write_state_mut(&mut self) -> &mut WriteState<'env> {
        match &mut self.mode_data {
            ModeData::Write(ws) => ws,
            ModeData::Read { .. } => unreachable!("write state on a read transaction"),
        }
    }

    /// Insert `key -> value`. Fails with [`Error::KeyExists`] if the key is
    /// already present; there is no implicit overwrite.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        if leaf_need(key.len(), value.len()) > PAGE_SIZE - PageHeader::SIZE {
            return Err(Error::MapFull);
        }
        btree::tree_put(self, Dbi::Main, key, value)
    }

    /// Delete `key`. Fails with [`Error::NotFound`] if absent.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        btree::tree_del(self, Dbi::Main, key)
    }

    /// Allocate a page number, preferring retired pages whose snapshots are
    /// all gone, extending the file horizon otherwise.
    pub(crate) fn alloc_pgno(&mut self) -> Result<Pgno> {
        if let Some(pgno) = self.write_state_mut().reclaim.pop() {
            tracing::trace!(pgno = pgno.0, "reusing retired page");
            return Ok(pgno);
        }
        let next = Pgno(self.snapshot.last_pgno.0 + 1);
        if (next.0 + 1) as usize * PAGE_SIZE > self.env.inner().io.map_size() {
            return Err(Error::MapFull);
        }
        self.snapshot.last_pgno = next;
        Ok(next)
    }

    /// Allocate a fresh dirty page
    pub(crate) fn alloc_page(&mut self, flags: PageFlags) -> Result<Pgno> {
        let pgno = self.alloc_pgno()?;
        let page = Page::new_boxed(pgno, flags);
        self.write_state_mut().dirty.insert(pgno, page);
        Ok(pgno)
    }

    /// Make `pgno` writable: already-dirty pages are returned as-is, pages of
    /// the inherited committed tree are copied into a fresh dirty buffer
    /// under a new pgno and the original joins the freed list.
    pub(crate) fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        if self.write_state().dirty.contains_key(&pgno) {
            return Ok(pgno);
        }
        let src = self.page(pgno)? as *const Page;
        let new_pgno = self.alloc_pgno()?;
        // SAFETY: `src` points into the map (it was not dirty), which is
        // stable; alloc_pgno does not touch the map.
        let copy = unsafe { (*src).copy_boxed(new_pgno) };
        let ws = self.write_state_mut();
        ws.dirty.insert(new_pgno, copy);
        ws.freed.push(pgno);
        Ok(new_pgno)
    }

    /// Mutable access to a dirty page
    pub(crate) fn dirty_page_mut(&mut self, pgno: Pgno) -> Result<&mut Page> {
        self.write_state_mut()
            .dirty
            .get_mut(&pgno)
            .map(|page| page.as_mut())
            .ok_or_else(|| Error::Corruption { details: format!("page {} is not dirty", pgno) })
    }

    /// Commit: persist the freed-page list into the free DB, copy dirty
    /// buffers into the map, flush data, then write and flush the stale meta
    /// page. The meta flush is the atomic commit point.
    pub fn commit(mut self) -> Result<()> {
        freelist::save(&mut self)?;

        let inner = self.env.inner();
        let ws = self.write_state();
        if ws.dirty.is_empty() {
            tracing::trace!(txnid = self.snapshot.txnid.0, "empty write transaction");
            return Ok(());
        }

        inner.io.grow(self.snapshot.last_pgno)?;
        for page in ws.dirty.values() {
            inner.io.write_page(page)?;
        }
        inner.io.sync()?;

        let txnid = self.snapshot.txnid;
        let meta = MetaPage {
            magic: MAGIC,
            version: DB_VERSION,
            txnid: txnid.0,
            root: self.snapshot.root.0,
            last_pgno: self.snapshot.last_pgno.0,
            free_db_root: self.snapshot.free_root.0,
        };
        let slot = MetaPage::slot_for(txnid);
        inner.io.write_meta(slot, &meta)?;
        inner.io.sync_page(slot)?;

        inner.txn_id.store(txnid.0, Ordering::Release);
        tracing::debug!(
            txnid = txnid.0,
            dirty = ws.dirty.len(),
            freed = ws.freed.len(),
            last_pgno = self.snapshot.last_pgno.0,
            "committed write transaction"
        );
        Ok(())
    }

    /// Discard all changes; the file is untouched
    pub fn abort(self) {}
}

impl<'env, M: mode::Mode> Transaction<'env, M> {
    /// The transaction's snapshot txnid (readers) or the txnid this
    /// transaction will commit as (writers)
    pub fn id(&self) -> TxnId {
        self.snapshot.txnid
    }

    /// Highest page number currently in use by this transaction's view
    pub fn last_pgno(&self) -> Pgno {
        self.snapshot.last_pgno
    }

    pub(crate) fn root(&self, dbi: Dbi) -> Pgno {
        match dbi {
            Dbi::Main => self.snapshot.root,
            Dbi::Free => self.snapshot.free_root,
        }
    }

    pub(crate) fn set_root(&mut self, dbi: Dbi, pgno: Pgno) {
        match dbi {
            Dbi::Main => self.snapshot.root = pgno,
            Dbi::Free => self.snapshot.free_root = pgno,
        }
    }

    /// Fetch a page, preferring this transaction's dirty copy
    pub(crate) fn page(&self, pgno: Pgno) -> Result<&Page> {
        if pgno.0 <= 1 {
            return Err(Error::Corruption { details: format!("page {} is a meta page", pgno) });
        }
        if let ModeData::Write(ws) = &self.mode_data {
            if let Some(page) = ws.dirty.get(&pgno) {
                return Ok(page);
            }
        }
        // SAFETY: the environment (and thus the map) outlives this
        // transaction, the map is never remapped, and any page reachable from
        // this snapshot stays byte-identical under the CoW discipline.
        unsafe { self.env.inner().io.page_ref(pgno) }
    }

    /// Look up `key`, returning a zero-copy view of its value
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        check_key(key)?;
        btree::tree_get(self, Dbi::Main, key)
    }

    /// Open a cursor over the main tree
    pub fn cursor(&self) -> Cursor<'_, 'env, M> {
        Cursor::new(self, Dbi::Main)
    }

    /// Walk the main tree and gather page/entry counts and depth
    pub fn stat(&self) -> Result<crate::meta::Stat> {
        btree::tree_stat(self, Dbi::Main)
    }

    /// The pgnos retired by the transaction that committed as `txnid`, if
    /// the free DB still holds that entry
    pub fn retired_pages(&self, txnid: TxnId) -> Result<Option<Vec<Pgno>>> {
        match btree::tree_get(self, Dbi::Free, &freelist::encode_key(txnid))? {
            Some(value) => Ok(Some(freelist::decode_pgnos(value)?)),
            None => Ok(None),
        }
    }
}

impl<M: mode::Mode> Drop for Transaction<'_, M> {
    fn drop(&mut self) {
        if let ModeData::Read { slot } = &self.mode_data {
            self.env.inner().readers.release(*slot);
        }
        // Writers: dropping the guard releases the lock; an uncommitted
        // dirty table simply evaporates.
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidParameter("empty key"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::InvalidParameter("key too large"));
    }
    Ok(())
}
