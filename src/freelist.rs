//! Free-space management
//!
//! Every write transaction records the pages it retires as one free-DB entry
//! `txnid -> [pgno]`, with the txnid key big-endian so lexicographic order is
//! numeric order. The allocator reuses pages only out of entries older than
//! the oldest live reader snapshot; everything else extends the file.
//!
//! The free DB is an ordinary tree sharing all of the B+ tree code, so
//! maintaining it at commit is itself CoW and can retire further pages. The
//! save loop therefore iterates to a fixed point: it keeps re-syncing
//! consumed entries and the transaction's own freed list until one full pass
//! changes nothing.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::btree;
use crate::cursor::Cursor;
use crate::error::{Error, Pgno, Result, TxnId};
use crate::page::{leaf_need, PageHeader, PAGE_SIZE};
use crate::txn::{Dbi, Transaction, Write};

/// Largest number of pgnos one free-DB entry can carry inline
const MAX_ENTRY_PGNOS: usize = (PAGE_SIZE - PageHeader::SIZE - leaf_need(8, 0)) / 8;

/// Safety cap on save-loop passes; real databases converge in two or three
const MAX_SAVE_PASSES: usize = 1000;

/// Encode a free-DB key (big-endian txnid)
pub(crate) fn encode_key(txnid: TxnId) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, txnid.0);
    buf
}

/// Decode a free-DB key
pub(crate) fn decode_key(buf: &[u8]) -> Result<TxnId> {
    if buf.len() != 8 {
        return Err(Error::Corruption { details: "free-DB key is not 8 bytes".into() });
    }
    Ok(TxnId(BigEndian::read_u64(buf)))
}

/// Encode a free-DB value (packed little-endian pgno array)
pub(crate) fn encode_pgnos(pages: &[Pgno]) -> Vec<u8> {
    let mut out = vec![0u8; pages.len() * 8];
    for (i, page) in pages.iter().enumerate() {
        LittleEndian::write_u64(&mut out[i * 8..], page.0);
    }
    out
}

/// Decode a free-DB value
pub(crate) fn decode_pgnos(buf: &[u8]) -> Result<Vec<Pgno>> {
    if buf.len() % 8 != 0 {
        return Err(Error::Corruption { details: "free-DB value is not a pgno array".into() });
    }
    Ok(buf.chunks_exact(8).map(|chunk| Pgno(LittleEndian::read_u64(chunk))).collect())
}

struct ReclaimEntry {
    txnid: TxnId,
    remaining: Vec<Pgno>,
    /// At least one pgno was taken; the tree entry is stale
    taken: bool,
    /// Remaining-length last written back to the tree; `None` means the tree
    /// still holds the original entry
    synced: Option<usize>,
}

/// Free-DB entries whose snapshots are all gone, available to the allocator
#[derive(Default)]
pub(crate) struct ReclaimList {
    entries: Vec<ReclaimEntry>,
}

impl ReclaimList {
    fn new(loaded: Vec<(TxnId, Vec<Pgno>)>) -> Self {
        Self {
            entries: loaded
                .into_iter()
                .map(|(txnid, remaining)| ReclaimEntry {
                    txnid,
                    remaining,
                    taken: false,
                    synced: None,
                })
                .collect(),
        }
    }

    /// Take one reusable pgno, oldest entry first
    pub(crate) fn pop(&mut self) -> Option<Pgno> {
        for entry in &mut self.entries {
            if let Some(pgno) = entry.remaining.pop() {
                entry.taken = true;
                return Some(pgno);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Copy out the state of entry `i` for the save loop
    fn snapshot(&self, i: usize) -> (TxnId, Vec<Pgno>, bool, Option<usize>) {
        let entry = &self.entries[i];
        (entry.txnid, entry.remaining.clone(), entry.taken, entry.synced)
    }

    fn mark_synced(&mut self, i: usize, written_len: usize) {
        self.entries[i].synced = Some(written_len);
    }
}

/// Load the free-DB entries eligible for reuse under `oldest`.
///
/// `oldest == 0` means no reader holds a snapshot and every entry is fair
/// game; otherwise only entries strictly older than the oldest reader are.
pub(crate) fn load_reclaimable(txn: &Transaction<'_, Write>, oldest: TxnId) -> Result<ReclaimList> {
    let mut loaded = Vec::new();
    let mut cursor = Cursor::new(txn, Dbi::Free);
    let mut item = cursor.first()?;
    while let Some((key, value)) = item {
        let txnid = decode_key(key)?;
        if oldest.0 != 0 && txnid.0 >= oldest.0 {
            break;
        }
        loaded.push((txnid, decode_pgnos(value)?));
        item = cursor.next()?;
    }
    if !loaded.is_empty() {
        tracing::trace!(entries = loaded.len(), oldest = oldest.0, "loaded reclaimable entries");
    }
    Ok(ReclaimList::new(loaded))
}

/// Bring the free DB in line with this transaction before its pages are
/// written out: consumed reclaim entries lose the pgnos the allocator took,
/// and the transaction's own freed list is stored under its txnid.
pub(crate) fn save(txn: &mut Transaction<'_, Write>) -> Result<()> {
    let own_key = encode_key(txn.id());
    let mut own_written: Option<usize> = None;

    for _ in 0..MAX_SAVE_PASSES {
        let mut changed = false;

        for i in 0..txn.write_state().reclaim.len() {
            let (entry_txnid, remaining, taken, synced) = txn.write_state().reclaim.snapshot(i);
            if !taken || synced == Some(remaining.len()) {
                continue;
            }
            let key = encode_key(entry_txnid);
            // The tree holds a node for this key unless the last sync wrote
            // an empty remainder (pure delete).
            if synced.map_or(true, |len| len > 0) {
                btree::tree_del(txn, Dbi::Free, &key)?;
            }
            if !remaining.is_empty() {
                let mut pages = remaining;
                pages.sort_unstable();
                btree::tree_put(txn, Dbi::Free, &key, &encode_pgnos(&pages))?;
                txn.write_state_mut().reclaim.mark_synced(i, pages.len());
            } else {
                txn.write_state_mut().reclaim.mark_synced(i, 0);
            }
            changed = true;
        }

        let freed_len = txn.write_state().freed.len();
        if freed_len > 0 && own_written != Some(freed_len) {
            if own_written.is_some() {
                btree::tree_del(txn, Dbi::Free, &own_key)?;
            }
            let mut pages = txn.write_state().freed.clone();
            pages.sort_unstable();
            if pages.len() > MAX_ENTRY_PGNOS {
                tracing::warn!(
                    dropped = pages.len() - MAX_ENTRY_PGNOS,
                    "freed-page list exceeds one entry; excess pages will not be reused"
                );
                pages.truncate(MAX_ENTRY_PGNOS);
            }
            btree::tree_put(txn, Dbi::Free, &own_key, &encode_pgnos(&pages))?;
            own_written = Some(freed_len);
            changed = true;
        }

        if !changed {
            return Ok(());
        }
    }
    Err(Error::Corruption { details: "free-DB maintenance did not converge".into() })
}
