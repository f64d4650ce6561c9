//! Meta pages and live-meta selection
//!
//! Pages 0 and 1 hold one meta page each. A commit writes the meta page the
//! live one does NOT occupy, then fsyncs it; the page with the higher valid
//! txnid is the live one on the next open. Because txnids increase by one per
//! commit, the meta page a transaction writes is simply `txnid % 2`.

use crate::error::{Error, Pgno, Result, TxnId};
use crate::page::PAGE_SIZE;
use static_assertions::const_assert;
use std::mem::size_of;

/// Page number of the first meta page
pub const META_PAGE_0: Pgno = Pgno(0);

/// Page number of the second meta page
pub const META_PAGE_1: Pgno = Pgno(1);

/// Magic number identifying database files
pub const MAGIC: u32 = 0xDECA_FBAD;

/// On-disk format version
pub const DB_VERSION: u32 = 1;

/// Tree statistics gathered by a full walk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Height of the tree; 1 is a single leaf, 0 an empty tree
    pub depth: usize,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of entries
    pub entries: u64,
}

/// Meta page contents. The struct occupies the head of the page; the rest of
/// the 4096 bytes is reserved and zero.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MetaPage {
    /// Magic number
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Transaction that wrote this meta page
    pub txnid: u64,
    /// Root page of the main tree (0 = empty tree)
    pub root: u64,
    /// Highest page number in use
    pub last_pgno: u64,
    /// Root page of the free DB (0 = empty tree)
    pub free_db_root: u64,
}

const_assert!(size_of::<MetaPage>() == 40);
const_assert!(size_of::<MetaPage>() <= PAGE_SIZE);

impl MetaPage {
    /// Meta page written when a file is first created, per meta slot.
    ///
    /// Slot 0 carries txnid 0 and slot 1 carries txnid 1, so slot 1 is live
    /// on a fresh database and the first commit (txnid 2) targets slot 0.
    pub fn initial(slot: u64) -> Self {
        Self {
            magic: MAGIC,
            version: DB_VERSION,
            txnid: slot,
            root: 0,
            last_pgno: 1,
            free_db_root: 0,
        }
    }

    /// Validate magic and version
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Corruption {
                details: format!("invalid magic number: 0x{:08x}", self.magic),
            });
        }
        if self.version != DB_VERSION {
            return Err(Error::VersionMismatch { expected: DB_VERSION, found: self.version });
        }
        Ok(())
    }

    /// Txnid as a typed id
    pub fn txnid(&self) -> TxnId {
        TxnId(self.txnid)
    }

    /// Meta slot (0 or 1) the commit with this txnid writes to
    pub fn slot_for(txnid: TxnId) -> Pgno {
        Pgno(txnid.0 % 2)
    }
}

/// Pick the live meta out of the two candidates read at open.
///
/// Both valid: higher txnid wins. One valid: it wins. Neither: the file is
/// not a database we can open.
pub fn select_live(meta0: &MetaPage, meta1: &MetaPage) -> Result<MetaPage> {
    let valid0 = meta0.validate().is_ok();
    let valid1 = meta1.validate().is_ok();
    match (valid0, valid1) {
        (true, true) => {
            if meta0.txnid >= meta1.txnid {
                Ok(*meta0)
            } else {
                Ok(*meta1)
            }
        }
        (true, false) => Ok(*meta0),
        (false, true) => Ok(*meta1),
        (false, false) => {
            // Report the more interesting failure: a version mismatch beats
            // a garbage page.
            meta0.validate()?;
            meta1.validate()?;
            unreachable!()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_metas() {
        let meta0 = MetaPage::initial(0);
        let meta1 = MetaPage::initial(1);
        assert!(meta0.validate().is_ok());
        let live = select_live(&meta0, &meta1).unwrap();
        assert_eq!(live.txnid, 1);
        assert_eq!(live.root, 0);
        assert_eq!(live.last_pgno, 1);
    }

    #[test]
    fn test_validation() {
        let mut meta = MetaPage::initial(1);
        assert!(meta.validate().is_ok());

        meta.magic = 0xDEAD_BEEF;
        assert!(matches!(meta.validate(), Err(Error::Corruption { .. })));

        meta.magic = MAGIC;
        meta.version = 7;
        assert!(matches!(
            meta.validate(),
            Err(Error::VersionMismatch { expected: DB_VERSION, found: 7 })
        ));
    }

    #[test]
    fn test_live_selection_prefers_valid() {
        let mut stale = MetaPage::initial(0);
        stale.magic = 0;
        let good = MetaPage::initial(1);
        assert_eq!(select_live(&stale, &good).unwrap().txnid, 1);
        assert_eq!(select_live(&good, &stale).unwrap().txnid, 1);
        assert!(select_live(&stale, &stale).is_err());
    }

    #[test]
    fn test_slot_alternates() {
        assert_eq!(MetaPage::slot_for(TxnId(1)), META_PAGE_1);
        assert_eq!(MetaPage::slot_for(TxnId(2)), META_PAGE_0);
        assert_eq!(MetaPage::slot_for(TxnId(3)), META_PAGE_1);
    }
}
