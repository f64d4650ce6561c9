//! Database cursors
//!
//! A cursor is a traversal stack plus an eof flag. There are no sibling
//! pointers on disk; NEXT and PREV cross page boundaries by popping exhausted
//! frames and descending into the adjacent child. Frames store page numbers,
//! not references; pages are re-fetched through the transaction on use.

use crate::btree::{Frame, PathStack, MAX_DEPTH};
use crate::error::{Error, Pgno, Result};
use crate::page::Page;
use crate::txn::{mode, Dbi, Transaction};

/// A key/value pair viewed zero-copy out of the transaction's snapshot
pub type Entry<'txn> = (&'txn [u8], &'txn [u8]);

/// A cursor over one tree of a transaction
pub struct Cursor<'txn, 'env, M: mode::Mode> {
    txn: &'txn Transaction<'env, M>,
    dbi: Dbi,
    stack: PathStack,
    eof: bool,
    initialized: bool,
}

impl<'txn, 'env, M: mode::Mode> Cursor<'txn, 'env, M> {
    pub(crate) fn new(txn: &'txn Transaction<'env, M>, dbi: Dbi) -> Self {
        Self { txn, dbi, stack: PathStack::new(), eof: false, initialized: false }
    }

    /// Fetch a page with the transaction's full lifetime, so returned
    /// key/value slices outlive `&mut self` calls on the cursor.
    fn page(&self, pgno: Pgno) -> Result<&'txn Page> {
        let txn: &'txn Transaction<'env, M> = self.txn;
        txn.page(pgno)
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.eof = false;
        self.initialized = false;
    }

    fn top_leaf_len(&self) -> Result<usize> {
        match self.stack.top() {
            Some(frame) => Ok(self.page(frame.pgno)?.header.num_keys()),
            None => Ok(0),
        }
    }

    /// Entry under the cursor, or `None` when unpositioned or past the end
    pub fn get_current(&self) -> Result<Option<Entry<'txn>>> {
        if self.eof {
            return Ok(None);
        }
        let Some(top) = self.stack.top() else {
            return Ok(None);
        };
        let page = self.page(top.pgno)?;
        if !page.header.is_leaf() || top.index >= page.header.num_keys() {
            return Ok(None);
        }
        let node = page.leaf(top.index)?;
        Ok(Some((node.key, node.value)))
    }

    /// Position at the first entry
    pub fn first(&mut self) -> Result<Option<Entry<'txn>>> {
        self.reset();
        self.initialized = true;
        let root = self.txn.root(self.dbi);
        if root == Pgno(0) {
            self.eof = true;
            return Ok(None);
        }
        self.descend_leftmost(root)?;
        if self.top_leaf_len()? == 0 && !self.next_leaf()? {
            return Ok(None);
        }
        self.get_current()
    }

    /// Position at the last entry
    pub fn last(&mut self) -> Result<Option<Entry<'txn>>> {
        self.reset();
        self.initialized = true;
        let root = self.txn.root(self.dbi);
        if root == Pgno(0) {
            self.eof = true;
            return Ok(None);
        }
        self.descend_rightmost(root)?;
        if self.top_leaf_len()? == 0 && !self.prev_leaf()? {
            return Ok(None);
        }
        self.get_current()
    }

    /// Position at `key` exactly
    pub fn set(&mut self, key: &[u8]) -> Result<Entry<'txn>> {
        match self.seek(key)? {
            Some((k, v)) if k == key => Ok((k, v)),
            _ => {
                self.reset();
                Err(Error::NotFound)
            }
        }
    }

    /// Position at the first entry whose key is `>= key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        self.seek(key)
    }

    /// Advance to the next entry. An unpositioned cursor starts at FIRST.
    pub fn next(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.initialized {
            return self.first();
        }
        if self.eof || self.stack.is_empty() {
            return Ok(None);
        }
        let index = match self.stack.top_mut() {
            Some(top) => {
                top.index += 1;
                top.index
            }
            None => return Ok(None),
        };
        if index < self.top_leaf_len()? {
            return self.get_current();
        }
        if !self.next_leaf()? {
            return Ok(None);
        }
        self.get_current()
    }

    /// Step back to the previous entry. An unpositioned cursor starts at LAST.
    pub fn prev(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.initialized {
            return self.last();
        }
        if self.eof || self.stack.is_empty() {
            return Ok(None);
        }
        let stepped = match self.stack.top_mut() {
            Some(top) if top.index > 0 => {
                top.index -= 1;
                true
            }
            Some(_) => false,
            None => return Ok(None),
        };
        if stepped {
            return self.get_current();
        }
        if !self.prev_leaf()? {
            return Ok(None);
        }
        self.get_current()
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        self.reset();
        self.initialized = true;
        let mut pgno = self.txn.root(self.dbi);
        if pgno == Pgno(0) {
            self.eof = true;
            return Ok(None);
        }
        for _ in 0..MAX_DEPTH {
            let page = self.page(pgno)?;
            let (found, index) = page.search(key)?;
            if page.header.is_leaf() {
                // `index` is the first slot >= key; it may be one past the
                // last node, in which case the answer is on a later leaf.
                self.stack.push(Frame { pgno, index })?;
                if index >= page.header.num_keys() && !self.next_leaf()? {
                    return Ok(None);
                }
                return self.get_current();
            }
            let child_index = Page::descend_index(found, index);
            self.stack.push(Frame { pgno, index: child_index })?;
            pgno = page.branch(child_index)?.child;
        }
        Err(Error::Corruption { details: "tree deeper than traversal stack".into() })
    }

    fn descend_leftmost(&mut self, mut pgno: Pgno) -> Result<()> {
        for _ in 0..MAX_DEPTH {
            let page = self.page(pgno)?;
            self.stack.push(Frame { pgno, index: 0 })?;
            if page.header.is_leaf() {
                return Ok(());
            }
            pgno = page.branch(0)?.child;
        }
        Err(Error::Corruption { details: "tree deeper than traversal stack".into() })
    }

    fn descend_rightmost(&mut self, mut pgno: Pgno) -> Result<()> {
        for _ in 0..MAX_DEPTH {
            let page = self.page(pgno)?;
            let last = page.header.num_keys().saturating_sub(1);
            self.stack.push(Frame { pgno, index: last })?;
            if page.header.is_leaf() {
                return Ok(());
            }
            pgno = page.branch(last)?.child;
        }
        Err(Error::Corruption { details: "tree deeper than traversal stack".into() })
    }

    /// Walk to the first entry of the next non-empty leaf. Clears the
    /// position and reports `false` at the end of the tree.
    fn next_leaf(&mut self) -> Result<bool> {
        loop {
            self.stack.pop();
            let child = loop {
                let Some(frame) = self.stack.top() else {
                    self.eof = true;
                    return Ok(false);
                };
                let page = self.page(frame.pgno)?;
                if frame.index + 1 < page.header.num_keys() {
                    let child = page.branch(frame.index + 1)?.child;
                    if let Some(top) = self.stack.top_mut() {
                        top.index = frame.index + 1;
                    }
                    break child;
                }
                self.stack.pop();
            };
            self.descend_leftmost(child)?;
            if self.top_leaf_len()? > 0 {
                return Ok(true);
            }
        }
    }

    /// Walk to the last entry of the previous non-empty leaf
    fn prev_leaf(&mut self) -> Result<bool> {
        loop {
            self.stack.pop();
            let child = loop {
                let Some(frame) = self.stack.top() else {
                    self.eof = true;
                    return Ok(false);
                };
                if frame.index > 0 {
                    let child = self.page(frame.pgno)?.branch(frame.index - 1)?.child;
                    if let Some(top) = self.stack.top_mut() {
                        top.index = frame.index - 1;
                    }
                    break child;
                }
                self.stack.pop();
            };
            self.descend_rightmost(child)?;
            if self.top_leaf_len()? > 0 {
                return Ok(true);
            }
        }
    }
}
