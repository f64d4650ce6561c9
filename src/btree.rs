//! B+ tree operations
//!
//! There are no parent or sibling pointers on disk. Every operation walks
//! down from the root recording `(page, index)` frames on an explicit
//! traversal stack; inserts use the stack to propagate splits upward and
//! cursors reuse the same stack shape to iterate. Write descents copy every
//! page on the path (CoW) and repoint the parent at the copy immediately,
//! so by the time a leaf is modified the whole path is private to the
//! transaction.

use crate::error::{Error, Pgno, Result};
use crate::page::{branch_need, leaf_need, Page, PageFlags, PageHeader, PAGE_SIZE};
use crate::txn::{mode, Dbi, Transaction, Write};

/// Maximum tree depth a traversal stack can record. Fanout makes real trees
/// far shallower; hitting this means a corrupt page graph.
pub(crate) const MAX_DEPTH: usize = 32;

/// One step of a root-to-leaf traversal
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    /// Page visited
    pub(crate) pgno: Pgno,
    /// Slot index taken (child index in branches, node index in leaves)
    pub(crate) index: usize,
}

impl Default for Frame {
    fn default() -> Self {
        Self { pgno: Pgno(0), index: 0 }
    }
}

/// Fixed-depth stack of traversal frames
pub(crate) struct PathStack {
    frames: [Frame; MAX_DEPTH],
    len: usize,
}

impl PathStack {
    pub(crate) fn new() -> Self {
        Self { frames: [Frame::default(); MAX_DEPTH], len: 0 }
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push(&mut self, frame: Frame) -> Result<()> {
        if self.len == MAX_DEPTH {
            return Err(Error::Corruption { details: "tree deeper than traversal stack".into() });
        }
        self.frames[self.len] = frame;
        self.len += 1;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.frames[self.len])
    }

    pub(crate) fn top(&self) -> Option<Frame> {
        self.len.checked_sub(1).map(|i| self.frames[i])
    }

    pub(crate) fn top_mut(&mut self) -> Option<&mut Frame> {
        self.len.checked_sub(1).map(move |i| &mut self.frames[i])
    }
}

/// Point lookup; returns a zero-copy view of the value
pub(crate) fn tree_get<'txn, M: mode::Mode>(
    txn: &'txn Transaction<'_, M>,
    dbi: Dbi,
    key: &[u8],
) -> Result<Option<&'txn [u8]>> {
    let mut pgno = txn.root(dbi);
    if pgno == Pgno(0) {
        return Ok(None);
    }
    for _ in 0..MAX_DEPTH {
        let page = txn.page(pgno)?;
        let (found, index) = page.search(key)?;
        if page.header.is_leaf() {
            return if found { Ok(Some(page.leaf(index)?.value)) } else { Ok(None) };
        }
        pgno = page.branch(Page::descend_index(found, index))?.child;
    }
    Err(Error::Corruption { details: "tree deeper than traversal stack".into() })
}

/// Walk a whole tree, counting pages and entries per kind
pub(crate) fn tree_stat<M: mode::Mode>(txn: &Transaction<'_, M>, dbi: Dbi) -> Result<crate::meta::Stat> {
    let mut stat = crate::meta::Stat::default();
    let root = txn.root(dbi);
    if root == Pgno(0) {
        return Ok(stat);
    }
    let mut stack = vec![(root, 1usize)];
    while let Some((pgno, depth)) = stack.pop() {
        let page = txn.page(pgno)?;
        stat.depth = stat.depth.max(depth);
        if page.header.is_leaf() {
            stat.leaf_pages += 1;
            stat.entries += page.header.num_keys() as u64;
        } else {
            stat.branch_pages += 1;
            for i in 0..page.header.num_keys() {
                stack.push((page.branch(i)?.child, depth + 1));
            }
        }
    }
    Ok(stat)
}

/// CoW descent to the leaf covering `key`. Every page on the path is made
/// dirty and its parent repointed; branch frames are pushed on `stack`.
fn descend_for_write(
    txn: &mut Transaction<'_, Write>,
    dbi: Dbi,
    key: &[u8],
    stack: &mut PathStack,
) -> Result<Pgno> {
    let mut pgno = txn.touch(txn.root(dbi))?;
    txn.set_root(dbi, pgno);
    for _ in 0..MAX_DEPTH {
        let (child_index, child) = {
            let page = txn.page(pgno)?;
            if page.header.is_leaf() {
                return Ok(pgno);
            }
            let (found, index) = page.search(key)?;
            let child_index = Page::descend_index(found, index);
            (child_index, page.branch(child_index)?.child)
        };
        stack.push(Frame { pgno, index: child_index })?;
        let new_child = txn.touch(child)?;
        if new_child != child {
            txn.dirty_page_mut(pgno)?.set_branch_child(child_index, new_child)?;
        }
        pgno = new_child;
    }
    Err(Error::Corruption { details: "tree deeper than traversal stack".into() })
}

/// Make room for `need` bytes on a dirty page: free space as-is, or heap
/// compaction when the holes left by deletions would cover it. Returns
/// whether the insert can proceed without a split.
fn ensure_space(txn: &mut Transaction<'_, Write>, pgno: Pgno, need: usize) -> Result<bool> {
    let (free, live) = {
        let page = txn.page(pgno)?;
        (page.header.free_space(), page.live_bytes()?)
    };
    if free >= need {
        return Ok(true);
    }
    if PAGE_SIZE - PageHeader::SIZE - live >= need {
        txn.dirty_page_mut(pgno)?.compact()?;
        return Ok(true);
    }
    Ok(false)
}

/// Insert `key -> value` into the tree rooted at `dbi`
pub(crate) fn tree_put(
    txn: &mut Transaction<'_, Write>,
    dbi: Dbi,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    if txn.root(dbi) == Pgno(0) {
        let leaf = txn.alloc_page(PageFlags::LEAF)?;
        txn.dirty_page_mut(leaf)?.insert_leaf(0, key, value)?;
        txn.set_root(dbi, leaf);
        return Ok(());
    }

    let mut stack = PathStack::new();
    let leaf_pgno = descend_for_write(txn, dbi, key, &mut stack)?;

    let (found, index) = txn.page(leaf_pgno)?.search(key)?;
    if found {
        return Err(Error::KeyExists);
    }
    if ensure_space(txn, leaf_pgno, leaf_need(key.len(), value.len()))? {
        // Compaction preserves slot order, so the index stays valid.
        return txn.dirty_page_mut(leaf_pgno)?.insert_leaf(index, key, value);
    }

    let (mut divider, mut right) = split_leaf(txn, leaf_pgno, key, value)?;
    while let Some(frame) = stack.pop() {
        let (_, at) = txn.page(frame.pgno)?.search(&divider)?;
        if ensure_space(txn, frame.pgno, branch_need(divider.len()))? {
            return txn.dirty_page_mut(frame.pgno)?.insert_branch(at, &divider, right);
        }
        let (up, new_right) = split_branch(txn, frame.pgno, &divider, right)?;
        divider = up;
        right = new_right;
    }

    // The root itself split: grow the tree by one level.
    let old_root = txn.root(dbi);
    let first_key = txn.page(old_root)?.key_at(0)?.to_vec();
    let new_root = txn.alloc_page(PageFlags::BRANCH)?;
    {
        let page = txn.dirty_page_mut(new_root)?;
        page.insert_branch(0, &first_key, old_root)?;
        page.insert_branch(1, &divider, right)?;
    }
    txn.set_root(dbi, new_root);
    tracing::trace!(root = new_root.0, "tree grew a level");
    Ok(())
}

/// Delete `key` from the tree rooted at `dbi`. The slot is removed; no
/// sibling merging or redistribution happens and a page may become empty.
pub(crate) fn tree_del(txn: &mut Transaction<'_, Write>, dbi: Dbi, key: &[u8]) -> Result<()> {
    if txn.root(dbi) == Pgno(0) {
        return Err(Error::NotFound);
    }
    let mut stack = PathStack::new();
    let leaf_pgno = descend_for_write(txn, dbi, key, &mut stack)?;
    let (found, index) = txn.page(leaf_pgno)?.search(key)?;
    if !found {
        return Err(Error::NotFound);
    }
    txn.dirty_page_mut(leaf_pgno)?.remove_node(index)
}

/// Split index over `sizes` (per-node bytes including the slot), balancing
/// the halves by bytes while keeping both within page capacity.
fn choose_split(sizes: &[usize]) -> Result<usize> {
    let capacity = PAGE_SIZE - PageHeader::SIZE;
    let n = sizes.len();
    debug_assert!(n >= 2);
    let total: usize = sizes.iter().sum();
    let prefix = |split: usize| sizes[..split].iter().sum::<usize>();

    let mut split = 1;
    while split < n - 1 && prefix(split) * 2 < total {
        split += 1;
    }
    while split > 1 && prefix(split) > capacity {
        split -= 1;
    }
    while split < n - 1 && total - prefix(split) > capacity {
        split += 1;
    }
    if prefix(split) > capacity || total - prefix(split) > capacity {
        return Err(Error::MapFull);
    }
    Ok(split)
}

/// Split a full leaf while inserting `(key, value)`. Returns the divider key
/// (first key of the right sibling) and the right sibling's pgno.
fn split_leaf(
    txn: &mut Transaction<'_, Write>,
    pgno: Pgno,
    key: &[u8],
    value: &[u8],
) -> Result<(Vec<u8>, Pgno)> {
    let mut items: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    {
        let page = txn.page(pgno)?;
        let (_, at) = page.search(key)?;
        for i in 0..page.header.num_keys() {
            let node = page.leaf(i)?;
            items.push((node.key.to_vec(), node.value.to_vec()));
        }
        items.insert(at, (key.to_vec(), value.to_vec()));
    }

    let sizes: Vec<usize> = items.iter().map(|(k, v)| leaf_need(k.len(), v.len())).collect();
    let split = choose_split(&sizes)?;
    let right_pgno = txn.alloc_page(PageFlags::LEAF)?;

    {
        let left = txn.dirty_page_mut(pgno)?;
        left.clear();
        for (i, (k, v)) in items[..split].iter().enumerate() {
            left.insert_leaf(i, k, v)?;
        }
    }
    {
        let right = txn.dirty_page_mut(right_pgno)?;
        for (i, (k, v)) in items[split..].iter().enumerate() {
            right.insert_leaf(i, k, v)?;
        }
    }
    tracing::trace!(left = pgno.0, right = right_pgno.0, "leaf split");
    Ok((items[split].0.clone(), right_pgno))
}

/// Split a full branch while inserting the pending `(key, child)` entry.
/// The middle key moves up to the parent; the right sibling keeps its child
/// with the key truncated to empty, which descent never consults.
fn split_branch(
    txn: &mut Transaction<'_, Write>,
    pgno: Pgno,
    key: &[u8],
    child: Pgno,
) -> Result<(Vec<u8>, Pgno)> {
    let mut items: Vec<(Vec<u8>, Pgno)> = Vec::new();
    {
        let page = txn.page(pgno)?;
        let (_, at) = page.search(key)?;
        for i in 0..page.header.num_keys() {
            let node = page.branch(i)?;
            items.push((node.key.to_vec(), node.child));
        }
        items.insert(at, (key.to_vec(), child));
    }

    let sizes: Vec<usize> = items.iter().map(|(k, _)| branch_need(k.len())).collect();
    let split = choose_split(&sizes)?;
    let up_key = items[split].0.clone();
    let right_pgno = txn.alloc_page(PageFlags::BRANCH)?;

    {
        let left = txn.dirty_page_mut(pgno)?;
        left.clear();
        for (i, (k, c)) in items[..split].iter().enumerate() {
            left.insert_branch(i, k, *c)?;
        }
    }
    {
        let right = txn.dirty_page_mut(right_pgno)?;
        right.insert_branch(0, b"", items[split].1)?;
        for (i, (k, c)) in items[split + 1..].iter().enumerate() {
            right.insert_branch(i + 1, k, *c)?;
        }
    }
    tracing::trace!(left = pgno.0, right = right_pgno.0, "branch split");
    Ok((up_key, right_pgno))
}
