//! Single-writer trie body (component D): lookup, insert, delete, and
//! the copy-on-write machinery that keeps published (immutable) twig
//! runs untouched while the writer edits its private working copy.
//!
//! Grounded on `qp.c`'s `dns_qp_getleaf`/`dns_qp_insert`/
//! `dns_qp_deleteleaf`, and its `make_root_mutable`/`make_twigs_mutable`
//! copy-on-write helpers.

use std::sync::Arc;

use crate::arena::Arena;
use crate::error::TrieError;
use crate::key::{KEY_EQUAL, Shift, TrieKey};
use crate::methods::Methods;
use crate::node::{self, Cell, NodeRef};

/// The writer-owned trie body shared by every transaction mode in
/// `transaction.rs`. Not `Send`/`Sync` on its own — it's always reached
/// through the single-writer mutex in `multi.rs`. `methods` is an `Arc`
/// rather than an owned `M` so that [`crate::reader::Reader`] and
/// [`crate::reader::Snapshot`] can carry their own cheap handle to the
/// same callback bundle without touching the writer's mutex.
pub(crate) struct Trie<M: Methods> {
    pub(crate) arena: Arena,
    pub(crate) root: NodeRef,
    pub(crate) leaf_count: u64,
    pub(crate) methods: Arc<M>,
    /// Bumped by `MultiTrie::commit` each time it publishes a new root;
    /// carried on the reader anchor so snapshots can report which
    /// generation they pinned.
    pub(crate) generation: u64,
    /// Whether the most recently *completed* transaction (committed or
    /// rolled back) was a `write`. Lets `Transaction::open_write` decide
    /// whether it may keep reusing the current bump chunk (spec §4.F:
    /// "if previous mode was write, set fender ...; else reset the
    /// allocator") instead of always starting a fresh one.
    pub(crate) last_write: bool,
}

impl<M: Methods> Trie<M> {
    pub(crate) fn new(arena: Arena, methods: Arc<M>) -> Self {
        Trie { arena, root: NodeRef::INVALID, leaf_count: 0, methods, generation: 0, last_write: false }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.root.is_valid()
    }

    /// Look up `key`, returning the `(pval, ival)` of its leaf if found.
    pub(crate) fn get(&self, key: &TrieKey) -> Option<(*mut (), u32)> {
        node::lookup(self.root, key, |p, i| self.methods.makekey(p, i), |r| self.arena.cell(r))
    }

    /// Insert `pval`/`ival` under the key `self.methods.makekey` derives
    /// for it. Mirrors `qp.c::dns_qp_insert`'s three cases: empty trie,
    /// new-branch split at the first differing bit, and grow-branch
    /// (insert a twig into an existing branch).
    pub(crate) fn insert(&mut self, pval: *mut (), ival: u32) -> Result<(), TrieError> {
        let key = self.methods.makekey(pval, ival);
        if self.is_empty() {
            self.root = self.new_leaf(pval, ival);
            self.methods.attach(pval, ival);
            self.leaf_count += 1;
            return Ok(());
        }

        // Probe: descend from the root following this key's bit whenever
        // a branch has a twig for it, or an arbitrary existing twig
        // (position 0) when it doesn't, until bottoming out at a leaf.
        // The probe never stops early at a branch — a branch missing
        // this key's bit doesn't mean the divergence is *here*; it could
        // be above or below this branch's own offset, and the only way
        // to find out is to keep going and compare whatever leaf we
        // reach (the "witness") against the new key (qp.c's insert
        // probe, `qp.c:1509-1511`: `branch_has_twig(n, bit) ?
        // branch_twig_pos(n, bit) : 0`).
        let mut path: Vec<(NodeRef, Shift)> = Vec::new();
        let mut n = self.root;
        let mut cell = self.arena.cell(n);
        while cell.is_branch() {
            let bit = key.bit_at(cell.key_offset());
            path.push((n, bit));
            let pos = if cell.has_twig(bit) { cell.twig_pos(bit) } else { 0 };
            n = NodeRef { chunk: cell.twigs_ref().chunk, cell: cell.twigs_ref().cell + pos as u32 };
            cell = self.arena.cell(n);
        }
        let witness = n;

        let existing_key = self.methods.makekey(cell.pval(), cell.ival());
        let offset = TrieKey::compare(&existing_key, &key);
        if offset == KEY_EQUAL {
            return Err(TrieError::Exists);
        }

        // Re-walk `path` (branch offsets strictly increase root to leaf)
        // to find exactly where `offset` falls. Every branch strictly
        // above `offset` was genuinely descended via this key's own bit
        // during the probe (the two keys agree up to any such branch's
        // offset, so its twig for this key's bit must already exist) —
        // so `path` up to `i` is trustworthy regardless of whether the
        // probe took a wrong turn further down.
        let mut i = 0;
        while i < path.len() && self.branch_offset_lt(path[i].0, offset) {
            i += 1;
        }
        if i < path.len() && self.arena.cell(path[i].0).key_offset() == offset {
            // The divergence is exactly at an existing branch's own
            // offset: insert a new twig there.
            let (branch, bit) = path[i];
            return self.growbranch(branch, bit, pval, ival);
        }
        // The divergence is strictly above whatever currently sits at
        // this point in the trie — another branch further down the path
        // (`i < path.len()`), or the witness leaf itself if `offset` is
        // past every branch on the path. Either way, splice a fresh
        // branch in its place.
        let child = if i < path.len() { path[i].0 } else { witness };
        self.newbranch_splitting(i, &path, child, pval, ival, key, offset)
    }

    fn branch_offset_lt(&self, branch: NodeRef, offset: usize) -> bool {
        self.arena.cell(branch).key_offset() < offset
    }

    /// Insert a new twig into an existing branch (qp.c's `growbranch`).
    /// `bit` must be absent from `branch`'s bitmap — callers only reach
    /// this once `offset` has been confirmed to equal the branch's own
    /// key offset, which is exactly the condition under which the
    /// probed bit can't already be a member (see `insert`).
    fn growbranch(&mut self, branch: NodeRef, bit: Shift, pval: *mut (), ival: u32) -> Result<(), TrieError> {
        let branch = self.make_twigs_mutable_path(branch);
        let cell = self.arena.cell(branch);
        let old_twigs = cell.twigs_ref();
        let old_size = cell.twigs_size();
        debug_assert!(!cell.has_twig(bit), "growbranch called with a bit already present");
        let pos = cell.twig_pos(bit);
        let new_twigs = self.arena.alloc_twigs((old_size + 1) as u32);
        self.arena.move_twigs(new_twigs, old_twigs, pos);
        self.arena.write_twig(new_twigs, pos, self.new_leaf_cell(pval, ival));
        if pos < old_size {
            let rest = NodeRef { chunk: new_twigs.chunk, cell: new_twigs.cell + pos as u32 + 1 };
            let rest_src = NodeRef { chunk: old_twigs.chunk, cell: old_twigs.cell + pos as u32 };
            self.arena.move_twigs(rest, rest_src, old_size - pos);
        }
        if old_size > 0 && !self.arena.free_twigs(old_twigs, old_size as u32) {
            // Deferred (old run still immutable and readable): every
            // twig in `new_twigs` now needs its own attach — the
            // duplicated old twigs because the old run they were
            // bit-copied from is still alive too, and the freshly
            // inserted leaf at `pos` because every insert attaches its
            // new leaf exactly once regardless of how it was spliced in
            // (qp.c `growbranch`'s `attach_leaf`/`attach_twigs` over the
            // whole new run, `qp.c:1586`/`1589`). One sweep over the
            // full contiguous range covers both.
            self.reattach_duplicated(new_twigs, (old_size + 1) as usize);
        } else {
            // Old run destroyed outright (or never existed): only the
            // newly inserted leaf gained a reference.
            self.methods.attach(pval, ival);
        }
        let new_bitmap = cell.bitmap() | (1u64 << bit);
        let new_cell = cell.with_bitmap(new_bitmap).with_twigs_ref(new_twigs);
        self.set_cell(branch, new_cell);
        self.leaf_count += 1;
        Ok(())
    }

    /// Splice a fresh two-twig branch in at key offset `offset`,
    /// displacing whatever currently occupies `child`: another branch
    /// further down the probed path (when the new key diverges strictly
    /// above it, `i < path.len()`), or the leaf the probe bottomed out
    /// at (when the divergence is below every branch on the path, `i ==
    /// path.len()`). `i == 0` additionally covers splitting the root
    /// itself, whether it's a leaf or a branch. Mirrors qp.c's
    /// `newbranch` (`qp.c:1540-1560`).
    fn newbranch_splitting(
        &mut self,
        i: usize,
        path: &[(NodeRef, Shift)],
        child: NodeRef,
        pval: *mut (),
        ival: u32,
        key: TrieKey,
        offset: usize,
    ) -> Result<(), TrieError> {
        let existing_bit = self.bit_of_leaf_at(child, offset);
        let new_bit = key.bit_at(offset);
        let twigs = self.arena.alloc_twigs(2);
        if new_bit < existing_bit {
            self.arena.write_twig(twigs, 0, self.new_leaf_cell(pval, ival));
            self.copy_twig_into(twigs, 1, child);
        } else {
            self.copy_twig_into(twigs, 0, child);
            self.arena.write_twig(twigs, 1, self.new_leaf_cell(pval, ival));
        }
        self.methods.attach(pval, ival);
        let bitmap = (1u64 << existing_bit) | (1u64 << new_bit);
        let new_branch_ref = self.arena.alloc_twigs(1);
        self.arena.write_twig(new_branch_ref, 0, Cell::make_branch(bitmap, offset, twigs));
        let new_branch = self.arena.cell(new_branch_ref);

        if i == 0 {
            self.root = new_branch_ref;
        } else {
            let (above, above_bit) = path[i - 1];
            let above = self.make_twigs_mutable_path(above);
            let cell = self.arena.cell(above);
            let pos = cell.twig_pos(above_bit);
            let slot = NodeRef { chunk: cell.twigs_ref().chunk, cell: cell.twigs_ref().cell + pos as u32 };
            self.arena.write_twig(slot, 0, new_branch);
        }
        self.leaf_count += 1;
        Ok(())
    }

    /// Walk down from `key`'s divergence leaf to read which bit it
    /// occupies at `offset` (the leaf itself has no branch node, so its
    /// "bit" is simply its key's bit at that offset).
    fn bit_of_leaf_at(&self, mut n: NodeRef, offset: usize) -> Shift {
        let mut cell = self.arena.cell(n);
        while cell.is_branch() {
            let twigs = cell.twigs_ref();
            n = NodeRef { chunk: twigs.chunk, cell: twigs.cell };
            cell = self.arena.cell(n);
        }
        let leaf_key = self.methods.makekey(cell.pval(), cell.ival());
        leaf_key.bit_at(offset)
    }

    fn copy_twig_into(&mut self, twigs: NodeRef, pos: usize, src: NodeRef) {
        let cell = self.arena.cell(src);
        self.arena.write_twig(twigs, pos, cell);
        if cell.is_leaf_tagged() && !cell.pval().is_null() {
            self.methods.attach(cell.pval(), cell.ival());
        }
    }

    /// Re-`attach` every leaf among `count` twigs starting at `twigs`.
    /// Called after bit-copying a run whose old location was immutable
    /// and so could not be destroyed (`Arena::free_twigs` returned
    /// `false`): the old and new copies are now both live, so each
    /// duplicated leaf has gained a reference (spec §4.D grow-branch:
    /// "if the old run was immutable ... re-attach all duplicated
    /// leaves").
    fn reattach_duplicated(&self, twigs: NodeRef, count: usize) {
        for pos in 0..count {
            let cell = self.arena.twig(twigs, pos);
            if cell.is_leaf_tagged() && !cell.pval().is_null() {
                self.methods.attach(cell.pval(), cell.ival());
            }
        }
    }

    fn new_leaf(&mut self, pval: *mut (), ival: u32) -> NodeRef {
        let r = self.arena.alloc_twigs(1);
        self.arena.write_twig(r, 0, Cell::make_leaf(pval, ival));
        r
    }

    fn new_leaf_cell(&self, pval: *mut (), ival: u32) -> Cell {
        Cell::make_leaf(pval, ival)
    }

    fn set_cell(&mut self, at: NodeRef, cell: Cell) {
        self.arena.write_twig(at, 0, cell);
    }

    /// If `n`'s *own* cell sits in an immutable chunk, duplicate just
    /// that one cell into the current bump chunk and return the fresh
    /// reference. This is the one-cell copy-on-write step qp.c performs
    /// while descending a `make_root_mutable`/`make_twigs_mutable` path.
    fn make_twigs_mutable_path(&mut self, n: NodeRef) -> NodeRef {
        if !self.arena.cells_immutable(n) {
            return n;
        }
        let cell = self.arena.cell(n);
        let fresh = self.arena.alloc_twigs(1);
        self.arena.write_twig(fresh, 0, cell);
        if n == self.root {
            self.root = fresh;
        }
        fresh
    }

    /// Remove the leaf matching `key`. Mirrors `qp.c::dns_qp_deleteleaf`:
    /// shrink-in-place for branches with more than two twigs, collapse
    /// (replace the branch with its sole remaining sibling) when exactly
    /// two twigs remain.
    pub(crate) fn delete(&mut self, key: &TrieKey) -> Result<(*mut (), u32), TrieError> {
        if self.is_empty() {
            return Err(TrieError::NotFound);
        }
        let mut path: Vec<(NodeRef, Shift)> = Vec::new();
        let mut n = self.root;
        let mut cell = self.arena.cell(n);
        while cell.is_branch() {
            let bit = key.bit_at(cell.key_offset());
            if !cell.has_twig(bit) {
                return Err(TrieError::NotFound);
            }
            path.push((n, bit));
            let pos = cell.twig_pos(bit);
            n = NodeRef { chunk: cell.twigs_ref().chunk, cell: cell.twigs_ref().cell + pos as u32 };
            cell = self.arena.cell(n);
        }
        let found_key = self.methods.makekey(cell.pval(), cell.ival());
        if TrieKey::compare(&found_key, key) != KEY_EQUAL {
            return Err(TrieError::NotFound);
        }
        let removed = (cell.pval(), cell.ival());
        self.methods.detach(removed.0, removed.1);

        let Some(&(branch, bit)) = path.last() else {
            // Trie held exactly one leaf at the root.
            self.root = NodeRef::INVALID;
            self.leaf_count -= 1;
            return Ok(removed);
        };

        let branch_ref = self.make_twigs_mutable_path(branch);
        let bcell = self.arena.cell(branch_ref);
        let old_twigs = bcell.twigs_ref();
        let old_size = bcell.twigs_size();
        let pos = bcell.twig_pos(bit);

        if old_size == 2 {
            // Collapse: the branch disappears, replaced by its one
            // remaining sibling twig.
            let sibling_pos = 1 - pos;
            let sibling = self.arena.twig(old_twigs, sibling_pos);
            let destroyed = old_size == 0 || self.arena.free_twigs(old_twigs, old_size as u32);
            if !destroyed && sibling.is_leaf_tagged() && !sibling.pval().is_null() {
                self.methods.attach(sibling.pval(), sibling.ival());
            }
            if path.len() == 1 {
                let fresh = self.arena.alloc_twigs(1);
                self.arena.write_twig(fresh, 0, sibling);
                self.root = fresh;
            } else {
                let (above, above_bit) = path[path.len() - 2];
                let above = self.make_twigs_mutable_path(above);
                let acell = self.arena.cell(above);
                let apos = acell.twig_pos(above_bit);
                let slot = NodeRef { chunk: acell.twigs_ref().chunk, cell: acell.twigs_ref().cell + apos as u32 };
                self.arena.write_twig(slot, 0, sibling);
            }
        } else {
            let new_twigs = self.arena.alloc_twigs((old_size - 1) as u32);
            self.arena.move_twigs(new_twigs, old_twigs, pos);
            if pos + 1 < old_size {
                let rest_dst = NodeRef { chunk: new_twigs.chunk, cell: new_twigs.cell + pos as u32 };
                let rest_src = NodeRef { chunk: old_twigs.chunk, cell: old_twigs.cell + pos as u32 + 1 };
                self.arena.move_twigs(rest_dst, rest_src, old_size - pos - 1);
            }
            if !self.arena.free_twigs(old_twigs, old_size as u32) {
                self.reattach_duplicated(new_twigs, pos);
                if pos + 1 < old_size {
                    let rest_dst = NodeRef { chunk: new_twigs.chunk, cell: new_twigs.cell + pos as u32 };
                    self.reattach_duplicated(rest_dst, old_size - pos - 1);
                }
            }
            let new_bitmap = bcell.bitmap() & !(1u64 << bit);
            let new_cell = bcell.with_bitmap(new_bitmap).with_twigs_ref(new_twigs);
            self.set_cell(branch_ref, new_cell);
        }

        self.leaf_count -= 1;
        Ok(removed)
    }
}
