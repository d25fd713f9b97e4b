//! Compaction and chunk reclamation (component E).
//!
//! Grounded on qp.c's garbage collector section: `evacuate` (here
//! folded into `compact_recursive`'s per-node rewrite), `compact`,
//! `recycle`, `defer_chunk_reclamation`, `reclaim_chunks`, and the
//! snapshot release path that used to run through `marksweep_chunks`.

use crate::methods::Methods;
use crate::node::{Cell, NodeRef};
use crate::reclaim::{PendingReclaim, ReclamationCoordinator, Worklist};
use crate::trie::Trie;

/// How aggressively [`Trie::compact`] should run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompactMode {
    /// Only evacuate chunks below `TrieConfig::min_used`.
    Auto,
    /// Evacuate every fragmented chunk regardless of `min_used` — used
    /// before dropping a trie wholesale, or on explicit caller request.
    Full,
}

impl<M: Methods> Trie<M> {
    /// Recursively rebuild the subtree rooted at `at`, copying any live
    /// twigs run that lives in a chunk due for evacuation into the
    /// current bump chunk.
    fn compact_recursive(&mut self, at: NodeRef, mode: CompactMode) -> NodeRef {
        let cell = self.arena.cell(at);
        if cell.is_leaf_tagged() {
            return at;
        }
        let twigs = cell.twigs_ref();
        let size = cell.twigs_size();
        let mut rebuilt: Vec<Cell> = Vec::with_capacity(size);
        for pos in 0..size {
            let child = NodeRef { chunk: twigs.chunk, cell: twigs.cell + pos as u32 };
            let child = self.compact_recursive(child, mode);
            rebuilt.push(self.arena.cell(child));
        }
        if !self.chunk_needs_evacuation(twigs.chunk, mode) {
            return at;
        }
        let fresh = self.arena.alloc_twigs(size as u32);
        for (pos, twig) in rebuilt.iter().enumerate() {
            self.arena.write_twig(fresh, pos, *twig);
        }
        if !self.arena.free_twigs(twigs, size as u32) {
            // Old run still immutable and reachable: every twig just
            // copied into `fresh` now has two live homes, so each
            // duplicated leaf needs another attach (spec §4.E evacuate:
            // "if free was deferred, re-invoke attach on each leaf in
            // the new run").
            for twig in rebuilt.iter() {
                if twig.is_leaf_tagged() && !twig.pval().is_null() {
                    self.methods.attach(twig.pval(), twig.ival());
                }
            }
        }
        let new_branch = self.arena.alloc_twigs(1);
        self.arena.write_twig(new_branch, 0, cell.with_twigs_ref(fresh));
        new_branch
    }

    fn chunk_needs_evacuation(&self, chunk: u32, mode: CompactMode) -> bool {
        let usage = &self.arena.usage[chunk as usize];
        if !usage.exists || usage.free == 0 {
            return false;
        }
        match mode {
            CompactMode::Full => true,
            CompactMode::Auto => self.arena.chunk_live(chunk) < self.arena.config.min_used,
        }
    }

    /// Run a compaction pass over the whole trie, then immediately free
    /// any chunk left fully empty and unpinned.
    pub fn compact(&mut self, mode: CompactMode) {
        if self.is_empty() {
            return;
        }
        self.root = self.compact_recursive(self.root, mode);
        self.recycle();
    }

    /// Free every existing, non-immutable, unpinned chunk with zero live
    /// cells. Safe because a non-immutable chunk was never published.
    fn recycle(&mut self) {
        let max = self.arena.chunk_max();
        for chunk in 0..max {
            let usage = self.arena.usage[chunk as usize];
            if usage.exists
                && !usage.immutable
                && !usage.snapshot
                && chunk != self.arena.bump
                && self.arena.chunk_live(chunk) == 0
            {
                let methods = &self.methods;
                self.arena.chunk_free(chunk, |pval, ival| methods.detach(pval, ival));
            }
        }
    }

    /// Tag every emptied-but-immutable chunk (possibly still reachable
    /// from a reader that pinned an earlier generation) for deferred
    /// reclamation once `coordinator` reports quiescence. A chunk a live
    /// snapshot still references is never queued directly; it's marked
    /// `snapfree` instead, so `marksweep_chunks` can free it the moment
    /// the last snapshot holding it is dropped.
    pub(crate) fn defer_chunk_reclamation(&mut self, worklist: &Worklist, coordinator: &dyn ReclamationCoordinator) {
        let phase = coordinator.phase();
        let max = self.arena.chunk_max();
        for chunk in 0..max {
            let usage = &mut self.arena.usage[chunk as usize];
            if usage.exists && usage.immutable && usage.phase == 0 {
                let live = usage.used - usage.free;
                if live == 0 {
                    if usage.snapshot {
                        usage.snapfree = true;
                    } else {
                        usage.phase = phase;
                        worklist.push(PendingReclaim { phase, chunk });
                    }
                }
            }
        }
    }

    /// Free every chunk the worklist reports as fully drained.
    pub(crate) fn reclaim_chunks(&mut self, worklist: &Worklist, coordinator: &dyn ReclamationCoordinator) {
        for chunk in worklist.drain_ready(coordinator) {
            if self.arena.usage[chunk as usize].exists {
                let methods = &self.methods;
                self.arena.chunk_free(chunk, |pval, ival| methods.detach(pval, ival));
            }
        }
    }

    /// Recompute which chunks are held back by a live
    /// [`crate::reader::Snapshot`], given the full set of chunks every
    /// *remaining* snapshot still references. Called whenever a snapshot
    /// is dropped (spec §4.E/§4.G `marksweep_chunks`): mark every chunk
    /// in `pinned`, then for every chunk in the arena, `snapshot` takes
    /// over the (now cleared) `snapmark`, and anything that was
    /// separately flagged `snapfree` by a deferred-reclamation pass but
    /// is no longer pinned gets freed immediately.
    pub(crate) fn marksweep_chunks(&mut self, pinned: &[u32]) {
        for &chunk in pinned {
            if let Some(usage) = self.arena.usage.get_mut(chunk as usize) {
                usage.snapmark = true;
            }
        }
        let max = self.arena.chunk_max();
        let mut to_free = Vec::new();
        for chunk in 0..max {
            let usage = &mut self.arena.usage[chunk as usize];
            usage.snapshot = usage.snapmark;
            usage.snapmark = false;
            if usage.snapfree && !usage.snapshot {
                to_free.push(chunk);
            }
        }
        for chunk in to_free {
            let methods = &self.methods;
            self.arena.chunk_free(chunk, |pval, ival| methods.detach(pval, ival));
        }
    }
}
