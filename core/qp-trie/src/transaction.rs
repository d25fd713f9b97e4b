//! Transaction manager (component F): `write` vs `update` modes,
//! `commit`, `rollback`.
//!
//! Grounded on qp.c's transaction API: a `write` transaction is the
//! cheap default (no pre-image kept, cannot be rolled back); an
//! `update` transaction additionally captures a `Shadow` of the
//! writer's top-level state so the whole transaction can be undone.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::arena::ChunkUsage;
use crate::compact::CompactMode;
use crate::error::TrieError;
use crate::key::TrieKey;
use crate::methods::Methods;
use crate::node::NodeRef;
use crate::trie::Trie;

struct Shadow {
    root: NodeRef,
    leaf_count: u64,
    used_count: u64,
    free_count: u64,
    hold_count: u64,
    bump: u32,
    fender: u32,
    last_write: bool,
    /// A full clone of the per-chunk usage bookkeeping as of
    /// transaction-open time. `rollback` needs more than just which
    /// slots existed: the transaction may have kept writing into the
    /// chunk that was already the bump chunk before it opened (spec
    /// §4.F "write: keep the same bump chunk"), bumping that chunk's
    /// own `used`/`free` past their pre-transaction values — restoring
    /// those per-chunk counters exactly, not just discarding
    /// newly-created chunks, is what makes rollback exact (spec §8.1
    /// property 9).
    usage: Vec<ChunkUsage>,
}

enum Mode {
    Write,
    Update(Shadow),
}

/// One in-flight transaction against a [`Trie`], borrowed from the
/// owning `MultiTrie`'s mutex guard for its lifetime.
pub struct Transaction<'t, M: Methods> {
    trie: MutexGuard<'t, Trie<M>>,
    mode: Mode,
}

impl<'t, M: Methods> Transaction<'t, M> {
    pub(crate) fn open_write(mut trie: MutexGuard<'t, Trie<M>>) -> Self {
        if trie.last_write {
            // The previous transaction was also a light `write`: keep
            // the same bump chunk, just move the immutable/mutable
            // boundary up to what it had already written.
            let chunk = trie.arena.bump;
            trie.arena.fender = trie.arena.usage[chunk as usize].used;
        } else {
            trie.arena.alloc_reset();
        }
        #[cfg(feature = "write-protect")]
        trie.arena.write_protect_immutable();
        Transaction { trie, mode: Mode::Write }
    }

    pub(crate) fn open_update(mut trie: MutexGuard<'t, Trie<M>>) -> Self {
        let usage = trie.arena.usage.clone();
        let shadow = Shadow {
            root: trie.root,
            leaf_count: trie.leaf_count,
            used_count: trie.arena.used_count,
            free_count: trie.arena.free_count,
            hold_count: trie.arena.hold_count,
            bump: trie.arena.bump,
            fender: trie.arena.fender,
            last_write: trie.last_write,
            usage,
        };
        trie.arena.alloc_reset();
        #[cfg(feature = "write-protect")]
        trie.arena.write_protect_immutable();
        Transaction { trie, mode: Mode::Update(shadow) }
    }

    pub fn is_update(&self) -> bool {
        matches!(self.mode, Mode::Update(_))
    }

    pub fn insert(&mut self, pval: *mut (), ival: u32) -> Result<(), TrieError> {
        self.trie.insert(pval, ival)
    }

    pub fn delete(&mut self, key: &TrieKey) -> Result<(*mut (), u32), TrieError> {
        self.trie.delete(key)
    }

    pub fn get(&self, key: &TrieKey) -> Option<(*mut (), u32)> {
        self.trie.get(key)
    }

    pub fn leaf_count(&self) -> u64 {
        self.trie.leaf_count
    }

    pub fn compact(&mut self, mode: CompactMode) {
        self.trie.compact(mode);
    }

    /// Undo every edit this transaction made so far. Only valid for an
    /// `update` transaction — calling it on a `write` transaction is a
    /// contract violation, mirroring qp.c's `REQUIRE(transaction_mode
    /// == QP_UPDATE)`.
    pub fn rollback(self) {
        let Transaction { mut trie, mode } = self;
        match mode {
            Mode::Write => panic!("rollback called on a write transaction"),
            Mode::Update(shadow) => {
                tracing::debug!(triename = trie.methods.triename(), "qp transaction rolled back");
                // Every chunk that didn't exist when this transaction
                // opened was created by it and holds nothing but
                // transaction-local garbage once the root is rewound —
                // discard it outright (detaching any leaves it still
                // references) rather than relying on live-cell
                // bookkeeping a rolled-back transaction never finished
                // updating.
                let max = trie.arena.chunk_max();
                for chunk in 0..max {
                    let existed_before =
                        (chunk as usize) < shadow.usage.len() && shadow.usage[chunk as usize].exists;
                    if !existed_before && trie.arena.usage[chunk as usize].exists {
                        let methods = Arc::clone(&trie.methods);
                        trie.arena.chunk_free(chunk, move |pval, ival| methods.detach(pval, ival));
                    }
                }
                // Restore every surviving chunk's own bookkeeping
                // (`used`/`free`/`immutable`/...) exactly as it was
                // before the transaction touched it — this is what
                // makes rollback exact when the transaction reused the
                // pre-existing bump chunk rather than allocating a
                // fresh one.
                for (chunk, usage) in shadow.usage.iter().enumerate() {
                    trie.arena.usage[chunk] = *usage;
                }
                trie.root = shadow.root;
                trie.leaf_count = shadow.leaf_count;
                trie.arena.used_count = shadow.used_count;
                trie.arena.free_count = shadow.free_count;
                trie.arena.hold_count = shadow.hold_count;
                trie.arena.bump = shadow.bump;
                trie.arena.fender = shadow.fender;
                trie.last_write = shadow.last_write;
            }
        }
    }

    /// Freeze the cells this transaction wrote (everything below the
    /// current bump chunk's `used` becomes the new immutable prefix)
    /// and hand back the still-held lock plus the new root, so
    /// `MultiTrie::commit` can run post-commit housekeeping (GC,
    /// deferred reclamation) before releasing the writer lock.
    pub(crate) fn finish(mut self) -> (MutexGuard<'t, Trie<M>>, NodeRef) {
        let chunk = self.trie.arena.bump;
        let used = self.trie.arena.usage[chunk as usize].used;
        self.trie.arena.fender = used;
        self.trie.last_write = matches!(self.mode, Mode::Write);
        let root = self.trie.root;
        (self.trie, root)
    }
}
