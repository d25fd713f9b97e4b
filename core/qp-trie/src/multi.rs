//! The multi-reader object tying together the writer-exclusive
//! [`Trie`], its published reader-facing state, and QSBR-based chunk
//! reclamation — the "multi" in qp.c's `dns_qpmulti_t`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::compact::CompactMode;
use crate::config::TrieConfig;
use crate::metrics::MemUsage;
use crate::methods::Methods;
use crate::node::NodeRef;
use crate::reader::{Published, Reader, Snapshot};
use crate::reclaim::{ImmediateReclaimer, ReclamationCoordinator, Worklist};
use crate::transaction::Transaction;
use crate::trie::Trie;

pub struct MultiTrie<M: Methods> {
    inner: Mutex<Trie<M>>,
    published: Published,
    worklist: Arc<Worklist>,
    coordinator: Arc<dyn ReclamationCoordinator>,
    methods: Arc<M>,
    /// Every live snapshot's id paired with the chunks it pins, so that
    /// dropping one can recompute `ChunkUsage::snapshot` from whichever
    /// snapshots remain (`compact::marksweep_chunks`) instead of just
    /// unconditionally clearing the flag.
    snapshots: Mutex<Vec<(u64, Vec<u32>)>>,
    next_snapshot_id: AtomicU64,
}

impl<M: Methods + Send + Sync + 'static> MultiTrie<M> {
    pub fn new(methods: M) -> Self {
        Self::with_parts(methods, TrieConfig::default(), Arc::new(Worklist::new()), Arc::new(ImmediateReclaimer::new()))
    }

    pub fn with_config(methods: M, config: TrieConfig) -> Self {
        Self::with_parts(methods, config, Arc::new(Worklist::new()), Arc::new(ImmediateReclaimer::new()))
    }

    /// Build a trie sharing an existing reclamation domain (worklist +
    /// coordinator) with other `MultiTrie`s — several tries can share
    /// one QSBR grace-period domain process-wide.
    pub fn with_parts(
        methods: M,
        config: TrieConfig,
        worklist: Arc<Worklist>,
        coordinator: Arc<dyn ReclamationCoordinator>,
    ) -> Self {
        let methods = Arc::new(methods);
        let arena = Arena::new(config);
        let base = arena.base.clone();
        let trie = Trie::new(arena, Arc::clone(&methods));
        let published = Published::new(base, NodeRef::INVALID);
        MultiTrie {
            inner: Mutex::new(trie),
            published,
            worklist,
            coordinator,
            methods,
            snapshots: Mutex::new(Vec::new()),
            next_snapshot_id: AtomicU64::new(0),
        }
    }

    /// Begin a cheap transaction with no rollback support.
    pub fn write(&self) -> Transaction<'_, M> {
        Transaction::open_write(self.inner.lock())
    }

    /// Begin a transaction that keeps a pre-image so it can be rolled
    /// back via [`Transaction::rollback`].
    pub fn update(&self) -> Transaction<'_, M> {
        Transaction::open_update(self.inner.lock())
    }

    /// Publish a transaction's edits, run an opportunistic compaction
    /// pass if `TrieConfig::needs_gc` says one is due, and push any
    /// now-empty immutable chunks through deferred reclamation.
    pub fn commit(&self, txn: Transaction<'_, M>) {
        let (mut guard, root) = txn.finish();
        guard.root = root;
        guard.generation += 1;
        let generation = guard.generation;

        let (used, free, hold) = (guard.arena.used_count, guard.arena.free_count, guard.arena.hold_count);
        if guard.arena.config.needs_gc(used, free, hold) {
            guard.compact(CompactMode::Auto);
        }
        guard.defer_chunk_reclamation(&self.worklist, self.coordinator.as_ref());
        guard.reclaim_chunks(&self.worklist, self.coordinator.as_ref());

        self.published.store_base(guard.arena.base.clone());
        self.published.store_root(guard.root, generation);
        tracing::debug!(
            triename = guard.methods.triename(),
            generation,
            leaf_count = guard.leaf_count,
            "qp commit"
        );
    }

    /// Pin a cheap, short-lived read view as of the most recent commit.
    pub fn read(&self) -> Reader<M> {
        Reader::pin(&self.published, Arc::clone(&self.methods))
    }

    /// Pin a durable read view that survives arbitrarily many later
    /// writer generations, at the cost of holding back reclamation of
    /// every chunk it can still reach. Requires an owning `Arc` because
    /// the snapshot's release hook must be able to outlive any single
    /// borrow of this trie.
    pub fn snapshot(self: &Arc<Self>) -> Snapshot<M> {
        let mut guard = self.inner.lock();
        let chunk_max = guard.arena.chunk_max();
        let root = guard.root;
        let generation = guard.generation;

        let mut base: Vec<Option<Arc<crate::arena::RawChunk>>> = vec![None; chunk_max as usize];
        let mut pinned = Vec::new();
        for chunk in 0..chunk_max {
            if guard.arena.usage[chunk as usize].exists && guard.arena.chunk_live(chunk) > 0 {
                guard.arena.usage[chunk as usize].snapshot = true;
                base[chunk as usize] = guard.arena.base[chunk as usize].clone();
                pinned.push(chunk);
            }
        }
        drop(guard);

        let id = self.next_snapshot_id.fetch_add(1, Ordering::Relaxed);
        self.snapshots.lock().push((id, pinned));

        let owner = Arc::clone(self);
        let release: Arc<dyn Fn() + Send + Sync> = Arc::new(move || owner.release_snapshot(id));
        Snapshot::new(root, Arc::new(base), generation, release, Arc::clone(&self.methods))
    }

    /// Drop `id` from the live-snapshot list and recompute every
    /// remaining chunk's `ChunkUsage::snapshot` flag from whatever
    /// snapshots are left (`compact::marksweep_chunks`).
    fn release_snapshot(&self, id: u64) {
        let remaining: Vec<u32> = {
            let mut snapshots = self.snapshots.lock();
            snapshots.retain(|(sid, _)| *sid != id);
            snapshots.iter().flat_map(|(_, chunks)| chunks.iter().copied()).collect()
        };
        self.inner.lock().marksweep_chunks(&remaining);
    }

    pub fn leaf_count(&self) -> u64 {
        self.inner.lock().leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn memusage(&self) -> MemUsage {
        MemUsage::collect(&self.inner.lock().arena)
    }
}
