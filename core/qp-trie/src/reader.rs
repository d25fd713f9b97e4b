//! Reader and snapshot pinning (component G).
//!
//! Two tiers, matching qp.c's `dns_qpread_t` vs `dns_qpsnap_t` split:
//!
//! - A [`Reader`] is cheap and ephemeral. It grabs the writer's current
//!   chunk table (via `arc_swap`, lock-free) and the currently published
//!   root (via a plain acquire-load), then reads through those without
//!   touching the trie again. It does not keep any particular chunk
//!   alive beyond ordinary `Arc` refcounting of whatever it happened to
//!   observe.
//! - A [`Snapshot`] is for a reader that wants to keep reading a
//!   consistent view for a long time, potentially across many
//!   subsequent writer generations. Creating one copies every chunk
//!   pointer the current root can still reach into the snapshot's own
//!   base table and marks each of those chunks `ChunkUsage::snapshot` on
//!   the writer, so `compact.rs`'s recycling and deferred reclamation
//!   leave them alone until the snapshot is dropped, at which point
//!   `MultiTrie::release_snapshot` re-runs `marksweep_chunks` over every
//!   snapshot still alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;

use crate::arena::BaseTable;
use crate::key::TrieKey;
use crate::methods::Methods;
use crate::node::{self, Cell, NodeRef};

/// The publication point a [`crate::multi::MultiTrie`] exposes to every
/// reader: the current chunk table (swapped lock-free on growth or
/// chunk release) and the current root (a plain acquire/release word,
/// changed only by `commit`).
pub(crate) struct Published {
    base: ArcSwap<Vec<Option<Arc<crate::arena::RawChunk>>>>,
    root: AtomicU64,
    generation: AtomicU64,
}

impl Published {
    pub(crate) fn new(base: BaseTable, root: NodeRef) -> Self {
        Published { base: ArcSwap::new(base), root: AtomicU64::new(pack(root)), generation: AtomicU64::new(0) }
    }

    pub(crate) fn store_base(&self, base: BaseTable) {
        self.base.store(base);
    }

    pub(crate) fn store_root(&self, root: NodeRef, generation: u64) {
        self.generation.store(generation, Ordering::Release);
        self.root.store(pack(root), Ordering::Release);
    }

    pub(crate) fn load_base(&self) -> BaseTable {
        self.base.load_full()
    }

    pub(crate) fn load_root(&self) -> NodeRef {
        unpack(self.root.load(Ordering::Acquire))
    }

    pub(crate) fn load_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

fn pack(r: NodeRef) -> u64 {
    (r.chunk as u64) << 32 | r.cell as u64
}

fn unpack(w: u64) -> NodeRef {
    NodeRef { chunk: (w >> 32) as u32, cell: w as u32 }
}

/// A light, cheap-to-create read pin. Pinned to whichever generation
/// was published at the moment it was created — it never observes a
/// later writer commit, matching the isolation guarantee in spec §8.1
/// property 7.
///
/// Also pinned to the worker thread that created it (spec §5: "pin the
/// reader to the current worker thread id"), since the validity of its
/// held-back chunks depends on that thread's own quiescent-state
/// epoch. Using it from a different thread is a contract violation
/// (qp.c's `REQUIRE(qp->tid == isc_tid())`), caught here with a
/// `debug_assert_eq!` rather than threaded through as a `Result`.
pub struct Reader<M: Methods> {
    base: BaseTable,
    root: NodeRef,
    generation: u64,
    methods: Arc<M>,
    owner: std::thread::ThreadId,
}

impl<M: Methods> Reader<M> {
    pub(crate) fn pin(published: &Published, methods: Arc<M>) -> Reader<M> {
        let base = published.load_base();
        let root = published.load_root();
        let generation = published.load_generation();
        Reader { base, root, generation, methods, owner: std::thread::current().id() }
    }

    fn check_thread(&self) {
        debug_assert_eq!(
            self.owner,
            std::thread::current().id(),
            "Reader used from a thread other than the one that pinned it"
        );
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Exact-match lookup against this reader's pinned view.
    pub fn get(&self, key: &TrieKey) -> Option<(*mut (), u32)> {
        self.check_thread();
        node::lookup(self.root, key, |p, i| self.methods.makekey(p, i), |r| self.cell(r))
    }

    pub(crate) fn cell(&self, r: NodeRef) -> Cell {
        self.base[r.chunk as usize].as_ref().expect("dangling chunk reference").read(r.cell)
    }

    pub(crate) fn twig(&self, twigs: NodeRef, pos: usize) -> Cell {
        self.cell(NodeRef { chunk: twigs.chunk, cell: twigs.cell + pos as u32 })
    }
}

impl<M: Methods> Drop for Reader<M> {
    fn drop(&mut self) {
        self.check_thread();
    }
}

/// A heavy, durably-pinned snapshot. `release` is invoked on drop so the
/// owning trie can drop this snapshot from its live-snapshot list and
/// re-run `marksweep_chunks` (see `compact.rs`) to recompute which
/// chunks the *remaining* snapshots still hold back.
pub struct Snapshot<M: Methods> {
    root: NodeRef,
    base: BaseTable,
    generation: u64,
    release: Arc<dyn Fn() + Send + Sync>,
    methods: Arc<M>,
}

impl<M: Methods> Snapshot<M> {
    pub(crate) fn new(
        root: NodeRef,
        base: BaseTable,
        generation: u64,
        release: Arc<dyn Fn() + Send + Sync>,
        methods: Arc<M>,
    ) -> Snapshot<M> {
        Snapshot { root, base, generation, release, methods }
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Exact-match lookup against this snapshot's pinned view. Stable
    /// across any number of intervening writer commits — spec §8.1
    /// property 8.
    pub fn get(&self, key: &TrieKey) -> Option<(*mut (), u32)> {
        node::lookup(self.root, key, |p, i| self.methods.makekey(p, i), |r| self.cell(r))
    }

    pub(crate) fn cell(&self, r: NodeRef) -> Cell {
        self.base[r.chunk as usize].as_ref().expect("dangling chunk reference").read(r.cell)
    }

    pub(crate) fn twig(&self, twigs: NodeRef, pos: usize) -> Cell {
        self.cell(NodeRef { chunk: twigs.chunk, cell: twigs.cell + pos as u32 })
    }
}

impl<M: Methods> Drop for Snapshot<M> {
    fn drop(&mut self) {
        (self.release)();
    }
}
