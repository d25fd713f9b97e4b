//! Bump chunk allocator and base table (component C).
//!
//! Grounded on `qp.c`'s allocator section: `chunk_alloc`, `alloc_slow`,
//! `alloc_twigs`, `free_twigs`, `realloc_chunk_arrays`, `cells_immutable`.
//!
//! Each chunk is a fixed-capacity, append-only array of [`Cell`]s wrapped
//! in an `Arc` so it can be shared, read-only, between the writer and any
//! reader/snapshot that observed it before it was frozen. The writer's
//! per-chunk usage bookkeeping (`exists`/`immutable`/`used`/`free`/
//! `phase`/snapshot pins) is a plain, writer-exclusive `Vec`, never
//! shared — matching the split between qp.c's shared `dns_qpbase_t` and
//! writer-only `qp->usage[]`.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::config::TrieConfig;
use crate::node::{Cell, NodeRef};

/// A fixed-capacity array of node cells, shared read-only once frozen.
///
/// # Safety
/// Cells below a chunk's current writer-tracked `used`/`fender` boundary
/// are never written again once published to a reader; see
/// [`Arena::cells_immutable`]. Under that protocol, concurrent `read`
/// (from any reader thread) and `write` (only ever from the single
/// writer, only to cells it still owns exclusively) never alias.
pub(crate) struct RawChunk {
    cells: UnsafeCell<Box<[Cell]>>,
}

unsafe impl Send for RawChunk {}
unsafe impl Sync for RawChunk {}

impl RawChunk {
    fn new(capacity: u32) -> Self {
        RawChunk { cells: UnsafeCell::new(vec![Cell::ZERO; capacity as usize].into_boxed_slice()) }
    }

    #[inline]
    pub(crate) fn read(&self, idx: u32) -> Cell {
        unsafe { (*self.cells.get())[idx as usize] }
    }

    /// # Safety
    /// `idx` must be in the writer-exclusive mutable region of this
    /// chunk (see [`Arena::cells_immutable`]).
    #[inline]
    unsafe fn write(&self, idx: u32, cell: Cell) {
        unsafe {
            (*self.cells.get())[idx as usize] = cell;
        }
    }
}

/// The refcounted array of chunk pointers. Readers and snapshots clone
/// this `Arc` (and, transitively, the per-chunk `Arc<RawChunk>`s they
/// still need) to pin exactly the chunks they depend on.
pub(crate) type BaseTable = Arc<Vec<Option<Arc<RawChunk>>>>;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ChunkUsage {
    pub exists: bool,
    pub immutable: bool,
    pub used: u32,
    pub free: u32,
    /// QSBR phase this chunk was tagged in for deferred reclamation; 0
    /// means "not scheduled".
    pub phase: u32,
    pub snapshot: bool,
    pub snapmark: bool,
    pub snapfree: bool,
}

/// The writer-exclusive allocator state: base table, usage bookkeeping,
/// and bump-pointer position.
pub(crate) struct Arena {
    pub(crate) base: BaseTable,
    pub(crate) usage: Vec<ChunkUsage>,
    pub(crate) bump: u32,
    pub(crate) fender: u32,
    pub(crate) used_count: u64,
    pub(crate) free_count: u64,
    pub(crate) hold_count: u64,
    pub(crate) config: TrieConfig,
}

impl Arena {
    pub(crate) fn new(config: TrieConfig) -> Self {
        debug_assert!(
            config.chunk_size as u32 > crate::key::BITMAP_BITS,
            "chunk_size must exceed the maximum possible twig run (branch bitmap width)"
        );
        Arena {
            base: Arc::new(Vec::new()),
            usage: Vec::new(),
            bump: 0,
            fender: 0,
            used_count: 0,
            free_count: 0,
            hold_count: 0,
            config,
        }
    }

    #[inline]
    pub(crate) fn chunk_max(&self) -> u32 {
        self.usage.len() as u32
    }

    /// Is the cell range starting at `r` part of an immutable (already
    /// published, copy-on-write-protected) chunk?
    #[inline]
    pub(crate) fn cells_immutable(&self, r: NodeRef) -> bool {
        if r.chunk == self.bump {
            r.cell < self.fender
        } else {
            self.usage[r.chunk as usize].immutable
        }
    }

    #[inline]
    pub(crate) fn chunk_live(&self, chunk: u32) -> u32 {
        self.usage[chunk as usize].used - self.usage[chunk as usize].free
    }

    pub(crate) fn cell(&self, r: NodeRef) -> Cell {
        self.base[r.chunk as usize].as_ref().expect("dangling chunk reference").read(r.cell)
    }

    pub(crate) fn twig(&self, twigs: NodeRef, pos: usize) -> Cell {
        self.cell(NodeRef { chunk: twigs.chunk, cell: twigs.cell + pos as u32 })
    }

    /// Write one twig. Caller must have already established (typically
    /// via `make_root_mutable`/`make_twigs_mutable` in `trie.rs`) that
    /// `twigs` is not [`cells_immutable`](Self::cells_immutable).
    pub(crate) fn write_twig(&self, twigs: NodeRef, pos: usize, value: Cell) {
        let r = NodeRef { chunk: twigs.chunk, cell: twigs.cell + pos as u32 };
        debug_assert!(!self.cells_immutable(r), "write to an immutable cell");
        let chunk = self.base[twigs.chunk as usize].as_ref().expect("dangling chunk reference");
        unsafe { chunk.write(r.cell, value) };
    }

    pub(crate) fn move_twigs(&self, dst: NodeRef, src: NodeRef, count: usize) {
        if count == 0 {
            return;
        }
        // copy high-to-low when ranges could overlap within the same
        // chunk and dst is ahead of src (growbranch's splice); otherwise
        // order doesn't matter.
        if dst.chunk == src.chunk && dst.cell > src.cell {
            for i in (0..count).rev() {
                let v = self.twig(src, i);
                self.write_twig(dst, i, v);
            }
        } else {
            for i in 0..count {
                let v = self.twig(src, i);
                self.write_twig(dst, i, v);
            }
        }
    }

    fn zero_twigs(&self, twigs: NodeRef, size: u32) {
        for pos in 0..size as usize {
            self.write_twig(twigs, pos, Cell::ZERO);
        }
    }

    fn set_base_slot(&mut self, chunk: u32, value: Option<Arc<RawChunk>>) {
        if let Some(v) = Arc::get_mut(&mut self.base) {
            v[chunk as usize] = value;
        } else {
            let mut cloned = (*self.base).clone();
            cloned[chunk as usize] = value;
            self.base = Arc::new(cloned);
        }
    }

    /// Grow the chunk table (both the shared base array and the
    /// writer-exclusive usage array) to hold at least `newmax` chunks.
    /// Grounded on `qp.c::realloc_chunk_arrays`.
    fn realloc_chunk_arrays(&mut self, newmax: u32) {
        if let Some(v) = Arc::get_mut(&mut self.base) {
            v.resize(newmax as usize, None);
        } else {
            let mut cloned = (*self.base).clone();
            cloned.resize(newmax as usize, None);
            self.base = Arc::new(cloned);
        }
        self.usage.resize(newmax as usize, ChunkUsage::default());
        tracing::trace!(newmax, "qp chunk table grown");
    }

    fn chunk_alloc(&mut self, chunk: u32, size: u32) -> NodeRef {
        debug_assert!(self.base[chunk as usize].is_none());
        debug_assert_eq!(self.usage[chunk as usize].used, 0);
        debug_assert_eq!(self.usage[chunk as usize].free, 0);
        let raw = Arc::new(RawChunk::new(self.config.chunk_size));
        // The chunk we're retiring as the bump chunk must never be
        // written again — including by this same still-in-flight
        // transaction, whose `rollback` shadow may depend on its
        // contents staying byte-for-byte intact. Freeze it now rather
        // than waiting for the next commit to notice.
        if self.usage[self.bump as usize].exists {
            self.usage[self.bump as usize].immutable = true;
        }
        self.set_base_slot(chunk, Some(raw));
        self.usage[chunk as usize] = ChunkUsage { exists: true, used: size, ..Default::default() };
        self.used_count += size as u64;
        self.bump = chunk;
        self.fender = 0;
        tracing::trace!(chunk, size, "qp chunk_alloc");
        NodeRef { chunk, cell: 0 }
    }

    fn alloc_slow(&mut self, size: u32) -> NodeRef {
        let max = self.chunk_max();
        for chunk in 0..max {
            if !self.usage[chunk as usize].exists {
                return self.chunk_alloc(chunk, size);
            }
        }
        let newmax = ((max.max(1) as f32) * self.config.growth_factor).ceil() as u32;
        let newmax = newmax.max(max + 1);
        self.realloc_chunk_arrays(newmax);
        self.chunk_alloc(max, size)
    }

    /// Ensure the next allocation starts a fresh bump chunk.
    pub(crate) fn alloc_reset(&mut self) {
        let _ = self.alloc_slow(0);
    }

    /// Best-effort read-only hardening of every chunk this transaction
    /// opened on top of (everything but the fresh `bump` chunk it is
    /// about to write into). A real implementation would `mprotect`
    /// each chunk's backing pages `PROT_READ`; this crate's dependency
    /// stack carries no raw-syscall/`region` crate to ground that call
    /// on (see DESIGN.md Open Question 5), so with the feature enabled
    /// this is a documented no-op a host embedder can extend.
    #[cfg(feature = "write-protect")]
    pub(crate) fn write_protect_immutable(&self) {
        if !self.config.write_protect {
            return;
        }
        for chunk in 0..self.chunk_max() {
            if chunk != self.bump && self.usage[chunk as usize].exists {
                tracing::trace!(chunk, "qp write-protect (no-op hook)");
            }
        }
    }

    /// The bump-allocator fast path: grab `size` contiguous cells from
    /// the current bump chunk, falling back to the slow path when it's
    /// full or (`QP_MAX_FREE`) too fragmented with holes to keep using.
    pub(crate) fn alloc_twigs(&mut self, size: u32) -> NodeRef {
        let chunk = self.bump;
        let cell = self.usage[chunk as usize].used;
        let too_fragmented = self.usage[chunk as usize].free > self.config.max_free;
        if !too_fragmented && cell + size <= self.config.chunk_size {
            self.usage[chunk as usize].used += size;
            self.used_count += size as u64;
            NodeRef { chunk, cell }
        } else {
            self.alloc_slow(size)
        }
    }

    /// Record that `size` twigs starting at `twigs` are no longer used.
    /// Returns `true` if they were destroyed immediately (mutable,
    /// zeroed in place); `false` if destruction was deferred because the
    /// range is immutable (the caller must `hold_count`-account this by
    /// having already recorded it here, and must re-`attach` any
    /// duplicated leaves itself).
    pub(crate) fn free_twigs(&mut self, twigs: NodeRef, size: u32) -> bool {
        let chunk = twigs.chunk as usize;
        self.free_count += size as u64;
        self.usage[chunk].free += size;
        debug_assert!(self.free_count <= self.used_count);
        debug_assert!(self.usage[chunk].free <= self.usage[chunk].used);
        if self.cells_immutable(twigs) {
            self.hold_count += size as u64;
            debug_assert!(self.free_count >= self.hold_count);
            false
        } else {
            self.zero_twigs(twigs, size);
            true
        }
    }

    /// Remove an empty chunk's contribution from the global counters.
    /// Guarded by `phase == 0` so a chunk already scheduled for deferred
    /// reclamation isn't discounted twice.
    pub(crate) fn chunk_discount(&mut self, chunk: u32) {
        let u = &self.usage[chunk as usize];
        if u.phase == 0 {
            debug_assert!(self.used_count >= u.used as u64);
            debug_assert!(self.free_count >= u.free as u64);
            self.used_count -= u.used as u64;
            self.free_count -= u.free as u64;
        }
    }

    /// Release a chunk's storage, detaching any residual leaves.
    /// `detach` is the user `Methods::detach` callback.
    pub(crate) fn chunk_free(&mut self, chunk: u32, mut detach: impl FnMut(*mut (), u32)) {
        let used = self.usage[chunk as usize].used;
        if let Some(raw) = self.base[chunk as usize].clone() {
            for i in 0..used {
                let cell = raw.read(i);
                if cell.is_leaf_tagged() && !cell.pval().is_null() {
                    detach(cell.pval(), cell.ival());
                }
            }
        }
        self.chunk_discount(chunk);
        self.set_base_slot(chunk, None);
        self.usage[chunk as usize] = ChunkUsage::default();
    }

    pub(crate) fn memusage_chunk_count(&self) -> usize {
        self.base.iter().filter(|c| c.is_some()).count()
    }
}
