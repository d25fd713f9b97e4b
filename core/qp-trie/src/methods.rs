//! User-provided callback bundle (§6.1).
//!
//! A small capability record, expressed as a trait bound rather than a
//! struct of function pointers — the direct Rust analogue of qp.c's
//! `dns_qpmethods_t` ("no inheritance", spec §9 Design Notes). `M:
//! Methods` is monomorphized per concrete implementor, so there is no
//! vtable or dynamic dispatch involved.

use crate::key::TrieKey;

/// Callbacks through which the trie manages externally-owned leaf
/// values. The trie never allocates, frees, or dereferences `pval`
/// itself; it only round-trips the pointer through these calls.
pub trait Methods {
    /// Invoked whenever a leaf is duplicated (copy-on-write, or a
    /// `grow-branch` that had to re-attach all of an immutable run's
    /// leaves).
    fn attach(&self, pval: *mut (), ival: u32);

    /// Invoked whenever a leaf copy is destroyed.
    fn detach(&self, pval: *mut (), ival: u32);

    /// Recover the trie key for a stored leaf. Must be deterministic
    /// and consistent with the key the leaf was originally inserted
    /// with.
    fn makekey(&self, pval: *mut (), ival: u32) -> TrieKey;

    /// Diagnostic name for tracing spans. No behavioural effect.
    fn triename(&self) -> &str {
        "qp-trie"
    }
}
