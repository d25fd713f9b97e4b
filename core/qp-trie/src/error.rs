//! Domain error surface (component H).
//!
//! Grounded on `near-store`'s `StoreOpenerError` (`core/store/src/
//! node_storage/opener.rs`): a small `thiserror`-derived enum for the
//! outcomes the spec designates as first-class, returnable results.
//! Everything else — wrong transaction mode, a reader used off its
//! pinned thread, a corrupt reference — is a contract violation and
//! aborts via `debug_assert!`/`panic!`, matching qp.c's `REQUIRE`/
//! `INSIST`/`ENSURE`.

/// Outcome of a trie operation that can legitimately fail as part of
/// normal use (idempotent, safe to retry).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieError {
    /// `insert` found the key already present.
    #[error("key already exists in trie")]
    Exists,
    /// `get`/`delete` found no matching key.
    #[error("key not found in trie")]
    NotFound,
}
