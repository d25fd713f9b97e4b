//! A quadbit-popcount trie (qp-trie) specialised for DNS names.
//!
//! Ported from BIND9's `qp.c`: an in-memory associative container with
//! exact-match lookup, insertion and deletion, where values are opaque
//! user-owned objects tracked through user-supplied reference-count
//! callbacks ([`Methods`]). A [`MultiTrie`] adds copy-on-write
//! transactions on top of the single-writer [`Trie`](trie::Trie) body:
//! a single writer opens a [`write`](MultiTrie::write) or
//! [`update`](MultiTrie::update) transaction, mutates it, and commits or
//! rolls back, while arbitrarily many concurrent readers observe
//! consistent point-in-time views through [`Reader`] or [`Snapshot`]
//! without ever blocking the writer.
//!
//! No range scans, prefix iteration, or ordered traversal are
//! supported — only exact-match lookup. See `DESIGN.md` for the
//! module-by-module grounding in the original `qp.c`.

mod arena;
mod compact;
mod config;
mod error;
mod key;
mod metrics;
mod methods;
mod multi;
mod node;
mod reader;
mod reclaim;
mod transaction;
mod trie;

#[cfg(test)]
mod tests;

pub use compact::CompactMode;
pub use config::TrieConfig;
pub use error::TrieError;
pub use key::{KEY_EQUAL, SHIFT_BITMAP, SHIFT_NOBYTE, SHIFT_OFFSET, Shift, TrieKey};
pub use metrics::MemUsage;
pub use methods::Methods;
pub use multi::MultiTrie;
pub use node::NodeRef;
pub use reader::{Reader, Snapshot};
pub use reclaim::{ImmediateReclaimer, ReclamationCoordinator, Worklist};
pub use transaction::Transaction;
