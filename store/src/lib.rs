//! Keyed-store capability for the sync layer.
//!
//! Everything that mutates shared remote state (claims, handoff tokens)
//! goes through [`KeyedStore::transact`], an atomic per-key
//! read-modify-write. The updater sees the current value and either
//! returns the next value or aborts, so two racing callers against the
//! same key are serialized by the store itself: the loser observes a
//! clean not-committed outcome, never a torn write.

use async_trait::async_trait;
use serde_json::Value;

mod memory;

pub use memory::MemoryStore;

/// Errors from a store backend.
///
/// Aborting a transaction is not an error; it is reported through
/// [`TransactionOutcome::committed`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Decision returned by a transaction updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Replace the key's value and commit.
    Write(Value),
    /// Delete the key and commit.
    Remove,
    /// Leave the key untouched and report not-committed.
    Abort,
}

/// Result of a [`KeyedStore::transact`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutcome {
    /// Whether the updater's write was applied.
    pub committed: bool,
    /// The value at the key after the call: the written value when
    /// committed, the value the updater observed when aborted.
    pub value: Option<Value>,
}

/// Atomic keyed storage holding a JSON tree, addressed by `/`-separated
/// string paths.
///
/// Any backend offering atomic read-modify-write per key (a realtime
/// database transaction, a local file under a lock) can implement this.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Read the current value at `key`.
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditionally create or overwrite the value at `key`.
    async fn write(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Atomically read `key`, apply `updater`, and commit its write.
    ///
    /// The updater runs with exclusive access to the key. Returning
    /// [`Transition::Abort`] leaves the stored value untouched.
    async fn transact(
        &self,
        key: &str,
        updater: &mut (dyn for<'a> FnMut(Option<&'a Value>) -> Transition + Send),
    ) -> Result<TransactionOutcome, StoreError>;
}
