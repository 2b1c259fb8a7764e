//! In-memory [`KeyedStore`] used by tests and as the reference semantics
//! for remote backends.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{KeyedStore, StoreError, TransactionOutcome, Transition};

/// In-memory keyed store. One mutex over the whole map, so transactions
/// against any key are fully serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored keys, for assertions.
    pub async fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).cloned())
    }

    async fn write(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn transact(
        &self,
        key: &str,
        updater: &mut (dyn for<'a> FnMut(Option<&'a Value>) -> Transition + Send),
    ) -> Result<TransactionOutcome, StoreError> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(key);
        match updater(current) {
            Transition::Write(next) => {
                entries.insert(key.to_string(), next.clone());
                Ok(TransactionOutcome {
                    committed: true,
                    value: Some(next),
                })
            }
            Transition::Remove => {
                entries.remove(key);
                Ok(TransactionOutcome {
                    committed: true,
                    value: None,
                })
            }
            Transition::Abort => Ok(TransactionOutcome {
                committed: false,
                value: current.cloned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn transact_commits_write() {
        let store = MemoryStore::new();

        let outcome = store
            .transact("counters/a", &mut |current| {
                assert_eq!(None, current);
                Transition::Write(json!(1))
            })
            .await
            .expect("memory store never fails");

        assert!(outcome.committed);
        assert_eq!(Some(json!(1)), outcome.value);
        assert_eq!(Some(json!(1)), store.read("counters/a").await.expect("read"));
    }

    #[tokio::test]
    async fn abort_leaves_value_untouched() {
        let store = MemoryStore::new();
        store.write("owners/doc", json!("uid-a")).await.expect("write");

        let outcome = store
            .transact("owners/doc", &mut |_| Transition::Abort)
            .await
            .expect("memory store never fails");

        assert!(!outcome.committed);
        assert_eq!(Some(json!("uid-a")), outcome.value);
        assert_eq!(
            Some(json!("uid-a")),
            store.read("owners/doc").await.expect("read")
        );
    }

    #[tokio::test]
    async fn updater_observes_prior_commit() {
        let store = MemoryStore::new();

        store
            .transact("k", &mut |_| Transition::Write(json!("first")))
            .await
            .expect("first transaction");
        let outcome = store
            .transact("k", &mut |current| match current {
                Some(v) if v == &json!("first") => Transition::Write(json!("second")),
                _ => Transition::Abort,
            })
            .await
            .expect("second transaction");

        assert!(outcome.committed);
        assert_eq!(Some(json!("second")), outcome.value);
    }

    #[tokio::test]
    async fn write_overwrites_unconditionally() {
        let store = MemoryStore::new();
        store.write("k", json!({"a": 1})).await.expect("write");
        store.write("k", json!({"a": 2})).await.expect("write");

        assert_eq!(Some(json!({"a": 2})), store.read("k").await.expect("read"));
        assert_eq!(vec!["k".to_string()], store.keys().await);
    }
}
