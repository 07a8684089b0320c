//! Per-session state: variable values, deferred writes, and memoization.
//!
//! `SessionState` is exclusively owned by one orchestrator per conversation;
//! cloning yields another handle to the same inner state. Turns within a
//! session are processed sequentially, so the lock is never contended within
//! a session — it exists so snapshots can be taken from event subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use roundtable_types::{
    DeferredWrite, EngineError, RefreshPolicy, Result, ValueType, VariableDefinition,
    VariableSource, WriteStrategy,
};
use serde_json::Value;

use crate::external::DocumentStore;
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::template::interpolate_map;

/// Which deferred writes a flush covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// Writes tagged `on_phase_transition`.
    Phase,
    /// All remaining writes, including `on_workflow_end`.
    End,
}

#[derive(Debug, Default)]
struct SessionInner {
    values: HashMap<String, Value>,
    pending_writes: Vec<DeferredWrite>,
    /// Variables resolved under `refresh = once`; never re-resolved.
    memoized: HashSet<String>,
    /// Variables resolved under `refresh = per_phase`; cleared on phase
    /// transitions.
    phase_memoized: HashSet<String>,
}

/// Per-session mapping of variable name -> current value plus the deferred
/// write queue.
#[derive(Clone, Default)]
pub struct SessionState {
    inner: Arc<tokio::sync::RwLock<SessionInner>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().await.values.get(name).cloned()
    }

    pub async fn set(&self, name: impl Into<String>, value: Value) {
        self.inner.write().await.values.insert(name.into(), value);
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().await.values.clone()
    }

    // --- memoization for refresh policies ---

    pub async fn mark_resolved(&self, name: &str, refresh: RefreshPolicy) {
        let mut inner = self.inner.write().await;
        match refresh {
            RefreshPolicy::Once => {
                inner.memoized.insert(name.to_string());
            }
            RefreshPolicy::PerPhase => {
                inner.phase_memoized.insert(name.to_string());
            }
            RefreshPolicy::PerTurn => {}
        }
    }

    /// Whether the variable's memoized value is still current.
    pub async fn is_resolved(&self, name: &str) -> bool {
        let inner = self.inner.read().await;
        inner.memoized.contains(name) || inner.phase_memoized.contains(name)
    }

    /// Invalidate `per_phase` memoization; called on phase transitions.
    pub async fn invalidate_phase(&self) {
        self.inner.write().await.phase_memoized.clear();
    }

    // --- deferred writes ---

    /// Queue a deferred write, replacing any pending write for the same
    /// variable so the last value wins.
    pub async fn queue_write(&self, write: DeferredWrite) {
        let mut inner = self.inner.write().await;
        inner.pending_writes.retain(|w| w.variable != write.variable);
        inner.pending_writes.push(write);
    }

    pub async fn pending_write_count(&self) -> usize {
        self.inner.read().await.pending_writes.len()
    }

    /// Remove and return the writes covered by `scope`, in queue order.
    pub async fn take_writes(&self, scope: FlushScope) -> Vec<DeferredWrite> {
        let mut inner = self.inner.write().await;
        let covered = |w: &DeferredWrite| match scope {
            FlushScope::Phase => w.strategy == WriteStrategy::OnPhaseTransition,
            FlushScope::End => true,
        };
        let (taken, kept): (Vec<_>, Vec<_>) =
            inner.pending_writes.drain(..).partition(covered);
        inner.pending_writes = kept;
        taken
    }

    /// Discard all queued writes. Used on session cancellation: `immediate`
    /// writes already persisted synchronously, so only deferred ones remain.
    pub async fn discard_pending(&self) {
        self.inner.write().await.pending_writes.clear();
    }

    // --- entity writes ---

    /// Set a variable's value, handling `DataEntity` persistence: `immediate`
    /// writes persist synchronously before this returns; other strategies
    /// queue a deferred write.
    pub async fn set_variable(
        &self,
        def: &VariableDefinition,
        value: Value,
        store: &dyn DocumentStore,
    ) -> Result<()> {
        if let VariableSource::DataEntity {
            collection,
            search_key,
            schema,
            write,
            retry,
        } = &def.source
        {
            let snapshot = self.snapshot().await;
            let key = interpolate_map(search_key, &snapshot);
            let write_op = DeferredWrite {
                variable: def.name.clone(),
                collection: collection.clone(),
                key,
                record: value.clone(),
                strategy: *write,
                retry: retry.clone(),
                queued_at: chrono::Utc::now(),
            };
            match write {
                WriteStrategy::Immediate => {
                    check_schema(collection, schema, &value)?;
                    persist_write(&write_op, store).await?;
                }
                _ => self.queue_write(write_op).await,
            }
        }
        self.set(&def.name, value).await;
        Ok(())
    }

    /// Persist the writes covered by `scope`. Each write retries per its
    /// variable's retry policy; a write that still fails surfaces a fatal
    /// error, aborting the flush without attempting the rest of the batch.
    pub async fn flush(
        &self,
        definitions: &[VariableDefinition],
        store: &dyn DocumentStore,
        scope: FlushScope,
    ) -> Result<usize> {
        let writes = self.take_writes(scope).await;
        let mut flushed = 0;
        for write in &writes {
            if let Some(def) = definitions.iter().find(|d| d.name == write.variable) {
                if let VariableSource::DataEntity { collection, schema, .. } = &def.source {
                    check_schema(collection, schema, &write.record)?;
                }
            }
            persist_write(write, store).await?;
            flushed += 1;
        }
        tracing::debug!(flushed, "Deferred writes persisted");
        Ok(flushed)
    }
}

/// Validate a record against a `DataEntity` schema. Fields present in the
/// record must match their declared type; absent fields are allowed (partial
/// records are legal on update).
fn check_schema(
    collection: &str,
    schema: &HashMap<String, ValueType>,
    record: &Value,
) -> Result<()> {
    if schema.is_empty() {
        return Ok(());
    }
    let map = record.as_object().ok_or_else(|| EngineError::SchemaMismatch {
        collection: collection.to_string(),
        message: "entity record must be an object".into(),
    })?;
    for (field, ty) in schema {
        if let Some(value) = map.get(field) {
            if !ty.accepts(value) {
                return Err(EngineError::SchemaMismatch {
                    collection: collection.to_string(),
                    message: format!("field '{field}' does not match declared type {ty:?}"),
                });
            }
        }
    }
    Ok(())
}

async fn persist_write(write: &DeferredWrite, store: &dyn DocumentStore) -> Result<()> {
    let policy = BackoffPolicy::from(&write.retry);
    execute_with_retry(
        || store.upsert(&write.collection, &write.key, &write.record),
        write.retry.max_attempts,
        &policy,
        &write.variable,
    )
    .await
    .map_err(|e| {
        if e.is_retryable() {
            EngineError::WriteFailed {
                variable: write.variable.clone(),
                attempts: write.retry.max_attempts,
            }
        } else {
            e
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryDocumentStore;
    use roundtable_types::{Backoff, RetrySpec};

    fn entity_def(name: &str, write: WriteStrategy) -> VariableDefinition {
        let mut search_key = HashMap::new();
        search_key.insert("order_id".to_string(), "${order_id}".to_string());
        let mut schema = HashMap::new();
        schema.insert("status".to_string(), ValueType::String);
        VariableDefinition {
            name: name.to_string(),
            value_type: ValueType::Object,
            source: VariableSource::DataEntity {
                collection: "orders".into(),
                search_key,
                schema,
                write,
                retry: RetrySpec {
                    max_attempts: 2,
                    backoff: Backoff::Linear,
                    base_ms: 0,
                },
            },
        }
    }

    #[tokio::test]
    async fn set_and_get_round_trip() {
        let session = SessionState::new();
        session.set("x", serde_json::json!(10)).await;
        assert_eq!(session.get("x").await, Some(serde_json::json!(10)));
        assert_eq!(session.get("missing").await, None);
    }

    #[tokio::test]
    async fn snapshot_is_detached() {
        let session = SessionState::new();
        session.set("a", serde_json::json!(1)).await;
        let snap = session.snapshot().await;
        session.set("a", serde_json::json!(2)).await;
        assert_eq!(snap.get("a"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn memoization_tracks_refresh_policy() {
        let session = SessionState::new();
        session.mark_resolved("once_var", RefreshPolicy::Once).await;
        session.mark_resolved("phase_var", RefreshPolicy::PerPhase).await;
        session.mark_resolved("turn_var", RefreshPolicy::PerTurn).await;

        assert!(session.is_resolved("once_var").await);
        assert!(session.is_resolved("phase_var").await);
        assert!(!session.is_resolved("turn_var").await);

        session.invalidate_phase().await;
        assert!(session.is_resolved("once_var").await);
        assert!(!session.is_resolved("phase_var").await);
    }

    #[tokio::test]
    async fn immediate_write_visible_before_set_returns() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-9")).await;
        let store = InMemoryDocumentStore::new();
        let def = entity_def("order", WriteStrategy::Immediate);

        session
            .set_variable(&def, serde_json::json!({"status": "open"}), &store)
            .await
            .unwrap();

        // Visible in the store and in the session, with nothing queued.
        let mut key = HashMap::new();
        key.insert("order_id".to_string(), serde_json::json!("o-9"));
        let found = store.find_one("orders", &key).await.unwrap().unwrap();
        assert_eq!(found["status"], "open");
        assert_eq!(
            session.get("order").await,
            Some(serde_json::json!({"status": "open"}))
        );
        assert_eq!(session.pending_write_count().await, 0);
    }

    #[tokio::test]
    async fn deferred_write_queued_until_flush() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-1")).await;
        let store = InMemoryDocumentStore::new();
        let def = entity_def("order", WriteStrategy::OnPhaseTransition);

        session
            .set_variable(&def, serde_json::json!({"status": "open"}), &store)
            .await
            .unwrap();
        assert_eq!(session.pending_write_count().await, 1);
        assert_eq!(store.write_calls(), 0);

        let flushed = session
            .flush(&[def], &store, FlushScope::Phase)
            .await
            .unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(store.write_calls(), 1);
        assert_eq!(session.pending_write_count().await, 0);
    }

    #[tokio::test]
    async fn queue_keeps_only_latest_write_per_variable() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-1")).await;
        let store = InMemoryDocumentStore::new();
        let def = entity_def("order", WriteStrategy::OnWorkflowEnd);

        session
            .set_variable(&def, serde_json::json!({"status": "open"}), &store)
            .await
            .unwrap();
        session
            .set_variable(&def, serde_json::json!({"status": "closed"}), &store)
            .await
            .unwrap();
        assert_eq!(session.pending_write_count().await, 1);

        session
            .flush(&[def], &store, FlushScope::End)
            .await
            .unwrap();
        let mut key = HashMap::new();
        key.insert("order_id".to_string(), serde_json::json!("o-1"));
        let found = store.find_one("orders", &key).await.unwrap().unwrap();
        assert_eq!(found["status"], "closed");
    }

    #[tokio::test]
    async fn phase_flush_leaves_end_writes_queued() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-1")).await;
        let store = InMemoryDocumentStore::new();
        let phase_def = entity_def("phase_entity", WriteStrategy::OnPhaseTransition);
        let end_def = entity_def("end_entity", WriteStrategy::OnWorkflowEnd);

        session
            .set_variable(&phase_def, serde_json::json!({"status": "a"}), &store)
            .await
            .unwrap();
        session
            .set_variable(&end_def, serde_json::json!({"status": "b"}), &store)
            .await
            .unwrap();

        let defs = vec![phase_def, end_def];
        let flushed = session.flush(&defs, &store, FlushScope::Phase).await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(session.pending_write_count().await, 1);

        let flushed = session.flush(&defs, &store, FlushScope::End).await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(session.pending_write_count().await, 0);
    }

    #[tokio::test]
    async fn flush_retries_then_surfaces_fatal_error() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-1")).await;
        let store = InMemoryDocumentStore::new();
        let def = entity_def("order", WriteStrategy::OnPhaseTransition);

        session
            .set_variable(&def, serde_json::json!({"status": "open"}), &store)
            .await
            .unwrap();

        // max_attempts is 2; fail more than that.
        store.fail_next_writes(3);
        let err = session
            .flush(&[def], &store, FlushScope::Phase)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WriteFailed { .. }));
        assert!(err.is_fatal());
        assert_eq!(store.write_calls(), 2);
    }

    #[tokio::test]
    async fn flush_write_recovers_within_retry_budget() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-1")).await;
        let store = InMemoryDocumentStore::new();
        let def = entity_def("order", WriteStrategy::OnPhaseTransition);

        session
            .set_variable(&def, serde_json::json!({"status": "open"}), &store)
            .await
            .unwrap();

        store.fail_next_writes(1);
        let flushed = session
            .flush(&[def], &store, FlushScope::Phase)
            .await
            .unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(store.write_calls(), 2);
    }

    #[tokio::test]
    async fn schema_mismatch_is_fatal_at_flush() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-1")).await;
        let store = InMemoryDocumentStore::new();
        let def = entity_def("order", WriteStrategy::OnPhaseTransition);

        // status declared as string, written as number
        session
            .set_variable(&def, serde_json::json!({"status": 42}), &store)
            .await
            .unwrap();

        let err = session
            .flush(&[def], &store, FlushScope::Phase)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn discard_pending_drops_deferred_writes() {
        let session = SessionState::new();
        session.set("order_id", serde_json::json!("o-1")).await;
        let store = InMemoryDocumentStore::new();
        let def = entity_def("order", WriteStrategy::OnWorkflowEnd);

        session
            .set_variable(&def, serde_json::json!({"status": "open"}), &store)
            .await
            .unwrap();
        assert_eq!(session.pending_write_count().await, 1);

        session.discard_pending().await;
        assert_eq!(session.pending_write_count().await, 0);
    }
}
