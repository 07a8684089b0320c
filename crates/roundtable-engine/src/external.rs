//! Collaborator traits at the engine boundary, plus in-memory implementations
//! used by tests and the CLI's scripted runner.
//!
//! The engine never talks to a concrete database or HTTP client; it consumes
//! these capabilities and leaves driver code to the host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use roundtable_types::{AuthSpec, EngineError, Result};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ConfigSource — key -> value lookup for Config variables
// ---------------------------------------------------------------------------

pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from the process environment.
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed key/value map, for tests and scripted runs.
#[derive(Default)]
pub struct StaticConfigSource {
    values: HashMap<String, String>,
}

impl StaticConfigSource {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for StaticConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

// ---------------------------------------------------------------------------
// DocumentStore — abstract read/write/query capability
// ---------------------------------------------------------------------------

/// Query-by-example document store. Filters and keys are field -> value maps;
/// a record matches when every filter field equals the record's field.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(
        &self,
        collection: &str,
        filter: &HashMap<String, Value>,
    ) -> Result<Option<Value>>;

    async fn upsert(
        &self,
        collection: &str,
        key: &HashMap<String, Value>,
        record: &Value,
    ) -> Result<()>;
}

/// In-memory document store with call counters and fault injection.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
}

fn record_matches(record: &Value, filter: &HashMap<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| record.get(field) == Some(expected))
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing counters.
    pub fn seed(&self, collection: &str, record: Value) {
        self.collections
            .write()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .push(record);
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` reads fail with `StoreUnavailable`.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail with `StoreUnavailable`.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self, counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: &HashMap<String, Value>,
    ) -> Result<Option<Value>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure(&self.failing_reads) {
            return Err(EngineError::StoreUnavailable {
                store: "memory".into(),
                message: "injected read failure".into(),
            });
        }
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| record_matches(r, filter)))
            .cloned())
    }

    async fn upsert(
        &self,
        collection: &str,
        key: &HashMap<String, Value>,
        record: &Value,
    ) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure(&self.failing_writes) {
            return Err(EngineError::StoreUnavailable {
                store: "memory".into(),
                message: "injected write failure".into(),
            });
        }
        let mut collections = self.collections.write().unwrap();
        let records = collections.entry(collection.to_string()).or_default();
        match records.iter_mut().find(|r| record_matches(r, key)) {
            Some(existing) => *existing = record.clone(),
            None => {
                // New record: the key fields become part of the stored record
                // so later lookups by the same key find it.
                let mut stored = record.clone();
                if let Value::Object(ref mut map) = stored {
                    for (field, value) in key {
                        map.entry(field.clone()).or_insert_with(|| value.clone());
                    }
                }
                records.push(stored);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExternalService — abstract third-party service call
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExternalService: Send + Sync {
    async fn call(
        &self,
        service: &str,
        operation: &str,
        params: &HashMap<String, Value>,
        auth: &AuthSpec,
    ) -> Result<Value>;
}

/// Scripted service returning canned responses per `service/operation`, with
/// call counting and fault injection.
#[derive(Default)]
pub struct ScriptedService {
    responses: RwLock<HashMap<String, Value>>,
    call_count: AtomicUsize,
    failing_calls: AtomicUsize,
    reject_auth: std::sync::atomic::AtomicBool,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, service: &str, operation: &str, response: Value) {
        self.responses
            .write()
            .unwrap()
            .insert(format!("{service}/{operation}"), response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn fail_next_calls(&self, n: usize) {
        self.failing_calls.store(n, Ordering::SeqCst);
    }

    /// Make every call fail authentication.
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExternalService for ScriptedService {
    async fn call(
        &self,
        service: &str,
        operation: &str,
        _params: &HashMap<String, Value>,
        _auth: &AuthSpec,
    ) -> Result<Value> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(EngineError::AuthFailure {
                service: service.to_string(),
            });
        }
        if self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::ServiceUnavailable {
                service: service.to_string(),
                message: "injected failure".into(),
            });
        }
        self.responses
            .read()
            .unwrap()
            .get(&format!("{service}/{operation}"))
            .cloned()
            .ok_or_else(|| EngineError::ServiceUnavailable {
                service: service.to_string(),
                message: format!("no scripted response for operation '{operation}'"),
            })
    }
}
