//! Variable resolution: computes the current value of a variable definition
//! against its declared source kind.
//!
//! The resolver is stateless given its inputs; memoization and value storage
//! live in [`SessionState`]. Degradation policy (null for failed reads,
//! fatal for required variables) belongs to the orchestrator — `resolve`
//! reports errors strictly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use roundtable_types::{
    DeferredWrite, EngineError, Result, ValueType, VariableDefinition, VariableSource,
    WriteStrategy,
};
use serde_json::Value;

use crate::cache::ResolutionCache;
use crate::computation::ComputationRegistry;
use crate::external::{ConfigSource, DocumentStore, ExternalService};
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::store::SessionState;
use crate::template::{interpolate, interpolate_map};

pub struct VariableResolver {
    config: Arc<dyn ConfigSource>,
    documents: Arc<dyn DocumentStore>,
    services: Arc<dyn ExternalService>,
    computations: ComputationRegistry,
    cache: Arc<ResolutionCache>,
}

impl VariableResolver {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        documents: Arc<dyn DocumentStore>,
        services: Arc<dyn ExternalService>,
        computations: ComputationRegistry,
        cache: Arc<ResolutionCache>,
    ) -> Self {
        Self {
            config,
            documents,
            services,
            computations,
            cache,
        }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Resolve the current value of a variable. Does not write the session;
    /// use [`resolve_into_session`](Self::resolve_into_session) for the
    /// store-and-memoize path.
    pub async fn resolve(
        &self,
        def: &VariableDefinition,
        session: &SessionState,
    ) -> Result<Value> {
        match &def.source {
            VariableSource::Config {
                env_key,
                default,
                required,
            } => self.resolve_config(def, env_key.as_deref(), default.as_ref(), *required),

            VariableSource::DataReference {
                store,
                collection,
                query,
                field,
                ..
            } => {
                self.resolve_reference(def, store, collection, query, field.as_deref(), session)
                    .await
            }

            VariableSource::DataEntity {
                collection,
                search_key,
                ..
            } => {
                self.resolve_entity(def, collection, search_key, session)
                    .await
            }

            VariableSource::Computed {
                computation,
                inputs,
                output,
                persist_to,
                ..
            } => {
                self.resolve_computed(def, computation, inputs, *output, persist_to.as_ref(), session)
                    .await
            }

            // State variables are mutated exclusively by triggers; resolution
            // just reads the stored value.
            VariableSource::State { default, .. } => Ok(session
                .get(&def.name)
                .await
                .unwrap_or_else(|| default.clone())),

            VariableSource::External {
                service,
                operation,
                params,
                auth,
                cache,
                retry,
                timeout_ms,
                ..
            } => {
                self.resolve_external(
                    service,
                    operation,
                    params,
                    auth,
                    cache.as_ref(),
                    retry,
                    *timeout_ms,
                    session,
                )
                .await
            }
        }
    }

    /// Resolve and store: honors memoization (a `once`/`per_phase` variable
    /// whose value is current is returned without re-resolving), writes the
    /// value into the session, and records the refresh policy.
    pub async fn resolve_into_session(
        &self,
        def: &VariableDefinition,
        session: &SessionState,
    ) -> Result<Value> {
        if def.source.refresh().is_some() && session.is_resolved(&def.name).await {
            if let Some(value) = session.get(&def.name).await {
                return Ok(value);
            }
        }
        self.refresh_into_session(def, session).await
    }

    /// Resolve ignoring memoization, store the value, and re-mark it current.
    /// Used when a trigger explicitly requests recomputation.
    pub async fn refresh_into_session(
        &self,
        def: &VariableDefinition,
        session: &SessionState,
    ) -> Result<Value> {
        let value = self.resolve(def, session).await?;
        session.set(&def.name, value.clone()).await;
        if let Some(refresh) = def.source.refresh() {
            session.mark_resolved(&def.name, refresh).await;
        }
        Ok(value)
    }

    fn resolve_config(
        &self,
        def: &VariableDefinition,
        env_key: Option<&str>,
        default: Option<&Value>,
        required: bool,
    ) -> Result<Value> {
        if let Some(key) = env_key {
            if let Some(raw) = self.config.get(key) {
                return Ok(coerce_config(&raw, def.value_type));
            }
        }
        if let Some(value) = default {
            return Ok(value.clone());
        }
        if required {
            return Err(EngineError::MissingConfig {
                variable: def.name.clone(),
            });
        }
        Ok(Value::Null)
    }

    async fn resolve_reference(
        &self,
        def: &VariableDefinition,
        store: &str,
        collection: &str,
        query: &HashMap<String, String>,
        field: Option<&str>,
        session: &SessionState,
    ) -> Result<Value> {
        let snapshot = session.snapshot().await;
        let filter = interpolate_map(query, &snapshot);
        tracing::debug!(variable = %def.name, store, collection, "Resolving data reference");

        let record = execute_with_retry(
            || self.documents.find_one(collection, &filter),
            3,
            &BackoffPolicy::default(),
            &def.name,
        )
        .await?;

        // A missing record is non-fatal: the variable resolves to null.
        let Some(record) = record else {
            tracing::debug!(variable = %def.name, collection, "No record matched; resolving to null");
            return Ok(Value::Null);
        };
        Ok(match field {
            Some(f) => record.get(f).cloned().unwrap_or(Value::Null),
            None => record,
        })
    }

    async fn resolve_entity(
        &self,
        def: &VariableDefinition,
        collection: &str,
        search_key: &HashMap<String, String>,
        session: &SessionState,
    ) -> Result<Value> {
        let snapshot = session.snapshot().await;
        let filter = interpolate_map(search_key, &snapshot);

        let record = execute_with_retry(
            || self.documents.find_one(collection, &filter),
            3,
            &BackoffPolicy::default(),
            &def.name,
        )
        .await?;

        // The record may not exist yet: the entity is created by this
        // workflow instance on first write.
        Ok(record.unwrap_or_else(|| def.value_type.zero_value()))
    }

    async fn resolve_computed(
        &self,
        def: &VariableDefinition,
        computation: &str,
        inputs: &[String],
        output: ValueType,
        persist_to: Option<&roundtable_types::PersistSpec>,
        session: &SessionState,
    ) -> Result<Value> {
        let snapshot = session.snapshot().await;
        let mut input_values = HashMap::new();
        for input in inputs {
            let value = snapshot
                .get(input)
                .cloned()
                .ok_or_else(|| EngineError::InputMissing {
                    computation: computation.to_string(),
                    input: input.clone(),
                })?;
            input_values.insert(input.clone(), value);
        }

        let f = self.computations.get(computation)?;
        let value = f(&input_values)?;
        if !output.accepts(&value) {
            return Err(EngineError::Other(format!(
                "computation '{computation}' produced a value that is not a {output:?}"
            )));
        }

        if let Some(persist) = persist_to {
            let record_key = interpolate(&persist.key, &snapshot);
            let mut key = HashMap::new();
            key.insert("key".to_string(), Value::String(record_key.clone()));
            // Scalar results are wrapped so the stored record stays queryable
            // by its key field.
            let record = serde_json::json!({"key": record_key, "value": value});
            session
                .queue_write(DeferredWrite {
                    variable: def.name.clone(),
                    collection: persist.collection.clone(),
                    key,
                    record,
                    strategy: WriteStrategy::OnPhaseTransition,
                    retry: Default::default(),
                    queued_at: chrono::Utc::now(),
                })
                .await;
        }
        Ok(value)
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_external(
        &self,
        service: &str,
        operation: &str,
        params: &HashMap<String, String>,
        auth: &roundtable_types::AuthSpec,
        cache: Option<&roundtable_types::CacheSpec>,
        retry: &roundtable_types::RetrySpec,
        timeout_ms: u64,
        session: &SessionState,
    ) -> Result<Value> {
        let snapshot = session.snapshot().await;

        let cache_key = cache.map(|spec| interpolate(&spec.key, &snapshot));
        if let Some(ref key) = cache_key {
            if let Some(hit) = self.cache.get(key) {
                tracing::debug!(service, operation, key = %key, "External cache hit");
                return Ok(hit);
            }
        }

        if let Some(ref token_env) = auth.token_env {
            if self.config.get(token_env).is_none() {
                return Err(EngineError::AuthFailure {
                    service: service.to_string(),
                });
            }
        }

        let call_params = interpolate_map(params, &snapshot);
        let policy = BackoffPolicy::from(retry);
        let timeout = Duration::from_millis(timeout_ms);
        let value = execute_with_retry(
            || async {
                match tokio::time::timeout(
                    timeout,
                    self.services.call(service, operation, &call_params, auth),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::ServiceTimeout {
                        service: service.to_string(),
                        timeout_ms,
                    }),
                }
            },
            retry.max_attempts,
            &policy,
            service,
        )
        .await?;

        if let (Some(spec), Some(key)) = (cache, cache_key) {
            self.cache
                .insert(key, value.clone(), Duration::from_secs(spec.ttl_secs));
        }
        Ok(value)
    }
}

/// Parse a raw config string into the declared value type. Unparseable input
/// falls back to the raw string.
fn coerce_config(raw: &str, ty: ValueType) -> Value {
    match ty {
        ValueType::String => Value::String(raw.to_string()),
        ValueType::Integer => raw
            .parse::<i64>()
            .map(|n| serde_json::json!(n))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        ValueType::Float => raw
            .parse::<f64>()
            .map(|n| serde_json::json!(n))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        ValueType::Boolean => match raw {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        ValueType::Object => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        }
    }
}
