//! Shared types for the Roundtable handoff engine.
//!
//! This crate provides the foundational types used across the other Roundtable
//! crates:
//! - `EngineError` — unified error taxonomy
//! - `ValueType` — the closed set of variable value types
//! - `WorkflowDefinition` and friends — the authored, immutable workflow model
//! - `TurnEvent` — the events the orchestrator consumes each turn

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified error type for all Roundtable subsystems.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // === Resolution errors ===
    #[error("Config variable '{variable}' has no environment value and no default")]
    MissingConfig { variable: String },

    #[error("No record found in '{collection}' for variable '{variable}'")]
    RecordNotFound {
        collection: String,
        variable: String,
    },

    #[error("Store '{store}' unavailable: {message}")]
    StoreUnavailable { store: String, message: String },

    #[error("Schema mismatch writing to '{collection}': {message}")]
    SchemaMismatch {
        collection: String,
        message: String,
    },

    #[error("No computation registered under '{name}'")]
    UnknownComputation { name: String },

    #[error("Computation '{computation}' is missing input variable '{input}'")]
    InputMissing {
        computation: String,
        input: String,
    },

    // === External service errors ===
    #[error("Authentication failed for service '{service}'")]
    AuthFailure { service: String },

    #[error("Service '{service}' unavailable: {message}")]
    ServiceUnavailable { service: String, message: String },

    #[error("Call to service '{service}' timed out after {timeout_ms}ms")]
    ServiceTimeout { service: String, timeout_ms: u64 },

    // === Persistence errors ===
    #[error("Deferred write for variable '{variable}' failed after {attempts} attempts")]
    WriteFailed { variable: String, attempts: usize },

    // === Load-time errors ===
    #[error("Workflow definition invalid: {0}")]
    DefinitionError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StoreUnavailable { .. }
                | EngineError::ServiceUnavailable { .. }
                | EngineError::ServiceTimeout { .. }
        )
    }

    /// Returns `true` if the error must abort the turn (or session start) rather
    /// than degrade to a null value.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::AuthFailure { .. }
                | EngineError::SchemaMismatch { .. }
                | EngineError::WriteFailed { .. }
                | EngineError::DefinitionError(_)
        )
    }
}

/// A convenience alias for `Result<T, EngineError>`.
pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// ValueType — the closed set of variable value types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Integer,
    Float,
    Boolean,
    Object,
}

impl ValueType {
    /// The type-appropriate zero value, used when a variable is unresolved.
    pub fn zero_value(&self) -> Value {
        match self {
            ValueType::String => Value::String(String::new()),
            ValueType::Integer => serde_json::json!(0),
            ValueType::Float => serde_json::json!(0.0),
            ValueType::Boolean => Value::Bool(false),
            ValueType::Object => Value::Object(serde_json::Map::new()),
        }
    }

    /// Whether a runtime value is acceptable for this declared type.
    /// Null is always accepted: unresolved reads degrade to null by design.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ValueType::String, Value::String(_)) => true,
            (ValueType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ValueType::Float, Value::Number(_)) => true,
            (ValueType::Boolean, Value::Bool(_)) => true,
            (ValueType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Policies — refresh, write, retry, cache, auth
// ---------------------------------------------------------------------------

/// How often a read-only external value is re-fetched within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    #[default]
    Once,
    PerPhase,
    PerTurn,
}

/// When a `DataEntity` write is persisted to the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    Immediate,
    #[default]
    OnPhaseTransition,
    OnWorkflowEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Linear,
    #[default]
    Exponential,
}

/// Retry policy for store writes and external service calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "RetrySpec::default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "RetrySpec::default_base_ms")]
    pub base_ms: u64,
}

impl RetrySpec {
    fn default_max_attempts() -> usize {
        3
    }

    fn default_base_ms() -> u64 {
        500
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff: Backoff::default(),
            base_ms: Self::default_base_ms(),
        }
    }
}

/// Caching policy for `External` resolutions. The key is a `${var}` template
/// interpolated from session values, which keeps cache entries session-scoped
/// by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub ttl_secs: u64,
    pub key: String,
}

/// Authentication for `External` service calls. The engine never stores
/// credentials; it carries the name of the environment key holding the token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpec {
    #[serde(default)]
    pub token_env: Option<String>,
}

/// Persistence target for a `Computed` variable's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistSpec {
    pub collection: String,
    /// `${var}` template for the record key.
    pub key: String,
}

// ---------------------------------------------------------------------------
// VariableSource — the six-kind tagged union
// ---------------------------------------------------------------------------

fn default_computed_refresh() -> RefreshPolicy {
    RefreshPolicy::PerTurn
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// Where a variable's value comes from. Exactly one kind per definition;
/// a document populating the wrong fields fails at deserialization, not at
/// runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableSource {
    /// Deployment-level setting, read once at session start. Never persisted.
    Config {
        #[serde(default)]
        env_key: Option<String>,
        #[serde(default)]
        default: Option<Value>,
        #[serde(default)]
        required: bool,
    },

    /// Read-only projection of an existing record in an external store.
    DataReference {
        store: String,
        collection: String,
        /// Field name -> `${var}` template; interpolated per query.
        query: HashMap<String, String>,
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        refresh: RefreshPolicy,
    },

    /// A record this workflow instance owns and may create or update.
    DataEntity {
        collection: String,
        /// Field name -> `${var}` template identifying the record.
        search_key: HashMap<String, String>,
        #[serde(default)]
        schema: HashMap<String, ValueType>,
        #[serde(default)]
        write: WriteStrategy,
        #[serde(default)]
        retry: RetrySpec,
    },

    /// Derived from other variables via a named pure computation.
    Computed {
        computation: String,
        inputs: Vec<String>,
        output: ValueType,
        #[serde(default)]
        persist_to: Option<PersistSpec>,
        #[serde(default = "default_computed_refresh")]
        refresh: RefreshPolicy,
        /// Extra triggers forcing a recomputation on a specific event.
        #[serde(default)]
        recompute_on: Vec<Trigger>,
    },

    /// Workflow-orchestration state, mutated only by triggers.
    State {
        default: Value,
        #[serde(default)]
        transitions: Vec<Transition>,
    },

    /// Fetched from a third-party service call.
    External {
        service: String,
        operation: String,
        #[serde(default)]
        params: HashMap<String, String>,
        #[serde(default)]
        auth: AuthSpec,
        #[serde(default)]
        cache: Option<CacheSpec>,
        #[serde(default)]
        retry: RetrySpec,
        #[serde(default = "default_computed_refresh")]
        refresh: RefreshPolicy,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        required: bool,
    },
}

impl VariableSource {
    /// The kind tag as it appears in workflow documents.
    pub fn kind(&self) -> &'static str {
        match self {
            VariableSource::Config { .. } => "config",
            VariableSource::DataReference { .. } => "data_reference",
            VariableSource::DataEntity { .. } => "data_entity",
            VariableSource::Computed { .. } => "computed",
            VariableSource::State { .. } => "state",
            VariableSource::External { .. } => "external",
        }
    }

    /// Refresh policy, for the kinds that have one.
    pub fn refresh(&self) -> Option<RefreshPolicy> {
        match self {
            VariableSource::DataReference { refresh, .. }
            | VariableSource::Computed { refresh, .. }
            | VariableSource::External { refresh, .. } => Some(*refresh),
            _ => None,
        }
    }
}

/// A variable definition, authored once per workflow and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    pub value_type: ValueType,
    pub source: VariableSource,
}

// ---------------------------------------------------------------------------
// Triggers and transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Equals,
    Contains,
    Regex,
}

/// What causes a transition to fire, and when the routing layer may observe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum Trigger {
    /// Matches against the full text emitted by the named participant.
    AgentText {
        participant: String,
        rule: MatchKind,
        pattern: String,
    },
    /// Matches a structured response from an interactive component: the
    /// component id must match and the named field must be present and
    /// non-null.
    UiResponse { component: String, field: String },
}

/// A declared transition on a `State` variable. `from: None` means "any".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub from: Option<Value>,
    pub to: Value,
    pub trigger: Trigger,
}

// ---------------------------------------------------------------------------
// Handoff rules and routing targets
// ---------------------------------------------------------------------------

/// An addressable routing target: a declared participant or one of the two
/// sentinels. Serialized as a plain string; `"user"` and `"terminate"` are
/// reserved names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NextTarget {
    Participant(String),
    User,
    Terminate,
}

impl From<String> for NextTarget {
    fn from(s: String) -> Self {
        match s.as_str() {
            "user" => NextTarget::User,
            "terminate" => NextTarget::Terminate,
            _ => NextTarget::Participant(s),
        }
    }
}

impl From<NextTarget> for String {
    fn from(t: NextTarget) -> Self {
        match t {
            NextTarget::Participant(p) => p,
            NextTarget::User => "user".to_string(),
            NextTarget::Terminate => "terminate".to_string(),
        }
    }
}

impl std::fmt::Display for NextTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextTarget::Participant(p) => write!(f, "{p}"),
            NextTarget::User => write!(f, "user"),
            NextTarget::Terminate => write!(f, "terminate"),
        }
    }
}

/// When a conditional handoff rule is evaluated relative to the source
/// participant's turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationTiming {
    #[default]
    PostTurn,
    PreTurn,
}

/// A handoff rule. A rule is conditional iff `condition` is present, which
/// makes the "condition present iff conditional" invariant unrepresentable
/// to violate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRule {
    pub source: String,
    pub target: NextTarget,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub timing: EvaluationTiming,
}

impl HandoffRule {
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition — the authored document, loaded once per session
// ---------------------------------------------------------------------------

fn default_max_pre_turn_polls() -> usize {
    25
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub participants: Vec<String>,
    pub variables: Vec<VariableDefinition>,
    pub handoffs: Vec<HandoffRule>,
    /// Upper bound on how many turns a pre-turn condition is re-checked
    /// before it is dropped.
    #[serde(default = "default_max_pre_turn_polls")]
    pub max_pre_turn_polls: usize,
}

impl WorkflowDefinition {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Handoff rules whose source is the given participant, in authoring order.
    pub fn rules_from<'a>(
        &'a self,
        participant: &'a str,
    ) -> impl Iterator<Item = &'a HandoffRule> {
        self.handoffs.iter().filter(move |r| r.source == participant)
    }

    pub fn has_participant(&self, name: &str) -> bool {
        self.participants.iter().any(|p| p == name)
    }
}

// ---------------------------------------------------------------------------
// TurnEvent — what the orchestrator consumes each turn
// ---------------------------------------------------------------------------

/// One unit of input to the engine: either the text a participant emitted
/// this turn, or an asynchronous interactive-component response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    AgentText {
        participant: String,
        text: String,
    },
    UiResponse {
        component: String,
        payload: serde_json::Map<String, Value>,
    },
}

impl TurnEvent {
    /// The participant whose turn produced this event, when there is one.
    pub fn participant(&self) -> Option<&str> {
        match self {
            TurnEvent::AgentText { participant, .. } => Some(participant),
            TurnEvent::UiResponse { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// DeferredWrite — a queued persistence operation
// ---------------------------------------------------------------------------

/// A persistence operation queued against the external store but not yet
/// flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredWrite {
    pub variable: String,
    pub collection: String,
    /// Field name -> concrete value identifying the record.
    pub key: HashMap<String, Value>,
    pub record: Value,
    pub strategy: WriteStrategy,
    pub retry: RetrySpec,
    pub queued_at: chrono::DateTime<chrono::Utc>,
}
