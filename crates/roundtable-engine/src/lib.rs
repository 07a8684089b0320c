//! Context-variable resolution and conditional handoff routing.
//!
//! This crate implements the Roundtable runtime engine: the six-kind variable
//! resolver, event-driven trigger evaluation, the condition expression
//! language, handoff routing, per-session state with deferred writes, and the
//! turn orchestrator that ties them together.

pub mod cache;
pub mod computation;
pub mod condition;
pub mod events;
pub mod external;
pub mod orchestrator;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod store;
pub mod template;
pub mod trigger;
pub mod validation;

pub use cache::ResolutionCache;
pub use computation::{Computation, ComputationRegistry};
pub use condition::{
    check_condition, evaluate_condition, parse_condition, CmpOp, CondExpr, Operand,
};
pub use events::{EngineEvent, EventEmitter};
pub use external::{
    ConfigSource, DocumentStore, EnvConfigSource, ExternalService, InMemoryDocumentStore,
    ScriptedService, StaticConfigSource,
};
pub use orchestrator::{RuntimeOrchestrator, TurnResult};
pub use resolver::VariableResolver;
pub use retry::{execute_with_retry, BackoffPolicy};
pub use router::{pre_turn_rules, route, RouteDecision};
pub use store::{FlushScope, SessionState};
pub use template::{interpolate, interpolate_map};
pub use trigger::{apply_triggers, matches_trigger, TriggerEffect};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
