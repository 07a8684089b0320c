//! End-to-end integration tests for the Roundtable engine.
//!
//! Each test exercises the full path: load workflow JSON -> validate ->
//! start a session -> feed turn events -> verify state, routing, and writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use roundtable_engine::{
    check_condition, ComputationRegistry, DocumentStore, EventEmitter, InMemoryDocumentStore,
    ResolutionCache, RuntimeOrchestrator, ScriptedService, StaticConfigSource, VariableResolver,
};
use roundtable_types::{NextTarget, TurnEvent, WorkflowDefinition};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: RuntimeOrchestrator,
    documents: Arc<InMemoryDocumentStore>,
    services: Arc<ScriptedService>,
}

fn harness(workflow_json: &str) -> Harness {
    harness_with(workflow_json, StaticConfigSource::default(), ComputationRegistry::new())
}

fn harness_with(
    workflow_json: &str,
    config: StaticConfigSource,
    computations: ComputationRegistry,
) -> Harness {
    let workflow = WorkflowDefinition::from_json(workflow_json).expect("workflow should parse");
    let documents = Arc::new(InMemoryDocumentStore::new());
    let services = Arc::new(ScriptedService::new());
    let resolver = VariableResolver::new(
        Arc::new(config),
        documents.clone(),
        services.clone(),
        computations,
        Arc::new(ResolutionCache::new()),
    );
    let orchestrator =
        RuntimeOrchestrator::new(workflow, resolver, documents.clone(), EventEmitter::default())
            .expect("workflow should validate");
    Harness {
        orchestrator,
        documents,
        services,
    }
}

fn gate_event(approved: bool) -> TurnEvent {
    TurnEvent::UiResponse {
        component: "Gate".into(),
        payload: json!({"approved": approved}).as_object().cloned().unwrap(),
    }
}

fn agent_text(participant: &str, text: &str) -> TurnEvent {
    TurnEvent::AgentText {
        participant: participant.into(),
        text: text.into(),
    }
}

// ---------------------------------------------------------------------------
// Scenario A/B: state transition via gate response, then conditional routing
// ---------------------------------------------------------------------------

const APPROVAL_FLOW: &str = r#"{
    "name": "approval_flow",
    "participants": ["Planner", "Executor"],
    "variables": [
        {
            "name": "approval_status",
            "value_type": "string",
            "source": {
                "kind": "state",
                "default": "pending",
                "transitions": [
                    {
                        "from": "pending",
                        "to": "approved",
                        "trigger": {"on": "ui_response", "component": "Gate", "field": "approved"}
                    }
                ]
            }
        }
    ],
    "handoffs": [
        {
            "source": "Planner",
            "target": "Executor",
            "condition": "${approval_status} == 'approved'"
        }
    ]
}"#;

#[tokio::test]
async fn gate_response_flips_approval_status() {
    let mut h = harness(APPROVAL_FLOW);
    h.orchestrator.start().await.unwrap();
    assert_eq!(
        h.orchestrator.session().get("approval_status").await,
        Some(json!("pending"))
    );

    h.orchestrator.process_turn(&gate_event(true)).await.unwrap();
    assert_eq!(
        h.orchestrator.session().get("approval_status").await,
        Some(json!("approved"))
    );
}

#[tokio::test]
async fn planner_routes_to_executor_only_after_approval() {
    let mut h = harness(APPROVAL_FLOW);
    h.orchestrator.start().await.unwrap();

    let before = h
        .orchestrator
        .process_turn(&agent_text("Planner", "plan drafted"))
        .await
        .unwrap();
    assert_eq!(before.next, NextTarget::User);

    h.orchestrator.process_turn(&gate_event(true)).await.unwrap();

    let after = h
        .orchestrator
        .process_turn(&agent_text("Planner", "plan approved, proceeding"))
        .await
        .unwrap();
    assert_eq!(after.next, NextTarget::Participant("Executor".into()));
}

#[tokio::test]
async fn from_guard_blocks_transition_from_wrong_state() {
    let mut h = harness(APPROVAL_FLOW);
    h.orchestrator.start().await.unwrap();
    h.orchestrator
        .session()
        .set("approval_status", json!("rejected"))
        .await;

    h.orchestrator.process_turn(&gate_event(true)).await.unwrap();
    // from="pending" does not admit "rejected"; value unchanged.
    assert_eq!(
        h.orchestrator.session().get("approval_status").await,
        Some(json!("rejected"))
    );
}

// ---------------------------------------------------------------------------
// Scenario C: external resolution with a TTL cache
// ---------------------------------------------------------------------------

const WEATHER_FLOW: &str = r#"{
    "name": "weather_flow",
    "participants": ["Concierge"],
    "variables": [
        {
            "name": "city",
            "value_type": "string",
            "source": {"kind": "config", "env_key": "CITY", "required": true}
        },
        {
            "name": "weather",
            "value_type": "object",
            "source": {
                "kind": "external",
                "service": "weather",
                "operation": "current",
                "params": {"city": "${city}"},
                "cache": {"ttl_secs": 300, "key": "weather:${city}"},
                "retry": {"max_attempts": 2, "base_ms": 0}
            }
        }
    ],
    "handoffs": []
}"#;

#[tokio::test(start_paused = true)]
async fn external_cache_expires_after_ttl() {
    let mut h = harness_with(
        WEATHER_FLOW,
        StaticConfigSource::default().with("CITY", "lisbon"),
        ComputationRegistry::new(),
    );
    h.services.respond("weather", "current", json!({"temp_c": 21}));
    h.orchestrator.start().await.unwrap();
    assert_eq!(h.services.call_count(), 1);

    // Second resolution within the TTL hits the cache.
    h.orchestrator
        .process_turn(&agent_text("Concierge", "checking again"))
        .await
        .unwrap();
    assert_eq!(h.services.call_count(), 1);

    tokio::time::advance(Duration::from_secs(301)).await;

    h.orchestrator
        .process_turn(&agent_text("Concierge", "after expiry"))
        .await
        .unwrap();
    assert_eq!(h.services.call_count(), 2);
}

#[tokio::test]
async fn degraded_external_failure_reported_not_fatal() {
    let mut h = harness_with(
        WEATHER_FLOW,
        StaticConfigSource::default().with("CITY", "lisbon"),
        ComputationRegistry::new(),
    );
    h.services.respond("weather", "current", json!({"temp_c": 21}));
    h.orchestrator.start().await.unwrap();

    h.services.fail_next_calls(5);
    let result = h
        .orchestrator
        .process_turn(&agent_text("Concierge", "forecast please"))
        .await
        .unwrap();
    assert_eq!(result.errors.len(), 1);
    assert_eq!(h.orchestrator.session().get("weather").await, Some(Value::Null));
}

// ---------------------------------------------------------------------------
// Idempotence: once-refresh reference reads the store exactly once
// ---------------------------------------------------------------------------

const CUSTOMER_FLOW: &str = r#"{
    "name": "customer_flow",
    "participants": ["Agent"],
    "variables": [
        {
            "name": "customer_email",
            "value_type": "string",
            "source": {"kind": "config", "env_key": "CUSTOMER_EMAIL", "required": true}
        },
        {
            "name": "customer_tier",
            "value_type": "string",
            "source": {
                "kind": "data_reference",
                "store": "primary",
                "collection": "customers",
                "query": {"email": "${customer_email}"},
                "field": "tier",
                "refresh": "once"
            }
        }
    ],
    "handoffs": [
        {
            "source": "Agent",
            "target": "user",
            "condition": "${customer_tier} == 'gold'"
        }
    ]
}"#;

#[tokio::test]
async fn once_reference_resolved_with_single_store_call() {
    let mut h = harness_with(
        CUSTOMER_FLOW,
        StaticConfigSource::default().with("CUSTOMER_EMAIL", "a@x.com"),
        ComputationRegistry::new(),
    );
    h.documents
        .seed("customers", json!({"email": "a@x.com", "tier": "gold"}));
    h.orchestrator.start().await.unwrap();
    assert_eq!(
        h.orchestrator.session().get("customer_tier").await,
        Some(json!("gold"))
    );

    for turn in 0..3 {
        h.orchestrator
            .process_turn(&agent_text("Agent", &format!("turn {turn}")))
            .await
            .unwrap();
    }
    assert_eq!(h.documents.read_calls(), 1);
}

// ---------------------------------------------------------------------------
// Entity round trip: immediate write visible on the same key
// ---------------------------------------------------------------------------

const ORDER_FLOW: &str = r#"{
    "name": "order_flow",
    "participants": ["Clerk"],
    "variables": [
        {
            "name": "order_id",
            "value_type": "string",
            "source": {"kind": "config", "env_key": "ORDER_ID", "required": true}
        },
        {
            "name": "order",
            "value_type": "object",
            "source": {
                "kind": "data_entity",
                "collection": "orders",
                "search_key": {"order_id": "${order_id}"},
                "schema": {"status": "string"},
                "write": "immediate",
                "retry": {"max_attempts": 2, "base_ms": 0}
            }
        }
    ],
    "handoffs": []
}"#;

#[tokio::test]
async fn immediate_entity_write_round_trips() {
    let mut h = harness_with(
        ORDER_FLOW,
        StaticConfigSource::default().with("ORDER_ID", "o-42"),
        ComputationRegistry::new(),
    );
    h.orchestrator.start().await.unwrap();

    h.orchestrator
        .write_variable("order", json!({"order_id": "o-42", "status": "open"}))
        .await
        .unwrap();

    let mut key = HashMap::new();
    key.insert("order_id".to_string(), json!("o-42"));
    let found = h
        .documents
        .find_one("orders", &key)
        .await
        .unwrap()
        .expect("record should exist before write_variable returned");
    assert_eq!(found["status"], "open");
}

// ---------------------------------------------------------------------------
// Conditions: zero-value defaulting and determinism
// ---------------------------------------------------------------------------

#[test]
fn condition_on_unresolved_variable_never_panics() {
    let values = HashMap::new();
    assert!(check_condition("${missing} == ''", &values));
    assert!(check_condition("${missing} == 0", &values));
    assert!(!check_condition("${missing} == true", &values));
    assert!(!check_condition("${missing} > 1", &values));
}

#[tokio::test]
async fn routing_is_deterministic_across_repeated_turns() {
    let mut h = harness(APPROVAL_FLOW);
    h.orchestrator.start().await.unwrap();
    h.orchestrator.process_turn(&gate_event(true)).await.unwrap();

    let mut targets = Vec::new();
    for _ in 0..5 {
        let result = h
            .orchestrator
            .process_turn(&agent_text("Planner", "status check"))
            .await
            .unwrap();
        targets.push(result.next);
    }
    assert!(targets
        .iter()
        .all(|t| *t == NextTarget::Participant("Executor".into())));
}

// ---------------------------------------------------------------------------
// Lifecycle: deferred writes flushed at session end, discarded on cancel
// ---------------------------------------------------------------------------

const SUMMARY_FLOW: &str = r#"{
    "name": "summary_flow",
    "participants": ["Scribe"],
    "variables": [
        {
            "name": "session_key",
            "value_type": "string",
            "source": {"kind": "config", "env_key": "SESSION_KEY", "required": true}
        },
        {
            "name": "summary",
            "value_type": "object",
            "source": {
                "kind": "data_entity",
                "collection": "summaries",
                "search_key": {"key": "${session_key}"},
                "write": "on_workflow_end",
                "retry": {"max_attempts": 2, "base_ms": 0}
            }
        }
    ],
    "handoffs": []
}"#;

#[tokio::test]
async fn end_session_flushes_deferred_entity_write() {
    let mut h = harness_with(
        SUMMARY_FLOW,
        StaticConfigSource::default().with("SESSION_KEY", "s-1"),
        ComputationRegistry::new(),
    );
    h.orchestrator.start().await.unwrap();

    h.orchestrator
        .write_variable("summary", json!({"text": "all done"}))
        .await
        .unwrap();
    assert_eq!(h.documents.write_calls(), 0);

    let flushed = h.orchestrator.end_session().await.unwrap();
    assert_eq!(flushed, 1);
    assert_eq!(h.documents.write_calls(), 1);
}

#[tokio::test]
async fn cancel_drops_deferred_entity_write() {
    let mut h = harness_with(
        SUMMARY_FLOW,
        StaticConfigSource::default().with("SESSION_KEY", "s-1"),
        ComputationRegistry::new(),
    );
    h.orchestrator.start().await.unwrap();

    h.orchestrator
        .write_variable("summary", json!({"text": "partial"}))
        .await
        .unwrap();
    h.orchestrator.cancel().await;
    assert_eq!(h.documents.write_calls(), 0);
}

// ---------------------------------------------------------------------------
// Computed pipeline: inputs, persistence, and phase flush
// ---------------------------------------------------------------------------

const SCORING_FLOW: &str = r#"{
    "name": "scoring_flow",
    "participants": ["Analyst"],
    "variables": [
        {
            "name": "session_key",
            "value_type": "string",
            "source": {"kind": "config", "env_key": "SESSION_KEY", "required": true}
        },
        {
            "name": "base_score",
            "value_type": "integer",
            "source": {"kind": "config", "env_key": "BASE_SCORE", "default": 50}
        },
        {
            "name": "risk_score",
            "value_type": "integer",
            "source": {
                "kind": "computed",
                "computation": "risk",
                "inputs": ["base_score"],
                "output": "integer",
                "persist_to": {"collection": "scores", "key": "risk:${session_key}"}
            }
        }
    ],
    "handoffs": [
        {
            "source": "Analyst",
            "target": "user",
            "condition": "${risk_score} > 60"
        }
    ]
}"#;

#[tokio::test]
async fn computed_variable_resolves_and_persists_on_phase_flush() {
    let mut computations = ComputationRegistry::new();
    computations.register("risk", |inputs| {
        let base = inputs["base_score"].as_i64().unwrap_or(0);
        Ok(json!(base + 20))
    });
    let mut h = harness_with(
        SCORING_FLOW,
        StaticConfigSource::default()
            .with("SESSION_KEY", "s-1")
            .with("BASE_SCORE", "55"),
        computations,
    );
    h.orchestrator.start().await.unwrap();
    assert_eq!(
        h.orchestrator.session().get("risk_score").await,
        Some(json!(75))
    );

    let result = h
        .orchestrator
        .process_turn(&agent_text("Analyst", "scored"))
        .await
        .unwrap();
    assert_eq!(result.next, NextTarget::User);

    let flushed = h.orchestrator.advance_phase().await.unwrap();
    assert_eq!(flushed, 1);
    let mut key = HashMap::new();
    key.insert("key".to_string(), json!("risk:s-1"));
    let record = h
        .documents
        .find_one("scores", &key)
        .await
        .unwrap()
        .expect("persisted score should be queryable by key");
    assert_eq!(record["value"], json!(75));
}
