//! Trigger evaluation: maps an incoming turn event onto state transitions.
//!
//! Pure with respect to its inputs — the event, the workflow's variable
//! definitions, and the session values — so it can be unit tested without a
//! live conversational agent.

use regex::Regex;
use roundtable_types::{
    MatchKind, Transition, Trigger, TurnEvent, VariableSource, WorkflowDefinition,
};
use serde_json::Value;

use crate::store::SessionState;

/// The effect a matched trigger has on a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEffect {
    /// A `State` variable transitioned to a new value.
    Applied { variable: String, to: Value },
    /// A `Computed` variable must be re-resolved.
    Recompute { variable: String },
}

/// Whether an event satisfies a trigger.
pub fn matches_trigger(event: &TurnEvent, trigger: &Trigger) -> bool {
    match (event, trigger) {
        (
            TurnEvent::AgentText { participant, text },
            Trigger::AgentText {
                participant: expected,
                rule,
                pattern,
            },
        ) => {
            if participant != expected {
                return false;
            }
            match rule {
                MatchKind::Equals => text.trim() == pattern,
                MatchKind::Contains => text.contains(pattern.as_str()),
                // Invalid patterns are rejected at load time; treat as
                // non-matching here rather than panic.
                MatchKind::Regex => Regex::new(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false),
            }
        }
        (
            TurnEvent::UiResponse { component, payload },
            Trigger::UiResponse {
                component: expected,
                field,
            },
        ) => {
            component == expected
                && payload.get(field).map(|v| !v.is_null()).unwrap_or(false)
        }
        _ => false,
    }
}

/// First transition whose trigger matches the event and whose `from` guard
/// admits the current value. A trigger match with a failed `from` guard is a
/// skip, not an error, and scanning continues.
fn select_transition<'a>(
    event: &TurnEvent,
    transitions: &'a [Transition],
    current: &Value,
) -> Option<&'a Transition> {
    transitions.iter().find(|t| {
        matches_trigger(event, &t.trigger)
            && t.from.as_ref().map(|from| from == current).unwrap_or(true)
    })
}

/// Apply the event to every variable that declares triggers. `State`
/// transitions are applied directly; `Computed` recompute requests are
/// reported for the orchestrator to resolve.
pub async fn apply_triggers(
    event: &TurnEvent,
    workflow: &WorkflowDefinition,
    session: &SessionState,
) -> Vec<TriggerEffect> {
    let mut effects = Vec::new();
    for def in &workflow.variables {
        match &def.source {
            VariableSource::State { default, transitions } => {
                let current = session.get(&def.name).await.unwrap_or_else(|| default.clone());
                if let Some(transition) = select_transition(event, transitions, &current) {
                    session.set(&def.name, transition.to.clone()).await;
                    tracing::debug!(variable = %def.name, to = %transition.to, "Transition fired");
                    effects.push(TriggerEffect::Applied {
                        variable: def.name.clone(),
                        to: transition.to.clone(),
                    });
                }
            }
            VariableSource::Computed { recompute_on, .. } => {
                if recompute_on.iter().any(|t| matches_trigger(event, t)) {
                    effects.push(TriggerEffect::Recompute {
                        variable: def.name.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    effects
}
