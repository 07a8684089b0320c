//! Handoff routing.
//!
//! After a participant's turn completes, this module determines who speaks
//! next based on a priority cascade: first conditional rule (declaration
//! order) whose expression is true, then the unconditional fallback rule,
//! then back to the user.

use std::collections::HashMap;

use roundtable_types::{EvaluationTiming, HandoffRule, NextTarget, WorkflowDefinition};
use serde_json::Value;

use crate::condition::check_condition;

/// The outcome of a routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub next: NextTarget,
    /// Condition text of the rule that fired, if a conditional rule fired.
    pub matched_condition: Option<String>,
}

impl RouteDecision {
    fn fallback_to_user() -> Self {
        Self {
            next: NextTarget::User,
            matched_condition: None,
        }
    }
}

/// Select the next target after `current` finishes a turn.
///
/// Only post-turn rules participate; pre-turn rules are armed separately and
/// polled at the start of subsequent turns. Conditional rules are evaluated
/// in declaration order and the first true condition wins, so routing is
/// deterministic for a given variable snapshot.
pub fn route(
    current: &str,
    workflow: &WorkflowDefinition,
    values: &HashMap<String, Value>,
) -> RouteDecision {
    let rules: Vec<&HandoffRule> = workflow
        .rules_from(current)
        .filter(|r| r.timing == EvaluationTiming::PostTurn)
        .collect();

    for rule in rules.iter().filter(|r| r.is_conditional()) {
        let condition = rule.condition.as_deref().unwrap_or_default();
        if check_condition(condition, values) {
            tracing::debug!(from = current, to = %rule.target, condition, "Handoff rule matched");
            return RouteDecision {
                next: rule.target.clone(),
                matched_condition: rule.condition.clone(),
            };
        }
    }

    if let Some(rule) = rules.iter().find(|r| !r.is_conditional()) {
        return RouteDecision {
            next: rule.target.clone(),
            matched_condition: None,
        };
    }

    tracing::debug!(from = current, "No handoff rule matched; returning to user");
    RouteDecision::fallback_to_user()
}

/// Pre-turn rules from `current`, in declaration order. The orchestrator
/// arms these after the turn's post-turn routing completes.
pub fn pre_turn_rules<'a>(
    current: &'a str,
    workflow: &'a WorkflowDefinition,
) -> Vec<&'a HandoffRule> {
    workflow
        .rules_from(current)
        .filter(|r| r.timing == EvaluationTiming::PreTurn)
        .collect()
}
