//! Workflow validation: lint rules and diagnostics.
//!
//! Provides built-in rules that check structural and semantic correctness of
//! a [`WorkflowDefinition`]. Call [`validate`] for advisory diagnostics or
//! [`validate_or_raise`] to fail on the first `Error`-severity issue.

use std::collections::{HashMap, HashSet};

use roundtable_types::{
    EngineError, MatchKind, NextTarget, Trigger, VariableSource, WorkflowDefinition,
};

use crate::condition::{parse_condition, CondExpr, Operand};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub variable: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn referenced_vars(expr: &CondExpr, out: &mut HashSet<String>) {
    match expr {
        CondExpr::Or(a, b) | CondExpr::And(a, b) => {
            referenced_vars(a, out);
            referenced_vars(b, out);
        }
        CondExpr::Not(inner) => referenced_vars(inner, out),
        CondExpr::Cmp { lhs, rhs, .. } => {
            operand_var(lhs, out);
            operand_var(rhs, out);
        }
        CondExpr::Truthy(op) => operand_var(op, out),
    }
}

fn operand_var(op: &Operand, out: &mut HashSet<String>) {
    if let Operand::Var(name) = op {
        out.insert(name.clone());
    }
}

fn trigger_participant(trigger: &Trigger) -> Option<&str> {
    match trigger {
        Trigger::AgentText { participant, .. } => Some(participant),
        Trigger::UiResponse { .. } => None,
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct DuplicateVariableRule;
impl LintRule for DuplicateVariableRule {
    fn name(&self) -> &str { "duplicate_variable" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut seen = HashMap::new();
        for def in &workflow.variables {
            *seen.entry(def.name.as_str()).or_insert(0usize) += 1;
        }
        seen.into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, count)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Variable '{name}' is declared {count} times"),
                variable: Some(name.to_string()),
                fix: Some("Remove or rename the duplicate declarations".into()),
            })
            .collect()
    }
}

struct ParticipantExistsRule;
impl LintRule for ParticipantExistsRule {
    fn name(&self) -> &str { "participant_exists" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for rule in &workflow.handoffs {
            if !workflow.has_participant(&rule.source) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!(
                        "Handoff rule references undeclared source participant '{}'",
                        rule.source
                    ),
                    variable: None,
                    fix: Some(format!("Declare '{}' in participants", rule.source)),
                });
            }
            if let NextTarget::Participant(ref target) = rule.target {
                if !workflow.has_participant(target) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Handoff rule references undeclared target participant '{target}'"
                        ),
                        variable: None,
                        fix: Some(format!("Declare '{target}' in participants")),
                    });
                }
            }
        }
        for def in &workflow.variables {
            let triggers: Vec<&Trigger> = match &def.source {
                VariableSource::State { transitions, .. } => {
                    transitions.iter().map(|t| &t.trigger).collect()
                }
                VariableSource::Computed { recompute_on, .. } => recompute_on.iter().collect(),
                _ => vec![],
            };
            for trigger in triggers {
                if let Some(p) = trigger_participant(trigger) {
                    if !workflow.has_participant(p) {
                        diags.push(Diagnostic {
                            rule: self.name().into(),
                            severity: Severity::Error,
                            message: format!(
                                "Trigger on variable '{}' references undeclared participant '{p}'",
                                def.name
                            ),
                            variable: Some(def.name.clone()),
                            fix: Some(format!("Declare '{p}' in participants")),
                        });
                    }
                }
            }
        }
        diags
    }
}

struct SingleUnconditionalRule;
impl LintRule for SingleUnconditionalRule {
    fn name(&self) -> &str { "single_unconditional" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut per_source: HashMap<&str, usize> = HashMap::new();
        for rule in &workflow.handoffs {
            if !rule.is_conditional() {
                *per_source.entry(rule.source.as_str()).or_insert(0) += 1;
            }
        }
        per_source
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(source, count)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Participant '{source}' has {count} unconditional handoff rules; at most one is allowed"
                ),
                variable: None,
                fix: Some("Add conditions or remove the extra fallback rules".into()),
            })
            .collect()
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str { "condition_syntax" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        workflow
            .handoffs
            .iter()
            .filter_map(|rule| {
                let cond = rule.condition.as_deref()?;
                match parse_condition(cond) {
                    Ok(_) => None,
                    Err(err) => Some(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Handoff {} -> {} has invalid condition '{}': {}",
                            rule.source, rule.target, cond, err
                        ),
                        variable: None,
                        fix: Some("Fix the condition expression syntax".into()),
                    }),
                }
            })
            .collect()
    }
}

struct ConditionVariablesDeclaredRule;
impl LintRule for ConditionVariablesDeclaredRule {
    fn name(&self) -> &str { "condition_variables_declared" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        let declared: HashSet<&str> = workflow.variables.iter().map(|d| d.name.as_str()).collect();
        let mut diags = Vec::new();
        for rule in &workflow.handoffs {
            let Some(cond) = rule.condition.as_deref() else { continue };
            let Ok(expr) = parse_condition(cond) else { continue };
            let mut referenced = HashSet::new();
            referenced_vars(&expr, &mut referenced);
            for name in referenced {
                if !declared.contains(name.as_str()) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Condition on handoff {} -> {} references undeclared variable '{name}'; it will compare as a zero value",
                            rule.source, rule.target
                        ),
                        variable: Some(name),
                        fix: Some("Declare the variable or fix the reference".into()),
                    });
                }
            }
        }
        diags
    }
}

struct ComputedInputsExistRule;
impl LintRule for ComputedInputsExistRule {
    fn name(&self) -> &str { "computed_inputs_exist" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        let declared: HashSet<&str> = workflow.variables.iter().map(|d| d.name.as_str()).collect();
        let mut diags = Vec::new();
        for def in &workflow.variables {
            if let VariableSource::Computed { inputs, .. } = &def.source {
                for input in inputs {
                    if !declared.contains(input.as_str()) {
                        diags.push(Diagnostic {
                            rule: self.name().into(),
                            severity: Severity::Error,
                            message: format!(
                                "Computed variable '{}' lists undeclared input '{input}'",
                                def.name
                            ),
                            variable: Some(def.name.clone()),
                            fix: Some(format!("Declare '{input}' or remove it from inputs")),
                        });
                    }
                    if input == &def.name {
                        diags.push(Diagnostic {
                            rule: self.name().into(),
                            severity: Severity::Error,
                            message: format!(
                                "Computed variable '{}' lists itself as an input",
                                def.name
                            ),
                            variable: Some(def.name.clone()),
                            fix: Some("Remove the self-reference".into()),
                        });
                    }
                }
            }
        }
        diags
    }
}

struct TriggerPatternRule;
impl LintRule for TriggerPatternRule {
    fn name(&self) -> &str { "trigger_pattern" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for def in &workflow.variables {
            let triggers: Vec<&Trigger> = match &def.source {
                VariableSource::State { transitions, .. } => {
                    transitions.iter().map(|t| &t.trigger).collect()
                }
                VariableSource::Computed { recompute_on, .. } => recompute_on.iter().collect(),
                _ => vec![],
            };
            for trigger in triggers {
                if let Trigger::AgentText {
                    rule: MatchKind::Regex,
                    pattern,
                    ..
                } = trigger
                {
                    if let Err(err) = regex::Regex::new(pattern) {
                        diags.push(Diagnostic {
                            rule: self.name().into(),
                            severity: Severity::Error,
                            message: format!(
                                "Trigger on variable '{}' has invalid regex '{pattern}': {err}",
                                def.name
                            ),
                            variable: Some(def.name.clone()),
                            fix: Some("Fix the regular expression".into()),
                        });
                    }
                }
            }
        }
        diags
    }
}

struct RequiredConfigResolvableRule;
impl LintRule for RequiredConfigResolvableRule {
    fn name(&self) -> &str { "required_config_resolvable" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        workflow
            .variables
            .iter()
            .filter_map(|def| match &def.source {
                VariableSource::Config {
                    env_key: None,
                    default: None,
                    required: true,
                } => Some(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!(
                        "Required config variable '{}' has neither env_key nor default and can never resolve",
                        def.name
                    ),
                    variable: Some(def.name.clone()),
                    fix: Some("Add an env_key or a default, or mark it optional".into()),
                }),
                _ => None,
            })
            .collect()
    }
}

struct TransitionValueTypeRule;
impl LintRule for TransitionValueTypeRule {
    fn name(&self) -> &str { "transition_value_type" }
    fn apply(&self, workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for def in &workflow.variables {
            if let VariableSource::State {
                default,
                transitions,
            } = &def.source
            {
                if !def.value_type.accepts(default) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "State variable '{}' has a default that is not a {:?}",
                            def.name, def.value_type
                        ),
                        variable: Some(def.name.clone()),
                        fix: Some("Align the default with the declared value_type".into()),
                    });
                }
                for t in transitions {
                    if !def.value_type.accepts(&t.to) {
                        diags.push(Diagnostic {
                            rule: self.name().into(),
                            severity: Severity::Warning,
                            message: format!(
                                "Transition on '{}' sets value {} which is not a {:?}",
                                def.name, t.to, def.value_type
                            ),
                            variable: Some(def.name.clone()),
                            fix: Some("Align the transition value with the declared value_type".into()),
                        });
                    }
                }
            }
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(workflow: &WorkflowDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(DuplicateVariableRule),
        Box::new(ParticipantExistsRule),
        Box::new(SingleUnconditionalRule),
        Box::new(ConditionSyntaxRule),
        Box::new(ConditionVariablesDeclaredRule),
        Box::new(ComputedInputsExistRule),
        Box::new(TriggerPatternRule),
        Box::new(RequiredConfigResolvableRule),
        Box::new(TransitionValueTypeRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(workflow));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(
    workflow: &WorkflowDefinition,
) -> roundtable_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(workflow);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(EngineError::DefinitionError(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use roundtable_types::{
        EvaluationTiming, HandoffRule, Transition, ValueType, VariableDefinition,
    };

    fn base_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test".into(),
            participants: vec!["Planner".into(), "Executor".into()],
            variables: vec![],
            handoffs: vec![],
            max_pre_turn_polls: 25,
        }
    }

    fn state_var(name: &str, default: serde_json::Value, transitions: Vec<Transition>) -> VariableDefinition {
        VariableDefinition {
            name: name.into(),
            value_type: ValueType::String,
            source: VariableSource::State {
                default,
                transitions,
            },
        }
    }

    fn handoff(source: &str, target: &str, condition: Option<&str>) -> HandoffRule {
        HandoffRule {
            source: source.into(),
            target: NextTarget::from(target.to_string()),
            condition: condition.map(String::from),
            timing: EvaluationTiming::PostTurn,
        }
    }

    #[test]
    fn valid_workflow_passes() {
        let mut wf = base_workflow();
        wf.variables = vec![state_var("status", serde_json::json!("pending"), vec![])];
        wf.handoffs = vec![
            handoff("Planner", "Executor", Some("${status} == 'approved'")),
            handoff("Planner", "user", None),
        ];
        let diags = validate(&wf);
        let errors: Vec<_> = diags.iter().filter(|d| d.severity == Severity::Error).collect();
        assert!(errors.is_empty(), "Expected no errors, got: {errors:?}");
    }

    #[test]
    fn duplicate_variable_error() {
        let mut wf = base_workflow();
        wf.variables = vec![
            state_var("status", serde_json::json!("a"), vec![]),
            state_var("status", serde_json::json!("b"), vec![]),
        ];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "duplicate_variable" && d.severity == Severity::Error));
    }

    #[test]
    fn undeclared_handoff_participants_error() {
        let mut wf = base_workflow();
        wf.handoffs = vec![handoff("Ghost", "Phantom", None)];
        let diags = validate(&wf);
        let count = diags.iter().filter(|d| d.rule == "participant_exists").count();
        assert_eq!(count, 2, "Expected source and target diagnostics, got: {diags:?}");
    }

    #[test]
    fn sentinel_targets_are_not_participants() {
        let mut wf = base_workflow();
        wf.handoffs = vec![
            handoff("Planner", "user", None),
            handoff("Executor", "terminate", Some("${done} == true")),
        ];
        let diags = validate(&wf);
        assert!(!diags.iter().any(|d| d.rule == "participant_exists"));
    }

    #[test]
    fn undeclared_trigger_participant_error() {
        let mut wf = base_workflow();
        wf.variables = vec![state_var(
            "status",
            serde_json::json!("pending"),
            vec![Transition {
                from: None,
                to: serde_json::json!("approved"),
                trigger: Trigger::AgentText {
                    participant: "Ghost".into(),
                    rule: MatchKind::Contains,
                    pattern: "ok".into(),
                },
            }],
        )];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "participant_exists" && d.message.contains("Ghost")));
    }

    #[test]
    fn two_unconditional_rules_error() {
        let mut wf = base_workflow();
        wf.handoffs = vec![
            handoff("Planner", "Executor", None),
            handoff("Planner", "user", None),
        ];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "single_unconditional" && d.severity == Severity::Error));
    }

    #[test]
    fn invalid_condition_syntax_error() {
        let mut wf = base_workflow();
        wf.handoffs = vec![handoff("Planner", "Executor", Some("${status} =="))];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "condition_syntax" && d.severity == Severity::Error));
    }

    #[test]
    fn undeclared_condition_variable_warning() {
        let mut wf = base_workflow();
        wf.handoffs = vec![handoff("Planner", "Executor", Some("${missing} == 'x'"))];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| {
            d.rule == "condition_variables_declared"
                && d.severity == Severity::Warning
                && d.variable.as_deref() == Some("missing")
        }));
    }

    #[test]
    fn computed_input_undeclared_error() {
        let mut wf = base_workflow();
        wf.variables = vec![VariableDefinition {
            name: "total".into(),
            value_type: ValueType::Integer,
            source: VariableSource::Computed {
                computation: "sum".into(),
                inputs: vec!["missing".into()],
                output: ValueType::Integer,
                persist_to: None,
                refresh: roundtable_types::RefreshPolicy::PerTurn,
                recompute_on: vec![],
            },
        }];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "computed_inputs_exist" && d.severity == Severity::Error));
    }

    #[test]
    fn computed_self_input_error() {
        let mut wf = base_workflow();
        wf.variables = vec![VariableDefinition {
            name: "total".into(),
            value_type: ValueType::Integer,
            source: VariableSource::Computed {
                computation: "sum".into(),
                inputs: vec!["total".into()],
                output: ValueType::Integer,
                persist_to: None,
                refresh: roundtable_types::RefreshPolicy::PerTurn,
                recompute_on: vec![],
            },
        }];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.message.contains("itself")));
    }

    #[test]
    fn invalid_trigger_regex_error() {
        let mut wf = base_workflow();
        wf.variables = vec![state_var(
            "status",
            serde_json::json!("pending"),
            vec![Transition {
                from: None,
                to: serde_json::json!("approved"),
                trigger: Trigger::AgentText {
                    participant: "Planner".into(),
                    rule: MatchKind::Regex,
                    pattern: "(unclosed".into(),
                },
            }],
        )];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "trigger_pattern" && d.severity == Severity::Error));
    }

    #[test]
    fn unresolvable_required_config_error() {
        let mut wf = base_workflow();
        wf.variables = vec![VariableDefinition {
            name: "region".into(),
            value_type: ValueType::String,
            source: VariableSource::Config {
                env_key: None,
                default: None,
                required: true,
            },
        }];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "required_config_resolvable" && d.severity == Severity::Error));
    }

    #[test]
    fn transition_type_mismatch_warning() {
        let mut wf = base_workflow();
        wf.variables = vec![state_var(
            "status",
            serde_json::json!("pending"),
            vec![Transition {
                from: None,
                to: serde_json::json!(42),
                trigger: Trigger::UiResponse {
                    component: "Gate".into(),
                    field: "approved".into(),
                },
            }],
        )];
        let diags = validate(&wf);
        assert!(diags.iter().any(|d| d.rule == "transition_value_type" && d.severity == Severity::Warning));
    }

    #[test]
    fn validate_or_raise_collects_error_messages() {
        let mut wf = base_workflow();
        wf.handoffs = vec![handoff("Ghost", "Executor", None)];
        let err = validate_or_raise(&wf).unwrap_err();
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn validate_or_raise_ok_with_warnings_only() {
        let mut wf = base_workflow();
        wf.handoffs = vec![handoff("Planner", "Executor", Some("${missing} == 1"))];
        let diags = validate_or_raise(&wf).unwrap();
        assert!(diags.iter().any(|d| d.severity == Severity::Warning));
    }
}
