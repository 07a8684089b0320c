//! Turn-by-turn session driver.
//!
//! One orchestrator owns one session. The external conversational layer
//! feeds it turn events; the orchestrator applies triggers, re-resolves
//! per-turn variables, routes the handoff, and reports who speaks next.
//! Turns within a session are strictly sequential.

use std::sync::Arc;

use roundtable_types::{
    EngineError, HandoffRule, NextTarget, RefreshPolicy, Result, TurnEvent, VariableDefinition,
    VariableSource, WorkflowDefinition,
};
use serde_json::Value;

use crate::condition::check_condition;
use crate::events::{EngineEvent, EventEmitter};
use crate::external::DocumentStore;
use crate::resolver::VariableResolver;
use crate::router::{pre_turn_rules, route};
use crate::store::{FlushScope, SessionState};
use crate::trigger::{apply_triggers, TriggerEffect};
use crate::validation::validate_or_raise;

/// The outcome of one processed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub next: NextTarget,
    pub effects: Vec<TriggerEffect>,
    /// Non-fatal resolution failures attached to the turn; the conversational
    /// layer decides whether to surface or retry them.
    pub errors: Vec<String>,
}

struct ArmedPreTurn {
    source: String,
    rules: Vec<HandoffRule>,
    polls_remaining: usize,
}

pub struct RuntimeOrchestrator {
    workflow: WorkflowDefinition,
    session: SessionState,
    resolver: VariableResolver,
    documents: Arc<dyn DocumentStore>,
    emitter: EventEmitter,
    session_id: String,
    armed: Option<ArmedPreTurn>,
}

impl RuntimeOrchestrator {
    /// Validate the workflow and construct an orchestrator for a fresh
    /// session. Definition errors abort here, before any turn runs.
    pub fn new(
        workflow: WorkflowDefinition,
        resolver: VariableResolver,
        documents: Arc<dyn DocumentStore>,
        emitter: EventEmitter,
    ) -> Result<Self> {
        validate_or_raise(&workflow)?;
        Ok(Self {
            workflow,
            session: SessionState::new(),
            resolver,
            documents,
            emitter,
            session_id: uuid::Uuid::new_v4().to_string(),
            armed: None,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Initialize the session: `State` defaults are installed and every other
    /// variable gets an initial resolution. A `required` variable that fails
    /// to resolve aborts session start.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(session_id = %self.session_id, workflow = %self.workflow.name, "Session starting");
        for def in &self.workflow.variables {
            match &def.source {
                VariableSource::State { default, .. } => {
                    self.session.set(&def.name, default.clone()).await;
                }
                _ => {
                    match self.resolver.resolve_into_session(def, &self.session).await {
                        Ok(_) => self.emitter.emit(EngineEvent::VariableResolved {
                            variable: def.name.clone(),
                            kind: def.source.kind().to_string(),
                        }),
                        Err(err) => {
                            if err.is_fatal() || is_required(def) {
                                return Err(err);
                            }
                            self.session.set(&def.name, Value::Null).await;
                            self.emitter.emit(EngineEvent::ResolutionFailed {
                                variable: def.name.clone(),
                                error: err.to_string(),
                                degraded: true,
                            });
                        }
                    }
                }
            }
        }
        self.emitter.emit(EngineEvent::SessionStarted {
            session_id: self.session_id.clone(),
            workflow: self.workflow.name.clone(),
        });
        Ok(())
    }

    /// Process one turn event. Triggers apply first, then per-turn variables
    /// re-resolve, then armed pre-turn rules are polled, then post-turn
    /// routing runs for the event's participant.
    pub async fn process_turn(&mut self, event: &TurnEvent) -> Result<TurnResult> {
        let effects = apply_triggers(event, &self.workflow, &self.session).await;
        let mut errors = Vec::new();

        for effect in &effects {
            match effect {
                TriggerEffect::Applied { variable, to } => {
                    self.emitter.emit(EngineEvent::TriggerFired {
                        variable: variable.clone(),
                        to: to.to_string(),
                    });
                }
                TriggerEffect::Recompute { variable } => {
                    if let Some(def) = self.workflow.variable(variable).cloned() {
                        self.resolve_degrading(&def, true, &mut errors).await?;
                    }
                }
            }
        }

        for def in self.per_turn_definitions() {
            self.resolve_degrading(&def, false, &mut errors).await?;
        }

        if let Some(next) = self.poll_pre_turn().await {
            return Ok(TurnResult {
                next,
                effects,
                errors,
            });
        }

        // A component response is not a participant turn; without a satisfied
        // pre-turn rule, control returns to the user.
        let Some(current) = event.participant().map(String::from) else {
            return Ok(TurnResult {
                next: NextTarget::User,
                effects,
                errors,
            });
        };

        let snapshot = self.session.snapshot().await;
        let decision = route(&current, &self.workflow, &snapshot);
        self.emitter.emit(EngineEvent::HandoffSelected {
            from: current.clone(),
            to: decision.next.to_string(),
            condition: decision.matched_condition.clone(),
        });

        self.arm_pre_turn(&current);

        Ok(TurnResult {
            next: decision.next,
            effects,
            errors,
        })
    }

    /// Write a value to a declared variable, honoring `DataEntity`
    /// persistence strategy (an `immediate` entity write persists before this
    /// returns).
    pub async fn write_variable(&self, name: &str, value: Value) -> Result<()> {
        let def = self
            .workflow
            .variable(name)
            .ok_or_else(|| EngineError::DefinitionError(format!("unknown variable '{name}'")))?;
        self.session
            .set_variable(def, value, self.documents.as_ref())
            .await
    }

    /// Phase transition: flush `on_phase_transition` writes and invalidate
    /// `per_phase` memoization.
    pub async fn advance_phase(&mut self) -> Result<usize> {
        let flushed = self
            .session
            .flush(&self.workflow.variables, self.documents.as_ref(), FlushScope::Phase)
            .await?;
        self.session.invalidate_phase().await;
        self.emitter.emit(EngineEvent::WritesFlushed { count: flushed });
        Ok(flushed)
    }

    /// Normal session end: flush every remaining deferred write.
    pub async fn end_session(&mut self) -> Result<usize> {
        let flushed = self
            .session
            .flush(&self.workflow.variables, self.documents.as_ref(), FlushScope::End)
            .await?;
        self.emitter.emit(EngineEvent::SessionEnded {
            session_id: self.session_id.clone(),
            writes_flushed: flushed,
        });
        tracing::info!(session_id = %self.session_id, flushed, "Session ended");
        Ok(flushed)
    }

    /// User abort: deferred writes are discarded. `immediate` writes already
    /// persisted synchronously, so durability for them is unaffected.
    pub async fn cancel(&mut self) {
        self.session.discard_pending().await;
        self.emitter.emit(EngineEvent::SessionEnded {
            session_id: self.session_id.clone(),
            writes_flushed: 0,
        });
        tracing::info!(session_id = %self.session_id, "Session cancelled");
    }

    fn per_turn_definitions(&self) -> Vec<VariableDefinition> {
        self.workflow
            .variables
            .iter()
            .filter(|d| d.source.refresh() == Some(RefreshPolicy::PerTurn))
            .cloned()
            .collect()
    }

    /// Resolve with the degradation policy: fatal errors and `required`
    /// variables propagate; everything else records the error, resolves to
    /// null, and lets the turn continue.
    async fn resolve_degrading(
        &self,
        def: &VariableDefinition,
        force: bool,
        errors: &mut Vec<String>,
    ) -> Result<()> {
        let resolved = if force {
            self.resolver.refresh_into_session(def, &self.session).await
        } else {
            self.resolver.resolve_into_session(def, &self.session).await
        };
        match resolved {
            Ok(_) => Ok(()),
            Err(err) if err.is_fatal() || is_required(def) => Err(err),
            Err(err) => {
                tracing::warn!(variable = %def.name, error = %err, "Resolution degraded to null");
                self.session.set(&def.name, Value::Null).await;
                self.emitter.emit(EngineEvent::ResolutionFailed {
                    variable: def.name.clone(),
                    error: err.to_string(),
                    degraded: true,
                });
                errors.push(format!("{}: {err}", def.name));
                Ok(())
            }
        }
    }

    /// Evaluate armed pre-turn rules against the current snapshot. The first
    /// true condition disarms and yields its target; a spent poll budget
    /// disarms without routing.
    async fn poll_pre_turn(&mut self) -> Option<NextTarget> {
        let mut armed = self.armed.take()?;
        let snapshot = self.session.snapshot().await;

        for rule in &armed.rules {
            let condition = rule.condition.as_deref().unwrap_or_default();
            if check_condition(condition, &snapshot) {
                let target = rule.target.clone();
                self.emitter.emit(EngineEvent::PreTurnSatisfied {
                    source: armed.source,
                    to: target.to_string(),
                });
                return Some(target);
            }
        }

        armed.polls_remaining = armed.polls_remaining.saturating_sub(1);
        if armed.polls_remaining == 0 {
            let polls = self.workflow.max_pre_turn_polls;
            tracing::warn!(source = %armed.source, polls, "Pre-turn rules expired without matching");
            self.emitter.emit(EngineEvent::PreTurnExpired {
                source: armed.source,
                polls,
            });
        } else {
            self.armed = Some(armed);
        }
        None
    }

    fn arm_pre_turn(&mut self, current: &str) {
        let rules: Vec<HandoffRule> = pre_turn_rules(current, &self.workflow)
            .into_iter()
            .cloned()
            .collect();
        if rules.is_empty() {
            return;
        }
        self.emitter.emit(EngineEvent::PreTurnArmed {
            source: current.to_string(),
            rule_count: rules.len(),
        });
        self.armed = Some(ArmedPreTurn {
            source: current.to_string(),
            rules,
            polls_remaining: self.workflow.max_pre_turn_polls,
        });
    }
}

fn is_required(def: &VariableDefinition) -> bool {
    matches!(
        def.source,
        VariableSource::Config { required: true, .. }
            | VariableSource::External { required: true, .. }
    )
}
