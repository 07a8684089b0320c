//! Engine event stream for observability.
//!
//! Emits [`EngineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, UIs, test harnesses) can watch session
//! progress without coupling to orchestrator internals.

use serde::{Deserialize, Serialize};

/// Events emitted during a workflow session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    SessionStarted {
        session_id: String,
        workflow: String,
    },
    SessionEnded {
        session_id: String,
        writes_flushed: usize,
    },
    TriggerFired {
        variable: String,
        to: String,
    },
    VariableResolved {
        variable: String,
        kind: String,
    },
    ResolutionFailed {
        variable: String,
        error: String,
        degraded: bool,
    },
    WritesFlushed {
        count: usize,
    },
    HandoffSelected {
        from: String,
        to: String,
        condition: Option<String>,
    },
    PreTurnArmed {
        source: String,
        rule_count: usize,
    },
    PreTurnSatisfied {
        source: String,
        to: String,
    },
    PreTurnExpired {
        source: String,
        polls: usize,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(EngineEvent::SessionStarted {
            session_id: "s-1".into(),
            workflow: "approval_flow".into(),
        });

        let event = rx.recv().await.unwrap();
        match event {
            EngineEvent::SessionStarted {
                session_id,
                workflow,
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(workflow, "approval_flow");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(EngineEvent::WritesFlushed { count: 2 });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();

        // Both subscribers should get the same event content.
        let json1 = serde_json::to_string(&e1).unwrap();
        let json2 = serde_json::to_string(&e2).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        // No subscriber — this must not panic.
        emitter.emit(EngineEvent::ResolutionFailed {
            variable: "weather".into(),
            error: "service 'weather' unavailable".into(),
            degraded: true,
        });
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = EngineEvent::HandoffSelected {
            from: "Planner".into(),
            to: "Executor".into(),
            condition: Some("${ready} == true".into()),
        };

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: EngineEvent = serde_json::from_str(&json).unwrap();

        match deserialized {
            EngineEvent::HandoffSelected { from, to, condition } => {
                assert_eq!(from, "Planner");
                assert_eq!(to, "Executor");
                assert_eq!(condition.as_deref(), Some("${ready} == true"));
            }
            other => panic!("unexpected variant after round-trip: {:?}", other),
        }
    }
}
