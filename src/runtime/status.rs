use serde::{Deserialize, Serialize};

use crate::{EventKind, HistoryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed | OrchestrationStatus::Failed | OrchestrationStatus::Terminated
        )
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of an instance, derived entirely from its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub orchestration_name: String,
    pub status: OrchestrationStatus,
    pub input: String,
    /// Output for `Completed`, the JSON-encoded fault for `Failed`, the reason
    /// for `Terminated`. `None` otherwise.
    pub output: Option<String>,
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
}

impl OrchestrationInstance {
    /// Returns `None` when the history does not start with `OrchestratorStarted`.
    pub fn from_history(instance_id: &str, history: &[HistoryEvent]) -> Option<Self> {
        let first = history.first()?;
        let EventKind::OrchestratorStarted { name, input, .. } = &first.kind else {
            return None;
        };
        let last = history.last().unwrap_or(first);

        let terminal = history.iter().rev().find(|e| e.kind.is_terminal());
        let (status, output) = match terminal.map(|e| &e.kind) {
            Some(EventKind::OrchestratorCompleted { output }) => (OrchestrationStatus::Completed, Some(output.clone())),
            Some(EventKind::OrchestratorFailed { fault }) => (
                OrchestrationStatus::Failed,
                // WorkflowFault is plain data; serialization cannot fail
                Some(serde_json::to_string(fault).unwrap_or_else(|_| fault.to_string())),
            ),
            Some(EventKind::OrchestratorTerminated { reason }) => {
                (OrchestrationStatus::Terminated, Some(reason.clone()))
            }
            _ if history.len() == 1 => (OrchestrationStatus::Pending, None),
            _ => (OrchestrationStatus::Running, None),
        };

        Some(Self {
            instance_id: instance_id.to_string(),
            orchestration_name: name.clone(),
            status,
            input: input.clone(),
            output,
            created_at_ms: first.timestamp_ms,
            last_updated_at_ms: last.timestamp_ms,
        })
    }

    /// Decode the fault of a `Failed` instance.
    pub fn fault(&self) -> Option<crate::WorkflowFault> {
        match (self.status, &self.output) {
            (OrchestrationStatus::Failed, Some(raw)) => serde_json::from_str(raw).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FaultKind, WorkflowFault};

    fn started() -> HistoryEvent {
        HistoryEvent {
            seq: 0,
            timestamp_ms: 10,
            kind: EventKind::OrchestratorStarted {
                name: "Flow".into(),
                input: "in".into(),
                idempotency_key: None,
            },
        }
    }

    fn at(seq: u64, ts: u64, kind: EventKind) -> HistoryEvent {
        HistoryEvent { seq, timestamp_ms: ts, kind }
    }

    #[test]
    fn only_started_is_pending() {
        let inst = OrchestrationInstance::from_history("i", &[started()]).unwrap();
        assert_eq!(inst.status, OrchestrationStatus::Pending);
        assert_eq!(inst.orchestration_name, "Flow");
        assert_eq!(inst.input, "in");
        assert_eq!(inst.output, None);
        assert_eq!(inst.created_at_ms, 10);
        assert_eq!(inst.last_updated_at_ms, 10);
    }

    #[test]
    fn later_non_terminal_event_is_running() {
        let hist = vec![
            started(),
            at(
                1,
                20,
                EventKind::ExternalEventRaised {
                    name: "Go".into(),
                    data: String::new(),
                },
            ),
        ];
        let inst = OrchestrationInstance::from_history("i", &hist).unwrap();
        assert_eq!(inst.status, OrchestrationStatus::Running);
        assert_eq!(inst.last_updated_at_ms, 20);
    }

    #[test]
    fn terminate_request_alone_is_still_running() {
        let hist = vec![
            started(),
            at(
                1,
                11,
                EventKind::TerminateRequested {
                    reason: "stop".into(),
                },
            ),
        ];
        let inst = OrchestrationInstance::from_history("i", &hist).unwrap();
        assert_eq!(inst.status, OrchestrationStatus::Running);
    }

    #[test]
    fn terminal_events_map_to_terminal_statuses() {
        let done = OrchestrationInstance::from_history(
            "i",
            &[started(), at(1, 30, EventKind::OrchestratorCompleted { output: "ok".into() })],
        )
        .unwrap();
        assert_eq!(done.status, OrchestrationStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("ok"));

        let fault = WorkflowFault::invalid_state("empty classification");
        let failed = OrchestrationInstance::from_history(
            "i",
            &[started(), at(1, 30, EventKind::OrchestratorFailed { fault: fault.clone() })],
        )
        .unwrap();
        assert_eq!(failed.status, OrchestrationStatus::Failed);
        assert_eq!(failed.fault(), Some(fault));
        assert_eq!(failed.fault().unwrap().kind, FaultKind::InvalidState);

        let terminated = OrchestrationInstance::from_history(
            "i",
            &[
                started(),
                at(1, 30, EventKind::TerminateRequested { reason: "bye".into() }),
                at(2, 31, EventKind::OrchestratorTerminated { reason: "bye".into() }),
            ],
        )
        .unwrap();
        assert_eq!(terminated.status, OrchestrationStatus::Terminated);
        assert_eq!(terminated.output.as_deref(), Some("bye"));
        assert!(terminated.status.is_terminal());
    }

    #[test]
    fn empty_history_has_no_instance() {
        assert!(OrchestrationInstance::from_history("i", &[]).is_none());
    }
}
