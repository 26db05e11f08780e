use std::panic::AssertUnwindSafe;

use crate::runtime::registry::OrchestrationRegistry;
use crate::{Action, EventKind, FaultKind, HistoryEvent, RetryPolicy, WorkflowFault, run_turn};

/// How a pass left the instance.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Waiting on outstanding work; the delta holds any newly scheduled steps.
    Continue,
    Completed(String),
    Failed(WorkflowFault),
    Terminated(String),
    /// History already ends the instance; nothing to do.
    AlreadyTerminal,
}

impl TurnOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnOutcome::Continue)
    }
}

/// Result of one replay pass: what to append and what to dispatch.
#[derive(Debug)]
pub struct Pass {
    /// Events to append, `seq` continuing from the history the pass read.
    pub history_delta: Vec<HistoryEvent>,
    /// Activity attempts to dispatch once the delta is durable.
    pub pending_actions: Vec<Action>,
    pub outcome: TurnOutcome,
}

impl Pass {
    fn terminal(base_seq: u64, outcome: TurnOutcome) -> Self {
        let kind = match &outcome {
            TurnOutcome::Completed(output) => Some(EventKind::OrchestratorCompleted { output: output.clone() }),
            TurnOutcome::Failed(fault) => Some(EventKind::OrchestratorFailed { fault: fault.clone() }),
            TurnOutcome::Terminated(reason) => Some(EventKind::OrchestratorTerminated { reason: reason.clone() }),
            TurnOutcome::Continue | TurnOutcome::AlreadyTerminal => None,
        };
        Self {
            history_delta: kind.map(|k| HistoryEvent::new(base_seq, k)).into_iter().collect(),
            pending_actions: Vec::new(),
            outcome,
        }
    }
}

/// Replay the instance's orchestration once against `history`.
///
/// Pure apart from the orchestration code itself: reads nothing but its
/// arguments and writes nothing. The caller persists `history_delta` and
/// only then dispatches `pending_actions`.
pub fn run_pass(
    instance: &str,
    history: &[HistoryEvent],
    orchestrations: &OrchestrationRegistry,
    retry: &RetryPolicy,
) -> Pass {
    let base_seq = history.len() as u64;

    let Some(EventKind::OrchestratorStarted { name, input, .. }) = history.first().map(|e| &e.kind) else {
        return Pass::terminal(
            base_seq,
            TurnOutcome::Failed(WorkflowFault::invalid_state("history does not begin with OrchestratorStarted")),
        );
    };

    if history.iter().any(|e| e.kind.is_terminal()) {
        return Pass::terminal(base_seq, TurnOutcome::AlreadyTerminal);
    }

    if let Some(reason) = history.iter().find_map(|e| match &e.kind {
        EventKind::TerminateRequested { reason } => Some(reason.clone()),
        _ => None,
    }) {
        tracing::debug!(target: "petflow::runtime::replay", instance = %instance, reason = %reason, "terminating");
        return Pass::terminal(base_seq, TurnOutcome::Terminated(reason));
    }

    let Some(handler) = orchestrations.get(name) else {
        return Pass::terminal(
            base_seq,
            TurnOutcome::Failed(WorkflowFault::new(
                FaultKind::Unregistered,
                format!("unregistered orchestration: {name}"),
            )),
        );
    };

    let turn = std::panic::catch_unwind(AssertUnwindSafe(|| {
        run_turn(instance, history.to_vec(), retry.clone(), |ctx| handler.invoke(ctx, input.clone()))
    }));
    let turn = match turn {
        Ok(turn) => turn,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            return Pass::terminal(
                base_seq,
                TurnOutcome::Failed(WorkflowFault::new(
                    FaultKind::Panicked,
                    format!("orchestration panicked: {detail}"),
                )),
            );
        }
    };

    if let Some(message) = turn.nondeterminism {
        tracing::warn!(target: "petflow::runtime::replay", instance = %instance, %message, "nondeterminism detected");
        return Pass::terminal(
            base_seq,
            TurnOutcome::Failed(WorkflowFault::new(FaultKind::Nondeterminism, message)),
        );
    }

    match turn.output {
        Some(Ok(output)) => Pass::terminal(base_seq, TurnOutcome::Completed(output)),
        Some(Err(fault)) => Pass::terminal(base_seq, TurnOutcome::Failed(fault)),
        None => {
            let history_delta = turn
                .actions
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, action)| HistoryEvent::new(base_seq + i as u64, action.into_event_kind()))
                .collect();
            let pending_actions = turn
                .actions
                .into_iter()
                .filter(|a| matches!(a, Action::ScheduleActivity { .. }))
                .collect();
            Pass {
                history_delta,
                pending_actions,
                outcome: TurnOutcome::Continue,
            }
        }
    }
}
