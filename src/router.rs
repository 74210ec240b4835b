//! Pure step routing for the workflow state machine.
//!
//! `route` and the `after_*` transitions never touch I/O, so replaying them
//! over an externally supplied state is always safe. That property is what
//! makes approval resume work: the caller hands the paused state back and
//! the machine picks up exactly where the gate halted it.

use crate::models::{is_mutating_operation, ExecutionState, StepAgent, WorkflowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Orchestrating,
    RunningDataStep,
    CheckingCompliance,
    RunningExecutionStep,
    Notifying,
    Summarizing,
}

/// Choose the next node from the step the cursor points at.
pub fn route(state: &ExecutionState) -> Node {
    let step = match state.current_step() {
        Some(step) => step,
        None => return Node::Summarizing,
    };
    match step.agent {
        StepAgent::Data => Node::RunningDataStep,
        StepAgent::Execution => Node::CheckingCompliance,
        StepAgent::Unknown => Node::Summarizing,
    }
}

/// After the gate: a halted run goes straight to the summarizer so the
/// caller sees the pending approval; otherwise the step may execute.
pub fn after_compliance(state: &ExecutionState) -> Node {
    if state.status == WorkflowStatus::AwaitingApproval {
        Node::Summarizing
    } else {
        Node::RunningExecutionStep
    }
}

/// After an execution step: mutating operations get a notification,
/// everything else re-enters routing for the next step.
pub fn after_execution(state: &ExecutionState) -> Node {
    let completed = state
        .step_idx
        .checked_sub(1)
        .and_then(|idx| state.plan.get(idx));
    match completed {
        Some(step) if is_mutating_operation(&step.operation) => Node::Notifying,
        _ => route(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Step;
    use serde_json::Map;

    fn state_with_plan(steps: Vec<(StepAgent, &str)>) -> ExecutionState {
        let mut state = ExecutionState::default();
        state.plan = steps
            .into_iter()
            .map(|(agent, operation)| Step {
                agent,
                operation: operation.to_string(),
                args: Map::new(),
            })
            .collect();
        state
    }

    #[test]
    fn empty_plan_routes_to_summarizer() {
        let state = ExecutionState::default();
        assert_eq!(route(&state), Node::Summarizing);
    }

    #[test]
    fn routes_by_step_agent() {
        let mut state = state_with_plan(vec![
            (StepAgent::Data, "customers.get"),
            (StepAgent::Execution, "payments.make"),
            (StepAgent::Unknown, "mystery.op"),
        ]);
        assert_eq!(route(&state), Node::RunningDataStep);
        state.step_idx = 1;
        assert_eq!(route(&state), Node::CheckingCompliance);
        state.step_idx = 2;
        assert_eq!(route(&state), Node::Summarizing);
        state.step_idx = 3;
        assert_eq!(route(&state), Node::Summarizing);
    }

    #[test]
    fn route_is_deterministic_for_identical_state() {
        let state = state_with_plan(vec![(StepAgent::Data, "transactions.list")]);
        let first = route(&state);
        for _ in 0..10 {
            assert_eq!(route(&state), first);
        }
    }

    #[test]
    fn gate_halt_routes_to_summarizer() {
        let mut state = state_with_plan(vec![(StepAgent::Execution, "payments.make")]);
        state.status = WorkflowStatus::AwaitingApproval;
        assert_eq!(after_compliance(&state), Node::Summarizing);
        state.status = WorkflowStatus::Ok;
        assert_eq!(after_compliance(&state), Node::RunningExecutionStep);
    }

    #[test]
    fn mutating_step_triggers_notification() {
        let mut state = state_with_plan(vec![(StepAgent::Execution, "payments.make")]);
        state.step_idx = 1;
        assert_eq!(after_execution(&state), Node::Notifying);
    }

    #[test]
    fn read_only_step_re_enters_routing() {
        let mut state = state_with_plan(vec![
            (StepAgent::Data, "payments.get"),
            (StepAgent::Data, "transactions.list"),
        ]);
        state.step_idx = 1;
        assert_eq!(after_execution(&state), Node::RunningDataStep);
        state.step_idx = 2;
        assert_eq!(after_execution(&state), Node::Summarizing);
    }
}
