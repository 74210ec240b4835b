//! Workflow engine
//!
//! Owns one pass of the step machine: plan once, then drive the state
//! node by node until it reaches the summary or halts at the compliance
//! gate. Approval decisions re-enter here through `resolve_approval`.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::approvals::{ApprovalStore, DecisionOutcome};
use crate::compliance::{ComplianceGate, RiskPolicy};
use crate::error::AgentError;
use crate::invoker::ToolInvoker;
use crate::models::{ChatTurn, ExecutionState, StepAgent, WorkflowStatus};
use crate::notifier::Notifier;
use crate::planner::{Planner, OUT_OF_SCOPE_HELP};
use crate::router::{self, Node};
use crate::steps::{DataStepExecutor, ExecutionStepExecutor};
use crate::summarizer::Summarizer;
use crate::Result;

/// Parsed approval decision. Anything else is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn parse(raw: &str) -> Result<Decision> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(Decision::Approve),
            "DENY" => Ok(Decision::Deny),
            other => Err(AgentError::InvalidDecision(other.to_string())),
        }
    }
}

pub struct WorkflowEngine {
    planner: Arc<dyn Planner>,
    data_steps: DataStepExecutor,
    execution_steps: ExecutionStepExecutor,
    gate: ComplianceGate,
    notifier: Notifier,
    summarizer: Arc<dyn Summarizer>,
    approvals: Arc<dyn ApprovalStore>,
}

impl WorkflowEngine {
    pub fn new(
        planner: Arc<dyn Planner>,
        invoker: Arc<dyn ToolInvoker>,
        summarizer: Arc<dyn Summarizer>,
        approvals: Arc<dyn ApprovalStore>,
        policy: RiskPolicy,
        notifier: Notifier,
    ) -> Self {
        Self {
            planner,
            data_steps: DataStepExecutor::new(invoker.clone()),
            execution_steps: ExecutionStepExecutor::new(invoker),
            gate: ComplianceGate::new(approvals.clone(), policy),
            notifier,
            summarizer,
            approvals,
        }
    }

    /// Run one request end to end: plan, execute until the machine
    /// finishes or halts for approval, then summarize.
    pub async fn invoke(
        &self,
        input: &str,
        history: Vec<ChatTurn>,
        extras: Map<String, Value>,
    ) -> Result<ExecutionState> {
        let state = ExecutionState::from_input(input, history, extras);
        let state = self.run_orchestrator(state).await?;
        self.drive(state).await
    }

    /// Apply an APPROVE or DENY decision against a halted workflow.
    /// The resume base is the caller-supplied state when present,
    /// otherwise the snapshot stored with the approval record.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        decision: &str,
        caller_state: Option<ExecutionState>,
    ) -> Result<ExecutionState> {
        let decision = Decision::parse(decision)?;
        let record = self.approvals.get(approval_id).await?;

        let base = caller_state.or_else(|| record.map(|record| record.state));
        let Some(mut state) = base else {
            return Err(AgentError::ApprovalNotFound(approval_id.to_string()));
        };

        match decision {
            Decision::Approve => {
                match self.approvals.try_decide(approval_id, true).await? {
                    DecisionOutcome::Applied => {
                        info!(approval_id = %approval_id, "approval applied, resuming workflow");
                    }
                    DecisionOutcome::AlreadyDecided(status) => {
                        info!(
                            approval_id = %approval_id,
                            status = %status,
                            "approval already decided, re-running resume"
                        );
                    }
                    DecisionOutcome::NotFound => {
                        warn!(
                            approval_id = %approval_id,
                            "approval record missing, resuming from caller state"
                        );
                    }
                }
                state.approved = Some(true);
                state.status = WorkflowStatus::Ok;
                state.pending_approval = None;
                self.drive(state).await
            }
            Decision::Deny => {
                match self.approvals.try_decide(approval_id, false).await? {
                    DecisionOutcome::Applied => {
                        info!(approval_id = %approval_id, "approval denied, terminating workflow");
                    }
                    DecisionOutcome::AlreadyDecided(status) => {
                        info!(approval_id = %approval_id, status = %status, "approval already decided");
                    }
                    DecisionOutcome::NotFound => {}
                }
                state.status = WorkflowStatus::Denied;
                state.approved = Some(false);
                state.pending_approval = None;
                state.result = Some(json!({ "summary": "Request denied." }));
                state.push_trace("approval", "denied", None);
                Ok(state)
            }
        }
    }

    async fn run_orchestrator(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        let input = state.input.clone();
        state.push_trace("orchestrator", "start", Some(json!({ "input": input })));

        let trimmed = state.input.trim().to_string();
        let outcome = if trimmed.is_empty() {
            None
        } else {
            match self.planner.plan(&trimmed, &state.history).await {
                Ok(outcome) if outcome.intent != "noop" && !outcome.plan.is_empty() => {
                    Some(outcome)
                }
                Ok(_) => None,
                Err(error) => {
                    warn!(error = %error, "planning failed, treating request as out of scope");
                    None
                }
            }
        };

        match outcome {
            Some(outcome) => {
                state.intent = outcome.intent;
                state.plan = outcome.plan;
                state.step_idx = 0;
                state.status = WorkflowStatus::Ok;
                state.push_trace(
                    "orchestrator",
                    "ok",
                    Some(json!({
                        "intent": state.intent.clone(),
                        "steps": state.plan.len(),
                        "plan": state.plan.clone(),
                    })),
                );
            }
            None => {
                state.intent = "noop".to_string();
                state.plan = Vec::new();
                state.step_idx = 0;
                state.status = WorkflowStatus::Ok;
                state.result = Some(json!({ "summary": OUT_OF_SCOPE_HELP }));
                state.push_trace(
                    "orchestrator",
                    "ok",
                    Some(json!({ "intent": "noop", "steps": 0 })),
                );
            }
        }
        Ok(state)
    }

    async fn drive(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        let mut node = router::route(&state);
        loop {
            match node {
                Node::Orchestrating => {
                    node = router::route(&state);
                }
                Node::RunningDataStep => {
                    state = self.data_steps.run(state).await?;
                    node = router::route(&state);
                }
                Node::CheckingCompliance => {
                    state = self.gate.check(state).await?;
                    node = router::after_compliance(&state);
                }
                Node::RunningExecutionStep => {
                    state = self.execution_steps.run(state).await?;
                    node = router::after_execution(&state);
                }
                Node::Notifying => {
                    state = self.notifier.notify(state).await;
                    node = router::route(&state);
                }
                Node::Summarizing => {
                    if let Some(step) = state.current_step() {
                        if step.agent == StepAgent::Unknown {
                            let operation = step.operation.clone();
                            state.push_trace(
                                "router",
                                "skipped",
                                Some(json!({
                                    "reason": "unknown_agent",
                                    "operation": operation,
                                })),
                            );
                        }
                    }
                    return self.run_summarize(state).await;
                }
            }
        }
    }

    async fn run_summarize(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        state.push_trace("summarize", "start", None);

        let content = if state.intent == "noop" || state.plan.is_empty() {
            state
                .result
                .as_ref()
                .and_then(|result| result.get("summary"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| OUT_OF_SCOPE_HELP.to_string())
        } else {
            self.summarizer.summarize(&state).await?
        };

        state.result = Some(json!({ "summary": content }));
        state.push_trace("summarize", "ok", None);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::{ApprovalStatus, InMemoryApprovalStore};
    use crate::invoker::MockToolInvoker;
    use crate::models::Step;
    use crate::notifier::LogMailer;
    use crate::planner::KeywordPlanner;
    use crate::summarizer::TemplateSummarizer;

    fn engine_with(approvals: Arc<InMemoryApprovalStore>) -> WorkflowEngine {
        WorkflowEngine::new(
            Arc::new(KeywordPlanner::new()),
            Arc::new(MockToolInvoker),
            Arc::new(TemplateSummarizer::new()),
            approvals,
            RiskPolicy::default(),
            Notifier::new(Arc::new(LogMailer), "ops@example.com".to_string()),
        )
    }

    fn engine() -> WorkflowEngine {
        engine_with(Arc::new(InMemoryApprovalStore::new()))
    }

    fn summary_of(state: &ExecutionState) -> &str {
        state
            .result
            .as_ref()
            .and_then(|result| result.get("summary"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn trace_pair(state: &ExecutionState, node: &str, status: &str) -> bool {
        state
            .trace
            .iter()
            .any(|entry| entry.node == node && entry.status == status)
    }

    #[tokio::test]
    async fn read_only_plan_runs_to_summary() {
        let out = engine()
            .invoke("show customer 42's transactions", Vec::new(), Map::new())
            .await
            .unwrap();

        assert_eq!(out.status, WorkflowStatus::Ok);
        assert_eq!(out.step_idx, 1);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].operation, "transactions.list");
        assert!(out.pending_approval.is_none());
        assert!(out.notifications.is_empty());
        assert!(summary_of(&out).contains("Completed 1 of 1"));
        assert!(trace_pair(&out, "orchestrator", "ok"));
        assert!(trace_pair(&out, "data_agent", "ok"));
        assert!(trace_pair(&out, "summarize", "ok"));
    }

    #[tokio::test]
    async fn out_of_scope_input_returns_help() {
        let out = engine()
            .invoke("what's the weather like", Vec::new(), Map::new())
            .await
            .unwrap();

        assert_eq!(out.intent, "noop");
        assert!(out.plan.is_empty());
        assert_eq!(out.status, WorkflowStatus::Ok);
        assert_eq!(summary_of(&out), OUT_OF_SCOPE_HELP);
        assert!(out.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn empty_input_is_out_of_scope() {
        let out = engine().invoke("   ", Vec::new(), Map::new()).await.unwrap();
        assert_eq!(out.intent, "noop");
        assert_eq!(summary_of(&out), OUT_OF_SCOPE_HELP);
    }

    #[tokio::test]
    async fn high_value_transaction_halts_for_approval() {
        let approvals = Arc::new(InMemoryApprovalStore::new());
        let engine = engine_with(approvals.clone());

        let out = engine
            .invoke(
                "create a transaction of 3000 INR for customer 11 for groceries",
                Vec::new(),
                Map::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.status, WorkflowStatus::AwaitingApproval);
        assert_eq!(out.step_idx, 0);
        assert!(out.tool_calls.is_empty());

        let pending = out.pending_approval.as_ref().unwrap();
        assert!(pending.reason.contains("high-value"));
        assert!(summary_of(&out).contains("needs approval"));

        let record = approvals.get(&pending.approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Pending);
        assert_eq!(record.state.step_idx, 0);
    }

    #[tokio::test]
    async fn approve_resumes_from_stored_snapshot() {
        let approvals = Arc::new(InMemoryApprovalStore::new());
        let engine = engine_with(approvals.clone());

        let halted = engine
            .invoke(
                "create a transaction of 3000 INR for customer 11 for groceries",
                Vec::new(),
                Map::new(),
            )
            .await
            .unwrap();
        let approval_id = halted.pending_approval.as_ref().unwrap().approval_id.clone();

        let resumed = engine
            .resolve_approval(&approval_id, "approve", None)
            .await
            .unwrap();

        assert_eq!(resumed.status, WorkflowStatus::Ok);
        assert_eq!(resumed.step_idx, 1);
        assert!(resumed.pending_approval.is_none());
        assert_eq!(resumed.tool_calls.len(), 1);
        assert!(resumed.data.contains_key("transaction"));
        assert_eq!(resumed.notifications.len(), 1);
        assert!(summary_of(&resumed).contains("Completed 1 of"));
        assert!(trace_pair(&resumed, "compliance", "needs_approval"));
        assert!(trace_pair(&resumed, "notifier", "ok"));

        let record = approvals.get(&approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn deny_terminates_without_invoking_tools() {
        let approvals = Arc::new(InMemoryApprovalStore::new());
        let engine = engine_with(approvals.clone());

        let halted = engine
            .invoke(
                "create a transaction of 9000 USD for customer 3",
                Vec::new(),
                Map::new(),
            )
            .await
            .unwrap();
        let approval_id = halted.pending_approval.as_ref().unwrap().approval_id.clone();

        let denied = engine
            .resolve_approval(&approval_id, "DENY", None)
            .await
            .unwrap();

        assert_eq!(denied.status, WorkflowStatus::Denied);
        assert_eq!(denied.step_idx, 0);
        assert!(denied.tool_calls.is_empty());
        assert_eq!(summary_of(&denied), "Request denied.");
        assert!(trace_pair(&denied, "approval", "denied"));
        // Halted-state trace survives into the denial response.
        assert!(trace_pair(&denied, "compliance", "needs_approval"));

        let record = approvals.get(&approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn approve_resumes_from_caller_state_when_record_is_gone() {
        let halted = engine()
            .invoke(
                "create a transaction of 3000 INR for customer 11",
                Vec::new(),
                Map::new(),
            )
            .await
            .unwrap();
        let approval_id = halted.pending_approval.as_ref().unwrap().approval_id.clone();

        // Fresh engine, empty approval store: only the caller state remains.
        let resumed = engine()
            .resolve_approval(&approval_id, "APPROVE", Some(halted))
            .await
            .unwrap();

        assert_eq!(resumed.status, WorkflowStatus::Ok);
        assert_eq!(resumed.step_idx, 1);
    }

    #[tokio::test]
    async fn resume_without_state_or_record_is_not_found() {
        let err = engine()
            .resolve_approval("missing-id", "APPROVE", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn unrecognized_decision_is_rejected() {
        let err = engine()
            .resolve_approval("any-id", "maybe", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidDecision(_)));

        assert_eq!(Decision::parse(" approve ").unwrap(), Decision::Approve);
        assert_eq!(Decision::parse("deny").unwrap(), Decision::Deny);
    }

    #[tokio::test]
    async fn mixed_plan_resolves_placeholder_from_data_step() {
        let engine = engine();

        let mut state = ExecutionState::from_input("pay it", Vec::new(), Map::new());
        state.intent = "make_payment".to_string();
        state.plan = vec![
            Step {
                agent: StepAgent::Data,
                operation: "transactions.get".to_string(),
                args: match json!({ "transactionId": 55 }) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                },
            },
            Step {
                agent: StepAgent::Execution,
                operation: "payments.make".to_string(),
                args: match json!({
                    "transactionId": "{{TRANSACTION_ID_FROM_PREV_STEP}}",
                    "method": "card",
                    "idempotencyKey": "pay:seeded",
                }) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                },
            },
        ];

        let out = engine.drive(state).await.unwrap();

        assert_eq!(out.status, WorkflowStatus::Ok);
        assert_eq!(out.step_idx, 2);
        assert_eq!(out.tool_calls.len(), 2);
        // Mock transactions.get answers with id 4001, which the payment
        // step picks up through the placeholder.
        assert_eq!(out.tool_calls[1].args["transactionId"], json!(4001));
        assert_eq!(out.notifications.len(), 1);
    }

    #[tokio::test]
    async fn unknown_agent_falls_back_to_summary_with_trace() {
        let engine = engine();

        let mut state = ExecutionState::from_input("do something odd", Vec::new(), Map::new());
        state.intent = "custom".to_string();
        state.plan = vec![Step {
            agent: StepAgent::Unknown,
            operation: "custom.op".to_string(),
            args: Map::new(),
        }];

        let out = engine.drive(state).await.unwrap();

        assert_eq!(out.status, WorkflowStatus::Ok);
        assert_eq!(out.step_idx, 0);
        assert!(out.tool_calls.is_empty());
        let skipped = out
            .trace
            .iter()
            .find(|entry| entry.node == "router" && entry.status == "skipped")
            .unwrap();
        assert_eq!(
            skipped.details.as_ref().unwrap()["reason"],
            json!("unknown_agent")
        );
    }

    #[tokio::test]
    async fn create_and_pay_runs_both_steps_with_two_notifications() {
        let out = engine()
            .invoke(
                "create a transaction of 120 USD for customer 7 for groceries and pay it via card",
                Vec::new(),
                Map::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.status, WorkflowStatus::Ok);
        assert_eq!(out.intent, "create_and_pay");
        assert_eq!(out.step_idx, 2);
        assert_eq!(out.tool_calls.len(), 2);
        // The payment step picked up the created transaction's id.
        assert_eq!(out.tool_calls[1].args["transactionId"], json!(5001));

        assert_eq!(out.notifications.len(), 2);
        assert!(out.notifications[0].subject.starts_with("Transaction created"));
        assert!(out.notifications[1].subject.starts_with("Payment receipt"));
        assert!(summary_of(&out).contains("Completed 2 of 2"));
    }

    #[tokio::test]
    async fn low_value_transaction_passes_gate_and_notifies() {
        let out = engine()
            .invoke(
                "create a transaction of 120 USD for customer 7 for groceries",
                Vec::new(),
                Map::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.status, WorkflowStatus::Ok);
        assert_eq!(out.step_idx, 1);
        assert!(trace_pair(&out, "compliance", "ok"));
        assert_eq!(out.notifications.len(), 1);
        assert!(out.data.contains_key("transaction"));
    }
}
