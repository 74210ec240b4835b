//! Compliance gate for execution steps
//!
//! Classifies the step the cursor points at against the risk policy. Risky
//! steps halt the workflow with AWAITING_APPROVAL and a persisted approval
//! record; everything else passes through untouched.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approvals::ApprovalStore;
use crate::models::{is_present, ExecutionState, PendingApproval, WorkflowStatus};
use crate::Result;

/// Risk knobs, kept out of the gate logic so deployments can tune them.
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    pub high_value_threshold: f64,
    pub payment_required_fields: Vec<String>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            high_value_threshold: 500.0,
            payment_required_fields: vec![
                "transactionId".to_string(),
                "method".to_string(),
                "idempotencyKey".to_string(),
            ],
        }
    }
}

impl RiskPolicy {
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Ok(raw) = std::env::var("APPROVAL_AMOUNT_THRESHOLD") {
            if let Ok(value) = raw.trim().parse::<f64>() {
                policy.high_value_threshold = value;
            }
        }
        policy
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParsedAmount {
    Missing,
    Valid(f64),
    NonPositive,
    Unparseable,
}

fn parse_amount(raw: Option<&Value>) -> ParsedAmount {
    let value = match raw {
        None | Some(Value::Null) => return ParsedAmount::Missing,
        Some(value) => value,
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(amount) if amount <= 0.0 => ParsedAmount::NonPositive,
        Some(amount) => ParsedAmount::Valid(amount),
        None => ParsedAmount::Unparseable,
    }
}

pub struct ComplianceGate {
    approvals: Arc<dyn ApprovalStore>,
    policy: RiskPolicy,
}

impl ComplianceGate {
    pub fn new(approvals: Arc<dyn ApprovalStore>, policy: RiskPolicy) -> Self {
        Self { approvals, policy }
    }

    /// Evaluate the current step. Returns the state with status set to OK
    /// (proceed) or AWAITING_APPROVAL (halt, step_idx untouched).
    pub async fn check(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        state.push_trace("compliance", "start", None);

        let step = match state.current_step() {
            Some(step) => step.clone(),
            None => {
                state.status = WorkflowStatus::Ok;
                state.push_trace("compliance", "skipped", Some(json!({"reason": "no_step"})));
                return Ok(state);
            }
        };

        let operation = step.operation.trim().to_ascii_lowercase();
        let mut reasons: Vec<String> = Vec::new();

        if matches!(operation.as_str(), "payments.make" | "make_payment") {
            let missing: Vec<&str> = self
                .policy
                .payment_required_fields
                .iter()
                .filter(|field| !is_present(step.args.get(field.as_str())))
                .map(|field| field.as_str())
                .collect();
            if !missing.is_empty() {
                reasons.push(format!("payment missing required: {}", missing.join(", ")));
            }
        }

        if matches!(
            operation.as_str(),
            "transactions.create" | "create_transaction"
        ) {
            match parse_amount(step.args.get("amount")) {
                ParsedAmount::Missing | ParsedAmount::NonPositive => {
                    reasons.push("invalid or non-positive amount for transaction".to_string());
                }
                ParsedAmount::Unparseable => {
                    reasons.push("amount not parseable".to_string());
                }
                ParsedAmount::Valid(amount) if amount >= self.policy.high_value_threshold => {
                    reasons.push("high-value transaction requires approval".to_string());
                }
                ParsedAmount::Valid(_) => {}
            }
        }

        if reasons.is_empty() {
            state.status = WorkflowStatus::Ok;
            state.push_trace(
                "compliance",
                "ok",
                Some(json!({"step": step.operation, "args": step.args})),
            );
            return Ok(state);
        }

        // Already cleared on resume: let the step through.
        if state.approved == Some(true) {
            state.status = WorkflowStatus::Ok;
            state.pending_approval = None;
            debug!(step = %step.operation, "risky step passed with prior approval");
            state.push_trace(
                "compliance",
                "ok",
                Some(json!({"step": step.operation, "approved": true})),
            );
            return Ok(state);
        }

        // Reuse the approval id from a previous halt of this run, otherwise mint one.
        let approval_id = state
            .approval_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reason = reasons.join("; ");

        state.status = WorkflowStatus::AwaitingApproval;
        state.approval_id = Some(approval_id.clone());
        state.pending_approval = Some(PendingApproval {
            reason: reason.clone(),
            args: Value::Object(step.args.clone()),
            approval_id: approval_id.clone(),
        });
        state.push_trace(
            "compliance",
            "needs_approval",
            Some(json!({"reasons": reasons, "step": step.operation})),
        );

        // Snapshot carries the fully annotated halted state.
        self.approvals
            .upsert_pending(&approval_id, &reason, &state)
            .await?;

        info!(approval_id = %approval_id, reason = %reason, "workflow gated pending approval");
        Ok(state)
    }
}
