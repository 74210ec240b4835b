//! Core data models for the payments agent workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Ok,
    AwaitingApproval,
    Denied,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepAgent {
    Data,
    Execution,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Sent,
    Error,
}

//
// ================= Plan =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub agent: StepAgent,
    #[serde(alias = "tool")]
    pub operation: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

//
// ================= Workflow Records =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub node: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub operation: String,
    pub args: Value,
}

/// Lenient on deserialization so partial resume blobs still parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PendingApproval {
    pub reason: String,
    pub args: Value,
    pub approval_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub provider: String,
    pub to: String,
    pub subject: String,
    pub preview: String,
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ms: u64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub meta: Value,
}

//
// ================= Execution State =================
//

/// The full workflow state threaded through every node. Serializable so a
/// paused run can be handed back to the caller and resumed later.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionState {
    pub input: String,
    #[serde(rename = "messages")]
    pub history: Vec<ChatTurn>,
    pub intent: String,
    pub plan: Vec<Step>,
    pub step_idx: usize,
    pub scratch: Map<String, Value>,
    pub data: Map<String, Value>,
    pub result: Option<Value>,
    pub status: WorkflowStatus,
    pub approval_id: Option<String>,
    pub approved: Option<bool>,
    pub trace: Vec<TraceEntry>,
    pub tool_calls: Vec<ToolCall>,
    pub pending_approval: Option<PendingApproval>,
    pub notifications: Vec<NotificationEntry>,
    pub extras: Map<String, Value>,
}

impl ExecutionState {
    pub fn from_input(input: &str, history: Vec<ChatTurn>, extras: Map<String, Value>) -> Self {
        Self {
            input: input.to_string(),
            history,
            extras,
            ..Default::default()
        }
    }

    /// The step the cursor currently points at, if any remain.
    pub fn current_step(&self) -> Option<&Step> {
        self.plan.get(self.step_idx)
    }

    pub fn push_trace(&mut self, node: &str, status: &str, details: Option<Value>) {
        self.trace.push(TraceEntry {
            node: node.to_string(),
            status: status.to_string(),
            details,
        });
    }

    pub fn push_tool_call(&mut self, operation: &str, args: Value) {
        self.tool_calls.push(ToolCall {
            operation: operation.to_string(),
            args,
        });
    }
}

//
// ================= Operation Classes =================
//

/// Operations that write to the payments backend and therefore need an
/// idempotency key before they are sent over the wire.
pub const MUTATING_OPERATIONS: &[&str] = &[
    "payments.make",
    "transactions.create",
    "customers.create",
    "make_payment",
    "create_transaction",
    "create_customer",
];

pub fn is_mutating_operation(operation: &str) -> bool {
    let normalized = operation.trim().to_ascii_lowercase();
    MUTATING_OPERATIONS.contains(&normalized.as_str())
}

//
// ================= Value Helpers =================
//

/// Truthiness in the sense the planner payloads use it: null, empty string,
/// zero, empty array and empty object all count as absent.
pub fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

pub fn is_present(value: Option<&Value>) -> bool {
    value.map(value_truthy).unwrap_or(false)
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Ok => "OK",
            WorkflowStatus::AwaitingApproval => "AWAITING_APPROVAL",
            WorkflowStatus::Denied => "DENIED",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for StepAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepAgent::Data => "data",
            StepAgent::Execution => "execution",
            StepAgent::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
