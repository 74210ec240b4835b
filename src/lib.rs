//! Payments Agent Runtime
//!
//! A step-execution engine for a payments assistant that:
//! - Turns each request into an ordered plan of read/write steps
//! - Drives the plan through an explicit state machine
//! - Pauses risky mutations at a compliance gate for human approval
//! - Resumes deterministically from stored or caller-supplied state
//! - Notifies after successful writes
//! - Enforces per-session usage quotas with atomic window counters
//!
//! STEP LOOP:
//! INPUT → PLAN → (DATA | COMPLIANCE → EXECUTE → NOTIFY)* → SUMMARIZE

pub mod api;
pub mod approvals;
pub mod compliance;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod models;
pub mod notifier;
pub mod planner;
pub mod router;
pub mod session;
pub mod steps;
pub mod summarizer;

pub use error::{AgentError, Result};

// Re-export common types
pub use models::*;
pub use engine::{Decision, WorkflowEngine};
