//! Final response composition
//!
//! Runs once per request, after the plan has either finished or halted.
//! The template implementation is fully deterministic so that responses
//! are reproducible across resumes of the same state.

use crate::models::{ExecutionState, WorkflowStatus};
use crate::Result;

/// Trait for response composition
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, state: &ExecutionState) -> Result<String>;
}

/// Deterministic summary built from counts and the last tool result
pub struct TemplateSummarizer;

impl TemplateSummarizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TemplateSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Summarizer for TemplateSummarizer {
    async fn summarize(&self, state: &ExecutionState) -> Result<String> {
        if state.status == WorkflowStatus::AwaitingApproval {
            if let Some(pending) = &state.pending_approval {
                return Ok(format!(
                    "This request needs approval before it can continue: {}. Approval id: {}.",
                    pending.reason, pending.approval_id
                ));
            }
            return Ok("This request needs approval before it can continue.".to_string());
        }

        let mut content = format!(
            "Completed {} of {} planned step(s) for intent '{}'.",
            state.step_idx.min(state.plan.len()),
            state.plan.len(),
            state.intent
        );
        if let Some(result) = &state.result {
            let pretty = serde_json::to_string_pretty(result)?;
            content.push_str("\n\nLast result:\n");
            content.push_str(&pretty);
        }
        Ok(content)
    }
}
