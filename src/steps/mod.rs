//! Step executors
//!
//! One executor per step agent kind. Data steps are read-only passthroughs
//! to the invoker; execution steps additionally resolve placeholders and
//! synthesize idempotency keys before delegating. Both are tolerant of
//! invoker failures: the step records a warning and completes with an
//! empty result rather than aborting the workflow.

pub mod substitution;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::invoker::{canonical_operation, ToolInvoker};
use crate::models::ExecutionState;
use crate::Result;

fn wrap_object(output: &Value) -> Value {
    if output.is_object() {
        output.clone()
    } else {
        json!({ "result": output })
    }
}

//
// ================= Data Steps =================
//

pub struct DataStepExecutor {
    invoker: Arc<dyn ToolInvoker>,
}

impl DataStepExecutor {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn run(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        state.push_trace("data_agent", "start", None);

        let step = match state.current_step() {
            Some(step) => step.clone(),
            None => {
                state.push_trace("data_agent", "skipped", Some(json!({"reason": "no_step"})));
                return Ok(state);
            }
        };

        state.push_tool_call(&step.operation, Value::Object(step.args.clone()));

        let started = Instant::now();
        let output = match self.invoker.invoke(&step.operation, &step.args).await {
            Ok(output) => output,
            Err(err) => {
                warn!(operation = %step.operation, error = %err, "data step failed, continuing with empty result");
                state.push_trace(
                    "data_agent",
                    "warning",
                    Some(json!({"reason": "tool_error", "operation": step.operation})),
                );
                json!({})
            }
        };
        let ms = started.elapsed().as_millis() as u64;

        let scratch_key = format!("step_{}_{}", state.step_idx, step.operation);
        state.scratch.insert(scratch_key, output.clone());
        state.scratch.insert("last_result".to_string(), output.clone());
        state.result = Some(output);
        state.step_idx += 1;
        state.push_trace(
            "data_agent",
            "ok",
            Some(json!({"operation": step.operation, "ms": ms})),
        );
        Ok(state)
    }
}

//
// ================= Execution Steps =================
//

pub struct ExecutionStepExecutor {
    invoker: Arc<dyn ToolInvoker>,
}

impl ExecutionStepExecutor {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn run(&self, mut state: ExecutionState) -> Result<ExecutionState> {
        state.push_trace("execution", "start", None);

        let step = match state.current_step() {
            Some(step) => step.clone(),
            None => {
                state.push_trace("execution", "skipped", Some(json!({"reason": "no_step"})));
                return Ok(state);
            }
        };

        let mut args = step.args.clone();
        substitution::resolve_placeholders(&mut args, state.scratch.get("last_result"));
        substitution::ensure_idempotency_key(&step.operation, state.step_idx, &mut args);

        state.push_tool_call(&step.operation, Value::Object(args.clone()));

        let started = Instant::now();
        let output = match self.invoker.invoke(&step.operation, &args).await {
            Ok(output) => output,
            Err(err) => {
                warn!(operation = %step.operation, error = %err, "execution step failed, continuing with empty result");
                state.push_trace(
                    "execution",
                    "warning",
                    Some(json!({"reason": "tool_error", "operation": step.operation})),
                );
                json!({})
            }
        };
        let ms = started.elapsed().as_millis() as u64;

        let scratch_key = format!("step_{}_{}", state.step_idx, step.operation);
        state.scratch.insert(scratch_key, output.clone());
        state.scratch.insert("last_result".to_string(), output.clone());

        // Stash the write payload where the notifier looks for it.
        match canonical_operation(&step.operation).as_str() {
            "payments.make" => {
                state.data.insert("payment".to_string(), wrap_object(&output));
            }
            "transactions.create" => {
                state
                    .data
                    .insert("transaction".to_string(), wrap_object(&output));
            }
            _ => {}
        }

        state.result = Some(output);
        state.step_idx += 1;
        state.push_trace(
            "execution",
            "ok",
            Some(json!({"operation": step.operation, "ms": ms})),
        );
        Ok(state)
    }
}
