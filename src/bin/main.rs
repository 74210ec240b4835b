use payments_agent_runtime::{
    approvals::InMemoryApprovalStore,
    compliance::RiskPolicy,
    engine::WorkflowEngine,
    invoker::MockToolInvoker,
    models::ExecutionState,
    notifier::{LogMailer, Notifier},
    planner::KeywordPlanner,
    summarizer::TemplateSummarizer,
};
use serde_json::Map;
use std::sync::Arc;
use tracing::info;

fn print_state(title: &str, state: &ExecutionState) {
    println!("\n=== {} ===", title);
    println!("Status: {}", state.status);
    if let Some(pending) = &state.pending_approval {
        println!("Approval ID: {}", pending.approval_id);
        println!("Reason: {}", pending.reason);
    }
    if let Some(summary) = state
        .result
        .as_ref()
        .and_then(|result| result.get("summary"))
        .and_then(|summary| summary.as_str())
    {
        println!("Summary: {}", summary);
    }
    println!("\nTrace:");
    for (i, entry) in state.trace.iter().enumerate() {
        println!("  {}: {} -> {}", i + 1, entry.node, entry.status);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Payments Agent Runtime starting");

    // Create workflow engine against the mock backend
    let engine = WorkflowEngine::new(
        Arc::new(KeywordPlanner::new()),
        Arc::new(MockToolInvoker),
        Arc::new(TemplateSummarizer::new()),
        Arc::new(InMemoryApprovalStore::new()),
        RiskPolicy::default(),
        Notifier::new(Arc::new(LogMailer), "ops@example.com".to_string()),
    );

    // A high-value create runs into the compliance gate
    let input = "create a transaction of 3000 INR for customer 11 for groceries";
    info!(input = %input, "Running workflow");

    let halted = engine.invoke(input, Vec::new(), Map::new()).await?;
    print_state("WORKFLOW HALTED", &halted);

    let Some(pending) = halted.pending_approval.clone() else {
        println!("\nNo approval was requested, nothing to resume.");
        return Ok(());
    };

    // Approve and resume from the stored snapshot
    info!(approval_id = %pending.approval_id, "Approving");
    match engine
        .resolve_approval(&pending.approval_id, "APPROVE", None)
        .await
    {
        Ok(resumed) => {
            print_state("WORKFLOW RESUMED", &resumed);
            println!("\nTool calls:");
            for (i, call) in resumed.tool_calls.iter().enumerate() {
                println!("  {}: {} {}", i + 1, call.operation, call.args);
            }
            for entry in &resumed.notifications {
                println!("\nNotification: [{}] {} -> {}", entry.provider, entry.subject, entry.to);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Resume failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
