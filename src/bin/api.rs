use payments_agent_runtime::{
    api::start_server,
    approvals::InMemoryApprovalStore,
    compliance::RiskPolicy,
    engine::WorkflowEngine,
    invoker::{HttpToolInvoker, MockToolInvoker, ToolInvoker},
    notifier::{LogMailer, Mailer, Notifier, SmtpMailer},
    planner::KeywordPlanner,
    session::memory::InMemorySessionBackend,
    session::postgres::PgSessionBackend,
    session::{SessionBackend, SessionConfig, SessionStore},
    summarizer::TemplateSummarizer,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("🚀 Payments Agent Runtime - API Server");
    info!("📍 Port: {}", api_port);

    // Create components; each one falls back to a local default when its
    // backing service is not configured.
    let invoker: Arc<dyn ToolInvoker> = match HttpToolInvoker::from_env() {
        Some(http) => {
            info!("Payments backend configured, delegating steps over HTTP");
            Arc::new(http)
        }
        None => {
            info!("PAYMENTS_API_BASE_URL not set, using the mock backend");
            Arc::new(MockToolInvoker)
        }
    };

    let mailer: Arc<dyn Mailer> = match SmtpMailer::from_env() {
        Some(smtp) => {
            info!("SMTP configured, notifications go out by email");
            Arc::new(smtp)
        }
        None => {
            info!("SMTP not configured, notifications are logged only");
            Arc::new(LogMailer)
        }
    };
    let default_to =
        std::env::var("SMTP_TO_DEFAULT").unwrap_or_else(|_| "ops@example.com".to_string());

    let session_backend: Arc<dyn SessionBackend> = match PgSessionBackend::from_env() {
        Some(pg) => Arc::new(pg),
        None => {
            info!("Session backend: in-memory");
            Arc::new(InMemorySessionBackend::new())
        }
    };
    let sessions = Arc::new(SessionStore::new(
        session_backend,
        SessionConfig::from_env(),
    ));

    // Create workflow engine
    let engine = Arc::new(WorkflowEngine::new(
        Arc::new(KeywordPlanner::new()),
        invoker,
        Arc::new(TemplateSummarizer::new()),
        Arc::new(InMemoryApprovalStore::new()),
        RiskPolicy::from_env(),
        Notifier::new(mailer, default_to),
    ));

    info!("✅ Workflow engine initialized");
    info!("📡 Starting API server...");

    // Start API server
    start_server(engine, sessions, api_port).await?;

    Ok(())
}
