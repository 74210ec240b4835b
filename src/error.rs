//! Error types for the payments agent runtime

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Tool invocation error: {0}")]
    InvocationError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    // =============================
    // Approval Workflow Errors
    // =============================

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    // =============================
    // Session & Quota Errors
    // =============================

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Invalid access key for tier: {0}")]
    InvalidAccessKey(String),

    #[error("Rate limited on {metric}: retry in {retry_after_secs}s")]
    RateLimited { metric: String, retry_after_secs: u64 },

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),
}
