//! Notification side-effects after successful mutations
//!
//! A mutating step that completed gets exactly one notification entry,
//! whether delivery worked or not. Delivery failures are recorded on the
//! state and never propagated; a receipt email is not worth failing a
//! payment workflow over.

use chrono::Utc;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Map, Value};
use std::env;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::models::{ExecutionState, NotificationEntry, NotificationStatus};
use crate::Result;

//
// ================= Mailer =================
//

/// Trait for notification delivery
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    fn provider(&self) -> &'static str;
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// SMTP delivery over STARTTLS
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_env() -> Option<Self> {
        let host = env::var("SMTP_HOST").ok().filter(|host| !host.is_empty())?;
        let port = env::var("SMTP_PORT")
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(587);
        let username = env::var("SMTP_USERNAME").unwrap_or_default();
        let password = env::var("SMTP_PASSWORD").unwrap_or_default();
        let from = env::var("SMTP_FROM").ok()?.parse::<Mailbox>().ok()?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
            .ok()?
            .port(port)
            .credentials(Credentials::new(username, password))
            .build();

        Some(Self { transport, from })
    }
}

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    fn provider(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| AgentError::NotificationError(format!("invalid recipient {}: {}", to, e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| AgentError::NotificationError(format!("message build failed: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AgentError::NotificationError(format!("smtp send failed: {}", e)))?;
        Ok(())
    }
}

/// Log-only delivery for deployments without SMTP configured
pub struct LogMailer;

#[async_trait::async_trait]
impl Mailer for LogMailer {
    fn provider(&self) -> &'static str {
        "log"
    }

    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<()> {
        info!(to = %to, subject = %subject, "email notification (log only)");
        Ok(())
    }
}

//
// ================= Write Classification =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Payment,
    Transaction,
}

impl WriteKind {
    fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Payment => "payment",
            WriteKind::Transaction => "transaction",
        }
    }
}

fn last_write_kind(state: &ExecutionState) -> Option<(WriteKind, Map<String, Value>)> {
    if let Some(payment) = state.data.get("payment").and_then(Value::as_object) {
        return Some((WriteKind::Payment, payment.clone()));
    }
    if let Some(transaction) = state.data.get("transaction").and_then(Value::as_object) {
        return Some((WriteKind::Transaction, transaction.clone()));
    }

    // Shape heuristic on the raw result if the executor did not classify it.
    let result = state.result.as_ref()?.as_object()?;
    let id_like = result.contains_key("transactionId") || result.contains_key("id");
    if id_like
        && result.contains_key("amount")
        && result.contains_key("currency")
        && result.contains_key("customerId")
    {
        return Some((WriteKind::Transaction, result.clone()));
    }
    None
}

fn display_field(payload: &Map<String, Value>, key: &str) -> String {
    match payload.get(key) {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn compose_email(kind: WriteKind, payload: &Map<String, Value>) -> (String, String) {
    match kind {
        WriteKind::Payment => {
            let subject = format!("Payment receipt #{}", display_field(payload, "id"));
            let body = format!(
                "Status: {}\nAmount: {} {}\nTransaction ID: {}",
                display_field(payload, "status"),
                display_field(payload, "amount"),
                display_field(payload, "currency"),
                display_field(payload, "transactionId"),
            );
            (subject, body)
        }
        WriteKind::Transaction => {
            let subject = format!("Transaction created #{}", display_field(payload, "id"));
            let body = format!(
                "Customer: {}\nAmount: {} {}\nCategory: {}\nDescription: {}",
                display_field(payload, "customerId"),
                display_field(payload, "amount"),
                display_field(payload, "currency"),
                display_field(payload, "category"),
                display_field(payload, "description"),
            );
            (subject, body)
        }
    }
}

fn resolve_recipient(
    payload: &Map<String, Value>,
    state: &ExecutionState,
    default_to: &str,
) -> String {
    payload
        .get("customerEmail")
        .and_then(Value::as_str)
        .filter(|email| !email.is_empty())
        .or_else(|| {
            state
                .extras
                .get("email")
                .and_then(Value::as_str)
                .filter(|email| !email.is_empty())
        })
        .unwrap_or(default_to)
        .to_string()
}

//
// ================= Notifier =================
//

pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    default_to: String,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, default_to: String) -> Self {
        Self { mailer, default_to }
    }

    /// Append one notification entry for the write that just completed.
    /// Infallible on purpose: delivery problems degrade to ERROR entries.
    pub async fn notify(&self, mut state: ExecutionState) -> ExecutionState {
        let (kind, payload) = match last_write_kind(&state) {
            Some(found) => found,
            None => {
                let count = state.notifications.len();
                state.push_trace("notifier", "ok", Some(json!({"count": count, "ms": 0})));
                return state;
            }
        };

        let to = resolve_recipient(&payload, &state, &self.default_to);
        let (subject, body) = compose_email(kind, &payload);
        let preview = body.lines().next().unwrap_or("").to_string();
        let meta = json!({
            "kind": kind.as_str(),
            "id": payload.get("id").cloned().unwrap_or(Value::Null),
        });

        let started = Instant::now();
        match self.mailer.send(&to, &subject, &body).await {
            Ok(()) => {
                let ms = started.elapsed().as_millis() as u64;
                state.notifications.push(NotificationEntry {
                    kind: "email".to_string(),
                    provider: self.mailer.provider().to_string(),
                    to,
                    subject,
                    preview,
                    status: NotificationStatus::Sent,
                    error: None,
                    ms,
                    ts: Utc::now(),
                    meta,
                });
                let count = state.notifications.len();
                state.push_trace("notifier", "ok", Some(json!({"count": count, "ms": ms})));
            }
            Err(err) => {
                warn!(error = %err, to = %to, "notification delivery failed");
                state.notifications.push(NotificationEntry {
                    kind: "email".to_string(),
                    provider: self.mailer.provider().to_string(),
                    to,
                    subject,
                    preview,
                    status: NotificationStatus::Error,
                    error: Some(err.to_string()),
                    ms: 0,
                    ts: Utc::now(),
                    meta,
                });
                state.push_trace(
                    "notifier",
                    "error",
                    Some(json!({"error": err.to_string()})),
                );
            }
        }
        state
    }
}
