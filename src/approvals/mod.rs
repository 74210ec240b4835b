//! Approval record store
//!
//! Holds the PENDING/APPROVED/DENIED ledger backing human-in-the-loop
//! decisions. In-memory is fine for a single instance; a durable store
//! can be swapped in behind the same trait for multi-instance setups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::ExecutionState;
use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

/// A gated workflow awaiting a human decision. Carries the halted state so
/// a caller without its own copy can still resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub status: ApprovalStatus,
    pub reason: String,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Result of an attempt to settle an approval. A record flips out of
/// PENDING exactly once; later attempts report what already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    Applied,
    AlreadyDecided(ApprovalStatus),
    NotFound,
}

/// Trait for approval persistence
#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn upsert_pending(
        &self,
        approval_id: &str,
        reason: &str,
        state: &ExecutionState,
    ) -> Result<ApprovalRecord>;
    async fn get(&self, approval_id: &str) -> Result<Option<ApprovalRecord>>;
    async fn try_decide(&self, approval_id: &str, approve: bool) -> Result<DecisionOutcome>;
}

/// In-memory approval store for single-instance deployments
pub struct InMemoryApprovalStore {
    records: Arc<RwLock<HashMap<String, ApprovalRecord>>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ApprovalStore for InMemoryApprovalStore {

    async fn upsert_pending(
        &self,
        approval_id: &str,
        reason: &str,
        state: &ExecutionState,
    ) -> Result<ApprovalRecord> {
        let record = ApprovalRecord {
            approval_id: approval_id.to_string(),
            status: ApprovalStatus::Pending,
            reason: reason.to_string(),
            state: state.clone(),
            created_at: Utc::now(),
            decided_at: None,
        };
        let mut records = self.records.write().await;
        records.insert(approval_id.to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, approval_id: &str) -> Result<Option<ApprovalRecord>> {
        let records = self.records.read().await;
        Ok(records.get(approval_id).cloned())
    }

    async fn try_decide(&self, approval_id: &str, approve: bool) -> Result<DecisionOutcome> {

        // Single write lock makes check-then-set atomic against racing deciders.
        let mut records = self.records.write().await;

        let record = match records.get_mut(approval_id) {
            Some(record) => record,
            None => return Ok(DecisionOutcome::NotFound),
        };

        if record.status != ApprovalStatus::Pending {
            return Ok(DecisionOutcome::AlreadyDecided(record.status));
        }

        record.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        record.decided_at = Some(Utc::now());
        Ok(DecisionOutcome::Applied)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Denied => "DENIED",
        };
        write!(f, "{}", s)
    }
}
