//! In-memory session backend for local runs and tests

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Metric, SessionBackend, SessionProfile, Tier, TierLimits};
use crate::Result;

struct CounterEntry {
    total: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    profiles: HashMap<String, SessionProfile>,
    counters: HashMap<String, CounterEntry>,
}

pub struct InMemorySessionBackend {
    inner: Arc<Mutex<Inner>>,
}

impl InMemorySessionBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl Default for InMemorySessionBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn counter_key(session_id: &str, metric: Metric, bucket: &str) -> String {
    format!("{}|{}|{}", session_id, metric.as_str(), bucket)
}

#[async_trait::async_trait]
impl SessionBackend for InMemorySessionBackend {

    async fn put_profile(&self, profile: &SessionProfile) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .profiles
            .insert(profile.session_id.clone(), profile.clone());
        Ok(())
    }

    async fn get_profile(&self, session_id: &str) -> Result<Option<SessionProfile>> {
        let inner = self.inner.lock().await;
        Ok(inner.profiles.get(session_id).cloned())
    }

    async fn update_tier(&self, session_id: &str, tier: Tier, limits: &TierLimits) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(profile) = inner.profiles.get_mut(session_id) {
            profile.tier = tier;
            profile.limits = limits.clone();
        }
        Ok(())
    }

    async fn touch(&self, session_id: &str, last_seen_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(profile) = inner.profiles.get_mut(session_id) {
            profile.last_seen_at = last_seen_at;
        }
        Ok(())
    }

    async fn increment_counter(
        &self,
        session_id: &str,
        metric: Metric,
        bucket: &str,
        amount: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<i64> {
        // One lock around read-modify-write keeps the add atomic.
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let entry = inner
            .counters
            .entry(counter_key(session_id, metric, bucket))
            .or_insert(CounterEntry {
                total: 0,
                expires_at,
            });
        if entry.expires_at <= now {
            entry.total = 0;
        }
        entry.total += amount;
        entry.expires_at = expires_at;
        Ok(entry.total)
    }

    async fn read_counter(&self, session_id: &str, metric: Metric, bucket: &str) -> Result<i64> {
        let inner = self.inner.lock().await;
        let total = inner
            .counters
            .get(&counter_key(session_id, metric, bucket))
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.total)
            .unwrap_or(0);
        Ok(total)
    }
}
