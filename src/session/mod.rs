//! Session tiers and usage quotas
//!
//! Every chat request runs inside a session that carries a tier and its
//! limits. Counters live in fixed UTC windows (minute for requests and
//! tools, day for tokens) and are bumped with one atomic increment so
//! concurrent requests cannot sneak past a limit between read and write.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Days, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AgentError;
use crate::Result;

//
// ================= Tiers & Limits =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Elevated,
    Admin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Elevated => "elevated",
            Tier::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Tier {
        match raw {
            "admin" => Tier::Admin,
            "elevated" => Tier::Elevated,
            _ => Tier::Anonymous,
        }
    }
}

/// Per-window ceilings. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_min: Option<i64>,
    pub tools_per_min: Option<i64>,
    pub tokens_per_day: Option<i64>,
}

impl TierLimits {
    pub fn anonymous() -> Self {
        Self {
            requests_per_min: Some(env_i64("LIMIT_ANON_REQ_PER_MIN", 12)),
            tools_per_min: Some(env_i64("LIMIT_ANON_TOOL_PER_MIN", 12)),
            tokens_per_day: Some(env_i64("LIMIT_ANON_TOK_PER_DAY", 60_000)),
        }
    }

    pub fn elevated() -> Self {
        Self {
            requests_per_min: Some(env_i64("LIMIT_ELEV_REQ_PER_MIN", 60)),
            tools_per_min: Some(env_i64("LIMIT_ELEV_TOOL_PER_MIN", 60)),
            tokens_per_day: Some(env_i64("LIMIT_ELEV_TOK_PER_DAY", 300_000)),
        }
    }

    pub fn admin() -> Self {
        Self {
            requests_per_min: None,
            tools_per_min: None,
            tokens_per_day: None,
        }
    }

    pub fn for_metric(&self, metric: Metric) -> Option<i64> {
        match metric {
            Metric::Requests => self.requests_per_min,
            Metric::Tools => self.tools_per_min,
            Metric::Tokens => self.tokens_per_day,
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

//
// ================= Metrics & Windows =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Requests,
    Tools,
    Tokens,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Requests => "requests",
            Metric::Tools => "tools",
            Metric::Tokens => "tokens",
        }
    }

    /// Fixed-window key the counter lives under.
    pub fn bucket(&self, now: DateTime<Utc>) -> String {
        match self {
            Metric::Requests | Metric::Tools => now.format("%Y%m%d%H%M").to_string(),
            Metric::Tokens => now.format("%Y%m%d").to_string(),
        }
    }

    /// Seconds until the current window rolls over.
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        match self {
            Metric::Requests | Metric::Tools => {
                60u64.saturating_sub(u64::from(now.second())).max(1)
            }
            Metric::Tokens => {
                let tomorrow = (now.date_naive() + Days::new(1)).and_time(NaiveTime::MIN);
                let next_midnight = DateTime::<Utc>::from_naive_utc_and_offset(tomorrow, Utc);
                (next_midnight - now).num_seconds().max(1) as u64
            }
        }
    }

    /// Counters outlive their window slightly so late writes stay visible.
    pub fn counter_ttl(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Metric::Requests | Metric::Tools => now + Duration::seconds(120),
            Metric::Tokens => now + Duration::days(2),
        }
    }
}

//
// ================= Profiles =================
//

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    #[serde(default)]
    pub allowlist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProfile {
    pub session_id: String,
    pub tier: Tier,
    pub limits: TierLimits,
    #[serde(default)]
    pub flags: SessionFlags,
    pub ip_hash: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Unix seconds after which the session no longer resolves.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricUsage {
    pub used: i64,
    pub max: Option<i64>,
    #[serde(rename = "resetInSec")]
    pub reset_in_sec: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveUsage {
    pub tier: Tier,
    pub requests: MetricUsage,
    pub tools: MetricUsage,
    pub tokens: MetricUsage,
}

//
// ================= Backend Trait =================
//

/// Persistence seam for profiles and usage counters
#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync {
    async fn put_profile(&self, profile: &SessionProfile) -> Result<()>;

    async fn get_profile(&self, session_id: &str) -> Result<Option<SessionProfile>>;

    async fn update_tier(&self, session_id: &str, tier: Tier, limits: &TierLimits) -> Result<()>;

    async fn touch(&self, session_id: &str, last_seen_at: DateTime<Utc>) -> Result<()>;

    /// Atomically add `amount` and return the window total after the add.
    async fn increment_counter(
        &self,
        session_id: &str,
        metric: Metric,
        bucket: &str,
        amount: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<i64>;

    async fn read_counter(&self, session_id: &str, metric: Metric, bucket: &str) -> Result<i64>;
}

//
// ================= Store =================
//

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl_days: i64,
    pub elevated_key: String,
    pub admin_key: String,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self {
            ttl_days: env_i64("SESSION_TTL_DAYS", 2),
            elevated_key: env::var("ACCESS_KEY_ELEVATED").unwrap_or_default(),
            admin_key: env::var("ACCESS_KEY_ADMIN").unwrap_or_default(),
        }
    }
}

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, config: SessionConfig) -> Self {
        Self { backend, config }
    }

    pub async fn start_session(&self, ip: &str, user_agent: &str) -> Result<SessionProfile> {
        let now = Utc::now();
        let profile = SessionProfile {
            session_id: Uuid::new_v4().to_string(),
            tier: Tier::Anonymous,
            limits: TierLimits::anonymous(),
            flags: SessionFlags::default(),
            ip_hash: hash_ip(ip),
            user_agent: user_agent.chars().take(200).collect(),
            created_at: now,
            last_seen_at: now,
            expires_at: (now + Duration::days(self.config.ttl_days)).timestamp(),
        };
        self.backend.put_profile(&profile).await?;
        Ok(profile)
    }

    /// Lookup that treats expired profiles as absent.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionProfile>> {
        let profile = self.backend.get_profile(session_id).await?;
        Ok(profile.filter(|profile| profile.expires_at > Utc::now().timestamp()))
    }

    pub async fn require(&self, session_id: &str) -> Result<SessionProfile> {
        self.get(session_id)
            .await?
            .ok_or_else(|| AgentError::UnknownSession(session_id.to_string()))
    }

    pub async fn upgrade(&self, session_id: &str, access_key: &str) -> Result<SessionProfile> {
        let mut profile = self.require(session_id).await?;

        let (tier, limits) = if !self.config.admin_key.is_empty()
            && access_key == self.config.admin_key
        {
            (Tier::Admin, TierLimits::admin())
        } else if !self.config.elevated_key.is_empty() && access_key == self.config.elevated_key {
            (Tier::Elevated, TierLimits::elevated())
        } else {
            return Err(AgentError::InvalidAccessKey(
                "access key does not match any tier".to_string(),
            ));
        };

        self.backend.update_tier(session_id, tier, &limits).await?;
        profile.tier = tier;
        profile.limits = limits;
        Ok(profile)
    }

    /// Charge `amount` against a metric. Admin and allowlisted sessions
    /// bypass counters entirely; a limit of `None` or below zero never
    /// blocks.
    pub async fn bump(&self, session_id: &str, metric: Metric, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Ok(());
        }
        let profile = self.require(session_id).await?;
        if profile.tier == Tier::Admin || profile.flags.allowlist {
            return Ok(());
        }
        let max = match profile.limits.for_metric(metric) {
            Some(max) if max >= 0 => max,
            _ => return Ok(()),
        };

        let now = Utc::now();
        let total = self
            .backend
            .increment_counter(
                session_id,
                metric,
                &metric.bucket(now),
                amount,
                metric.counter_ttl(now),
            )
            .await?;

        if total <= max {
            Ok(())
        } else {
            Err(AgentError::RateLimited {
                metric: metric.as_str().to_string(),
                retry_after_secs: metric.retry_after(now),
            })
        }
    }

    pub async fn live_usage(&self, session_id: &str) -> Result<LiveUsage> {
        let profile = self.require(session_id).await?;
        let now = Utc::now();
        Ok(LiveUsage {
            tier: profile.tier,
            requests: self.usage_for(&profile, Metric::Requests, now).await?,
            tools: self.usage_for(&profile, Metric::Tools, now).await?,
            tokens: self.usage_for(&profile, Metric::Tokens, now).await?,
        })
    }

    pub async fn touch(&self, session_id: &str) -> Result<()> {
        self.backend.touch(session_id, Utc::now()).await
    }

    async fn usage_for(
        &self,
        profile: &SessionProfile,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Result<MetricUsage> {
        let used = self
            .backend
            .read_counter(&profile.session_id, metric, &metric.bucket(now))
            .await?;
        Ok(MetricUsage {
            used,
            max: profile.limits.for_metric(metric),
            reset_in_sec: metric.retry_after(now),
        })
    }
}

fn hash_ip(ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn buckets_split_by_window() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 31, 22).unwrap();
        assert_eq!(Metric::Requests.bucket(at), "202403051431");
        assert_eq!(Metric::Tools.bucket(at), "202403051431");
        assert_eq!(Metric::Tokens.bucket(at), "20240305");
    }

    #[test]
    fn retry_after_counts_down_to_window_edge() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 31, 22).unwrap();
        assert_eq!(Metric::Requests.retry_after(at), 38);

        let tokens = Metric::Tokens.retry_after(at);
        // 9h 28m 38s until the next UTC midnight
        assert_eq!(tokens, 9 * 3600 + 28 * 60 + 38);
    }

    #[test]
    fn counter_ttl_outlives_each_window() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 31, 22).unwrap();
        assert_eq!(Metric::Tools.counter_ttl(at) - at, Duration::seconds(120));
        assert_eq!(Metric::Tokens.counter_ttl(at) - at, Duration::days(2));
    }

    #[test]
    fn tier_round_trips_through_text() {
        for tier in [Tier::Anonymous, Tier::Elevated, Tier::Admin] {
            assert_eq!(Tier::parse(tier.as_str()), tier);
        }
        assert_eq!(Tier::parse("something-else"), Tier::Anonymous);
    }

    #[test]
    fn ip_hash_is_short_and_stable() {
        let first = hash_ip("203.0.113.9");
        let second = hash_ip("203.0.113.9");
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert_ne!(first, hash_ip("203.0.113.10"));
    }
}
