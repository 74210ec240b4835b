//! Postgres session backend
//!
//! Counter increments ride a single INSERT .. ON CONFLICT .. RETURNING
//! statement so the add and the read happen atomically on the database
//! side, not as separate round trips.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::env;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{Metric, SessionBackend, SessionProfile, Tier, TierLimits};
use crate::error::AgentError;
use crate::Result;

pub struct PgSessionBackend {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgSessionBackend {
    pub fn from_env() -> Option<Self> {
        let url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .filter(|url| !url.is_empty())?;

        match PgPoolOptions::new().max_connections(5).connect_lazy(&url) {
            Ok(pool) => {
                info!("Session backend: postgres");
                Some(Self {
                    pool,
                    schema_ready: OnceCell::new(),
                })
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres session backend, falling back to in-memory: {}",
                    error
                );
                None
            }
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS session_profiles (
                      session_id TEXT PRIMARY KEY,
                      tier TEXT NOT NULL,
                      limits TEXT NOT NULL,
                      flags TEXT NOT NULL,
                      ip_hash TEXT NOT NULL,
                      user_agent TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL,
                      last_seen_at TIMESTAMPTZ NOT NULL,
                      expires_at BIGINT NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS usage_counters (
                      session_id TEXT NOT NULL,
                      metric TEXT NOT NULL,
                      bucket TEXT NOT NULL,
                      total BIGINT NOT NULL,
                      expires_at TIMESTAMPTZ NOT NULL,
                      PRIMARY KEY (session_id, metric, bucket)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AgentError::DatabaseError(format!("Failed to initialize session schema: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionBackend for PgSessionBackend {

    async fn put_profile(&self, profile: &SessionProfile) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO session_profiles
              (session_id, tier, limits, flags, ip_hash, user_agent, created_at, last_seen_at, expires_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (session_id) DO UPDATE
            SET tier = EXCLUDED.tier,
                limits = EXCLUDED.limits,
                flags = EXCLUDED.flags,
                last_seen_at = EXCLUDED.last_seen_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&profile.session_id)
        .bind(profile.tier.as_str())
        .bind(serde_json::to_string(&profile.limits)?)
        .bind(serde_json::to_string(&profile.flags)?)
        .bind(&profile.ip_hash)
        .bind(&profile.user_agent)
        .bind(profile.created_at)
        .bind(profile.last_seen_at)
        .bind(profile.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to save session profile: {}", e)))?;

        Ok(())
    }

    async fn get_profile(&self, session_id: &str) -> Result<Option<SessionProfile>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT session_id, tier, limits, flags, ip_hash, user_agent,
                   created_at, last_seen_at, expires_at
            FROM session_profiles
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to load session profile: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tier: String = row
            .try_get("tier")
            .map_err(|e| AgentError::DatabaseError(format!("Malformed session row: {}", e)))?;
        let limits: String = row
            .try_get("limits")
            .map_err(|e| AgentError::DatabaseError(format!("Malformed session row: {}", e)))?;
        let flags: String = row
            .try_get("flags")
            .map_err(|e| AgentError::DatabaseError(format!("Malformed session row: {}", e)))?;

        Ok(Some(SessionProfile {
            session_id: row
                .try_get("session_id")
                .map_err(|e| AgentError::DatabaseError(format!("Malformed session row: {}", e)))?,
            tier: Tier::parse(&tier),
            limits: serde_json::from_str(&limits)?,
            flags: serde_json::from_str(&flags)?,
            ip_hash: row.try_get("ip_hash").unwrap_or_default(),
            user_agent: row.try_get("user_agent").unwrap_or_default(),
            created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
            last_seen_at: row.try_get("last_seen_at").unwrap_or_else(|_| Utc::now()),
            expires_at: row.try_get("expires_at").unwrap_or(0),
        }))
    }

    async fn update_tier(&self, session_id: &str, tier: Tier, limits: &TierLimits) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("UPDATE session_profiles SET tier = $2, limits = $3 WHERE session_id = $1")
            .bind(session_id)
            .bind(tier.as_str())
            .bind(serde_json::to_string(limits)?)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AgentError::DatabaseError(format!("Failed to update session tier: {}", e))
            })?;

        Ok(())
    }

    async fn touch(&self, session_id: &str, last_seen_at: DateTime<Utc>) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("UPDATE session_profiles SET last_seen_at = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(last_seen_at)
            .execute(&self.pool)
            .await
            .map_err(|e| AgentError::DatabaseError(format!("Failed to touch session: {}", e)))?;

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
        self.ensure_schema().await?;

        // An expired row is reused as a fresh window instead of carrying
        // its stale total forward.
        let row = sqlx::query(
            r#"
            INSERT INTO usage_counters (session_id, metric, bucket, total, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id, metric, bucket) DO UPDATE
            SET total = CASE
                  WHEN usage_counters.expires_at <= NOW() THEN EXCLUDED.total
                  ELSE usage_counters.total + EXCLUDED.total
                END,
                expires_at = EXCLUDED.expires_at
            RETURNING total
            "#,
        )
        .bind(session_id)
        .bind(metric.as_str())
        .bind(bucket)
        .bind(amount)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to bump usage counter: {}", e)))?;

        row.try_get("total")
            .map_err(|e| AgentError::DatabaseError(format!("Malformed counter row: {}", e)))
    }

    async fn read_counter(&self, session_id: &str, metric: Metric, bucket: &str) -> Result<i64> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT total FROM usage_counters
            WHERE session_id = $1 AND metric = $2 AND bucket = $3 AND expires_at > NOW()
            "#,
        )
        .bind(session_id)
        .bind(metric.as_str())
        .bind(bucket)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to read usage counter: {}", e)))?;

        match row {
            Some(row) => row
                .try_get("total")
                .map_err(|e| AgentError::DatabaseError(format!("Malformed counter row: {}", e))),
            None => Ok(0),
        }
    }
}
