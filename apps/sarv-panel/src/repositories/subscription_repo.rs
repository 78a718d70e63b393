use sqlx::SqlitePool;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};

use crate::models::store::{ProvisionIntent, Subscription, INTENT_PENDING, SUB_ACTIVE, SUB_PENDING};

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscription by ID")
    }

    pub async fn get_for_user(&self, user_id: i64) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch user subscriptions")
    }

    pub async fn create_pending(
        &self,
        user_id: i64,
        plan_id: i64,
        traffic_limit: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (user_id, plan_id, status, traffic_limit, expires_at)
            VALUES (?, ?, 'pending', ?, ?)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(traffic_limit)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create pending subscription")
    }

    /// A recent still-pending subscription for the same user/plan, so a
    /// double-submitted purchase converges on one row.
    pub async fn find_reusable_pending(
        &self,
        user_id: i64,
        plan_id: i64,
        window_secs: i64,
    ) -> Result<Option<Subscription>> {
        let cutoff = Utc::now() - Duration::seconds(window_secs);
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions
             WHERE user_id = ? AND plan_id = ? AND status = ? AND datetime(created_at) > datetime(?)
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(SUB_PENDING)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up reusable pending subscription")
    }

    pub async fn activate(
        &self,
        id: i64,
        panel_id: i64,
        inbound_remote_id: i64,
        client_uuid: &str,
        client_email: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions
             SET status = ?, panel_id = ?, inbound_remote_id = ?, client_uuid = ?,
                 client_email = ?, suspended_reason = NULL
             WHERE id = ?",
        )
        .bind(SUB_ACTIVE)
        .bind(panel_id)
        .bind(inbound_remote_id)
        .bind(client_uuid)
        .bind(client_email)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to activate subscription")?;
        Ok(())
    }

    pub async fn set_status(&self, id: i64, status: &str, reason: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET status = ?, suspended_reason = ? WHERE id = ?")
            .bind(status)
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update subscription status")?;
        Ok(())
    }

    /// Mirror remote counters into the local cache row. Matching is by
    /// client email within the panel; returns false when no row matched.
    pub async fn update_traffic_by_email(
        &self,
        panel_id: i64,
        client_email: &str,
        used_traffic: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET used_traffic = ?, traffic_updated_at = ?
             WHERE panel_id = ? AND client_email = ?",
        )
        .bind(used_traffic)
        .bind(Utc::now())
        .bind(panel_id)
        .bind(client_email)
        .execute(&self.pool)
        .await
        .context("Failed to mirror client traffic")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn renew(
        &self,
        id: i64,
        expires_at: DateTime<Utc>,
        traffic_limit: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions
             SET status = ?, expires_at = ?, traffic_limit = ?, used_traffic = 0,
                 suspended_reason = NULL
             WHERE id = ?",
        )
        .bind(SUB_ACTIVE)
        .bind(expires_at)
        .bind(traffic_limit)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to renew subscription")?;
        Ok(())
    }

    pub async fn reset_traffic(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET used_traffic = 0, traffic_updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to reset subscription traffic")?;
        Ok(())
    }

    /// Active subscriptions past their traffic quota or expiry stamp.
    pub async fn breached_active(&self) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions
             WHERE status = ?
             AND ((traffic_limit > 0 AND used_traffic >= traffic_limit)
                  OR datetime(expires_at) < datetime(?))",
        )
        .bind(SUB_ACTIVE)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch breached subscriptions")
    }

    /// Subscriptions whose expiry lies beyond the grace period; their
    /// remote clients are due for deletion.
    pub async fn past_grace(&self, grace_days: i64) -> Result<Vec<Subscription>> {
        let cutoff = Utc::now() - Duration::days(grace_days);
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions
             WHERE status IN ('active', 'suspended') AND datetime(expires_at) < datetime(?)",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch subscriptions past grace period")
    }

    /// Suspended subscriptions on a panel whose remote client should be
    /// disabled (reconciled against live stats each sync pass).
    pub async fn suspended_on_panel(&self, panel_id: i64) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE panel_id = ? AND status = 'suspended'",
        )
        .bind(panel_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch suspended subscriptions")
    }

    pub async fn count_occupying_panel(&self, panel_id: i64) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions
             WHERE panel_id = ? AND status IN ('active', 'suspended')",
        )
        .bind(panel_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count panel occupancy")
    }

    // ==================== PROVISION INTENTS ====================

    pub async fn intent_by_key(&self, key: &str) -> Result<Option<ProvisionIntent>> {
        sqlx::query_as::<_, ProvisionIntent>(
            "SELECT * FROM provision_intents WHERE idempotency_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch provision intent")
    }

    /// Write (or re-arm) the pending intent for an idempotency key. The
    /// row must exist before the remote create call is made.
    pub async fn arm_intent(
        &self,
        key: &str,
        subscription_id: i64,
        panel_id: i64,
        inbound_remote_id: i64,
        client_uuid: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provision_intents
                (idempotency_key, subscription_id, panel_id, inbound_remote_id, client_uuid, state, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(idempotency_key) DO UPDATE SET
                panel_id = excluded.panel_id,
                inbound_remote_id = excluded.inbound_remote_id,
                client_uuid = excluded.client_uuid,
                state = 'pending',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(subscription_id)
        .bind(panel_id)
        .bind(inbound_remote_id)
        .bind(client_uuid)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to arm provision intent")?;
        Ok(())
    }

    pub async fn set_intent_state(&self, key: &str, state: &str) -> Result<()> {
        sqlx::query(
            "UPDATE provision_intents SET state = ?, updated_at = ? WHERE idempotency_key = ?",
        )
        .bind(state)
        .bind(Utc::now())
        .bind(key)
        .execute(&self.pool)
        .await
        .context("Failed to update provision intent")?;
        Ok(())
    }

    /// Pending intents older than the horizon; candidates for the reaper.
    pub async fn stale_pending_intents(&self, horizon_secs: i64) -> Result<Vec<ProvisionIntent>> {
        let cutoff = Utc::now() - Duration::seconds(horizon_secs);
        sqlx::query_as::<_, ProvisionIntent>(
            "SELECT * FROM provision_intents WHERE state = ? AND datetime(updated_at) < datetime(?)",
        )
        .bind(INTENT_PENDING)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stale provision intents")
    }
}
