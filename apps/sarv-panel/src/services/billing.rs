use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::models::store::{Plan, Subscription, User};
use crate::repositories::subscription_repo::SubscriptionRepository;
use crate::services::lifecycle::LifecycleService;
use crate::settings::SettingsService;

/// Payment glue: the external payment flows (card-to-card confirmation,
/// gateway callbacks, bot wallet) land here once money has moved, and
/// this service turns that into lifecycle calls.
#[derive(Clone)]
pub struct BillingService {
    pool: SqlitePool,
    settings: Arc<SettingsService>,
    subs: SubscriptionRepository,
    lifecycle: Arc<LifecycleService>,
}

impl BillingService {
    pub fn new(
        pool: SqlitePool,
        settings: Arc<SettingsService>,
        lifecycle: Arc<LifecycleService>,
    ) -> Self {
        let subs = SubscriptionRepository::new(pool.clone());
        Self { pool, settings, subs, lifecycle }
    }

    async fn get_active_plan(&self, plan_id: i64) -> Result<Plan> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ? AND is_active = 1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch plan")?
            .with_context(|| format!("Plan {} not found or inactive", plan_id))
    }

    async fn log_payment(
        &self,
        user_id: i64,
        subscription_id: Option<i64>,
        method: &str,
        amount: i64,
        external_id: Option<&str>,
        status: &str,
    ) -> Result<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO payments (user_id, subscription_id, method, amount, external_id, status)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(method)
        .bind(amount)
        .bind(external_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .context("Failed to log payment")?;
        Ok(id)
    }

    /// Subscription already paid for under this gateway reference, if
    /// any. Payment callbacks get retried; a seen external id must not
    /// produce a second subscription or remote client.
    async fn paid_subscription(&self, external_id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT subscription_id FROM payments
             WHERE external_id = ? AND status = 'completed' AND subscription_id IS NOT NULL
             ORDER BY id LIMIT 1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up payment by external ID")
    }

    pub async fn get_or_create_user(
        &self,
        tg_id: Option<i64>,
        username: Option<&str>,
    ) -> Result<User> {
        if let Some(tg_id) = tg_id {
            let existing = sqlx::query_as::<_, User>("SELECT * FROM users WHERE tg_id = ?")
                .bind(tg_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(user) = existing {
                return Ok(user);
            }
        }
        sqlx::query_as::<_, User>(
            "INSERT INTO users (tg_id, username) VALUES (?, ?) RETURNING *",
        )
        .bind(tg_id)
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create user")
    }

    /// A confirmed purchase payment: record it, create (or reuse) the
    /// pending subscription, and provision. A double-submitted
    /// confirmation inside the dedup window converges on the same
    /// subscription row and the same remote client.
    pub async fn confirm_purchase(
        &self,
        user_id: i64,
        plan_id: i64,
        method: &str,
        amount: i64,
        external_id: Option<&str>,
    ) -> Result<Subscription> {
        if let Some(ext) = external_id {
            if let Some(sub_id) = self.paid_subscription(ext).await? {
                info!("duplicate payment callback '{}', converging on subscription {}", ext, sub_id);
                return self.lifecycle.provision(sub_id).await;
            }
        }

        let plan = self.get_active_plan(plan_id).await?;
        let sub = self.ensure_pending_subscription(user_id, &plan).await?;
        self.log_payment(user_id, Some(sub.id), method, amount, external_id, "completed")
            .await?;

        info!("payment confirmed for user {} plan {}, provisioning subscription {}", user_id, plan_id, sub.id);
        self.lifecycle.provision(sub.id).await
    }

    /// A confirmed renewal payment for an existing subscription.
    pub async fn confirm_renewal(
        &self,
        sub_id: i64,
        method: &str,
        amount: i64,
        external_id: Option<&str>,
    ) -> Result<Subscription> {
        let sub = self
            .subs
            .get_by_id(sub_id)
            .await?
            .with_context(|| format!("Subscription {} not found", sub_id))?;

        if let Some(ext) = external_id {
            if self.paid_subscription(ext).await?.is_some() {
                info!("duplicate renewal callback '{}', skipping extension", ext);
                return Ok(sub);
            }
        }

        self.log_payment(sub.user_id, Some(sub.id), method, amount, external_id, "completed")
            .await?;
        self.lifecycle.renew(sub_id).await
    }

    pub async fn top_up(
        &self,
        user_id: i64,
        amount: i64,
        method: &str,
        external_id: Option<&str>,
    ) -> Result<i64> {
        if amount <= 0 {
            bail!("top-up amount must be positive");
        }
        self.log_payment(user_id, None, method, amount, external_id, "completed").await?;
        sqlx::query("UPDATE users SET balance = balance + ? WHERE id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to credit balance")?;
        let balance = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to read balance")?;
        Ok(balance)
    }

    /// Purchase paid from the wallet. The debit is a single guarded
    /// UPDATE, so a concurrent purchase cannot overdraw.
    pub async fn purchase_with_balance(&self, user_id: i64, plan_id: i64) -> Result<Subscription> {
        let plan = self.get_active_plan(plan_id).await?;

        let debited = sqlx::query(
            "UPDATE users SET balance = balance - ? WHERE id = ? AND balance >= ?",
        )
        .bind(plan.price)
        .bind(user_id)
        .bind(plan.price)
        .execute(&self.pool)
        .await
        .context("Failed to debit balance")?;
        if debited.rows_affected() == 0 {
            bail!("insufficient balance for plan '{}'", plan.name);
        }

        let sub = self.ensure_pending_subscription(user_id, &plan).await?;
        self.log_payment(user_id, Some(sub.id), "wallet", plan.price, None, "completed").await?;
        self.lifecycle.provision(sub.id).await
    }

    async fn ensure_pending_subscription(&self, user_id: i64, plan: &Plan) -> Result<Subscription> {
        let window = self.settings.purchase_dedup_window_secs().await;
        if let Some(existing) = self.subs.find_reusable_pending(user_id, plan.id, window).await? {
            info!("reusing pending subscription {} for user {}", existing.id, user_id);
            return Ok(existing);
        }
        let expires_at = Utc::now() + Duration::days(plan.duration_days);
        self.subs
            .create_pending(user_id, plan.id, plan.traffic_limit_bytes(), expires_at)
            .await
    }
}
