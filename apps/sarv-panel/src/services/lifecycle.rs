use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::models::panel::Panel;
use crate::models::store::{
    Plan, Subscription, INTENT_CONFIRMED, INTENT_FAILED, INTENT_PENDING, SUB_ACTIVE,
    SUB_CANCELLED, SUB_EXPIRED, SUB_PENDING, SUB_SUSPENDED,
};
use crate::repositories::panel_repo::PanelRepository;
use crate::repositories::subscription_repo::SubscriptionRepository;
use crate::services::registry::RegistryService;
use crate::settings::{SettingsService, SuspendMode};
use crate::xui::types::ClientSpec;
use crate::xui::{PanelError, XuiClient};

/// Remote client identifier. Deterministic per subscription, so every
/// provisioning attempt for the same row converges on one remote identity.
pub fn client_email(user_id: i64, sub_id: i64) -> String {
    format!("u{}s{}", user_id, sub_id)
}

fn idempotency_key(user_id: i64, plan_id: i64, sub_id: i64) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", user_id, plan_id, sub_id).as_bytes());
    hex::encode(&digest[..16])
}

/// Stable RFC 4122 UUID derived from the idempotency key.
fn derive_client_uuid(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

fn flow_for(protocol: &str) -> Option<String> {
    match protocol {
        "vless" => Some("xtls-rprx-vision".to_string()),
        _ => None,
    }
}

/// Subscription state machine:
/// `pending → active → (suspended ↔ active) → expired/cancelled`.
/// Every remote mutation goes through here; the sync scheduler calls back
/// in for suspension/expiry enforcement.
#[derive(Clone)]
pub struct LifecycleService {
    pool: SqlitePool,
    settings: Arc<SettingsService>,
    registry: Arc<RegistryService>,
    subs: SubscriptionRepository,
    panels: PanelRepository,
    xui: Arc<XuiClient>,
}

impl LifecycleService {
    pub fn new(
        pool: SqlitePool,
        settings: Arc<SettingsService>,
        registry: Arc<RegistryService>,
        xui: Arc<XuiClient>,
    ) -> Self {
        let subs = SubscriptionRepository::new(pool.clone());
        let panels = PanelRepository::new(pool.clone());
        Self { pool, settings, registry, subs, panels, xui }
    }

    async fn get_plan(&self, plan_id: i64) -> Result<Plan> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch plan")?
            .with_context(|| format!("Plan {} not found", plan_id))
    }

    async fn must_get(&self, sub_id: i64) -> Result<Subscription> {
        self.subs
            .get_by_id(sub_id)
            .await?
            .with_context(|| format!("Subscription {} not found", sub_id))
    }

    fn build_spec(&self, sub: &Subscription, protocol: &str, uuid: &str, enable: bool) -> ClientSpec {
        ClientSpec {
            id: uuid.to_string(),
            email: client_email(sub.user_id, sub.id),
            enable,
            total_gb: sub.traffic_limit,
            expiry_time: sub.expires_at.timestamp_millis(),
            limit_ip: 0,
            flow: flow_for(protocol),
        }
    }

    // ── provision ────────────────────────────────────────────────

    /// Create the remote client for a pending subscription and activate
    /// it. Idempotent: a confirmed intent short-circuits, a dangling
    /// pending intent is reconciled against the panel before any new
    /// create is attempted.
    pub async fn provision(&self, sub_id: i64) -> Result<Subscription> {
        let sub = self.must_get(sub_id).await?;
        match sub.status.as_str() {
            SUB_PENDING => {}
            SUB_ACTIVE => return Ok(sub),
            other => bail!("cannot provision subscription {} in state '{}'", sub_id, other),
        }

        let plan = self.get_plan(sub.plan_id).await?;
        let key = idempotency_key(sub.user_id, sub.plan_id, sub.id);
        let uuid = derive_client_uuid(&key);
        let email = client_email(sub.user_id, sub.id);

        if let Some(intent) = self.subs.intent_by_key(&key).await? {
            match intent.state.as_str() {
                INTENT_CONFIRMED => {
                    // A previous attempt finished remotely; just align
                    // the local row.
                    self.subs
                        .activate(sub.id, intent.panel_id, intent.inbound_remote_id, &intent.client_uuid, &email)
                        .await?;
                    return self.must_get(sub.id).await;
                }
                INTENT_PENDING => {
                    if self.try_confirm_intent(&intent, &sub, &email).await? {
                        return self.must_get(sub.id).await;
                    }
                    self.subs.set_intent_state(&key, INTENT_FAILED).await?;
                }
                _ => {}
            }
        }

        let country = plan.country_code.as_deref();
        let mut candidates = self.registry.candidates(&plan.protocol, country).await?;
        if candidates.is_empty() {
            // Mirrors may not exist yet on a fresh install; discover and
            // scan again.
            self.registry.discover_all().await?;
            candidates = self.registry.candidates(&plan.protocol, country).await?;
        }
        if candidates.is_empty() {
            bail!("no enabled panel offers protocol '{}'", plan.protocol);
        }

        let spec = self.build_spec(&sub, &plan.protocol, &uuid, true);
        let mut last_err: Option<PanelError> = None;

        for candidate in candidates {
            self.subs
                .arm_intent(&key, sub.id, candidate.panel.id, candidate.inbound_remote_id, &uuid)
                .await?;

            match self
                .xui
                .add_client(&candidate.panel, candidate.inbound_remote_id, &spec)
                .await
            {
                Ok(()) => {
                    self.subs.set_intent_state(&key, INTENT_CONFIRMED).await?;
                    self.subs
                        .activate(sub.id, candidate.panel.id, candidate.inbound_remote_id, &uuid, &email)
                        .await?;
                    info!(
                        "subscription {} provisioned on panel {} (inbound {})",
                        sub.id, candidate.panel.name, candidate.inbound_remote_id
                    );
                    return self.must_get(sub.id).await;
                }
                Err(e)
                    if e.is_retryable()
                        || matches!(
                            e,
                            PanelError::Auth { .. } | PanelError::Http { status: 401, .. }
                        ) =>
                {
                    warn!(
                        "panel {} unusable for provisioning ({e}), failing over",
                        candidate.panel.name
                    );
                    self.subs.set_intent_state(&key, INTENT_FAILED).await?;
                    self.panels
                        .mark_unreachable(candidate.panel.id, &e.to_string())
                        .await?;
                    last_err = Some(e);
                }
                Err(e) => {
                    // The panel answered and said no (inbound full,
                    // duplicate client); not a failover case.
                    self.subs.set_intent_state(&key, INTENT_FAILED).await?;
                    return Err(e).context("panel rejected client creation");
                }
            }
        }

        match last_err {
            Some(e) => Err(e).context("all candidate panels failed during provisioning"),
            None => bail!("all candidate panels failed during provisioning"),
        }
    }

    /// Check whether a dangling intent actually completed remotely; if
    /// so confirm it and activate the subscription.
    async fn try_confirm_intent(
        &self,
        intent: &crate::models::store::ProvisionIntent,
        sub: &Subscription,
        email: &str,
    ) -> Result<bool> {
        let Some(panel) = self.panels.get_by_id(intent.panel_id).await? else {
            return Ok(false);
        };
        match self.xui.get_client_traffic(&panel, email).await {
            Ok(Some(_)) => {
                self.subs.set_intent_state(&intent.idempotency_key, INTENT_CONFIRMED).await?;
                self.subs
                    .activate(sub.id, intent.panel_id, intent.inbound_remote_id, &intent.client_uuid, email)
                    .await?;
                info!("subscription {} recovered from dangling provision intent", sub.id);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!("could not verify dangling intent for subscription {}: {e}", sub.id);
                Ok(false)
            }
        }
    }

    // ── renew ────────────────────────────────────────────────────

    /// Extend expiry by one plan period from `max(now, expiry)`, restore
    /// the traffic quota, zero the remote counters, and return the
    /// subscription to `active`.
    pub async fn renew(&self, sub_id: i64) -> Result<Subscription> {
        let sub = self.must_get(sub_id).await?;
        if !matches!(sub.status.as_str(), SUB_ACTIVE | SUB_SUSPENDED) {
            bail!("cannot renew subscription {} in state '{}'", sub_id, sub.status);
        }

        let plan = self.get_plan(sub.plan_id).await?;
        let (panel, inbound_id, uuid, email) = self.remote_identity(&sub).await?;

        let new_expiry = sub.expires_at.max(Utc::now()) + Duration::days(plan.duration_days);
        let mut renewed = sub.clone();
        renewed.expires_at = new_expiry;
        renewed.traffic_limit = plan.traffic_limit_bytes();

        let spec = self.build_spec(&renewed, &plan.protocol, &uuid, true);
        self.xui
            .update_client(&panel, inbound_id, &spec)
            .await
            .context("failed to extend remote client")?;
        self.xui
            .reset_client_traffic(&panel, inbound_id, &email)
            .await
            .context("failed to reset remote traffic counters")?;

        self.subs.renew(sub.id, new_expiry, plan.traffic_limit_bytes()).await?;
        info!("subscription {} renewed until {}", sub.id, new_expiry);
        self.must_get(sub.id).await
    }

    // ── cancel ───────────────────────────────────────────────────

    /// Delete the remote client and mark the subscription cancelled.
    pub async fn cancel(&self, sub_id: i64) -> Result<Subscription> {
        let sub = self.must_get(sub_id).await?;
        match sub.status.as_str() {
            SUB_CANCELLED => return Ok(sub),
            SUB_PENDING => {
                // Nothing was provisioned; purely a local transition.
                self.subs.set_status(sub.id, SUB_CANCELLED, None).await?;
                return self.must_get(sub.id).await;
            }
            SUB_ACTIVE | SUB_SUSPENDED | SUB_EXPIRED => {}
            other => bail!("cannot cancel subscription {} in state '{}'", sub_id, other),
        }

        if let Ok((panel, inbound_id, uuid, _)) = self.remote_identity(&sub).await {
            match self.xui.delete_client(&panel, inbound_id, &uuid).await {
                Ok(()) => {}
                // The panel no longer knows the client; fine for cancel.
                Err(PanelError::Api { message }) => {
                    warn!("remote client already absent for subscription {}: {}", sub.id, message);
                }
                Err(e) => return Err(e).context("failed to delete remote client"),
            }
        }

        self.subs.set_status(sub.id, SUB_CANCELLED, None).await?;
        info!("subscription {} cancelled", sub.id);
        self.must_get(sub.id).await
    }

    // ── reset traffic ────────────────────────────────────────────

    pub async fn reset_traffic(&self, sub_id: i64) -> Result<Subscription> {
        let sub = self.must_get(sub_id).await?;
        if !matches!(sub.status.as_str(), SUB_ACTIVE | SUB_SUSPENDED) {
            bail!("cannot reset traffic for subscription {} in state '{}'", sub_id, sub.status);
        }

        let (panel, inbound_id, _, email) = self.remote_identity(&sub).await?;
        self.xui
            .reset_client_traffic(&panel, inbound_id, &email)
            .await
            .context("failed to reset remote traffic counters")?;
        self.subs.reset_traffic(sub.id).await?;

        // A traffic-suspended subscription regains service immediately.
        if sub.status == SUB_SUSPENDED && sub.suspended_reason.as_deref() == Some("traffic") {
            self.reinstate(&sub).await?;
        }
        self.must_get(sub.id).await
    }

    async fn reinstate(&self, sub: &Subscription) -> Result<()> {
        if self.settings.suspend_mode().await == SuspendMode::Disable {
            let plan = self.get_plan(sub.plan_id).await?;
            let (panel, inbound_id, uuid, _) = self.remote_identity(sub).await?;
            let spec = self.build_spec(sub, &plan.protocol, &uuid, true);
            self.xui
                .update_client(&panel, inbound_id, &spec)
                .await
                .context("failed to re-enable remote client")?;
        }
        self.subs.set_status(sub.id, SUB_ACTIVE, None).await
    }

    // ── sync-driven transitions ──────────────────────────────────

    /// Limit breach detected by the scheduler. The remote client is left
    /// in place or disabled, per configuration; a remote failure here is
    /// logged and re-asserted on the next sync pass.
    pub async fn suspend(&self, sub: &Subscription, reason: &str) -> Result<()> {
        self.subs.set_status(sub.id, SUB_SUSPENDED, Some(reason)).await?;
        info!("subscription {} suspended ({})", sub.id, reason);

        if self.settings.suspend_mode().await == SuspendMode::Disable {
            if let Err(e) = self.disable_remote(sub).await {
                warn!("could not disable remote client for subscription {}: {e:#}", sub.id);
            }
        }
        Ok(())
    }

    pub async fn disable_remote(&self, sub: &Subscription) -> Result<()> {
        let plan = self.get_plan(sub.plan_id).await?;
        let (panel, inbound_id, uuid, _) = self.remote_identity(sub).await?;
        let spec = self.build_spec(sub, &plan.protocol, &uuid, false);
        self.xui
            .update_client(&panel, inbound_id, &spec)
            .await
            .context("failed to disable remote client")?;
        Ok(())
    }

    /// Expiry past the grace period: remove the remote client, then mark
    /// the row expired. A transport failure leaves the row untouched so
    /// the next sync run retries the deletion.
    pub async fn expire(&self, sub: &Subscription) -> Result<()> {
        if let Ok((panel, inbound_id, uuid, _)) = self.remote_identity(sub).await {
            match self.xui.delete_client(&panel, inbound_id, &uuid).await {
                Ok(()) => {}
                Err(PanelError::Api { message }) => {
                    warn!("remote client already absent for subscription {}: {}", sub.id, message);
                }
                Err(e) => return Err(e).context("failed to delete expired remote client"),
            }
        }
        self.subs.set_status(sub.id, SUB_EXPIRED, Some("grace period elapsed")).await?;
        info!("subscription {} expired past grace period", sub.id);
        Ok(())
    }

    /// The panel/inbound/uuid/email tuple of a provisioned subscription.
    async fn remote_identity(&self, sub: &Subscription) -> Result<(Panel, i64, String, String)> {
        let panel_id = sub
            .panel_id
            .with_context(|| format!("subscription {} has no panel", sub.id))?;
        let inbound_id = sub
            .inbound_remote_id
            .with_context(|| format!("subscription {} has no inbound", sub.id))?;
        let uuid = sub
            .client_uuid
            .clone()
            .with_context(|| format!("subscription {} has no client UUID", sub.id))?;
        let email = sub
            .client_email
            .clone()
            .unwrap_or_else(|| client_email(sub.user_id, sub.id));
        let panel = self
            .panels
            .get_by_id(panel_id)
            .await?
            .with_context(|| format!("panel {} not found", panel_id))?;
        Ok((panel, inbound_id, uuid, email))
    }
}
