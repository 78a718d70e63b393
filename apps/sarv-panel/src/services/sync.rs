use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::models::panel::Panel;
use crate::models::store::{Subscription, INTENT_CONFIRMED, INTENT_FAILED, SUB_PENDING};
use crate::repositories::panel_repo::PanelRepository;
use crate::repositories::subscription_repo::SubscriptionRepository;
use crate::services::lifecycle::{client_email, LifecycleService};
use crate::services::registry::RegistryService;
use crate::settings::{SettingsService, SuspendMode};
use crate::xui::XuiClient;

/// Outcome of one reconciliation run, logged and returned to the manual
/// trigger endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub panels_ok: u32,
    pub panels_failed: u32,
    pub clients_matched: u32,
    pub suspended: u32,
    pub expired: u32,
    pub intents_confirmed: u32,
    pub intents_failed: u32,
}

/// Periodic reconciliation of local subscription state against every
/// enabled panel. One unreachable panel never aborts the run; it is
/// marked and retried on the next tick.
#[derive(Clone)]
pub struct SyncService {
    settings: Arc<SettingsService>,
    registry: Arc<RegistryService>,
    lifecycle: Arc<LifecycleService>,
    panels: PanelRepository,
    subs: SubscriptionRepository,
    xui: Arc<XuiClient>,
}

impl SyncService {
    pub fn new(
        settings: Arc<SettingsService>,
        registry: Arc<RegistryService>,
        lifecycle: Arc<LifecycleService>,
        panels: PanelRepository,
        subs: SubscriptionRepository,
        xui: Arc<XuiClient>,
    ) -> Self {
        Self { settings, registry, lifecycle, panels, subs, xui }
    }

    pub async fn start(&self) {
        info!("Starting background panel sync service...");
        let mut secs = self.settings.sync_interval_secs().await;
        let mut ticker = interval(Duration::from_secs(secs as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.run().await {
                Ok(report) => debug!("sync run finished: {:?}", report),
                Err(e) => error!("sync run error: {e:#}"),
            }

            // Pick up interval changes without a restart.
            let current = self.settings.sync_interval_secs().await;
            if current != secs {
                secs = current;
                ticker = interval(Duration::from_secs(secs as u64));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // Swallow the new interval's immediate first tick.
                ticker.tick().await;
            }
        }
    }

    /// One full reconciliation pass. Also invoked by the CLI `sync`
    /// command and the internal API trigger.
    pub async fn run(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for panel in self.panels.get_enabled().await? {
            match self.sync_panel(&panel).await {
                Ok(matched) => {
                    report.panels_ok += 1;
                    report.clients_matched += matched;
                }
                Err(e) => {
                    error!("sync failed for panel {}: {e:#}", panel.name);
                    self.panels.mark_unreachable(panel.id, &format!("{e:#}")).await?;
                    report.panels_failed += 1;
                }
            }
        }

        report.suspended = self.enforce_limits().await?;
        report.expired = self.expire_past_grace().await?;
        let (confirmed, failed) = self.reap_intents().await?;
        report.intents_confirmed = confirmed;
        report.intents_failed = failed;

        info!(
            "sync: {} panels ok, {} failed, {} clients matched, {} suspended, {} expired",
            report.panels_ok, report.panels_failed, report.clients_matched,
            report.suspended, report.expired
        );
        Ok(report)
    }

    /// Health-probe one panel, refresh its inbound mirrors, and mirror
    /// per-client traffic counters into the local subscription rows.
    async fn sync_panel(&self, panel: &Panel) -> Result<u32> {
        let status = self.xui.get_server_status(panel).await?;
        self.panels.mark_online(panel.id).await?;
        debug!(
            "panel {} online (xray {} {}, cpu {:.0}%)",
            panel.name, status.xray.state, status.xray.version, status.cpu
        );

        let inbounds = self.registry.discover_panel(panel).await?;

        let suspend_mode = self.settings.suspend_mode().await;
        let suspended: HashMap<String, Subscription> = self
            .subs
            .suspended_on_panel(panel.id)
            .await?
            .into_iter()
            .filter_map(|s| s.client_email.clone().map(|e| (e, s)))
            .collect();

        let mut matched = 0;
        for inbound in &inbounds {
            for stat in &inbound.client_stats {
                if self
                    .subs
                    .update_traffic_by_email(panel.id, &stat.email, stat.used())
                    .await?
                {
                    matched += 1;
                } else {
                    debug!("panel {} reports unknown client '{}'", panel.name, stat.email);
                }

                // Re-assert disablement for suspended clients the panel
                // still serves.
                if suspend_mode == SuspendMode::Disable && stat.enable {
                    if let Some(sub) = suspended.get(&stat.email) {
                        if let Err(e) = self.lifecycle.disable_remote(sub).await {
                            warn!("re-disable failed for subscription {}: {e:#}", sub.id);
                        }
                    }
                }
            }
        }

        Ok(matched)
    }

    /// Flag active subscriptions over quota or past expiry for
    /// suspension.
    async fn enforce_limits(&self) -> Result<u32> {
        let breached = self.subs.breached_active().await?;
        if breached.is_empty() {
            return Ok(0);
        }

        info!("{} subscriptions breached limits, suspending", breached.len());
        let mut count = 0;
        for sub in breached {
            let reason = if sub.is_over_quota() { "traffic" } else { "expiry" };
            if let Err(e) = self.lifecycle.suspend(&sub, reason).await {
                error!("failed to suspend subscription {}: {e:#}", sub.id);
            } else {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete remote clients for subscriptions whose expiry lies beyond
    /// the grace period and mark them expired.
    async fn expire_past_grace(&self) -> Result<u32> {
        let grace = self.settings.grace_period_days().await;
        let due = self.subs.past_grace(grace).await?;

        let mut count = 0;
        for sub in due {
            match self.lifecycle.expire(&sub).await {
                Ok(()) => count += 1,
                // Panel unreachable: the row stays suspended and the
                // deletion is retried next tick.
                Err(e) => warn!("deferred expiry for subscription {}: {e:#}", sub.id),
            }
        }
        Ok(count)
    }

    /// Reconcile provision intents stuck in `pending`: confirm the ones
    /// whose remote client actually exists, fail the rest.
    async fn reap_intents(&self) -> Result<(u32, u32)> {
        let horizon = self.settings.intent_horizon_secs().await;
        let stale = self.subs.stale_pending_intents(horizon).await?;

        let mut confirmed = 0;
        let mut failed = 0;
        for intent in stale {
            let Some(sub) = self.subs.get_by_id(intent.subscription_id).await? else {
                self.subs.set_intent_state(&intent.idempotency_key, INTENT_FAILED).await?;
                failed += 1;
                continue;
            };
            if sub.status != SUB_PENDING {
                // Provisioning finished through another path.
                self.subs.set_intent_state(&intent.idempotency_key, INTENT_CONFIRMED).await?;
                continue;
            }
            let Some(panel) = self.panels.get_by_id(intent.panel_id).await? else {
                self.subs.set_intent_state(&intent.idempotency_key, INTENT_FAILED).await?;
                failed += 1;
                continue;
            };

            let email = client_email(sub.user_id, sub.id);
            match self.xui.get_client_traffic(&panel, &email).await {
                Ok(Some(_)) => {
                    self.subs.set_intent_state(&intent.idempotency_key, INTENT_CONFIRMED).await?;
                    self.subs
                        .activate(sub.id, intent.panel_id, intent.inbound_remote_id, &intent.client_uuid, &email)
                        .await?;
                    info!("intent reaper confirmed subscription {}", sub.id);
                    confirmed += 1;
                }
                Ok(None) => {
                    self.subs.set_intent_state(&intent.idempotency_key, INTENT_FAILED).await?;
                    debug!("intent reaper rolled back subscription {}", sub.id);
                    failed += 1;
                }
                Err(e) => {
                    // Unverifiable; leave pending for the next run.
                    warn!("intent reaper could not reach panel {}: {e}", panel.name);
                }
            }
        }
        Ok((confirmed, failed))
    }
}
