use std::sync::Arc;
use anyhow::Result;
use tracing::debug;

use crate::models::panel::Panel;
use crate::repositories::panel_repo::PanelRepository;
use crate::repositories::subscription_repo::SubscriptionRepository;
use crate::xui::types::RemoteInbound;
use crate::xui::XuiClient;

/// A panel able to host a new client, paired with the inbound to put it on.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub panel: Panel,
    pub inbound_remote_id: i64,
}

/// Panel selection. A simple ordered scan: healthy panels before
/// unreachable ones, then priority ascending, each gated by a capacity
/// check and the presence of a matching enabled inbound. Failover is the
/// caller walking the returned list.
#[derive(Clone)]
pub struct RegistryService {
    panels: PanelRepository,
    subs: SubscriptionRepository,
    xui: Arc<XuiClient>,
}

impl RegistryService {
    pub fn new(
        panels: PanelRepository,
        subs: SubscriptionRepository,
        xui: Arc<XuiClient>,
    ) -> Self {
        Self { panels, subs, xui }
    }

    pub async fn candidates(
        &self,
        protocol: &str,
        country_code: Option<&str>,
    ) -> Result<Vec<Candidate>> {
        let mut panels = self.panels.get_enabled().await?;
        // Unreachable panels go last; they are still tried so a flapping
        // panel cannot strand provisioning entirely.
        panels.sort_by_key(|p| (p.is_unreachable(), p.priority));

        let mut out = Vec::new();
        for panel in panels {
            if let Some(cc) = country_code {
                if panel.country_code.as_deref() != Some(cc) {
                    continue;
                }
            }

            if panel.max_clients > 0 {
                let occupied = self.subs.count_occupying_panel(panel.id).await?;
                if occupied >= panel.max_clients {
                    debug!("panel {} at capacity ({}/{})", panel.name, occupied, panel.max_clients);
                    continue;
                }
            }

            let inbound = self
                .panels
                .get_inbounds(panel.id)
                .await?
                .into_iter()
                .find(|i| i.enable && i.protocol == protocol);

            if let Some(inbound) = inbound {
                out.push(Candidate { panel, inbound_remote_id: inbound.remote_id });
            }
        }

        Ok(out)
    }

    /// Pull the live inbound list from a panel and refresh the local
    /// mirrors. Returns the remote view (including per-client traffic
    /// counters) so the sync pass can reuse the same fetch.
    pub async fn discover_panel(&self, panel: &Panel) -> Result<Vec<RemoteInbound>> {
        let inbounds = self.xui.list_inbounds(panel).await?;

        for inbound in &inbounds {
            self.panels
                .upsert_inbound(
                    panel.id,
                    inbound.id,
                    &inbound.tag(),
                    &inbound.protocol,
                    inbound.port,
                    inbound.enable,
                )
                .await?;
        }
        let remote_ids: Vec<i64> = inbounds.iter().map(|i| i.id).collect();
        self.panels.prune_inbounds(panel.id, &remote_ids).await?;

        Ok(inbounds)
    }

    /// Refresh mirrors for every enabled panel, ignoring per-panel
    /// failures. Used as a discovery fallback when selection comes up
    /// empty on a fresh install.
    pub async fn discover_all(&self) -> Result<()> {
        for panel in self.panels.get_enabled().await? {
            if let Err(e) = self.discover_panel(&panel).await {
                debug!("inbound discovery failed for panel {}: {e:#}", panel.name);
            }
        }
        Ok(())
    }
}
