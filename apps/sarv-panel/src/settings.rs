use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use sqlx::SqlitePool;
use anyhow::{Context, Result};
use tracing::info;

pub const DEFAULT_SYNC_INTERVAL_SECS: i64 = 900;
pub const DEFAULT_GRACE_PERIOD_DAYS: i64 = 3;
pub const DEFAULT_DEDUP_WINDOW_SECS: i64 = 3600;
pub const DEFAULT_INTENT_HORIZON_SECS: i64 = 600;

/// How a quota-breached subscription is handled on the remote panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendMode {
    /// Leave the remote client in place; only the local record changes.
    Keep,
    /// Flip the remote client's enable flag off.
    Disable,
}

#[derive(Debug, Clone)]
pub struct SettingsService {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl SettingsService {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let service = Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
        };
        service.reload_cache().await?;
        Ok(service)
    }

    pub async fn reload_cache(&self) -> Result<()> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch settings from DB")?;

        let mut cache = self.cache.write().await;
        cache.clear();
        for (key, value) in rows {
            cache.insert(key, value);
        }

        info!("Settings cache reloaded with {} items", cache.len());
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to update setting in DB")?;

        let mut cache = self.cache.write().await;
        cache.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    // ── Typed knobs for the sync/lifecycle machinery ─────────────

    /// Reconciliation cadence; bounds the staleness of local mirrors.
    pub async fn sync_interval_secs(&self) -> i64 {
        self.get_i64("sync_interval_secs", DEFAULT_SYNC_INTERVAL_SECS).await.max(30)
    }

    /// Days past expiry before the remote client is deleted.
    pub async fn grace_period_days(&self) -> i64 {
        self.get_i64("grace_period_days", DEFAULT_GRACE_PERIOD_DAYS).await
    }

    /// Window in which a repeated purchase reuses the pending row.
    pub async fn purchase_dedup_window_secs(&self) -> i64 {
        self.get_i64("purchase_dedup_window_secs", DEFAULT_DEDUP_WINDOW_SECS).await
    }

    /// Age after which a pending provision intent is reconciled.
    pub async fn intent_horizon_secs(&self) -> i64 {
        self.get_i64("intent_horizon_secs", DEFAULT_INTENT_HORIZON_SECS).await
    }

    pub async fn suspend_mode(&self) -> SuspendMode {
        match self.get("suspend_mode").await.as_deref() {
            Some("disable") => SuspendMode::Disable,
            _ => SuspendMode::Keep,
        }
    }
}
