use sqlx::SqlitePool;
use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::panel::{Inbound, Panel, PANEL_STATUS_ONLINE, PANEL_STATUS_UNREACHABLE};

#[derive(Debug, Clone)]
pub struct PanelRepository {
    pool: SqlitePool,
}

impl PanelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_all(&self) -> Result<Vec<Panel>> {
        sqlx::query_as::<_, Panel>("SELECT * FROM panels ORDER BY priority ASC, name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch panels")
    }

    pub async fn get_enabled(&self) -> Result<Vec<Panel>> {
        sqlx::query_as::<_, Panel>(
            "SELECT * FROM panels WHERE is_enabled = 1 ORDER BY priority ASC, name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch enabled panels")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Panel>> {
        sqlx::query_as::<_, Panel>("SELECT * FROM panels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch panel by ID")
    }

    pub async fn create(
        &self,
        name: &str,
        base_url: &str,
        username: &str,
        password: &str,
        priority: i64,
        max_clients: i64,
        country_code: Option<&str>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO panels (name, base_url, username, password, priority, max_clients, country_code)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(base_url.trim_end_matches('/'))
        .bind(username)
        .bind(password)
        .bind(priority)
        .bind(max_clients)
        .bind(country_code)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create panel")?;
        Ok(id)
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE panels SET is_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to toggle panel")?;
        Ok(())
    }

    pub async fn mark_online(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE panels SET status = ?, last_seen = ?, last_error = NULL WHERE id = ?")
            .bind(PANEL_STATUS_ONLINE)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark panel online")?;
        Ok(())
    }

    pub async fn mark_unreachable(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE panels SET status = ?, last_error = ? WHERE id = ?")
            .bind(PANEL_STATUS_UNREACHABLE)
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark panel unreachable")?;
        Ok(())
    }

    // ==================== INBOUND MIRRORS ====================

    pub async fn get_inbounds(&self, panel_id: i64) -> Result<Vec<Inbound>> {
        sqlx::query_as::<_, Inbound>("SELECT * FROM inbounds WHERE panel_id = ?")
            .bind(panel_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch inbound mirrors")
    }

    pub async fn upsert_inbound(
        &self,
        panel_id: i64,
        remote_id: i64,
        tag: &str,
        protocol: &str,
        listen_port: i64,
        enable: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inbounds (panel_id, remote_id, tag, protocol, listen_port, enable, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(panel_id, remote_id) DO UPDATE SET
                tag = excluded.tag,
                protocol = excluded.protocol,
                listen_port = excluded.listen_port,
                enable = excluded.enable,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(panel_id)
        .bind(remote_id)
        .bind(tag)
        .bind(protocol)
        .bind(listen_port)
        .bind(enable)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to upsert inbound mirror")?;
        Ok(())
    }

    /// Drop mirrors for listeners the panel no longer reports.
    pub async fn prune_inbounds(&self, panel_id: i64, keep_remote_ids: &[i64]) -> Result<u64> {
        if keep_remote_ids.is_empty() {
            let result = sqlx::query("DELETE FROM inbounds WHERE panel_id = ?")
                .bind(panel_id)
                .execute(&self.pool)
                .await?;
            return Ok(result.rows_affected());
        }
        let ids = keep_remote_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let query = format!(
            "DELETE FROM inbounds WHERE panel_id = ? AND remote_id NOT IN ({})",
            ids
        );
        let result = sqlx::query(&query).bind(panel_id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
