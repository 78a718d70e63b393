use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use chrono::{DateTime, Utc};

pub const PANEL_STATUS_UNKNOWN: &str = "unknown";
pub const PANEL_STATUS_ONLINE: &str = "online";
pub const PANEL_STATUS_UNREACHABLE: &str = "unreachable";

/// A remote 3x-UI server this platform provisions clients on.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Panel {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub country_code: Option<String>,
    pub priority: i64,
    pub max_clients: i64,
    pub is_enabled: bool,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Panel {
    pub fn is_unreachable(&self) -> bool {
        self.status == PANEL_STATUS_UNREACHABLE
    }
}

/// Local mirror of a protocol listener on a panel, refreshed during sync.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Inbound {
    pub id: i64,
    pub panel_id: i64,
    pub remote_id: i64,
    pub tag: String,
    pub protocol: String,
    pub listen_port: i64,
    pub enable: bool,
    pub updated_at: DateTime<Utc>,
}
