use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use chrono::{DateTime, Utc};

pub const SUB_PENDING: &str = "pending";
pub const SUB_ACTIVE: &str = "active";
pub const SUB_SUSPENDED: &str = "suspended";
pub const SUB_EXPIRED: &str = "expired";
pub const SUB_CANCELLED: &str = "cancelled";

pub const INTENT_PENDING: &str = "pending";
pub const INTENT_CONFIRMED: &str = "confirmed";
pub const INTENT_FAILED: &str = "failed";

pub const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub tg_id: Option<i64>,
    pub username: Option<String>,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub protocol: String,
    /// Pin the plan to panels in one country; NULL = any location.
    pub country_code: Option<String>,
    pub traffic_limit_gb: i64,
    pub duration_days: i64,
    pub price: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Traffic quota in bytes; 0 means unlimited.
    pub fn traffic_limit_bytes(&self) -> i64 {
        self.traffic_limit_gb * GIB
    }
}

/// Local record of a purchased plan, mirroring one remote 3x-UI client.
/// Traffic/expiry fields are a cache of remote state; staleness is bounded
/// by the sync interval.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    pub panel_id: Option<i64>,
    pub inbound_remote_id: Option<i64>,
    pub client_uuid: Option<String>,
    pub client_email: Option<String>,
    pub status: String,
    pub traffic_limit: i64,
    pub used_traffic: i64,
    pub expires_at: DateTime<Utc>,
    pub traffic_updated_at: Option<DateTime<Utc>>,
    pub suspended_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_over_quota(&self) -> bool {
        self.traffic_limit > 0 && self.used_traffic >= self.traffic_limit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProvisionIntent {
    pub id: i64,
    pub idempotency_key: String,
    pub subscription_id: i64,
    pub panel_id: i64,
    pub inbound_remote_id: i64,
    pub client_uuid: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub subscription_id: Option<i64>,
    pub method: String,
    pub amount: i64,
    pub external_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}
