use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// 3x-UI session cookies outlive an hour; renew well before that.
const SESSION_TTL_SECS: i64 = 30 * 60;

#[derive(Debug, Default)]
pub struct Session {
    cookie: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// The cached cookie, if still inside its TTL.
    pub fn valid_cookie(&self) -> Option<String> {
        let cookie = self.cookie.as_ref()?;
        let expires_at = self.expires_at?;
        if Utc::now() < expires_at {
            Some(cookie.clone())
        } else {
            None
        }
    }

    pub fn store(&mut self, cookie: String) {
        self.cookie = Some(cookie);
        self.expires_at = Some(Utc::now() + Duration::seconds(SESSION_TTL_SECS));
    }

    /// Evict only if the failing cookie is still the cached one, so a
    /// request racing a fresh renewal cannot throw the new session away.
    pub fn invalidate_if_matches(&mut self, stale: &str) {
        if self.cookie.as_deref() == Some(stale) {
            self.cookie = None;
            self.expires_at = None;
        }
    }
}

/// Per-panel session slots. The inner mutex makes renewal single-flight:
/// the caller holds the slot across check-login-store, so concurrent
/// requests against an expired session produce exactly one login.
#[derive(Debug, Default)]
pub struct SessionCache {
    slots: Mutex<HashMap<i64, Arc<Mutex<Session>>>>,
}

impl SessionCache {
    pub async fn slot(&self, panel_id: i64) -> Arc<Mutex<Session>> {
        let mut slots = self.slots.lock().await;
        slots.entry(panel_id).or_default().clone()
    }

    pub async fn invalidate(&self, panel_id: i64, stale: &str) {
        let slot = self.slot(panel_id).await;
        let mut session = slot.lock().await;
        session.invalidate_if_matches(stale);
    }
}
