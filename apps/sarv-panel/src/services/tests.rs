use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::models::store::{INTENT_CONFIRMED, INTENT_FAILED, SUB_ACTIVE, SUB_CANCELLED, SUB_EXPIRED, SUB_PENDING, SUB_SUSPENDED};
use crate::repositories::panel_repo::PanelRepository;
use crate::repositories::subscription_repo::SubscriptionRepository;
use crate::services::billing::BillingService;
use crate::services::lifecycle::LifecycleService;
use crate::services::registry::RegistryService;
use crate::services::sync::SyncService;
use crate::settings::SettingsService;
use crate::xui::XuiClient;

const UUID_A: &str = "11111111-2222-4333-8444-555566667777";

struct Harness {
    pool: SqlitePool,
    settings: Arc<SettingsService>,
    panel_repo: PanelRepository,
    sub_repo: SubscriptionRepository,
    lifecycle: Arc<LifecycleService>,
    sync: Arc<SyncService>,
    billing: Arc<BillingService>,
}

async fn harness() -> Harness {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let settings = Arc::new(SettingsService::new(pool.clone()).await.unwrap());
    let xui = Arc::new(XuiClient::new().unwrap());
    let panel_repo = PanelRepository::new(pool.clone());
    let sub_repo = SubscriptionRepository::new(pool.clone());
    let registry = Arc::new(RegistryService::new(panel_repo.clone(), sub_repo.clone(), xui.clone()));
    let lifecycle = Arc::new(LifecycleService::new(pool.clone(), settings.clone(), registry.clone(), xui.clone()));
    let billing = Arc::new(BillingService::new(pool.clone(), settings.clone(), lifecycle.clone()));
    let sync = Arc::new(SyncService::new(
        settings.clone(),
        registry.clone(),
        lifecycle.clone(),
        panel_repo.clone(),
        sub_repo.clone(),
        xui.clone(),
    ));

    Harness { pool, settings, panel_repo, sub_repo, lifecycle, sync, billing }
}

fn login_ok() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("set-cookie", "3x-ui=test-session; Path=/; HttpOnly")
        .set_body_json(json!({ "success": true, "msg": "", "obj": null }))
}

fn status_ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true, "msg": "",
        "obj": { "cpu": 5.0, "mem": { "current": 1, "total": 2 }, "uptime": 10,
                 "xray": { "state": "running", "version": "1.8.4" } }
    }))
}

fn action_ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "success": true, "msg": "", "obj": null }))
}

fn inbounds_ok(client_stats: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true, "msg": "",
        "obj": [{
            "id": 3, "remark": "reality-443", "protocol": "vless",
            "port": 443, "enable": true, "clientStats": client_stats
        }]
    }))
}

async fn mount_panel_basics(server: &MockServer, client_stats: serde_json::Value) {
    Mock::given(method("POST")).and(path("/login")).respond_with(login_ok()).mount(server).await;
    Mock::given(method("GET"))
        .and(path("/panel/api/server/status"))
        .respond_with(status_ok())
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/panel/api/inbounds"))
        .respond_with(inbounds_ok(client_stats))
        .mount(server)
        .await;
}

async fn seed_panel(h: &Harness, base_url: &str, priority: i64, max_clients: i64) -> i64 {
    h.panel_repo
        .create("test-panel", base_url, "admin", "secret", priority, max_clients, None)
        .await
        .unwrap()
}

async fn seed_panel_in(h: &Harness, base_url: &str, priority: i64, country: &str) -> i64 {
    h.panel_repo
        .create("test-panel", base_url, "admin", "secret", priority, 0, Some(country))
        .await
        .unwrap()
}

async fn seed_inbound(h: &Harness, panel_id: i64, remote_id: i64) {
    h.panel_repo
        .upsert_inbound(panel_id, remote_id, "reality-443", "vless", 443, true)
        .await
        .unwrap();
}

async fn seed_user(h: &Harness) -> i64 {
    h.billing.get_or_create_user(None, Some("tester")).await.unwrap().id
}

async fn seed_plan(h: &Harness, traffic_gb: i64, duration_days: i64, price: i64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO plans (name, protocol, traffic_limit_gb, duration_days, price)
         VALUES ('Test Plan', 'vless', ?, ?, ?) RETURNING id",
    )
    .bind(traffic_gb)
    .bind(duration_days)
    .bind(price)
    .fetch_one(&h.pool)
    .await
    .unwrap()
}

/// A subscription already provisioned on a panel, bypassing the remote
/// create call.
async fn seed_active_sub(
    h: &Harness,
    user_id: i64,
    plan_id: i64,
    panel_id: i64,
    traffic_limit: i64,
    expires_at: chrono::DateTime<Utc>,
) -> i64 {
    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, traffic_limit, expires_at)
        .await
        .unwrap();
    let email = format!("u{}s{}", user_id, sub.id);
    h.sub_repo.activate(sub.id, panel_id, 3, UUID_A, &email).await.unwrap();
    sub.id
}

// ── provisioning ─────────────────────────────────────────────────

#[tokio::test]
async fn provision_creates_remote_client_and_activates() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/panel/api/inbounds/addClient"))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    seed_inbound(&h, panel_id, 3).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 50, 30, 1000).await;
    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, 50 * crate::models::store::GIB, Utc::now() + Duration::days(30))
        .await
        .unwrap();

    let sub = h.lifecycle.provision(sub.id).await.unwrap();

    assert_eq!(sub.status, SUB_ACTIVE);
    assert_eq!(sub.panel_id, Some(panel_id));
    assert_eq!(sub.inbound_remote_id, Some(3));
    assert_eq!(sub.client_email.as_deref(), Some(format!("u{}s{}", user_id, sub.id).as_str()));
    assert!(sub.client_uuid.is_some());

    let intent_state: String =
        sqlx::query_scalar("SELECT state FROM provision_intents WHERE subscription_id = ?")
            .bind(sub.id)
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(intent_state, INTENT_CONFIRMED);
}

#[tokio::test]
async fn provisioning_twice_creates_one_remote_client() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/panel/api/inbounds/addClient"))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    seed_inbound(&h, panel_id, 3).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 50, 30, 1000).await;
    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, 0, Utc::now() + Duration::days(30))
        .await
        .unwrap();

    let first = h.lifecycle.provision(sub.id).await.unwrap();
    assert_eq!(first.status, SUB_ACTIVE);

    // Simulate a lost local write after the remote create: the row is
    // back to pending but the confirmed intent remains.
    sqlx::query("UPDATE subscriptions SET status = 'pending', panel_id = NULL WHERE id = ?")
        .bind(sub.id)
        .execute(&h.pool)
        .await
        .unwrap();

    let second = h.lifecycle.provision(sub.id).await.unwrap();
    assert_eq!(second.status, SUB_ACTIVE);
    assert_eq!(second.client_uuid, first.client_uuid);
    // expect(1) on addClient: the retry never reached the panel.
}

#[tokio::test]
async fn duplicate_payment_callback_converges_on_one_subscription() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/panel/api/inbounds/addClient"))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    seed_inbound(&h, panel_id, 3).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 50, 30, 1000).await;

    let first = h
        .billing
        .confirm_purchase(user_id, plan_id, "zarinpal", 1000, Some("zp-ref-1"))
        .await
        .unwrap();
    let second = h
        .billing
        .confirm_purchase(user_id, plan_id, "zarinpal", 1000, Some("zp-ref-1"))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    let sub_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(sub_count, 1);
}

#[tokio::test]
async fn unreachable_panel_fails_over_to_next_candidate() {
    let h = harness().await;

    // Preferred panel: nothing listens there.
    let dead_id = seed_panel(&h, "http://127.0.0.1:1", 1, 0).await;
    seed_inbound(&h, dead_id, 1).await;

    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/panel/api/inbounds/addClient"))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;
    let live_id = seed_panel(&h, &server.uri(), 2, 0).await;
    seed_inbound(&h, live_id, 3).await;

    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 0, 30, 1000).await;
    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, 0, Utc::now() + Duration::days(30))
        .await
        .unwrap();

    let sub = h.lifecycle.provision(sub.id).await.unwrap();

    assert_eq!(sub.status, SUB_ACTIVE);
    assert_eq!(sub.panel_id, Some(live_id));

    let dead = h.panel_repo.get_by_id(dead_id).await.unwrap().unwrap();
    assert!(dead.is_unreachable());
}

#[tokio::test]
async fn country_pinned_plan_skips_foreign_panels() {
    let h = harness().await;

    let nl = MockServer::start().await;
    mount_panel_basics(&nl, json!([])).await;
    let nl_id = seed_panel_in(&h, &nl.uri(), 1, "nl").await;
    seed_inbound(&h, nl_id, 3).await;

    let de = MockServer::start().await;
    mount_panel_basics(&de, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/panel/api/inbounds/addClient"))
        .respond_with(action_ok())
        .expect(1)
        .mount(&de)
        .await;
    let de_id = seed_panel_in(&h, &de.uri(), 2, "de").await;
    seed_inbound(&h, de_id, 3).await;

    let user_id = seed_user(&h).await;
    let plan_id: i64 = sqlx::query_scalar(
        "INSERT INTO plans (name, protocol, country_code, traffic_limit_gb, duration_days, price)
         VALUES ('DE Plan', 'vless', 'de', 0, 30, 1000) RETURNING id",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap();

    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, 0, Utc::now() + Duration::days(30))
        .await
        .unwrap();
    let sub = h.lifecycle.provision(sub.id).await.unwrap();

    // The higher-priority Dutch panel is skipped for a pinned plan.
    assert_eq!(sub.panel_id, Some(de_id));
}

#[tokio::test]
async fn provision_fails_when_no_panel_has_capacity() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 1).await;
    seed_inbound(&h, panel_id, 3).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 0, 30, 1000).await;

    // Existing occupant exhausts max_clients = 1.
    seed_active_sub(&h, user_id, plan_id, panel_id, 0, Utc::now() + Duration::days(30)).await;

    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, 0, Utc::now() + Duration::days(30))
        .await
        .unwrap();
    let result = h.lifecycle.provision(sub.id).await;
    assert!(result.is_err());

    let status: String = sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = ?")
        .bind(sub.id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(status, SUB_PENDING);
}

// ── sync ─────────────────────────────────────────────────────────

#[tokio::test]
async fn sync_mirrors_traffic_and_suspends_over_quota() {
    let h = harness().await;
    let server = MockServer::start().await;
    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 1, 30, 1000).await;

    let sub_id = seed_active_sub(&h, user_id, plan_id, panel_id, 1000, Utc::now() + Duration::days(30)).await;
    let email = format!("u{}s{}", user_id, sub_id);

    // Remote reports the client at 110% of its quota.
    mount_panel_basics(
        &server,
        json!([{
            "id": 9, "inboundId": 3, "enable": true, "email": email,
            "up": 600, "down": 500, "expiryTime": 0, "total": 1000
        }]),
    )
    .await;

    let report = h.sync.run().await.unwrap();
    assert_eq!(report.panels_ok, 1);
    assert_eq!(report.clients_matched, 1);
    assert_eq!(report.suspended, 1);

    let sub = h.sub_repo.get_by_id(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.used_traffic, 1100);
    assert_eq!(sub.status, SUB_SUSPENDED);
    assert_eq!(sub.suspended_reason.as_deref(), Some("traffic"));
    assert!(sub.traffic_updated_at.is_some());

    let panel = h.panel_repo.get_by_id(panel_id).await.unwrap().unwrap();
    assert_eq!(panel.status, "online");
    assert!(panel.last_seen.is_some());
}

#[tokio::test]
async fn sync_suspend_mode_disable_flips_remote_client_off() {
    let h = harness().await;
    h.settings.set("suspend_mode", "disable").await.unwrap();

    let server = MockServer::start().await;
    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 1, 30, 1000).await;
    let sub_id = seed_active_sub(&h, user_id, plan_id, panel_id, 1000, Utc::now() + Duration::days(30)).await;
    let email = format!("u{}s{}", user_id, sub_id);

    mount_panel_basics(
        &server,
        // Exactly 100% of the quota: the boundary counts as a breach.
        json!([{
            "id": 9, "inboundId": 3, "enable": true, "email": email,
            "up": 400, "down": 600, "expiryTime": 0, "total": 1000
        }]),
    )
    .await;
    Mock::given(method("POST"))
        .and(path(format!("/panel/api/inbounds/updateClient/{}", UUID_A)))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    h.sync.run().await.unwrap();

    let sub = h.sub_repo.get_by_id(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SUB_SUSPENDED);
    // expect(1) on updateClient: the remote client was disabled.
}

#[tokio::test]
async fn sync_expires_past_grace_and_deletes_remote_client() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path(format!("/panel/api/inbounds/delClient/3/{}", UUID_A)))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 0, 30, 1000).await;
    // Expired well past the default 3-day grace period.
    let sub_id = seed_active_sub(&h, user_id, plan_id, panel_id, 0, Utc::now() - Duration::days(10)).await;

    let report = h.sync.run().await.unwrap();
    assert_eq!(report.expired, 1);

    let sub = h.sub_repo.get_by_id(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SUB_EXPIRED);
}

#[tokio::test]
async fn sync_tolerates_one_unreachable_panel() {
    let h = harness().await;

    let dead_id = seed_panel(&h, "http://127.0.0.1:1", 1, 0).await;

    let server = MockServer::start().await;
    let live_id = seed_panel(&h, &server.uri(), 2, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 0, 30, 1000).await;
    let sub_id = seed_active_sub(&h, user_id, plan_id, live_id, 0, Utc::now() + Duration::days(30)).await;
    let email = format!("u{}s{}", user_id, sub_id);

    mount_panel_basics(
        &server,
        json!([{
            "id": 9, "inboundId": 3, "enable": true, "email": email,
            "up": 10, "down": 20, "expiryTime": 0, "total": 0
        }]),
    )
    .await;

    let report = h.sync.run().await.unwrap();
    assert_eq!(report.panels_failed, 1);
    assert_eq!(report.panels_ok, 1);
    assert_eq!(report.clients_matched, 1);

    let dead = h.panel_repo.get_by_id(dead_id).await.unwrap().unwrap();
    assert!(dead.is_unreachable());
    let sub = h.sub_repo.get_by_id(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.used_traffic, 30);
}

// ── intent reaper ────────────────────────────────────────────────

async fn seed_stale_intent(h: &Harness, sub_id: i64, panel_id: i64) {
    sqlx::query(
        "INSERT INTO provision_intents
            (idempotency_key, subscription_id, panel_id, inbound_remote_id, client_uuid, state, created_at, updated_at)
         VALUES (?, ?, ?, 3, ?, 'pending', datetime('now', '-1 hour'), datetime('now', '-1 hour'))",
    )
    .bind(format!("test-key-{}", sub_id))
    .bind(sub_id)
    .bind(panel_id)
    .bind(UUID_A)
    .execute(&h.pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn reaper_confirms_intent_whose_remote_client_exists() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 0, 30, 1000).await;
    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, 0, Utc::now() + Duration::days(30))
        .await
        .unwrap();
    seed_stale_intent(&h, sub.id, panel_id).await;

    let email = format!("u{}s{}", user_id, sub.id);
    Mock::given(method("GET"))
        .and(path(format!("/panel/api/inbounds/getClientTraffics/{}", email)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "msg": "",
            "obj": { "id": 9, "inboundId": 3, "enable": true, "email": email,
                     "up": 0, "down": 0, "expiryTime": 0, "total": 0 }
        })))
        .mount(&server)
        .await;

    let report = h.sync.run().await.unwrap();
    assert_eq!(report.intents_confirmed, 1);

    let sub = h.sub_repo.get_by_id(sub.id).await.unwrap().unwrap();
    assert_eq!(sub.status, SUB_ACTIVE);
    assert_eq!(sub.client_uuid.as_deref(), Some(UUID_A));
}

#[tokio::test]
async fn reaper_rolls_back_intent_with_no_remote_client() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 0, 30, 1000).await;
    let sub = h
        .sub_repo
        .create_pending(user_id, plan_id, 0, Utc::now() + Duration::days(30))
        .await
        .unwrap();
    seed_stale_intent(&h, sub.id, panel_id).await;

    let email = format!("u{}s{}", user_id, sub.id);
    Mock::given(method("GET"))
        .and(path(format!("/panel/api/inbounds/getClientTraffics/{}", email)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "msg": "", "obj": null
        })))
        .mount(&server)
        .await;

    let report = h.sync.run().await.unwrap();
    assert_eq!(report.intents_failed, 1);

    let sub = h.sub_repo.get_by_id(sub.id).await.unwrap().unwrap();
    assert_eq!(sub.status, SUB_PENDING);
    let state: String = sqlx::query_scalar("SELECT state FROM provision_intents WHERE subscription_id = ?")
        .bind(sub.id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(state, INTENT_FAILED);
}

// ── lifecycle operations ─────────────────────────────────────────

#[tokio::test]
async fn cancel_deletes_remote_client_and_marks_cancelled() {
    let h = harness().await;
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/login")).respond_with(login_ok()).mount(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/panel/api/inbounds/delClient/3/{}", UUID_A)))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 0, 30, 1000).await;
    let sub_id = seed_active_sub(&h, user_id, plan_id, panel_id, 0, Utc::now() + Duration::days(30)).await;

    let sub = h.lifecycle.cancel(sub_id).await.unwrap();
    assert_eq!(sub.status, SUB_CANCELLED);
}

#[tokio::test]
async fn renew_extends_expiry_and_restores_quota() {
    let h = harness().await;
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/login")).respond_with(login_ok()).mount(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/panel/api/inbounds/updateClient/{}", UUID_A)))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 50, 30, 1000).await;
    let sub_id = seed_active_sub(&h, user_id, plan_id, panel_id, 1000, Utc::now() + Duration::days(2)).await;
    let email = format!("u{}s{}", user_id, sub_id);

    Mock::given(method("POST"))
        .and(path(format!("/panel/api/inbounds/3/resetClientTraffic/{}", email)))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    // Over quota and suspended; renewal must bring it back.
    sqlx::query("UPDATE subscriptions SET status = 'suspended', suspended_reason = 'traffic', used_traffic = 1200 WHERE id = ?")
        .bind(sub_id)
        .execute(&h.pool)
        .await
        .unwrap();

    let sub = h.lifecycle.renew(sub_id).await.unwrap();

    assert_eq!(sub.status, SUB_ACTIVE);
    assert_eq!(sub.used_traffic, 0);
    assert_eq!(sub.traffic_limit, 50 * crate::models::store::GIB);
    // Extended from the old expiry, not from now: ~32 days out.
    assert!(sub.expires_at > Utc::now() + Duration::days(31));
}

#[tokio::test]
async fn wallet_purchase_is_atomic_about_balance() {
    let h = harness().await;
    let server = MockServer::start().await;
    mount_panel_basics(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/panel/api/inbounds/addClient"))
        .respond_with(action_ok())
        .expect(1)
        .mount(&server)
        .await;

    let panel_id = seed_panel(&h, &server.uri(), 100, 0).await;
    seed_inbound(&h, panel_id, 3).await;
    let user_id = seed_user(&h).await;
    let plan_id = seed_plan(&h, 10, 30, 500).await;

    // Broke: purchase must fail without touching the panel or the rows.
    let result = h.billing.purchase_with_balance(user_id, plan_id).await;
    assert!(result.is_err());
    let sub_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(sub_count, 0);

    // Funded: purchase provisions and debits exactly the price.
    h.billing.top_up(user_id, 750, "card", None).await.unwrap();
    let sub = h.billing.purchase_with_balance(user_id, plan_id).await.unwrap();
    assert_eq!(sub.status, SUB_ACTIVE);

    let balance: i64 = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(balance, 250);
}
