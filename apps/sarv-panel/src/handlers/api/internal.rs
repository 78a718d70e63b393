// Internal request/response surface for the external collaborators
// (bot, dashboard, payment callbacks). Bearer-token guarded; every
// lifecycle operation takes a subscription id and answers with the
// updated row.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::AppState;

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    match extract_bearer_token(&headers) {
        Some(token) if !state.internal_token.is_empty() && token == state.internal_token => {
            next.run(req).await
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "msg": "invalid or missing bearer token" })),
        )
            .into_response(),
    }
}

fn failure(status: StatusCode, err: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    error!("internal API error: {err:#}");
    (status, Json(json!({ "success": false, "msg": format!("{err:#}") })))
}

fn ok<T: serde::Serialize>(obj: T) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "success": true, "obj": obj })))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "success": true, "version": env!("CARGO_PKG_VERSION") }))
}

// ── Panels ───────────────────────────────────────────────────────

pub async fn list_panels(State(state): State<AppState>) -> impl IntoResponse {
    match state.panel_repo.get_all().await {
        Ok(panels) => ok(panels),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Deserialize)]
pub struct CreatePanelRequest {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub max_clients: i64,
    pub country_code: Option<String>,
}

fn default_priority() -> i64 {
    100
}

pub async fn create_panel(
    State(state): State<AppState>,
    Json(req): Json<CreatePanelRequest>,
) -> impl IntoResponse {
    if url::Url::parse(&req.base_url).is_err() {
        return failure(StatusCode::BAD_REQUEST, anyhow::anyhow!("invalid base_url"));
    }
    match state
        .panel_repo
        .create(
            &req.name,
            &req.base_url,
            &req.username,
            &req.password,
            req.priority,
            req.max_clients,
            req.country_code.as_deref(),
        )
        .await
    {
        Ok(id) => ok(json!({ "id": id })),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Deserialize)]
pub struct TogglePanelRequest {
    pub enabled: bool,
}

pub async fn toggle_panel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<TogglePanelRequest>,
) -> impl IntoResponse {
    match state.panel_repo.set_enabled(id, req.enabled).await {
        Ok(()) => ok(json!({ "id": id, "enabled": req.enabled })),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Refresh the inbound mirrors for one panel from its live API.
pub async fn discover_panel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let panel = match state.panel_repo.get_by_id(id).await {
        Ok(Some(panel)) => panel,
        Ok(None) => return failure(StatusCode::NOT_FOUND, anyhow::anyhow!("panel {} not found", id)),
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    match state.registry.discover_panel(&panel).await {
        Ok(inbounds) => ok(json!({ "discovered": inbounds.len() })),
        Err(e) => failure(StatusCode::BAD_GATEWAY, e),
    }
}

/// Live health metrics straight from the panel.
pub async fn panel_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let panel = match state.panel_repo.get_by_id(id).await {
        Ok(Some(panel)) => panel,
        Ok(None) => return failure(StatusCode::NOT_FOUND, anyhow::anyhow!("panel {} not found", id)),
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    match state.xui.get_server_status(&panel).await {
        Ok(status) => ok(json!({
            "cpu": status.cpu,
            "mem_current": status.mem.current,
            "mem_total": status.mem.total,
            "uptime": status.uptime,
            "tcp_count": status.tcp_count,
            "udp_count": status.udp_count,
            "xray_state": status.xray.state,
            "xray_version": status.xray.version,
        })),
        Err(e) => failure(StatusCode::BAD_GATEWAY, e.into()),
    }
}

// ── Subscriptions ────────────────────────────────────────────────

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.sub_repo.get_by_id(id).await {
        Ok(Some(sub)) => ok(sub),
        Ok(None) => failure(StatusCode::NOT_FOUND, anyhow::anyhow!("subscription {} not found", id)),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn provision_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.lifecycle.provision(id).await {
        Ok(sub) => ok(sub),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

pub async fn renew_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.lifecycle.renew(id).await {
        Ok(sub) => ok(sub),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.lifecycle.cancel(id).await {
        Ok(sub) => ok(sub),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

pub async fn reset_subscription_traffic(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.lifecycle.reset_traffic(id).await {
        Ok(sub) => ok(sub),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

// ── Users & payments ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub tg_id: Option<i64>,
    pub username: Option<String>,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> impl IntoResponse {
    match state.billing.get_or_create_user(req.tg_id, req.username.as_deref()).await {
        Ok(user) => ok(user),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn list_user_subscriptions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.sub_repo.get_for_user(id).await {
        Ok(subs) => ok(subs),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn list_user_payments(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let payments = sqlx::query_as::<_, crate::models::store::Payment>(
        "SELECT * FROM payments WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(id)
    .fetch_all(&state.pool)
    .await;
    match payments {
        Ok(payments) => ok(payments),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.into()),
    }
}

#[derive(Deserialize)]
pub struct ConfirmPurchaseRequest {
    pub user_id: i64,
    pub plan_id: i64,
    pub method: String,
    pub amount: i64,
    pub external_id: Option<String>,
}

pub async fn confirm_purchase(
    State(state): State<AppState>,
    Json(req): Json<ConfirmPurchaseRequest>,
) -> impl IntoResponse {
    match state
        .billing
        .confirm_purchase(req.user_id, req.plan_id, &req.method, req.amount, req.external_id.as_deref())
        .await
    {
        Ok(sub) => ok(sub),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

#[derive(Deserialize)]
pub struct ConfirmRenewalRequest {
    pub subscription_id: i64,
    pub method: String,
    pub amount: i64,
    pub external_id: Option<String>,
}

pub async fn confirm_renewal(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRenewalRequest>,
) -> impl IntoResponse {
    match state
        .billing
        .confirm_renewal(req.subscription_id, &req.method, req.amount, req.external_id.as_deref())
        .await
    {
        Ok(sub) => ok(sub),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

#[derive(Deserialize)]
pub struct TopUpRequest {
    pub user_id: i64,
    pub amount: i64,
    pub method: String,
    pub external_id: Option<String>,
}

pub async fn top_up(
    State(state): State<AppState>,
    Json(req): Json<TopUpRequest>,
) -> impl IntoResponse {
    match state
        .billing
        .top_up(req.user_id, req.amount, &req.method, req.external_id.as_deref())
        .await
    {
        Ok(balance) => ok(json!({ "balance": balance })),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

#[derive(Deserialize)]
pub struct BalancePurchaseRequest {
    pub user_id: i64,
    pub plan_id: i64,
}

pub async fn purchase_with_balance(
    State(state): State<AppState>,
    Json(req): Json<BalancePurchaseRequest>,
) -> impl IntoResponse {
    match state.billing.purchase_with_balance(req.user_id, req.plan_id).await {
        Ok(sub) => ok(sub),
        Err(e) => failure(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

// ── Settings & sync ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UpdateSettingRequest {
    pub key: String,
    pub value: String,
}

pub async fn update_setting(
    State(state): State<AppState>,
    Json(req): Json<UpdateSettingRequest>,
) -> impl IntoResponse {
    match state.settings.set(&req.key, &req.value).await {
        Ok(()) => ok(json!({ "key": req.key })),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn trigger_sync(State(state): State<AppState>) -> impl IntoResponse {
    match state.sync.run().await {
        Ok(report) => ok(report),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
