mod cli;
mod db;
mod handlers;
mod models;
mod repositories;
mod services;
mod settings;
mod xui;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use db::init_db;
use repositories::panel_repo::PanelRepository;
use repositories::subscription_repo::SubscriptionRepository;
use services::billing::BillingService;
use services::lifecycle::LifecycleService;
use services::registry::RegistryService;
use services::sync::SyncService;
use settings::SettingsService;
use xui::XuiClient;

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub settings: Arc<SettingsService>,
    pub xui: Arc<XuiClient>,
    pub panel_repo: PanelRepository,
    pub sub_repo: SubscriptionRepository,
    pub registry: Arc<RegistryService>,
    pub lifecycle: Arc<LifecycleService>,
    pub billing: Arc<BillingService>,
    pub sync: Arc<SyncService>,
    pub internal_token: String,
}

#[derive(Parser)]
#[command(name = "sarv-panel")]
#[command(about = "Sarv VPN reselling control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the internal API server and the background sync scheduler
    Serve,
    /// Run one reconciliation pass and exit
    Sync,
    /// Administrative tools
    Admin {
        #[command(subcommand)]
        subcommand: AdminCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Register a 3x-UI panel
    AddPanel {
        name: String,
        base_url: String,
        username: String,
        password: String,
        #[arg(long, default_value_t = 100)]
        priority: i64,
        #[arg(long, default_value_t = 0)]
        max_clients: i64,
        #[arg(long)]
        country_code: Option<String>,
    },
    /// Show configuration summary
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("Warning: failed to load .env file: {}", e);
    }

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "sarv-panel.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "sarv_panel=debug,axum=info,tower_http=info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    let pool = init_db().await?;

    match cli.command {
        Commands::Serve => {
            let state = build_state(pool).await?;
            run_server(state).await?;
        }
        Commands::Sync => {
            let state = build_state(pool).await?;
            let report = state.sync.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Admin { subcommand } => match subcommand {
            AdminCommands::AddPanel {
                name,
                base_url,
                username,
                password,
                priority,
                max_clients,
                country_code,
            } => {
                cli::add_panel(
                    &pool,
                    &name,
                    &base_url,
                    &username,
                    &password,
                    priority,
                    max_clients,
                    country_code.as_deref(),
                )
                .await?;
            }
            AdminCommands::Info => cli::info(),
        },
    }

    Ok(())
}

async fn build_state(pool: sqlx::SqlitePool) -> Result<AppState> {
    let settings = Arc::new(SettingsService::new(pool.clone()).await?);
    let xui = Arc::new(XuiClient::new()?);

    let panel_repo = PanelRepository::new(pool.clone());
    let sub_repo = SubscriptionRepository::new(pool.clone());

    let registry = Arc::new(RegistryService::new(
        panel_repo.clone(),
        sub_repo.clone(),
        xui.clone(),
    ));
    let lifecycle = Arc::new(LifecycleService::new(
        pool.clone(),
        settings.clone(),
        registry.clone(),
        xui.clone(),
    ));
    let billing = Arc::new(BillingService::new(
        pool.clone(),
        settings.clone(),
        lifecycle.clone(),
    ));
    let sync = Arc::new(SyncService::new(
        settings.clone(),
        registry.clone(),
        lifecycle.clone(),
        panel_repo.clone(),
        sub_repo.clone(),
        xui.clone(),
    ));

    let internal_token = std::env::var("INTERNAL_API_TOKEN").unwrap_or_default();
    if internal_token.is_empty() {
        tracing::warn!("INTERNAL_API_TOKEN is not set; the internal API will reject all requests");
    }

    Ok(AppState {
        pool,
        settings,
        xui,
        panel_repo,
        sub_repo,
        registry,
        lifecycle,
        billing,
        sync,
        internal_token,
    })
}

async fn run_server(state: AppState) -> Result<()> {
    use axum::routing::{get, post};
    use handlers::api::internal;

    // Background reconciliation.
    let sync = state.sync.clone();
    tokio::spawn(async move {
        sync.start().await;
    });

    // Routes added after the auth layer (health) stay unauthenticated.
    let api = axum::Router::new()
        .route("/panels", get(internal::list_panels).post(internal::create_panel))
        .route("/panels/{id}/toggle", post(internal::toggle_panel))
        .route("/panels/{id}/status", get(internal::panel_status))
        .route("/panels/{id}/discover", post(internal::discover_panel))
        .route("/subscriptions/{id}", get(internal::get_subscription))
        .route("/subscriptions/{id}/provision", post(internal::provision_subscription))
        .route("/subscriptions/{id}/renew", post(internal::renew_subscription))
        .route("/subscriptions/{id}/cancel", post(internal::cancel_subscription))
        .route("/subscriptions/{id}/reset-traffic", post(internal::reset_subscription_traffic))
        .route("/users", post(internal::create_user))
        .route("/users/{id}/subscriptions", get(internal::list_user_subscriptions))
        .route("/users/{id}/payments", get(internal::list_user_payments))
        .route("/payments/confirm", post(internal::confirm_purchase))
        .route("/payments/renewal", post(internal::confirm_renewal))
        .route("/payments/topup", post(internal::top_up))
        .route("/purchase/balance", post(internal::purchase_with_balance))
        .route("/settings", post(internal::update_setting))
        .route("/sync/run", post(internal::trigger_sync))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            internal::auth_middleware,
        ))
        .route("/health", get(internal::health));

    let app = axum::Router::new()
        .nest("/api/internal", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8475".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!("internal API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
