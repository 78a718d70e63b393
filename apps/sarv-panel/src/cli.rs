use anyhow::Result;
use sqlx::SqlitePool;

use crate::repositories::panel_repo::PanelRepository;

pub async fn add_panel(
    pool: &SqlitePool,
    name: &str,
    base_url: &str,
    username: &str,
    password: &str,
    priority: i64,
    max_clients: i64,
    country_code: Option<&str>,
) -> Result<()> {
    url::Url::parse(base_url)?;
    let repo = PanelRepository::new(pool.clone());
    let id = repo
        .create(name, base_url, username, password, priority, max_clients, country_code)
        .await?;
    println!("Panel '{}' registered with id {}", name, id);
    println!("It will be health-checked and its inbounds discovered on the next sync run.");
    Ok(())
}

pub fn info() {
    println!("\n=== SARV PANEL INFO ===");
    println!("Bind addr:    {}", std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8475".to_string()));
    println!("Database:     {}", std::env::var("DATABASE_URL").unwrap_or_else(|_| "<unset>".to_string()));
    let token_set = std::env::var("INTERNAL_API_TOKEN").map(|t| !t.is_empty()).unwrap_or(false);
    println!("API token:    {}", if token_set { "configured" } else { "NOT CONFIGURED (API disabled)" });
    println!("=======================\n");
}
