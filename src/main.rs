use std::net::SocketAddr;

use harvest_api::{build_router, config::Config, db, mail::mailer_from_config, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harvest_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let pool = db::init_db(&config.database_url, 10).await?;
    tracing::info!("Database initialized");

    if let Some(username) = config.admin_username.as_deref() {
        if db::promote_admin(&pool, username).await? {
            tracing::info!(username, "promoted user to admin");
        } else {
            tracing::warn!(username, "ADMIN_USERNAME does not match any user");
        }
    }

    let mailer = mailer_from_config(&config)?;
    if config.resend_api_key.is_none() {
        tracing::warn!("RESEND_API_KEY not set, outgoing email will only be logged");
    }

    let addr = config.bind_addr.clone();
    let app = build_router(AppState::new(pool, config, mailer));

    tracing::info!("Server running on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
