use std::sync::Arc;

use sqlx::SqlitePool;

use crate::{config::Config, mail::Mailer, security::RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub mailer: Arc<dyn Mailer>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config, mailer: Arc<dyn Mailer>) -> Self {
        let limiter = RateLimiter::from_config(&config);
        Self {
            pool,
            config: Arc::new(config),
            mailer,
            limiter,
        }
    }
}
