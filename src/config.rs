use std::{env, fmt::Display, str::FromStr, time::Duration};

use anyhow::bail;
use tracing::{info, warn};

use crate::search::SearchWeights;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub secret_key: String,
    pub access_token_ttl: chrono::Duration,
    pub refresh_token_ttl: chrono::Duration,
    pub bcrypt_cost: u32,
    pub frontend_url: String,
    pub admin_email: String,
    pub default_from_email: String,
    pub resend_api_key: Option<String>,
    pub mail_timeout: Duration,
    pub cors_allowed_origins: Vec<String>,
    pub rate_limit_requests: u64,
    pub rate_limit_window: Duration,
    pub blacklist_ttl: Duration,
    /// Take the client IP from `X-Forwarded-For`/`X-Real-IP` instead of the
    /// socket peer. Only safe behind a proxy that overwrites those headers.
    pub trust_proxy_headers: bool,
    pub forum_posts_per_hour: u64,
    pub search_weights: SearchWeights,
    pub admin_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://harvest.db?mode=rwc".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
            secret_key: String::new(),
            access_token_ttl: chrono::Duration::minutes(30),
            refresh_token_ttl: chrono::Duration::days(1),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            frontend_url: "http://localhost:3000".to_string(),
            admin_email: "contact@harvestforgood.org".to_string(),
            default_from_email: "noreply@harvestforgood.org".to_string(),
            resend_api_key: None,
            mail_timeout: Duration::from_secs(10),
            cors_allowed_origins: Vec::new(),
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            blacklist_ttl: Duration::from_secs(86_400),
            trust_proxy_headers: false,
            forum_posts_per_hour: 20,
            search_weights: SearchWeights::default(),
            admin_username: None,
        }
    }
}

impl Config {
    /// Reads the process environment (after `.env` has been loaded).
    ///
    /// Only `SECRET_KEY` is mandatory; every other setting falls back to a
    /// development default, with malformed values logged and ignored.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let secret_key = env::var("SECRET_KEY").unwrap_or_default();
        if secret_key.trim().is_empty() {
            bail!("SECRET_KEY must be set");
        }

        let weights = SearchWeights {
            title: load_or("SEARCH_WEIGHT_A", defaults.search_weights.title),
            abstract_text: load_or("SEARCH_WEIGHT_B", defaults.search_weights.abstract_text),
            people_and_keywords: load_or(
                "SEARCH_WEIGHT_C",
                defaults.search_weights.people_and_keywords,
            ),
            journal: load_or("SEARCH_WEIGHT_D", defaults.search_weights.journal),
        };

        Ok(Self {
            database_url: string_or("DATABASE_URL", &defaults.database_url),
            bind_addr: string_or("BIND_ADDR", &defaults.bind_addr),
            secret_key,
            access_token_ttl: chrono::Duration::minutes(load_or("ACCESS_TOKEN_MINUTES", 30)),
            refresh_token_ttl: chrono::Duration::days(load_or("REFRESH_TOKEN_DAYS", 1)),
            bcrypt_cost: load_or("BCRYPT_COST", defaults.bcrypt_cost),
            frontend_url: string_or("FRONTEND_URL", &defaults.frontend_url),
            admin_email: string_or("ADMIN_EMAIL", &defaults.admin_email),
            default_from_email: string_or("DEFAULT_FROM_EMAIL", &defaults.default_from_email),
            resend_api_key: env::var("RESEND_API_KEY").ok().filter(|key| !key.is_empty()),
            mail_timeout: Duration::from_secs(load_or("MAIL_TIMEOUT_SECS", 10)),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            rate_limit_requests: load_or("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests),
            rate_limit_window: Duration::from_secs(load_or("RATE_LIMIT_WINDOW_SECS", 60)),
            blacklist_ttl: Duration::from_secs(load_or("BLACKLIST_SECS", 86_400)),
            trust_proxy_headers: load_or("TRUST_PROXY_HEADERS", defaults.trust_proxy_headers),
            forum_posts_per_hour: load_or("FORUM_POSTS_PER_HOUR", defaults.forum_posts_per_hour),
            search_weights: weights,
            admin_username: env::var("ADMIN_USERNAME").ok().filter(|name| !name.is_empty()),
        })
    }
}

fn string_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    })
}

fn load_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}
