//! Process configuration, read once from the environment at startup.

use chrono::NaiveDate;
use chrono_tz::Tz;
use std::{path::PathBuf, str::FromStr};

use crate::ingest::{normalize::SheetWindow, retry::RetryPolicy};

/// Session secret used when `SESSION_SECRET` is not set. Refused in production.
pub const DEFAULT_SESSION_SECRET: &str = "gestione-firme-secret";

lazy_static::lazy_static! {
    static ref CONFIG: AppConfig = AppConfig::from_env();
}

/// Global configuration, built on first access.
pub fn config() -> &'static AppConfig {
    &CONFIG
}

/// Today's date in the business time zone.
pub fn today() -> NaiveDate {
    chrono::Utc::now()
        .with_timezone(&config().business_tz)
        .date_naive()
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub public_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub session_secret: String,
    pub body_limit: usize,
    pub request_timeout_secs: u64,
    pub avatar_max_size: usize,
    pub tables: TableNames,
    pub sheet_window: SheetWindow,
    pub ingest_batch_size: usize,
    pub retry: RetryPolicy,
    pub business_tz: Tz,
    pub bootstrap_username: String,
    pub bootstrap_password: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let business_tz = std::env::var("BUSINESS_TZ")
            .ok()
            .and_then(|name| match name.parse::<Tz>() {
                Ok(tz) => Some(tz),
                Err(_) => {
                    tracing::warn!("BUSINESS_TZ={} is not a known time zone, using Europe/Rome", name);
                    None
                }
            })
            .unwrap_or(chrono_tz::Europe::Rome);

        Self {
            environment: env_string("ENVIRONMENT", "development"),
            host: env_string("HOST", "127.0.0.1"),
            port: env_or("PORT", 3000),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|origin| origin.trim().to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            public_dir: PathBuf::from(env_string("PUBLIC_DIR", "public")),
            upload_dir: PathBuf::from(env_string("UPLOAD_DIR", "uploads")),
            session_secret: env_string("SESSION_SECRET", DEFAULT_SESSION_SECRET),
            body_limit: env_or("REQUEST_BODY_LIMIT", 50 * 1024 * 1024),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 120),
            avatar_max_size: env_or("AVATAR_MAX_SIZE", 2 * 1024 * 1024),
            tables: TableNames::from_env(),
            sheet_window: SheetWindow::from_env(),
            ingest_batch_size: env_or::<usize>("INGEST_BATCH_SIZE", 200).max(1),
            retry: RetryPolicy::from_env(),
            business_tz,
            bootstrap_username: env_string("BOOTSTRAP_USERNAME", "brixware"),
            bootstrap_password: env_string("BOOTSTRAP_PASSWORD", "1234567890"),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Names of the four signature tables, overridable from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub base: String,
    pub assets: String,
    pub documents: String,
    pub renewals: String,
}

impl TableNames {
    pub fn from_env() -> Self {
        let base = sanitize_table_name(
            &std::env::var("DB_TABLE").unwrap_or_default(),
            "digital_signatures",
        );
        Self::derive(
            base,
            std::env::var("DB_ASSET_TABLE").ok(),
            std::env::var("DB_DOCUMENT_TABLE").ok(),
            std::env::var("DB_RENEWAL_TABLE").ok(),
        )
    }

    fn derive(
        base: String,
        assets: Option<String>,
        documents: Option<String>,
        renewals: Option<String>,
    ) -> Self {
        let assets = sanitize_table_name(&assets.unwrap_or_default(), &format!("{}_assets", base));
        let documents =
            sanitize_table_name(&documents.unwrap_or_default(), &format!("{}_documents", base));
        let renewals =
            sanitize_table_name(&renewals.unwrap_or_default(), &format!("{}_renewals", base));
        Self {
            base,
            assets,
            documents,
            renewals,
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::derive("digital_signatures".to_string(), None, None, None)
    }
}

/// Keep only `[A-Za-z0-9_]`; fall back when nothing survives.
pub fn sanitize_table_name(name: &str, fallback: &str) -> String {
    let safe: String = name
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if safe.is_empty() {
        fallback.to_string()
    } else {
        safe
    }
}

pub(crate) fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
