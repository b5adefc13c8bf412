pub mod models;

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::{config::TableNames, error::ApiError};

static DB_POOL: OnceCell<Arc<PgPool>> = OnceCell::const_new();

pub const USERS_TABLE: &str = "app_users";
pub const SESSIONS_TABLE: &str = "sessions";

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/firme".to_string()),
            max_connections: std::env::var("DB_POOL_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            min_connections: std::env::var("DB_POOL_MIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            connect_timeout_secs: std::env::var("DB_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            idle_timeout_secs: std::env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
        }
    }
}

pub async fn init_pool(config: Option<DbConfig>) -> Result<Arc<PgPool>, sqlx::Error> {
    let config = config.unwrap_or_default();

    tracing::info!("Initializing database connection pool...");
    tracing::debug!(
        "Database URL: {}",
        config.url.replace(
            |c: char| !c.is_ascii_alphanumeric() && c != ':' && c != '/' && c != '@' && c != '.',
            "*"
        )
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(std::time::Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .test_before_acquire(true)
        .connect(&config.url)
        .await?;

    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    tracing::info!("Database connection pool initialized successfully");

    let pool = Arc::new(pool);
    let _ = DB_POOL.set(pool.clone());

    Ok(pool)
}

pub fn get_pool() -> Option<Arc<PgPool>> {
    DB_POOL.get().cloned()
}

/// The pool, or 503 when the database was never reached.
pub fn pool() -> Result<Arc<PgPool>, ApiError> {
    get_pool().ok_or(ApiError::ServiceUnavailable)
}

pub async fn health_check() -> Result<std::time::Duration, sqlx::Error> {
    let pool = get_pool()
        .ok_or_else(|| sqlx::Error::Configuration("Database pool not initialized".into()))?;

    let start = std::time::Instant::now();
    sqlx::query("SELECT 1").fetch_one(pool.as_ref()).await?;

    Ok(start.elapsed())
}

/// A private pool on `DATABASE_URL` for database-backed tests; `None` when unset.
///
/// Never touches the shared pool, so the 503 paths stay testable.
#[cfg(test)]
pub(crate) async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("DATABASE_URL is set but unreachable");
    Some(pool)
}

/// Schema statements, one per query, in dependency order.
pub fn schema_statements(tables: &TableNames) -> Vec<String> {
    let TableNames {
        base,
        assets,
        documents,
        renewals,
    } = tables;

    vec![
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {base} (
            id BIGINT PRIMARY KEY,
            titolare TEXT NOT NULL DEFAULT '',
            email TEXT,
            recapito_telefonico TEXT,
            data_emissione DATE,
            emesso_da TEXT,
            costo_ie DOUBLE PRECISION,
            importo_ie DOUBLE PRECISION,
            fattura_numero TEXT,
            fattura_tipo_invio TEXT,
            fattura_tipo_pagamento TEXT,
            fattura_data_pagamento DATE,
            paid BOOLEAN NOT NULL DEFAULT false,
            note TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{base}_data_emissione ON {base}(data_emissione)"),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {assets} (
            signature_id BIGINT NOT NULL REFERENCES {base}(id) ON DELETE CASCADE ON UPDATE CASCADE,
            category TEXT NOT NULL,
            subtype TEXT NOT NULL,
            has_item BOOLEAN NOT NULL DEFAULT false,
            PRIMARY KEY (signature_id, category, subtype)
        )
    "#
        ),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {documents} (
            signature_id BIGINT NOT NULL REFERENCES {base}(id) ON DELETE CASCADE ON UPDATE CASCADE,
            category TEXT NOT NULL,
            subtype TEXT NOT NULL,
            has_item BOOLEAN NOT NULL DEFAULT false,
            PRIMARY KEY (signature_id, category, subtype)
        )
    "#
        ),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {renewals} (
            id BIGSERIAL PRIMARY KEY,
            signature_id BIGINT NOT NULL REFERENCES {base}(id) ON DELETE CASCADE ON UPDATE CASCADE,
            sheet_name TEXT NOT NULL,
            email TEXT,
            recapito_telefonico TEXT,
            certificato_cns_l BOOLEAN NOT NULL DEFAULT false,
            certificato_cns BOOLEAN NOT NULL DEFAULT false,
            certificato_cfd BOOLEAN NOT NULL DEFAULT false,
            certificato_cfd_r BOOLEAN NOT NULL DEFAULT false,
            data_emissione DATE,
            data_scadenza DATE,
            rinnovo_data DATE,
            rinnovo_da TEXT,
            nuova_emissione_id BIGINT REFERENCES {base}(id) ON DELETE SET NULL ON UPDATE CASCADE,
            costo_ie DOUBLE PRECISION,
            importo_ie DOUBLE PRECISION,
            fattura_numero TEXT,
            fattura_tipo_invio TEXT,
            fattura_tipo_pagamento TEXT,
            fattura_data_pagamento DATE,
            note TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{renewals}_signature_id ON {renewals}(signature_id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{renewals}_data_scadenza ON {renewals}(data_scadenza)"
        ),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {USERS_TABLE} (
            id SERIAL PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            must_change_password BOOLEAN NOT NULL DEFAULT true,
            full_name TEXT,
            avatar_url TEXT,
            avatar_data BYTEA,
            avatar_mime TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#
        ),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS {SESSIONS_TABLE} (
            session_id TEXT PRIMARY KEY,
            expires BIGINT NOT NULL,
            data JSONB NOT NULL
        )
    "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{SESSIONS_TABLE}_expires ON {SESSIONS_TABLE}(expires)"
        ),
    ]
}

pub async fn run_migrations(pool: &PgPool, tables: &TableNames) -> Result<(), sqlx::Error> {
    tracing::info!("Running database migrations...");

    for statement in schema_statements(tables) {
        sqlx::query(&statement).execute(pool).await?;
    }

    tracing::info!("Database migrations completed successfully");

    Ok(())
}

/// Create the bootstrap account with a temporary password when it does not exist yet.
pub async fn ensure_default_user(
    pool: &PgPool,
    username: &str,
    temporary_password: &str,
) -> Result<(), sqlx::Error> {
    let exists: Option<i32> =
        sqlx::query_scalar(&format!("SELECT id FROM {USERS_TABLE} WHERE username = $1"))
            .bind(username)
            .fetch_optional(pool)
            .await?;
    if exists.is_some() {
        return Ok(());
    }

    let password = temporary_password.to_string();
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| sqlx::Error::Protocol(format!("hash task failed: {}", e)))?
        .map_err(|e| sqlx::Error::Protocol(format!("hash failed: {}", e)))?;

    sqlx::query(&format!(
        "INSERT INTO {USERS_TABLE} (username, password_hash, must_change_password) \
         VALUES ($1, $2, true) ON CONFLICT (username) DO NOTHING"
    ))
    .bind(username)
    .bind(hash)
    .execute(pool)
    .await?;

    tracing::warn!(
        username,
        "Default user created with a temporary password; it must be changed at first login"
    );

    Ok(())
}
