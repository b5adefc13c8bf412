//! Server-side sessions stored in Postgres, keyed by a cookie token.

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{types::Json, PgPool};
use std::{sync::Arc, time::Duration};

use crate::{
    config::config,
    db::{self, SESSIONS_TABLE},
    error::ApiError,
};

pub const SESSION_COOKIE: &str = "firme.sid";

/// Sessions live this long after their last write.
pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// What the session remembers about the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub user_id: i32,
    pub username: String,
    pub must_change_password: bool,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CurrentSession {
    pub id: String,
    pub data: SessionData,
}

fn generate_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 64)
}

/// Stored session id: SHA-256 of the cookie token peppered with the server secret.
pub fn hash_token(token: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn expiry() -> i64 {
    Utc::now().timestamp() + SESSION_TTL_SECS
}

/// Store a new session and return the cookie token.
pub async fn create(pool: &PgPool, data: &SessionData) -> Result<String, sqlx::Error> {
    let token = generate_token();
    let id = hash_token(&token, &config().session_secret);

    sqlx::query(&format!(
        "INSERT INTO {SESSIONS_TABLE} (session_id, expires, data) VALUES ($1, $2, $3)"
    ))
    .bind(&id)
    .bind(expiry())
    .bind(Json(data))
    .execute(pool)
    .await?;

    Ok(token)
}

pub async fn load(pool: &PgPool, token: &str) -> Result<Option<CurrentSession>, sqlx::Error> {
    let id = hash_token(token, &config().session_secret);
    let row: Option<(i64, Json<SessionData>)> = sqlx::query_as(&format!(
        "SELECT expires, data FROM {SESSIONS_TABLE} WHERE session_id = $1"
    ))
    .bind(&id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((expires, Json(data))) if expires > Utc::now().timestamp() => {
            Ok(Some(CurrentSession { id, data }))
        }
        Some(_) => {
            destroy(pool, &id).await?;
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Persist changed session data and extend its lifetime.
pub async fn save(pool: &PgPool, session: &CurrentSession) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "UPDATE {SESSIONS_TABLE} SET data = $2, expires = $3 WHERE session_id = $1"
    ))
    .bind(&session.id)
    .bind(Json(&session.data))
    .bind(expiry())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn destroy(pool: &PgPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("DELETE FROM {SESSIONS_TABLE} WHERE session_id = $1"))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn sweep_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!("DELETE FROM {SESSIONS_TABLE} WHERE expires <= $1"))
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Periodically delete expired sessions.
pub fn spawn_sweeper(pool: Arc<PgPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match sweep_expired(&pool).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Expired sessions removed"),
                Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
            }
        }
    })
}

pub fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(config().is_production())
        .max_age(time::Duration::seconds(SESSION_TTL_SECS))
        .build()
}

pub fn removal_cookie() -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, "")).path("/").build()
}

/// Session for the request cookie, if any.
pub async fn from_jar(jar: &CookieJar) -> Result<Option<CurrentSession>, ApiError> {
    let Some(token) = jar.get(SESSION_COOKIE).map(|c| c.value().to_string()) else {
        return Ok(None);
    };
    if token.is_empty() {
        return Ok(None);
    }
    let pool = db::pool()?;
    Ok(load(&pool, &token).await?)
}

/// Like [`from_jar`] but a missing session is a 401.
pub async fn require(jar: &CookieJar) -> Result<CurrentSession, ApiError> {
    from_jar(jar)
        .await?
        .ok_or_else(|| ApiError::Unauthenticated("Non autenticato.".to_string()))
}

/// Gate for `/api/*`: needs a session with no pending password change.
pub async fn require_api_session(
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let session = require(&jar).await?;
    if session.data.must_change_password {
        return Err(ApiError::PasswordChangeRequired);
    }
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

/// Gate for pages: redirect to the login page instead of answering 401.
pub async fn require_page_session(jar: CookieJar, request: Request, next: Next) -> Response {
    match from_jar(&jar).await {
        Ok(Some(session)) if session.data.must_change_password => {
            Redirect::to("/login?change=1").into_response()
        }
        Ok(Some(_)) => next.run(request).await,
        Ok(None) => Redirect::to("/login").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup failed on page request");
            Redirect::to("/login").into_response()
        }
    }
}
