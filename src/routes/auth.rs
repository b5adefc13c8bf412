/**
 * Authentication Routes
 * Cookie sessions with login, logout, forced password change and profile
 */
use axum::{extract::Multipart, Json};
use axum_extra::extract::cookie::CookieJar;
use bcrypt::{hash, verify, DEFAULT_COST};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{
    avatar,
    config::config,
    db::{
        self,
        models::{AppUser, USER_COLUMNS},
        USERS_TABLE,
    },
    error::ApiError,
    session::{self, SessionData},
};

// ============================================================================
// Configuration
// ============================================================================

const MIN_PASSWORD_LENGTH: usize = 10;

const MAX_FULL_NAME_LENGTH: usize = 150;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub message: String,
    pub must_change_password: bool,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must_change_password: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub username: String,
    pub full_name: String,
    pub avatar_url: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateProfileRequest {
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarUploadResponse {
    pub message: String,
    pub data_url: String,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// bcrypt is CPU-bound; keep it off the async executor.
pub async fn hash_password(password: String) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || hash(password, DEFAULT_COST))
        .await
        .map_err(|e| ApiError::Internal(format!("hash task failed: {}", e)))?
        .map_err(|e| ApiError::Internal(format!("hash failed: {}", e)))
}

pub async fn verify_password(password: String, password_hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify(password, &password_hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

async fn find_user_by_name(pool: &PgPool, username: &str) -> Result<Option<AppUser>, sqlx::Error> {
    sqlx::query_as::<_, AppUser>(&format!(
        "SELECT {USER_COLUMNS} FROM {USERS_TABLE} WHERE username = $1"
    ))
    .bind(username)
    .fetch_optional(pool)
    .await
}

async fn find_user_by_id(pool: &PgPool, id: i32) -> Result<Option<AppUser>, sqlx::Error> {
    sqlx::query_as::<_, AppUser>(&format!("SELECT {USER_COLUMNS} FROM {USERS_TABLE} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Stored avatar bytes first, then the legacy file path.
async fn avatar_data_url(user: &AppUser) -> Option<String> {
    if let (Some(bytes), Some(mime)) = (&user.avatar_data, &user.avatar_mime) {
        if !bytes.is_empty() {
            return Some(avatar::to_data_url(mime, bytes));
        }
    }
    match user.avatar_url.as_deref().map(str::trim) {
        Some(url) if url.starts_with("data:") => Some(url.to_string()),
        Some(path) if !path.is_empty() => avatar::load_legacy(&config().upload_dir, path).await,
        _ => None,
    }
}

fn clean_full_name(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(name) = raw.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if name.chars().count() > MAX_FULL_NAME_LENGTH {
        return Err(ApiError::validation(format!(
            "Il nome completo puo' contenere al massimo {} caratteri.",
            MAX_FULL_NAME_LENGTH
        )));
    }
    Ok(Some(name.to_string()))
}

/// Rules for a new password, in the order they are reported.
fn validate_password_change(current: &str, new: &str) -> Result<(), ApiError> {
    if new.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::validation(format!(
            "La nuova password deve contenere almeno {} caratteri.",
            MIN_PASSWORD_LENGTH
        )));
    }
    if current.is_empty() {
        return Err(ApiError::validation("Inserisci la password attuale."));
    }
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/auth/login
pub async fn login(
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let username = payload.username.trim();
    if username.is_empty() || payload.password.is_empty() {
        return Err(ApiError::validation("Credenziali mancanti."));
    }

    let pool = db::pool()?;
    let invalid = || ApiError::Unauthenticated("Credenziali non valide.".to_string());

    let Some(user) = find_user_by_name(&pool, username).await? else {
        tracing::warn!("Login attempt for unknown user: {}", username);
        return Err(invalid());
    };

    if !verify_password(payload.password, user.password_hash.clone()).await {
        tracing::warn!("Failed login attempt for: {}", username);
        return Err(invalid());
    }

    // Drop any session the browser already had before issuing a new one.
    if let Ok(Some(previous)) = session::from_jar(&jar).await {
        session::destroy(&pool, &previous.id).await?;
    }

    let avatar_url = avatar_data_url(&user).await;
    let data = SessionData {
        user_id: user.id,
        username: user.username.clone(),
        must_change_password: user.must_change_password,
        full_name: user.full_name.clone(),
        avatar_url: avatar_url.clone(),
    };
    let token = session::create(&pool, &data).await?;

    tracing::info!("Successful login for user: {}", user.username);

    Ok((
        jar.add(session::session_cookie(token)),
        Json(LoginResponse {
            message: "Autenticato.".to_string(),
            must_change_password: user.must_change_password,
            full_name: user.full_name,
            avatar_url,
        }),
    ))
}

/// POST /api/auth/logout
pub async fn logout(jar: CookieJar) -> (CookieJar, Json<MessageResponse>) {
    match session::from_jar(&jar).await {
        Ok(Some(current)) => {
            if let Ok(pool) = db::pool() {
                if let Err(e) = session::destroy(&pool, &current.id).await {
                    tracing::warn!(error = %e, "Failed to delete session on logout");
                }
            }
        }
        Ok(None) => {}
        Err(e) => tracing::debug!(error = %e, "Session lookup failed on logout"),
    }

    (
        jar.remove(session::removal_cookie()),
        MessageResponse::new("Disconnesso."),
    )
}

/// GET /api/auth/session
pub async fn session_info(jar: CookieJar) -> Result<Json<SessionResponse>, ApiError> {
    let Some(mut current) = session::from_jar(&jar).await? else {
        return Ok(Json(SessionResponse::default()));
    };

    if current.data.avatar_url.is_none() {
        let pool = db::pool()?;
        if let Some(user) = find_user_by_id(&pool, current.data.user_id).await? {
            if let Some(url) = avatar_data_url(&user).await {
                current.data.avatar_url = Some(url);
                session::save(&pool, &current).await?;
            }
        }
    }

    let data = current.data;
    Ok(Json(SessionResponse {
        authenticated: true,
        username: Some(data.username),
        must_change_password: Some(data.must_change_password),
        full_name: data.full_name,
        avatar_url: data.avatar_url,
    }))
}

/// POST /api/auth/change-password
pub async fn change_password(
    jar: CookieJar,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let mut current = session::require(&jar).await?;
    validate_password_change(&payload.current_password, &payload.new_password)?;

    let pool = db::pool()?;
    let user = find_user_by_id(&pool, current.data.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Utente non trovato."))?;

    if !verify_password(payload.current_password.clone(), user.password_hash.clone()).await {
        return Err(ApiError::Unauthenticated(
            "Password attuale non corretta.".to_string(),
        ));
    }
    if payload.current_password == payload.new_password {
        return Err(ApiError::validation(
            "La nuova password deve essere diversa da quella attuale.",
        ));
    }

    let new_hash = hash_password(payload.new_password).await?;
    sqlx::query(&format!(
        "UPDATE {USERS_TABLE} SET password_hash = $1, must_change_password = false, \
         updated_at = now() WHERE id = $2"
    ))
    .bind(&new_hash)
    .bind(user.id)
    .execute(pool.as_ref())
    .await?;

    current.data.must_change_password = false;
    session::save(&pool, &current).await?;

    tracing::info!("Password changed for user: {}", user.username);
    Ok(MessageResponse::new("Password aggiornata correttamente."))
}

/// GET /api/auth/profile
pub async fn get_profile(jar: CookieJar) -> Result<Json<ProfileResponse>, ApiError> {
    let mut current = session::require(&jar).await?;
    let pool = db::pool()?;
    let user = find_user_by_id(&pool, current.data.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Utente non trovato."))?;

    let avatar_url = avatar_data_url(&user).await;
    if avatar_url.is_some() && current.data.avatar_url.is_none() {
        current.data.avatar_url = avatar_url.clone();
        session::save(&pool, &current).await?;
    }

    Ok(Json(ProfileResponse {
        username: user.username,
        full_name: user.full_name.unwrap_or_default(),
        avatar_url: avatar_url.unwrap_or_default(),
    }))
}

/// PUT /api/auth/profile
///
/// An empty or missing `avatarUrl` removes the picture.
pub async fn update_profile(
    jar: CookieJar,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let mut current = session::require(&jar).await?;
    let full_name = clean_full_name(payload.full_name.as_deref())?;

    let decoded = match payload.avatar_url.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(avatar::parse_data_url(raw, config().avatar_max_size)?),
        _ => None,
    };

    let pool = db::pool()?;
    sqlx::query(&format!(
        "UPDATE {USERS_TABLE} SET full_name = $1, avatar_url = NULL, avatar_data = $2, \
         avatar_mime = $3, updated_at = now() WHERE id = $4"
    ))
    .bind(&full_name)
    .bind(decoded.as_ref().map(|a| a.bytes.clone()))
    .bind(decoded.as_ref().map(|a| a.mime.clone()))
    .bind(current.data.user_id)
    .execute(pool.as_ref())
    .await?;

    current.data.full_name = full_name;
    current.data.avatar_url = decoded
        .as_ref()
        .map(|a| avatar::to_data_url(&a.mime, &a.bytes));
    session::save(&pool, &current).await?;

    Ok(MessageResponse::new("Profilo aggiornato."))
}

/// POST /api/auth/profile/avatar
///
/// Converts an uploaded picture into a data URL; nothing is stored until the
/// profile is saved.
pub async fn upload_avatar(
    jar: CookieJar,
    mut multipart: Multipart,
) -> Result<Json<AvatarUploadResponse>, ApiError> {
    session::require(&jar).await?;
    let max_size = config().avatar_max_size;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::error!("Multipart error: {}", e);
        ApiError::validation("Errore durante il caricamento dell'immagine.")
    })? {
        if field.name() != Some("avatar") {
            continue;
        }
        let declared = field.content_type().map(str::to_ascii_lowercase);
        let bytes = field
            .bytes()
            .await
            .map_err(|_| ApiError::validation("Errore durante il caricamento dell'immagine."))?;
        upload = Some((declared, bytes));
        break;
    }

    let Some((declared, bytes)) = upload else {
        return Err(ApiError::validation("Nessun file caricato."));
    };
    if bytes.is_empty() {
        return Err(ApiError::validation("Nessun file caricato."));
    }
    if bytes.len() > max_size {
        return Err(avatar::too_large(max_size));
    }

    let detected = avatar::detect_image_mime(&bytes)
        .ok_or_else(|| ApiError::validation("Immagine non valida."))?;
    // Keep the declared type when it is an accepted alias of the detected one.
    let mime = match declared.as_deref() {
        Some("image/pjpeg") if detected == "image/jpeg" => "image/pjpeg",
        _ => detected,
    };

    Ok(Json(AvatarUploadResponse {
        message: "Immagine caricata.".to_string(),
        data_url: avatar::to_data_url(mime, &bytes),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    fn auth_router() -> Router {
        Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/logout", post(logout))
            .route("/api/auth/session", get(session_info))
            .route("/api/auth/change-password", post(change_password))
            .route("/api/auth/profile", get(get_profile).put(update_profile))
            .route("/api/auth/profile/avatar", post(upload_avatar))
    }

    async fn post_json(uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = auth_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_login_missing_credentials() {
        let (status, json) = post_json("/api/auth/login", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "Credenziali mancanti.");

        let (status, _) = post_json(
            "/api/auth/login",
            serde_json::json!({"username": "   ", "password": "x"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_without_database_is_unavailable() {
        let (status, _) = post_json(
            "/api/auth/login",
            serde_json::json!({"username": "brixware", "password": "1234567890"}),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_session_without_cookie_is_anonymous() {
        let response = auth_router()
            .oneshot(
                Request::builder()
                    .uri("/api/auth/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({"authenticated": false}));
    }

    #[tokio::test]
    async fn test_logout_clears_cookie() {
        let response = auth_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header(header::COOKIE, format!("{}=stale", session::SESSION_COOKIE))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("{}=", session::SESSION_COOKIE)));
    }

    #[tokio::test]
    async fn test_change_password_requires_session() {
        let (status, json) = post_json(
            "/api/auth/change-password",
            serde_json::json!({"currentPassword": "1234567890", "newPassword": "abcdefghijk"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["message"], "Non autenticato.");
    }

    #[test]
    fn test_validate_password_change_rules() {
        let err = validate_password_change("old", "short").unwrap_err();
        assert_eq!(
            err.to_string(),
            "La nuova password deve contenere almeno 10 caratteri."
        );
        let err = validate_password_change("", "abcdefghijk").unwrap_err();
        assert_eq!(err.to_string(), "Inserisci la password attuale.");
        assert!(validate_password_change("old", "abcdefghijk").is_ok());
        // Length counts characters, not bytes.
        assert!(validate_password_change("old", "èèèèèèèèè").is_err());
    }

    #[test]
    fn test_clean_full_name() {
        assert_eq!(clean_full_name(Some("  Mario Rossi ")).unwrap(), Some("Mario Rossi".into()));
        assert_eq!(clean_full_name(Some("   ")).unwrap(), None);
        assert_eq!(clean_full_name(None).unwrap(), None);
        assert!(clean_full_name(Some(&"a".repeat(151))).is_err());
    }

    #[tokio::test]
    async fn test_password_hash_round_trip() {
        let hashed = hash_password("correct horse".to_string()).await.unwrap();
        assert!(verify_password("correct horse".to_string(), hashed.clone()).await);
        assert!(!verify_password("wrong".to_string(), hashed).await);
    }
}
