/**
 * Page Routes
 * Login page and the session-gated static front end
 */
use axum::{
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use std::path::Path;
use tower_http::services::{ServeDir, ServeFile};

use crate::{config::config, error::ApiError, session};

/// GET /login - skip straight to the dashboard when already signed in.
pub async fn login_page(jar: CookieJar) -> Response {
    match session::from_jar(&jar).await {
        Ok(Some(current)) if !current.data.must_change_password => {
            return Redirect::to("/").into_response();
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "Session lookup failed on login page"),
    }

    let path = config().public_dir.join("login.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Login page missing");
            ApiError::not_found("Risorsa non trovata").into_response()
        }
    }
}

/// `/` and every static file require a session without a pending password change.
pub fn page_router(public_dir: &Path) -> Router {
    let gated = Router::new()
        .route_service("/", ServeFile::new(public_dir.join("index.html")))
        .fallback_service(ServeDir::new(public_dir))
        .layer(middleware::from_fn(session::require_page_session));

    Router::new().route("/login", get(login_page)).merge(gated)
}
