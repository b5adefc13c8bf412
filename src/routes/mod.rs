/**
 * Routes Module
 * API route handlers
 */

pub mod auth;
pub mod health;
pub mod pages;
pub mod signatures;
pub mod stats;
pub mod upload;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};

use crate::{error::ApiError, session};

async fn not_found() -> ApiError {
    ApiError::not_found("Risorsa non trovata")
}

/// Authentication endpoints, reachable without a session.
pub fn auth_router() -> Router {
    Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/session", get(auth::session_info))
        .route("/change-password", post(auth::change_password))
        .route("/profile", get(auth::get_profile).put(auth::update_profile))
        .route("/profile/avatar", post(auth::upload_avatar))
}

/// Everything under `/api`; all but `/api/auth` needs a full session.
pub fn api_router() -> Router {
    let protected = Router::new()
        .route(
            "/signatures",
            get(signatures::list_signatures).post(signatures::create_signature),
        )
        .route("/signatures/expiring", get(signatures::list_expiring))
        .route("/signatures/next-id", get(signatures::next_id))
        .route("/signatures/search", get(signatures::search_signatures))
        .route("/signatures/stats/yearly", get(stats::yearly_stats))
        .route(
            "/signatures/stats/renewals/yearly",
            get(stats::renewals_yearly_stats),
        )
        .route(
            "/signatures/{id}",
            get(signatures::get_signature).put(signatures::update_signature),
        )
        .route("/signatures/{id}/renewals", get(signatures::get_renewals))
        .route("/signatures/{id}/paid", patch(signatures::set_paid))
        .route("/reports/summary", get(stats::summary))
        .route("/upload", post(upload::upload_spreadsheet))
        .route_layer(middleware::from_fn(session::require_api_session));

    Router::new()
        .nest("/auth", auth_router())
        .merge(protected)
        .fallback(not_found)
}

pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(health::health_ping))
        .route("/health/database", get(health::health_database))
        .route("/health/ready", get(health::health_ready))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn status_of(method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = Router::new()
            .nest("/api", api_router())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_protected_routes_require_session() {
        for (method, uri) in [
            ("GET", "/api/signatures"),
            ("GET", "/api/signatures/7"),
            ("GET", "/api/signatures/expiring?days=30"),
            ("GET", "/api/signatures/stats/renewals/yearly"),
            ("PATCH", "/api/signatures/7/paid"),
            ("GET", "/api/reports/summary"),
            ("POST", "/api/upload"),
        ] {
            let (status, body) = status_of(method, uri).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
            assert_eq!(body["message"], "Non autenticato.");
        }
    }

    #[tokio::test]
    async fn test_auth_routes_are_public() {
        let (status, body) = status_of("GET", "/api/auth/session").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authenticated"], false);
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_not_found() {
        let (status, body) = status_of("GET", "/api/nothing-here").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Risorsa non trovata");
    }
}
