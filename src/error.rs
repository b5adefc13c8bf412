//! API errors and their JSON response shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{config::config, ingest::IngestError};

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must_change_password: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("Cambio password richiesto.")]
    PasswordChangeRequired,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Database non disponibile.")]
    ServiceUnavailable,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PasswordChangeRequired => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Ingest(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Database(_) | Self::Ingest(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PasswordChangeRequired => "password_change_required",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Ingest(_) => "ingest_error",
            Self::Database(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Message shown to the user. Server-side failures get a generic text.
    fn public_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Internal(_) => "Errore interno del server".to_string(),
            Self::Ingest(e) if !e.is_client_error() => {
                "Errore durante l'importazione del file.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let details = if status == StatusCode::INTERNAL_SERVER_ERROR && !config().is_production() {
            Some(self.to_string())
        } else {
            None
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.public_message(),
            code: match &self {
                Self::Ingest(e) => Some(e.code().to_string()),
                _ => None,
            },
            must_change_password: matches!(self, Self::PasswordChangeRequired).then_some(true),
            details,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unauthenticated("Non autenticato.".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::PasswordChangeRequired.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::Conflict("dup".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::ServiceUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_ingest_client_errors_are_bad_requests() {
        assert_eq!(
            ApiError::from(IngestError::NoSheets).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(IngestError::NoValidRows).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(IngestError::Task("join".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_password_change_body_carries_flag() {
        let response = ApiError::PasswordChangeRequired.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.message, "Cambio password richiesto.");
        assert_eq!(json.must_change_password, Some(true));
    }

    #[tokio::test]
    async fn test_internal_error_hides_cause_from_message() {
        let response = ApiError::Internal("pool exploded".into()).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.message, "Errore interno del server");
    }

    #[tokio::test]
    async fn test_ingest_error_exposes_code() {
        let response = ApiError::from(IngestError::NoValidRows).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.code.as_deref(), Some("NO_VALID_ROWS"));
        assert_eq!(
            json.message,
            "Il file XLS non contiene righe valide da importare."
        );
    }
}
