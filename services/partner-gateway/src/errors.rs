use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use gateway_core::ShortResponse;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayServiceError>;

/// Infrastructure failures.
///
/// Business rejections never travel through this type; they are answered
/// in-band with a [`gateway_core::Rejection`].
#[derive(Error, Debug)]
pub enum GatewayServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Concurrent update on {0}")]
    Conflict(String),

    #[error("Redemption already in flight for {0}")]
    InFlight(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<gateway_core::Error> for GatewayServiceError {
    fn from(err: gateway_core::Error) -> Self {
        match err {
            gateway_core::Error::InvalidKey(_) | gateway_core::Error::Serialization(_) => {
                GatewayServiceError::Crypto(err.to_string())
            }
            other => GatewayServiceError::Internal(other.to_string()),
        }
    }
}

impl ResponseError for GatewayServiceError {
    fn error_response(&self) -> HttpResponse {
        let body = match self {
            GatewayServiceError::InFlight(_) => ShortResponse::new("409409", "Transaction Is Being Processed"),
            _ => ShortResponse::general_error(),
        };
        HttpResponse::build(self.status_code()).json(body)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            GatewayServiceError::InFlight(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl GatewayServiceError {
    /// Metric label for the failure class
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayServiceError::Database(_) => "database_error",
            GatewayServiceError::Redis(_) => "cache_error",
            GatewayServiceError::Http(_) => "external_service_error",
            GatewayServiceError::Serialization(_) => "serialization_error",
            GatewayServiceError::Crypto(_) => "crypto_error",
            GatewayServiceError::Config(_) => "config_error",
            GatewayServiceError::Queue(_) => "queue_error",
            GatewayServiceError::Conflict(_) => "conflict",
            GatewayServiceError::InFlight(_) => "in_flight",
            GatewayServiceError::Internal(_) => "internal_error",
        }
    }

    /// Whether a queued job failing with this error should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayServiceError::Database(_)
                | GatewayServiceError::Redis(_)
                | GatewayServiceError::Http(_)
                | GatewayServiceError::Conflict(_)
                | GatewayServiceError::InFlight(_)
                | GatewayServiceError::Queue(_)
        )
    }

    /// Whether a unique constraint rejected the write
    pub fn is_unique_violation(&self) -> bool {
        match self {
            GatewayServiceError::Database(sqlx::Error::Database(db)) => db.code().as_deref() == Some("23505"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_body_is_generic() {
        let err = GatewayServiceError::Internal("secret detail".to_string());
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["responseCode"], "500500");
        assert!(!String::from_utf8_lossy(&body).contains("secret detail"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(GatewayServiceError::Conflict("T1".into()).is_transient());
        assert!(!GatewayServiceError::Crypto("bad".into()).is_transient());
        assert!(!GatewayServiceError::Internal("x".into()).is_unique_violation());
        assert!(GatewayServiceError::InFlight("T1".into()).is_transient());
        assert_eq!(
            GatewayServiceError::InFlight("T1".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
