use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::auth::AuthError;
use crate::service::ServiceError;
use crate::store::StoreError;

/// Everything a handler can fail with, mapped onto the HTTP status table.
#[derive(Debug)]
pub enum ApiError {
    MissingBearer,
    PayloadTooLarge,
    InvalidJson(String),
    ApiRateExceeded,
    LoginRateExceeded { retry_after_secs: u64 },
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after, message) = match self {
            ApiError::MissingBearer => {
                (StatusCode::UNAUTHORIZED, None, "missing bearer token".to_string())
            }
            ApiError::PayloadTooLarge => {
                (StatusCode::BAD_REQUEST, None, "request body too large".to_string())
            }
            ApiError::InvalidJson(detail) => {
                (StatusCode::BAD_REQUEST, None, format!("invalid json: {detail}"))
            }
            ApiError::ApiRateExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(60),
                "rate limit exceeded".to_string(),
            ),
            ApiError::LoginRateExceeded { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(retry_after_secs),
                "too many login attempts, try later".to_string(),
            ),
            ApiError::Service(err) => (service_status(&err), None, err.to_string()),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let Some(secs) = retry_after
            && let Ok(value) = secs.to_string().parse()
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

fn service_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Auth(AuthError::InvalidPassword | AuthError::InvalidToken) => {
            StatusCode::UNAUTHORIZED
        }
        ServiceError::Store(StoreError::InvalidDeviceToken) => StatusCode::UNAUTHORIZED,
        ServiceError::Store(
            StoreError::DeviceNotFound | StoreError::CommandNotFound | StoreError::ArtifactNotFound,
        ) => StatusCode::NOT_FOUND,
        ServiceError::Store(
            StoreError::FleetLimitReached | StoreError::DeviceExistsWithOtherIdentity,
        ) => StatusCode::CONFLICT,
        ServiceError::Store(
            StoreError::Snapshot(_) | StoreError::Encode(_) | StoreError::Corrupt(_),
        ) => StatusCode::INTERNAL_SERVER_ERROR,
        ServiceError::InvalidEnrollKey
        | ServiceError::MissingField(_)
        | ServiceError::UnsupportedCommandType(_)
        | ServiceError::InvalidBase64
        | ServiceError::EmptyArtifactPayload => StatusCode::BAD_REQUEST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            service_status(&ServiceError::Auth(AuthError::InvalidToken)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            service_status(&ServiceError::Store(StoreError::FleetLimitReached)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            service_status(&ServiceError::Store(StoreError::ArtifactNotFound)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            service_status(&ServiceError::UnsupportedCommandType("x".to_string())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = ApiError::LoginRateExceeded { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }
}
