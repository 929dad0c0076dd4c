use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// API のエラー（レスポンスは `{"detail": "..."}`）
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Missing form field: {0}")]
    MissingField(&'static str),

    #[error("Invalid multipart payload: {0}")]
    BadMultipart(String),

    #[error("Upload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Prediction failed: {0}")]
    Prediction(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Prediction(format!("{:#}", err))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ModelNotLoaded | ApiError::Prediction(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MissingField(_) | ApiError::BadMultipart(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::ModelNotLoaded.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::MissingField("file").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::PayloadTooLarge { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        let err: ApiError = anyhow::anyhow!("decode").context("Failed").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("Failed: decode"));
    }
}
