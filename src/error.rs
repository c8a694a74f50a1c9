use crate::rpc::RpcError;
use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::Error as SerdeJsonError;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    #[error("Tokio join error: {0}")]
    Join(#[from] JoinError),

    #[error("Metadata store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Invalid request: {0}")]
    Validation(String),

    /// A workflow failed after committing side effects; compensation has
    /// already been attempted when this is raised.
    #[error("{message}")]
    PartialFailure { message: String, extra: Value },

    #[error("Generic error: {0}")]
    Generic(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    pub fn partial(message: impl Into<String>, extra: Value) -> Self {
        AppError::PartialFailure {
            message: message.into(),
            extra,
        }
    }

    /// Structured diagnostics for the failure envelope.
    pub fn extra(&self) -> Value {
        match self {
            AppError::PartialFailure { extra, .. } => extra.clone(),
            AppError::Rpc(RpcError::Fault(fault)) => serde_json::json!({
                "faultCode": fault.code,
                "faultString": fault.message,
            }),
            _ => Value::Null,
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({
                "ok": false,
                "error": self.to_string(),
                "extra": self.extra(),
            }))
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Image(_) => StatusCode::BAD_REQUEST,
            AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Sqlite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Rpc(_) => StatusCode::BAD_GATEWAY,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::PartialFailure { .. } => StatusCode::BAD_GATEWAY,
            AppError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcFault;

    #[test]
    fn daemon_failures_map_to_bad_gateway() {
        let errors = [
            AppError::Rpc(RpcError::Network("refused".into())),
            AppError::Rpc(RpcError::Protocol("garbage".into())),
            AppError::Rpc(RpcError::Fault(RpcFault::new(Some(1), "nope"))),
            AppError::partial("daemon could not index the image", Value::Null),
        ];
        for err in errors {
            assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY, "{}", err);
        }
        assert_eq!(AppError::Validation("bad id".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("image 3".into()).status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn fault_details_are_exposed_as_extra() {
        let err = AppError::from(RpcError::Fault(RpcFault::new(Some(8001), "procedure x not found")));
        assert_eq!(err.extra()["faultCode"], 8001);
        assert_eq!(err.to_string(), "XML-RPC fault: 8001 | procedure x not found");
    }
}
