//! Mapping of crate errors onto JSON error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;

/// Body of every non-2xx response: `{"code", "message", "details"?}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

macro_rules! api_error_ctor {
    ($($name:ident => $status:ident, $code:literal;)*) => {
        $(
            pub fn $name(message: impl Into<String>) -> Self {
                Self::new(StatusCode::$status, $code, message)
            }
        )*
    };
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(self, details: Value) -> Self {
        Self {
            details: Some(details),
            ..self
        }
    }

    api_error_ctor! {
        validation => BAD_REQUEST, "VALIDATION_ERROR";
        not_found => NOT_FOUND, "NOT_FOUND";
        conflict => CONFLICT, "CONFLICT";
        external => BAD_GATEWAY, "EXTERNAL_ERROR";
        internal => INTERNAL_SERVER_ERROR, "INTERNAL_ERROR";
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => Self::validation(msg),
            Error::NotFound { entity_type, id } => {
                Self::not_found(format!("{entity_type} with id '{id}' not found"))
            }
            Error::NoEligibleAccount { .. } => Self::not_found(err.to_string()),
            Error::Conflict(msg) => Self::conflict(msg),
            Error::InvalidStateTransition { from, to } => {
                Self::conflict(format!("Cannot transition from {from} to {to}"))
            }
            Error::Cancelled => Self::conflict("Cancelled"),
            Error::External(msg) => Self::external(msg),
            other => {
                // Internal details stay in the log, not in the response.
                tracing::error!(error = %other, "request failed");
                Self::internal("Internal server error")
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::validation("bad line"), StatusCode::BAD_REQUEST, "VALIDATION_ERROR")]
    #[case(Error::not_found("Task", "t1"), StatusCode::NOT_FOUND, "NOT_FOUND")]
    #[case(
        Error::NoEligibleAccount { platform: "jimeng".into(), kind: "text2img".into() },
        StatusCode::NOT_FOUND,
        "NOT_FOUND"
    )]
    #[case(Error::conflict("bound"), StatusCode::CONFLICT, "CONFLICT")]
    #[case(Error::invalid_transition("pending", "succeeded"), StatusCode::CONFLICT, "CONFLICT")]
    #[case(Error::external("captcha"), StatusCode::BAD_GATEWAY, "EXTERNAL_ERROR")]
    #[case(Error::Other("boom".into()), StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")]
    fn test_error_mapping(
        #[case] err: Error,
        #[case] status: StatusCode,
        #[case] code: &str,
    ) {
        let api = ApiError::from(err);
        assert_eq!(api.status, status);
        assert_eq!(api.code, code);
    }

    #[test]
    fn test_not_found_message() {
        let api = ApiError::from(Error::not_found("Task", "t1"));
        assert_eq!(api.message, "Task with id 't1' not found");
    }
}
