//! Error types for the panel client and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors raised while talking to the upstream administrative API
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("panel request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gave up after {attempts} login attempts")]
    LoginExhausted { attempts: u32 },

    #[error("panel call did not succeed before its deadline")]
    DeadlineExceeded,

    #[error("malformed panel response: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl PanelError {
    /// Errors meaning the gateway cannot authenticate at all
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PanelError::LoginExhausted { .. } | PanelError::DeadlineExceeded
        )
    }
}

pub type PanelResult<T> = Result<T, PanelError>;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Unknown route, wrong Host, or a request the route cannot serve
    NotFound,
    /// Inbound request body could not be read
    BadRequestBody,
    /// Failed to connect to (or talk to) the backend
    ConnectionFailed,
    /// Backend did not answer in time
    RequestTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::BadRequestBody => StatusCode::BAD_REQUEST,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::BadRequestBody => "BAD_REQUEST_BODY",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// The one 404 every unmatched or refused request gets
pub fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(GatewayErrorCode::NotFound, "Not Found")
}
