use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::admission::RejectionReason;
use crate::cache::{Failure, FailureKind};

pub const REJECTION_HEADER: &str = "x-rejection-reason";

/// Everything a conversion request can fail with, short of a payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Rejected(RejectionReason),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Error fetching source image: {0}")]
    UpstreamFetch(String),

    #[error("Error decoding source image: {0}")]
    Decode(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConversionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConversionError::Validation(_) => StatusCode::BAD_REQUEST,
            ConversionError::Rejected(_) => StatusCode::BAD_REQUEST,
            ConversionError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ConversionError::UpstreamFetch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ConversionError::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ConversionError::NotFound(_) => StatusCode::NOT_FOUND,
            ConversionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Failure> for ConversionError {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::UpstreamFetch => ConversionError::UpstreamFetch(failure.detail),
            FailureKind::Decode => ConversionError::Decode(failure.detail),
            FailureKind::Internal => ConversionError::Internal(failure.detail),
        }
    }
}

impl IntoResponse for ConversionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(error = %message, status = %status, "conversion failed");
        } else {
            tracing::info!(error = %message, status = %status, "conversion refused");
        }

        let mut response = (status, message).into_response();
        if let ConversionError::Rejected(reason) = self {
            if let Ok(value) = HeaderValue::from_str(&format!("{reason:?}")) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REJECTION_HEADER), value);
            }
        }
        response
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("Invalid domain pattern: {0}")]
    DomainPattern(#[from] regex::Error),

    #[error("Invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
}
