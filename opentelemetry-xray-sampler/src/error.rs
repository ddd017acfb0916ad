//! Errors raised while configuring the sampler or talking to the X-Ray sampling API.
use opentelemetry_http::HttpError;
use std::sync::PoisonError;

/// Errors returned by the X-Ray sampler.
///
/// Configuration errors surface from [`XraySamplerBuilder::build`]. Every other
/// variant only ever occurs on the background refresh path, where it is logged
/// and the previously cached rules and targets stay in effect.
///
/// [`XraySamplerBuilder::build`]: crate::XraySamplerBuilder::build
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum XraySamplerError {
    /// The sampler was built with missing or invalid settings.
    #[error("invalid sampler configuration: {0}")]
    Config(String),

    /// The HTTP client could not complete the request.
    #[error("sampling request failed: {0}")]
    Http(#[from] HttpError),

    /// The sampling API answered with a non-success status code.
    #[error("sampling request to {path} returned status {status}")]
    UnexpectedStatus {
        /// API path that was called.
        path: &'static str,
        /// Status code of the response.
        status: http::StatusCode,
    },

    /// The response body was not a valid sampling API payload.
    #[error("failed to decode sampling response: {0}")]
    Deserialize(#[from] serde_json::Error),

    /// Other types of failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for XraySamplerError {
    fn from(err: PoisonError<T>) -> Self {
        XraySamplerError::Other(err.to_string())
    }
}

/// Result type used across the crate.
pub type XraySamplerResult<T> = Result<T, XraySamplerError>;
