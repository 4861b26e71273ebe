//! # Provider Error Taxonomy
//!
//! Everything an upstream call can do wrong, in one enum. The distinction
//! that matters to the gateway is transient versus permanent: transient
//! failures (network trouble, timeouts, 5xx, rate limits) trigger failover
//! to the next candidate, permanent failures (other 4xx) are surfaced to the
//! caller unchanged.
//!
//! Concrete HTTP bridges convert their transport errors via the `reqwest`
//! and `serde_json` `From` impls; the gateway itself never constructs those
//! variants.

use thiserror::Error;

/// Errors raised by provider bridges and classified by the gateway.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP client and network communication errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API error with its upstream status code
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// Invalid or missing API key
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Requested model not served by this provider
    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    /// Provider rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider service temporarily unavailable
    #[error("Service unavailable")]
    ServiceUnavailable,

    /// Upstream attempt did not complete within its deadline
    #[error("Timeout")]
    Timeout,

    /// Caller abandoned the request before a reply arrived
    #[error("Request cancelled")]
    Cancelled,

    /// JSON encode/decode failure on the provider boundary
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reply arrived but could not be interpreted
    #[error("Invalid response format")]
    InvalidResponse,

    /// Bridge-side configuration problem
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Network connectivity failure outside the HTTP client
    #[error("Network error: {message}")]
    Network { message: String },
}

impl ProviderError {
    /// HTTP-style status code used when this error is surfaced to the
    /// gateway caller.
    pub fn status_code(&self) -> u16 {
        match self {
            ProviderError::Http(_) | ProviderError::Network { .. } => 502,
            ProviderError::Api { code, .. } => *code,
            ProviderError::InvalidApiKey => 401,
            ProviderError::ModelNotFound { .. } => 404,
            ProviderError::RateLimit => 429,
            ProviderError::ServiceUnavailable => 503,
            ProviderError::Timeout => 502,
            ProviderError::Cancelled => 499,
            ProviderError::Serialization(_) | ProviderError::InvalidResponse => 502,
            ProviderError::Configuration { .. } => 500,
        }
    }

    /// Whether failover to another provider is worthwhile.
    ///
    /// Rate limits (429), request timeouts (408) and all 5xx-class failures
    /// are transient; other 4xx responses would fail identically elsewhere
    /// and end the attempt loop.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_)
            | ProviderError::Network { .. }
            | ProviderError::RateLimit
            | ProviderError::ServiceUnavailable
            | ProviderError::Timeout
            | ProviderError::InvalidResponse => true,
            ProviderError::Api { code, .. } => {
                *code == 429 || *code == 408 || (500..600).contains(code)
            }
            ProviderError::Cancelled
            | ProviderError::InvalidApiKey
            | ProviderError::ModelNotFound { .. }
            | ProviderError::Serialization(_)
            | ProviderError::Configuration { .. } => false,
        }
    }
}

/// Status-code variant of the transient test, for failures that arrive as a
/// well-formed non-2xx `Response` rather than an error.
pub fn status_is_transient(status_code: u16) -> bool {
    status_code == 429 || status_code == 408 || (500..600).contains(&status_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_failover_policy() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimit.is_transient());
        assert!(ProviderError::ServiceUnavailable.is_transient());
        assert!(ProviderError::Api {
            code: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(ProviderError::Api {
            code: 429,
            message: "slow down".into()
        }
        .is_transient());

        assert!(!ProviderError::InvalidApiKey.is_transient());
        assert!(!ProviderError::Api {
            code: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!ProviderError::Cancelled.is_transient());
    }

    #[test]
    fn status_codes_follow_error_mapping() {
        assert_eq!(ProviderError::Timeout.status_code(), 502);
        assert_eq!(ProviderError::Cancelled.status_code(), 499);
        assert_eq!(ProviderError::RateLimit.status_code(), 429);
        assert_eq!(
            ProviderError::Api {
                code: 418,
                message: "teapot".into()
            }
            .status_code(),
            418
        );
    }

    #[test]
    fn status_helper_agrees_with_enum() {
        for code in [429u16, 408, 500, 502, 503, 599] {
            assert!(status_is_transient(code), "{code} should be transient");
        }
        for code in [400u16, 401, 403, 404, 422] {
            assert!(!status_is_transient(code), "{code} should be permanent");
        }
    }
}
