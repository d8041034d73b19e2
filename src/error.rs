use thiserror::Error;
use std::io;

/// Generic error type
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No registered DNS provider recognized the zone
    #[error("No DNS provider detected for zone '{0}'")]
    NoDnsProvider(String),

    /// Stored state changed underneath the caller
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A renewal for the same zone is already running
    #[error("Renewal already in progress for zone '{0}'")]
    RenewalInProgress(String),

    /// Crypto error (key generation, signing, bundling)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Certificate chain does not validate
    #[error("Chain validation failed: {0}")]
    ChainValidation(String),

    /// Stored key or certificate material could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// ACME protocol error
    #[error("ACME error: {0}")]
    Acme(String),

    /// ACME server refused the request; retrying the same request will not help
    #[error("ACME request rejected: {0}")]
    AcmeRejected(String),

    /// ACME server rejected a challenge or order
    #[error("ACME validation failed for '{domain}': {message}")]
    Validation { domain: String, message: String },

    /// DNS provider API error
    #[error("DNS provider error: {0}")]
    DnsProvider(String),

    /// Bounded wait expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Only network-level failures qualify. Configuration, crypto and storage
    /// errors are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Acme(_) | Error::DnsProvider(_) | Error::HttpClient(_) | Error::Timeout(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpClient(err.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<instant_acme::Error> for Error {
    fn from(err: instant_acme::Error) -> Self {
        match err {
            instant_acme::Error::Api(problem) => {
                let retryable = matches!(problem.status, Some(status) if status >= 500 || status == 429)
                    || problem
                        .r#type
                        .as_deref()
                        .is_some_and(|t| t.ends_with(":badNonce") || t.ends_with(":rateLimited"));
                if retryable {
                    Error::Acme(problem.to_string())
                } else {
                    Error::AcmeRejected(problem.to_string())
                }
            }
            other => Error::Acme(other.to_string()),
        }
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Internal(format!("Metrics error: {}", err))
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Internal(err)
    }
}
