use std::time::Duration;

/// Error type for persistent store operations.
///
/// These never reach callers of the layered cache; they are logged and turned into misses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// A store operation failed.
    #[error("[{tier}] cache error for key '{key}': {message}")]
    Operation {
        tier: String,
        key: String,
        message: String,
    },
    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Create a new operation error.
    pub fn operation(
        tier: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Operation {
            tier: tier.into(),
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Returned by a circuit breaker that refuses to run an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for service '{service}'")]
pub struct CircuitOpenError {
    pub service: String,
}

/// Coarse classification of a fetch failure, for deciding between a retry affordance and a
/// terminal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The remote could not be reached at all.
    Offline,
    /// The remote answered with an error, or is being shielded by an open circuit.
    Unavailable,
    /// The remote answered but the payload could not be understood.
    Malformed,
    /// The request was cancelled before it completed.
    Cancelled,
}

/// Error type for document fetches.
///
/// `Clone` so that a single coalesced failure can be handed to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Connectivity failure or timeout.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    /// The remote answered with a non-success status.
    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },
    /// The circuit breaker for the service is open.
    #[error("service '{service}' is unavailable")]
    ServiceUnavailable { service: String },
    /// The payload could not be parsed in the requested format.
    #[error("could not parse {format} document: {message}")]
    Parse { format: String, message: String },
    /// The remote said "not modified" but there is nothing cached to reuse.
    #[error("{url} reported not modified but no cached copy exists")]
    NotModifiedWithoutCache { url: String },
    /// The address is not a valid absolute URL.
    #[error("invalid address {url}: {message}")]
    InvalidUrl { url: String, message: String },
    /// The in-flight request was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn transport(url: impl Into<String>, message: impl ToString) -> Self {
        FetchError::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn parse(format: impl Into<String>, message: impl ToString) -> Self {
        FetchError::Parse {
            format: format.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Transport { .. } => ErrorKind::Offline,
            FetchError::Status { .. }
            | FetchError::ServiceUnavailable { .. }
            | FetchError::NotModifiedWithoutCache { .. } => ErrorKind::Unavailable,
            FetchError::Parse { .. } | FetchError::InvalidUrl { .. } => ErrorKind::Malformed,
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether trying again later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Offline | ErrorKind::Unavailable)
    }

    /// Short user-facing description, e.g. "could not load catalog (offline)".
    pub fn user_message(&self, resource: &str) -> String {
        let reason = match self.kind() {
            ErrorKind::Offline => "offline",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Malformed => "malformed response",
            ErrorKind::Cancelled => "cancelled",
        };
        format!("could not load {} ({})", resource, reason)
    }
}

impl From<CircuitOpenError> for FetchError {
    fn from(err: CircuitOpenError) -> Self {
        FetchError::ServiceUnavailable {
            service: err.service,
        }
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("stale_after ({stale_after:?}) must be shorter than expire_after ({expire_after:?})")]
    InvalidFreshness {
        stale_after: Duration,
        expire_after: Duration,
    },
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("persistence is enabled but no store or directory was configured")]
    MissingPersistenceDir,
}
