use thiserror::Error;

/// Gateway-wide error type. Domain variants map 1:1 onto the HTTP surface
/// (see `wagate-server`); leaf library errors are wrapped via `#[from]`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Denied by the rate limiter or scrape quota. `retry_after_ms` is the
    /// limiter's delay hint, surfaced as a Retry-After header upstream.
    #[error("rate limited: {reason}")]
    RateLimited { reason: String, retry_after_ms: i64 },

    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Recoverable transport close; drives reconnection and never escapes
    /// the session manager.
    #[error("transport disconnected: {0}")]
    TransientTransport(String),

    /// Logout / bad session / replaced / auth-class close. Credentials are
    /// purged and the session row is marked failed.
    #[error("transport failed: {0}")]
    FatalTransport(String),

    /// AI or shipping collaborator failure.
    #[error("dependency failed: {0}")]
    Dependency(String),

    /// Unique-key violation. Idempotent upsert paths treat this as success.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for either transport failure class; the auto-reply path uses
    /// this to tell a dead socket apart from a cosmetic presence error.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::TransientTransport(_) | Error::FatalTransport(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
