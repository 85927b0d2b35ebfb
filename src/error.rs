use thiserror::Error;

/// Errors surfaced by a [`Forge`](crate::Forge) implementation.
///
/// Classification matters more than the message: the pipeline aborts
/// the whole pass on a fatal error and records anything else against the
/// repository being processed.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("hit rate limit: {0}")]
    RateLimited(String),

    #[error("credentials rejected: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("GitHub API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("fork {repo} not available after {attempts} attempts")]
    ForkNotReady { repo: String, attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    /// Maps an HTTP status and API message onto an error class.
    ///
    /// GitHub reports primary rate limits as 403 with an "API rate limit
    /// exceeded" message and secondary limits as either 403 or 429.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => ForgeError::RateLimited(message),
            403 if message.to_lowercase().contains("rate limit") => {
                ForgeError::RateLimited(message)
            }
            401 => ForgeError::Unauthorized(message),
            404 => ForgeError::NotFound(message),
            _ => ForgeError::Api { status, message },
        }
    }

    /// Fatal errors end the current pass; no other repository can make
    /// progress until the condition clears.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForgeError::RateLimited(_) | ForgeError::Unauthorized(_))
    }
}

impl From<octocrab::Error> for ForgeError {
    fn from(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                ForgeError::from_status(source.status_code.as_u16(), source.message.clone())
            }
            other => ForgeError::Other(anyhow::Error::new(other)),
        }
    }
}
