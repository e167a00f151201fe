use thiserror::Error;

/// Remote-call failure classes. Transient failures are retried with
/// backoff; permanent ones surface immediately.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("rate limited or server error (HTTP {0})")]
    Transient(u16),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("permanent API error: {0}")]
    Permanent(String),
}

impl RemoteError {
    /// Rate limits (403/429), server-side failures (500/503), and
    /// connection-level errors are worth retrying; bad requests,
    /// missing auth, and decode failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Connection(_))
    }
}

impl From<google_gmail1::Error> for RemoteError {
    fn from(err: google_gmail1::Error) -> Self {
        match err {
            google_gmail1::Error::HttpError(e) => RemoteError::Connection(e.to_string()),
            google_gmail1::Error::Io(e) => RemoteError::Connection(e.to_string()),
            google_gmail1::Error::Failure(response) => {
                let code = response.status().as_u16();
                if matches!(code, 403 | 429 | 500 | 503) {
                    RemoteError::Transient(code)
                } else {
                    RemoteError::Permanent(format!("HTTP {}", code))
                }
            }
            other => RemoteError::Permanent(other.to_string()),
        }
    }
}
