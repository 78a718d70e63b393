use thiserror::Error;

/// Failure modes of a 3x-UI panel call.
///
/// `Auth` and `Transport` are candidates for retry/failover; `Api` means
/// the panel itself rejected the request (wrong inbound, duplicate email,
/// inbound full) and is surfaced to the caller as-is.
#[derive(Debug, Error)]
pub enum PanelError {
    /// Login rejected or session could not be established.
    #[error("panel authentication failed: {message}")]
    Auth { message: String },

    /// Connection-level failure (refused, DNS, timeout).
    #[error("panel transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid panel URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Non-success HTTP status outside the envelope protocol.
    #[error("panel returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Envelope arrived with `success: false`.
    #[error("panel API error: {message}")]
    Api { message: String },

    /// Body did not parse as the expected envelope/payload.
    #[error("panel response decode error: {message}")]
    Decode { message: String },
}

impl PanelError {
    /// Connectivity-shaped failures worth a bounded retry or a failover
    /// to the next panel. Panel-side rejections are deliberately excluded.
    pub fn is_retryable(&self) -> bool {
        match self {
            PanelError::Transport(_) => true,
            PanelError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
