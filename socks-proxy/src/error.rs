use thiserror::Error;

/// Session-level failure kinds, wrapping the wire-protocol crate's plain `std::io::Result`
/// so that log sites and tests can match on error *kind* instead of parsing message strings.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed request: {0}")]
    Framing(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("could not reach target: {0}")]
    Connect(#[source] std::io::Error),

    #[error("unsupported command")]
    Unsupported,

    #[error("upstream proxy misconfigured: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
