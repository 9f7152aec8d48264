use thiserror::Error;

/// Main error type for the playback server
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("encoder failed: {0}")]
    SubprocessFailure(String),

    /// The peer went away while the response body was being written.
    #[error("client aborted the transfer")]
    ClientAborted,

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("unauthorized: {message}")]
    Unauthorized {
        message: String,
        ask_credentials: bool,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlaybackError {
    /// Whether this error originates from the client closing the connection.
    pub fn is_client_abort(&self) -> bool {
        match self {
            PlaybackError::ClientAborted => true,
            PlaybackError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// An equivalent error for another observer of the same failure.
    /// I/O errors are not cloneable and become `Internal`.
    pub fn duplicate(&self) -> Self {
        match self {
            PlaybackError::InvalidRequest(m) => PlaybackError::InvalidRequest(m.clone()),
            PlaybackError::NotFound(m) => PlaybackError::NotFound(m.clone()),
            PlaybackError::MalformedContainer(m) => PlaybackError::MalformedContainer(m.clone()),
            PlaybackError::UnsupportedFormat(m) => PlaybackError::UnsupportedFormat(m.clone()),
            PlaybackError::SubprocessFailure(m) => PlaybackError::SubprocessFailure(m.clone()),
            PlaybackError::ClientAborted => PlaybackError::ClientAborted,
            PlaybackError::InvalidManifest(m) => PlaybackError::InvalidManifest(m.clone()),
            PlaybackError::Unauthorized {
                message,
                ask_credentials,
            } => PlaybackError::Unauthorized {
                message: message.clone(),
                ask_credentials: *ask_credentials,
            },
            PlaybackError::Config(m) => PlaybackError::Config(m.clone()),
            PlaybackError::Io(e) => PlaybackError::Internal(e.to_string()),
            PlaybackError::Internal(m) => PlaybackError::Internal(m.clone()),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PlaybackError>;
