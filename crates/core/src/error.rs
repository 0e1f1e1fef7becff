use thiserror::Error;

/// Failures the sync layer can observe. None of them are fatal: callers
/// report them to the diagnostic log and keep the last good state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Push channel failed to open or closed unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed push payload or response body.
    #[error("parse error: {0}")]
    Parse(String),
    /// HTTP collaborator failure.
    #[error("fetch {path} failed: {message}")]
    Fetch {
        path: String,
        status: Option<u16>,
        message: String,
    },
    /// The backend rejected the bearer credential.
    #[error("session invalid for {path}")]
    Unauthorized { path: String },
}

impl SyncError {
    pub fn fetch(path: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Fetch {
            path: path.into(),
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => "transport",
            SyncError::Parse(_) => "parse",
            SyncError::Fetch { .. } => "fetch",
            SyncError::Unauthorized { .. } => "unauthorized",
        }
    }
}

/// Convenience result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
