//! Error taxonomy for the annotation pipeline.
//!
//! Session-level operations return `PipelineError` so callers can branch on the
//! kind of failure. Setup and backend plumbing use `anyhow` and are folded into
//! one of these kinds at the session boundary.

use thiserror::Error;

/// Why a frame source could not be used.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SourceFault {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("unsupported media format: {0}")]
    UnsupportedFormat(String),
    #[error("no frame source is open")]
    NotOpen,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] SourceFault),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("region too small: {width}x{height} (minimum {min}x{min})")]
    SizeViolation { width: u32, height: u32, min: u32 },
    #[error("channel error: {0}")]
    ChannelError(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("malformed server message: {0}")]
    ParseError(String),
}

impl PipelineError {
    /// Errors that end the current streaming session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelError(_) | Self::ParseError(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// A user-facing notification raised by the session.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    Info(String),
    /// Something failed but the session carried on.
    Warning(PipelineError),
    /// Something failed and the affected activity was stopped.
    Error(PipelineError),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info(message) => f.write_str(message),
            Self::Warning(err) => write!(f, "warning: {}", err),
            Self::Error(err) => write!(f, "error: {}", err),
        }
    }
}
