//! Error type shared by every public entry point.

use std::io;
use std::path::{Path, PathBuf};

/// Broad classification used when surfacing failures to a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input or settings; retrying will not help.
    Configuration,
    /// File system failure.
    Io,
    /// The external decomposition engine failed to start or exited non-zero.
    Engine,
    /// Matrix maths failed.
    Numeric,
    /// The run was cancelled or could not start because another is active.
    Cancelled,
}

/// Error enumeration surfaced across the public API.
#[derive(thiserror::Error, Debug)]
pub enum IcaError {
    /// Stream id did not match any registered stream.
    #[error("unknown stream id: {0}")]
    UnknownStream(u32),
    /// Decomposition is undefined below two dimensions.
    #[error("at least 2 channels must be enabled to run ICA ({0} enabled)")]
    TooFewChannels(usize),
    /// Training config file could not be parsed.
    #[error("malformed ICA config file {path}: {reason}")]
    MalformedConfig {
        /// File being parsed.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// A loaded decomposition does not fit the stream it is applied to.
    #[error("channel mismatch: {0}")]
    ChannelMismatch(String),
    /// Component index outside the operation's dimension.
    #[error("component {component} out of range for dimension {dimension}")]
    InvalidComponent {
        /// Offending 0-based component.
        component: usize,
        /// Dimension of the current operation.
        dimension: usize,
    },
    /// A setting is outside the range the processor can work with.
    #[error("invalid setting: {0}")]
    InvalidConfig(String),
    /// Persisted settings could not be decoded.
    #[error("invalid persisted settings: {0}")]
    Persist(String),
    /// Wrapped I/O failure with the action that caused it.
    #[error("{context} ({path}): {source}")]
    Io {
        /// Action being attempted.
        context: &'static str,
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Matrix file held the wrong number of values.
    #[error("matrix file {path} holds {found} values, expected {expected}")]
    MatrixLength {
        /// File being read.
        path: PathBuf,
        /// Values found.
        found: usize,
        /// Values expected (dimension squared).
        expected: usize,
    },
    /// External engine could not be started.
    #[error("failed to launch decomposition engine {0}")]
    EngineLaunch(PathBuf),
    /// External engine exited with a non-zero code.
    #[error("decomposition engine exited with code {0}")]
    EngineExit(i32),
    /// Unmixing matrix could not be inverted.
    #[error("unmixing matrix is singular or ill-conditioned")]
    SingularMatrix,
    /// The cache lost fullness or was never full when its data was requested.
    #[error("sample cache is not full ({0}%)")]
    CacheNotFull(u8),
    /// A training run is already active.
    #[error("ICA training is already running")]
    AlreadyRunning,
    /// Run was cancelled before finishing.
    #[error("ICA training cancelled")]
    Cancelled,
}

impl IcaError {
    /// Map the error onto its user-facing category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            IcaError::UnknownStream(_)
            | IcaError::TooFewChannels(_)
            | IcaError::MalformedConfig { .. }
            | IcaError::ChannelMismatch(_)
            | IcaError::InvalidComponent { .. }
            | IcaError::InvalidConfig(_)
            | IcaError::Persist(_)
            | IcaError::CacheNotFull(_) => ErrorCategory::Configuration,
            IcaError::Io { .. } | IcaError::MatrixLength { .. } => ErrorCategory::Io,
            IcaError::EngineLaunch(_) | IcaError::EngineExit(_) => ErrorCategory::Engine,
            IcaError::SingularMatrix => ErrorCategory::Numeric,
            IcaError::AlreadyRunning | IcaError::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether the error represents a user cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, IcaError::Cancelled)
    }
}

/// Build a closure converting an `io::Error` into [`IcaError::Io`].
pub(crate) fn io_context<'a>(
    context: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> IcaError + 'a {
    move |source| IcaError::Io {
        context,
        path: path.to_path_buf(),
        source,
    }
}
