use thiserror::Error;

/// Canonical cumulo error taxonomy used across crates.
///
/// Classification guidance:
/// - [`CumuloError::InvalidConfig`]: session/config contract violations caught before any work
/// - [`CumuloError::Build`]: job construction failures (argument shapes, serialization setup,
///   aggregate-size ceilings) raised synchronously at build time
/// - [`CumuloError::Dispatch`]: compute-backend invocation failures, including exhausted retries
/// - [`CumuloError::Storage`]: storage backend failures other than plain missing objects
/// - [`CumuloError::NotFound`]: a missing storage object; expected-transient while a worker has
///   not yet written its status/output, fatal only once a retry ceiling is hit
/// - [`CumuloError::State`]: call-lifecycle misuse by the caller (for example requesting a
///   result before the job was invoked)
/// - [`CumuloError::Remote`]: a failure reported by the remote worker, deferred until the
///   caller asks for the call's status or result
#[derive(Debug, Error)]
pub enum CumuloError {
    /// Invalid or inconsistent session/executor configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Job construction failed before anything was dispatched.
    ///
    /// Examples:
    /// - ambiguous per-call argument shape
    /// - "exceeded maximum aggregate data size"
    /// - input descriptor resolving to no objects
    #[error("job build error: {0}")]
    Build(String),

    /// Compute-backend dispatch failed terminally.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Storage backend failure that is not a plain missing object.
    #[error("storage error: {0}")]
    Storage(String),

    /// A storage object is not (yet) visible.
    ///
    /// Polling paths treat this as a transient condition and retry with a
    /// bounded sleep loop before escalating.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Call-lifecycle misuse, for example `result()` on a never-dispatched call.
    #[error("invalid call state: {0}")]
    State(String),

    /// Failure reported by the remote worker for one call.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for behavior intentionally not provided (for example
    /// remote cancellation).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard cumulo result alias.
pub type Result<T> = std::result::Result<T, CumuloError>;

/// Failure class reported by a remote worker.
///
/// Workers tag their status writes with a small fixed vocabulary; everything
/// outside it is a user-function failure carrying the original type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Worker hit its wall-clock execution timeout (`OUTATIME`).
    Timeout,
    /// Worker ran out of memory (`OUTOFMEMORY`).
    OutOfMemory,
    /// Worker engine version differs from the orchestrator's (`WRONGVERSION`).
    VersionMismatch,
    /// The user function failed; `type_name` is the remote error type.
    User {
        /// Remote-side error type name.
        type_name: String,
    },
    /// The worker could not encode the real failure and fell back to a
    /// stringified bundle.
    Serialization,
}

/// A tagged remote failure: kind, message, and the opaque remote trace.
///
/// The orchestrator re-raises a local error constructed from this tag rather
/// than attempting to resurrect the foreign error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Failure class.
    pub kind: RemoteErrorKind,
    /// Human-readable message from the worker.
    pub message: String,
    /// Opaque remote traceback, when the worker captured one.
    pub remote_trace: Option<String>,
}

impl RemoteError {
    /// Builds a remote error with no trace attached.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remote_trace: None,
        }
    }

    fn kind_label(&self) -> &str {
        match &self.kind {
            RemoteErrorKind::Timeout => "execution timeout",
            RemoteErrorKind::OutOfMemory => "out of memory",
            RemoteErrorKind::VersionMismatch => "version mismatch",
            RemoteErrorKind::User { type_name } => type_name,
            RemoteErrorKind::Serialization => "serialization failure",
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote call failed ({}): {}", self.kind_label(), self.message)
    }
}

impl std::error::Error for RemoteError {}
