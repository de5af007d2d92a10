/// Errors surfaced by every fallible runtime operation.
///
/// The runtime never promotes an error to a process abort; collective
/// consistency failures are reported uniformly to every participant instead
/// (see `team_create`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad argument: unknown team, unknown global pointer, unknown offset,
    /// malformed group.
    Invalid(String),
    /// Out of pool memory, out of team slots, or out of segment ids.
    Exhausted(String),
    /// Segment, bucket, or handle lookup miss.
    NotFound(String),
    /// The runtime has not been initialized or was already finalized.
    NotInitialized,
    /// The underlying transport reported a non-success condition.
    Transport(String),
    /// Declared but not supported in this build.
    NotImplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Invalid(what) => write!(f, "invalid argument: {}", what),
            Error::Exhausted(what) => write!(f, "resource exhausted: {}", what),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::NotInitialized => write!(f, "runtime not initialized"),
            Error::Transport(what) => write!(f, "transport failure: {}", what),
            Error::NotImplemented(what) => write!(f, "not implemented: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::transport::AllocError> for Error {
    fn from(e: crate::transport::AllocError) -> Error {
        match e {
            crate::transport::AllocError::OutOfMemory(size) => {
                Error::Exhausted(format!("transport allocation of {} bytes", size))
            }
            crate::transport::AllocError::NotAMember(pe) => {
                Error::Invalid(format!("pe {} is not part of the sub allocation", pe))
            }
        }
    }
}
