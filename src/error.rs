//! Error taxonomy shared by every subsystem.
//!
//! Errors form a small closed set that is translated to signed platform codes
//! at the wire boundary. Two members are *normal* outcomes rather than
//! failures and must never be logged at error level: [`Error::NotFound`] and
//! [`Error::BufferTooSmall`] (the latter carries the size a retry needs).

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed error set.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested key, record, or request id does not exist.
    #[error("not found")]
    NotFound,
    /// The key or record already exists and overwrite was not permitted.
    #[error("already exists")]
    Exists,
    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {0}")]
    BadArg(&'static str),
    /// An allocation or pool slot could not be obtained.
    #[error("out of memory")]
    OutOfMemory,
    /// The supplied buffer cannot hold the value; retry with `required` bytes.
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall {
        /// Number of bytes a retry must provide.
        required: usize,
    },
    /// An interval with `end < start` was supplied.
    #[error("invalid byte range")]
    BadRange,
    /// Stored data failed validation while being decoded.
    #[error("corrupt record: {0}")]
    Corrupt(&'static str),
    /// The resource is held and the operation cannot proceed now.
    #[error("busy")]
    Busy,
    /// The operation exceeded its deadline.
    #[error("timed out")]
    Timeout,
    /// The caller cancelled the operation.
    #[error("cancelled by caller")]
    CancelledByCaller,
    /// A storage-engine or transport failure, diagnostic preserved.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Authentication or authorization failed.
    #[error("authentication failed")]
    AuthFailed,
    /// A server-selection policy could not be satisfied.
    #[error("policy unsatisfied")]
    PolicyUnsatisfied,
    /// Invariant violation inside the crate.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// True for outcomes that are part of normal control flow and must not
    /// be logged as errors.
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::NotFound | Error::BufferTooSmall { .. })
    }

    /// Signed platform code used on the wire. Codes are negative, matching
    /// the convention of the transport peers.
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::NotFound => -2,
            Error::Exists => -17,
            Error::BadArg(_) => -22,
            Error::OutOfMemory => -12,
            Error::BufferTooSmall { .. } => -7,
            Error::BadRange => -34,
            Error::Corrupt(_) => -74,
            Error::Busy => -16,
            Error::Timeout => -110,
            Error::CancelledByCaller => -125,
            Error::Io(_) => -5,
            Error::AuthFailed => -13,
            Error::PolicyUnsatisfied => -61,
            Error::Internal(_) => -131,
        }
    }

    /// Inverse of [`Error::wire_code`] for codes arriving off the wire.
    /// Unknown codes map to `Internal`.
    pub fn from_wire_code(code: i32) -> Error {
        match code {
            -2 => Error::NotFound,
            -17 => Error::Exists,
            -22 => Error::BadArg("peer"),
            -12 => Error::OutOfMemory,
            -7 => Error::BufferTooSmall { required: 0 },
            -34 => Error::BadRange,
            -74 => Error::Corrupt("peer"),
            -16 => Error::Busy,
            -110 => Error::Timeout,
            -125 => Error::CancelledByCaller,
            -5 => Error::Io(io::Error::other("peer i/o failure")),
            -13 => Error::AuthFailed,
            -61 => Error::PolicyUnsatisfied,
            _ => Error::Internal("unknown wire code"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for err in [
            Error::NotFound,
            Error::Exists,
            Error::OutOfMemory,
            Error::BadRange,
            Error::Busy,
            Error::Timeout,
            Error::CancelledByCaller,
            Error::AuthFailed,
            Error::PolicyUnsatisfied,
        ] {
            let code = err.wire_code();
            assert_eq!(Error::from_wire_code(code).wire_code(), code);
        }
    }

    #[test]
    fn benign_outcomes() {
        assert!(Error::NotFound.is_benign());
        assert!(Error::BufferTooSmall { required: 16 }.is_benign());
        assert!(!Error::Exists.is_benign());
    }
}
