/*!
Common error types for the SX camera core.
*/

use std::fmt;
use thiserror::Error;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, SxError>;

/// Broad failure category, used by adapters that map errors onto their own conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Protocol,
    Range,
    Argument,
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Io => "I/O",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Range => "range",
            ErrorKind::Argument => "argument",
            ErrorKind::InvalidState => "invalid state",
        };
        f.write_str(name)
    }
}

/// Error type for every camera operation
#[derive(Error, Debug)]
pub enum SxError {
    /// Platform I/O failure reported by the device handle
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device accepted fewer bytes than were sent
    #[error("Short write: requested {requested} bytes, only wrote {written}")]
    ShortWrite { requested: usize, written: usize },

    /// The device delivered fewer bytes than were requested
    #[error("Short read: requested {requested} bytes, only got {received} (os error {code:?})")]
    ShortRead {
        requested: usize,
        received: usize,
        code: Option<i32>,
    },

    /// Malformed or undersized response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A geometry value outside its legal range
    #[error("Invalid {field} {value}: {min} <= {field} <= {max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// Bit depth the reconstructor cannot handle
    #[error("Unsupported bits per pixel: {0}")]
    UnsupportedBitDepth(u8),

    /// Invalid flags, camera index or similar argument
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Operation not permitted in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SxError {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a range error for `field`, legal values `min..=max`
    pub fn out_of_range(field: &'static str, value: u32, min: u32, max: u32) -> Self {
        Self::OutOfRange { field, value, min, max }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::ShortWrite { .. } | Self::ShortRead { .. } => ErrorKind::Io,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::OutOfRange { .. } | Self::UnsupportedBitDepth(_) => ErrorKind::Range,
            Self::Argument(_) => ErrorKind::Argument,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(SxError::ShortWrite { requested: 8, written: 4 }.kind(), ErrorKind::Io);
        assert_eq!(SxError::protocol("bad").kind(), ErrorKind::Protocol);
        assert_eq!(SxError::out_of_range("width", 0, 1, 10).kind(), ErrorKind::Range);
        assert_eq!(SxError::UnsupportedBitDepth(32).kind(), ErrorKind::Range);
        assert_eq!(SxError::argument("flags").kind(), ErrorKind::Argument);
        assert_eq!(SxError::invalid_state("busy").kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_range_message_names_field() {
        let err = SxError::out_of_range("xBin", 9, 1, 4);
        assert_eq!(err.to_string(), "Invalid xBin 9: 1 <= xBin <= 4");
    }
}
