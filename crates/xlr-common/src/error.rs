//! Error types for the bonded ring data path

use thiserror::Error;

/// Ring error type
#[derive(Error, Debug)]
pub enum RingError {
    /// Bond created with more members than the hard cap
    #[error("bond ring with {count} members exceeds the limit of {max}")]
    TooManyMembers {
        /// Requested member count
        count: usize,
        /// Hard cap
        max: usize,
    },

    /// Bond created without members
    #[error("bond ring needs at least one member")]
    NoMembers,

    /// Invalid call argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Hardware queue reported a failure (errno-style code)
    #[error("hardware queue error (errno={errno})")]
    Hardware {
        /// Underlying errno
        errno: i32,
    },

    /// Completion record carried an unexpected opcode
    #[error("unexpected completion opcode {opcode:#x}")]
    BadCompletion {
        /// Opcode nibble from the record
        opcode: u8,
    },

    /// Device capability missing
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Control-plane agent rejected a flow message
    #[error("flow agent error: {0}")]
    AgentMessage(String),

    /// Buffer pool could not satisfy a request
    #[error("buffer pool exhausted")]
    PoolExhausted,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl RingError {
    /// errno-style code for callers that speak the socket API
    pub fn errno(&self) -> i32 {
        match self {
            Self::Hardware { errno } => *errno,
            Self::Io(e) => e.raw_os_error().unwrap_or(5),
            Self::InvalidArgument(_) => 22,
            Self::PoolExhausted => 12,
            Self::Unsupported(_) => 95,
            _ => 5,
        }
    }
}

/// Result type for ring operations
pub type RingResult<T> = Result<T, RingError>;
