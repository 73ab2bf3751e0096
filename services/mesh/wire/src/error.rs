//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Bytes are not valid JSON, or not a JSON object
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope key that names no known command
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// Known command carrying an argument of the wrong shape
    #[error("bad argument for `{key}`: {reason}")]
    BadArgument {
        /// Command key
        key: String,
        /// What was wrong with the argument
        reason: String,
    },

    /// Frame length exceeds the configured maximum
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Envelope could not be serialized
    #[error("envelope encoding failed: {0}")]
    Encode(String),
}
