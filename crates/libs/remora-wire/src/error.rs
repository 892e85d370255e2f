use std::io;

/// Errors raised while framing, decoding or validating wire data.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("invalid signature `{input}`: {reason}")]
    Signature { input: String, reason: String },

    #[error("corrupt payload: {reason}")]
    Payload { reason: String },
}

impl WireError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed { reason: reason.into() }
    }

    pub fn signature(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Signature { input: input.into(), reason: reason.into() }
    }

    pub fn payload(reason: impl Into<String>) -> Self {
        Self::Payload { reason: reason.into() }
    }
}
