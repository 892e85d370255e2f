use remora_wire::WireError;

/// Errors surfaced by connections, proxies and the server dispatcher.
///
/// Errors the server generates locally travel back to the caller as an `EX`
/// reply of the form `(Kind)message`; [`RpcError::from_remote`] maps the
/// well-known kinds back onto their variants.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum RpcError {
    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("timeout: {operation}")]
    Timeout { operation: String },

    #[error("session not found: {token}")]
    SessionNotFound { token: String },

    #[error("signature mismatch: {message}")]
    SignatureMismatch { message: String },

    #[error("remote fault ({kind}): {message}")]
    RemoteFault { kind: String, message: String, location: Option<String> },

    #[error("channel fault: {message}")]
    ChannelFault { message: String },

    #[error("unsupported status: {status}")]
    UnsupportedStatus { status: String },

    #[error("cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("busy: all {ceiling} correlation ids are outstanding")]
    Busy { ceiling: u32 },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("registration error: {message}")]
    Registration { message: String },
}

impl RpcError {
    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Busy { .. })
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::SignatureMismatch { message: message.into() }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::ChannelFault { message: message.into() }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec { message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// A fault raised by service code, e.g. `RpcError::fault("NotSupported", "...")`.
    pub fn fault(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteFault { kind: kind.into(), message: message.into(), location: None }
    }

    /// Short type tag used in the `(Kind)message` wire form.
    pub fn kind(&self) -> &str {
        match self {
            Self::Protocol { .. } => "Protocol",
            Self::Timeout { .. } => "Timeout",
            Self::SessionNotFound { .. } => "SessionNotFound",
            Self::SignatureMismatch { .. } => "SignatureMismatch",
            Self::RemoteFault { kind, .. } => kind,
            Self::ChannelFault { .. } => "ChannelFault",
            Self::UnsupportedStatus { .. } => "UnsupportedStatus",
            Self::Cancelled { .. } => "Cancelled",
            Self::Busy { .. } => "Busy",
            Self::InvalidState { .. } => "InvalidState",
            Self::Codec { .. } => "Codec",
            Self::Registration { .. } => "Registration",
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Protocol { message }
            | Self::SignatureMismatch { message }
            | Self::ChannelFault { message }
            | Self::InvalidState { message }
            | Self::Codec { message }
            | Self::Registration { message }
            | Self::RemoteFault { message, .. } => message.clone(),
            Self::Timeout { operation } | Self::Cancelled { operation } => operation.clone(),
            Self::SessionNotFound { .. } => "Specified token is invalid".to_string(),
            Self::UnsupportedStatus { status } => status.clone(),
            Self::Busy { .. } => self.to_string(),
        }
    }

    /// Renders the `(Kind)message` text carried by an `EX` reply.
    pub fn to_wire(&self) -> String {
        format!("({}){}", self.kind(), self.detail())
    }

    /// Rebuilds an error from an `EX` reply. `token` is the session the call
    /// was made against.
    pub fn from_remote(text: &str, location: Option<&str>, token: Option<&str>) -> Self {
        let (kind, message) = split_fault(text);
        match kind {
            Some("SessionNotFound") => {
                Self::SessionNotFound { token: token.unwrap_or_default().to_string() }
            }
            Some("SignatureMismatch") => Self::mismatch(message),
            Some("Protocol") => Self::protocol(message),
            kind => Self::RemoteFault {
                kind: kind.unwrap_or("Remote").to_string(),
                message: message.to_string(),
                location: location.map(str::to_string),
            },
        }
    }
}

/// Splits `(Kind)message` into its parts; text without a tag is all message.
fn split_fault(text: &str) -> (Option<&str>, &str) {
    if let Some(rest) = text.strip_prefix('(') {
        if let Some(end) = rest.find(')') {
            let kind = &rest[..end];
            if !kind.is_empty() && !kind.contains(char::is_whitespace) {
                return (Some(kind), &rest[end + 1..]);
            }
        }
    }
    (None, text)
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        Self::protocol(err.to_string())
    }
}

impl From<rmpv::ext::Error> for RpcError {
    fn from(err: rmpv::ext::Error) -> Self {
        Self::codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_round_trips_known_kinds() {
        let err = RpcError::SessionNotFound { token: "abc".into() };
        assert_eq!(err.to_wire(), "(SessionNotFound)Specified token is invalid");
        assert_eq!(RpcError::from_remote(&err.to_wire(), None, Some("abc")), err);

        let err = RpcError::mismatch("no operation `Add(9) 9`");
        assert_eq!(RpcError::from_remote(&err.to_wire(), None, None), err);
    }

    #[test]
    fn service_faults_keep_kind_and_location() {
        let err =
            RpcError::from_remote("(NotSupported)cannot reverse", Some("/calc/Reverse()"), None);
        assert_eq!(
            err,
            RpcError::RemoteFault {
                kind: "NotSupported".into(),
                message: "cannot reverse".into(),
                location: Some("/calc/Reverse()".into()),
            }
        );
    }

    #[test]
    fn untagged_text_is_a_generic_remote_fault() {
        let err = RpcError::from_remote("Unknown stream token", None, None);
        assert_eq!(err.kind(), "Remote");
        assert!(err.to_string().contains("Unknown stream token"));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(RpcError::Timeout { operation: "EXE".into() }.is_retryable());
        assert!(RpcError::Busy { ceiling: 125 }.is_retryable());
        assert!(!RpcError::channel("closed").is_retryable());
        assert!(!RpcError::fault("Panic", "boom").is_retryable());
    }
}
