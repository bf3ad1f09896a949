use crate::audio::DecodeError;

/// WebSocket close code for a request the server will not serve (RFC 6455 1003).
pub const CLOSE_UNSUPPORTED: u16 = 1003;
/// Close code for an abnormal server-side failure.
pub const CLOSE_INTERNAL: u16 = 1011;
/// Close code telling the client to try again later.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Failure taxonomy for a relay connection.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A single malformed audio payload. The frame is dropped, the session continues.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// Bad backend or sample-rate selection, fatal at bootstrap.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Missing credentials or an unreachable backend, fatal at bootstrap.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// One leg of the connection dropped.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Only decode errors are recoverable within a session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Decode(_))
    }

    /// The WebSocket close code used when this error ends a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            RelayError::Configuration(_) | RelayError::Decode(_) => CLOSE_UNSUPPORTED,
            RelayError::BackendUnavailable(_) => CLOSE_TRY_AGAIN_LATER,
            RelayError::Transport(_) => CLOSE_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::BackendUnavailable("OPENAI_API_KEY is not set".into());
        assert_eq!(err.to_string(), "backend unavailable: OPENAI_API_KEY is not set");

        let err: RelayError = DecodeError::OddByteLength(5).into();
        assert_eq!(err.to_string(), "decode error: PCM16 payload has odd byte length 5");
    }

    #[test]
    fn test_fatality_and_close_codes() {
        let decode: RelayError = DecodeError::OddByteLength(1).into();
        assert!(!decode.is_fatal());
        assert!(RelayError::Configuration("x".into()).is_fatal());
        assert_eq!(RelayError::Configuration("x".into()).close_code(), 1003);
        assert_eq!(RelayError::BackendUnavailable("x".into()).close_code(), 1013);
        assert_eq!(RelayError::Transport("x".into()).close_code(), 1011);
    }
}
