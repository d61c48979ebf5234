use thiserror::Error;

/// Per-connection failure classes. Each maps to the WebSocket close code the
/// client is sent during teardown; none of them escape the connection task.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed framing from the client: bad VLESS header, bad early data,
    /// UDP on a port other than 53, a text frame on the binary channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client UUID did not match the configured one.
    #[error("authentication failed")]
    Auth,

    /// Dial, read or write failure on the upstream side (TCP or DoH).
    #[error("upstream error: {0}")]
    Upstream(#[source] std::io::Error),

    /// The client side closed or aborted; a normal way for a relay to end.
    #[error("client closed: {0}")]
    Client(#[source] std::io::Error),

    /// Anything that should not happen in a healthy process.
    #[error("internal error: {0}")]
    Internal(String),
}

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

impl RelayError {
    pub fn close_code(&self) -> u16 {
        match self {
            RelayError::Protocol(_) => CLOSE_PROTOCOL_ERROR,
            RelayError::Auth => CLOSE_POLICY_VIOLATION,
            RelayError::Upstream(_) => CLOSE_INTERNAL_ERROR,
            RelayError::Client(_) => CLOSE_NORMAL,
            RelayError::Internal(_) => CLOSE_INTERNAL_ERROR,
        }
    }

    pub fn is_client_close(&self) -> bool {
        matches!(self, RelayError::Client(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(
            RelayError::Protocol("bad header".to_string()).close_code(),
            CLOSE_PROTOCOL_ERROR
        );
        assert_eq!(RelayError::Auth.close_code(), CLOSE_POLICY_VIOLATION);
        assert_eq!(
            RelayError::Upstream(std::io::Error::other("dial")).close_code(),
            CLOSE_INTERNAL_ERROR
        );
        assert_eq!(
            RelayError::Client(std::io::Error::other("reset")).close_code(),
            CLOSE_NORMAL
        );
    }
}
