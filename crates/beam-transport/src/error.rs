use std::net::SocketAddr;

use crate::PublicKey;

/// Errors returned by the Beam transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("remote identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        expected: PublicKey,
        actual: PublicKey,
    },

    #[error("remote {0} rejected by firewall")]
    Rejected(PublicKey),

    #[error("handshake timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_rejected() {
        let key = PublicKey::from_bytes([0xab; 32]);
        let err = TransportError::Rejected(key);
        assert_eq!(
            err.to_string(),
            format!("remote {} rejected by firewall", "ab".repeat(32))
        );
    }

    #[test]
    fn test_display_timeout() {
        assert_eq!(TransportError::Timeout.to_string(), "handshake timed out");
    }
}
