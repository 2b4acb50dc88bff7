/// Pipe-level errors for Beam.
///
/// Every failure surfaces to the owner of the pipe; nothing is retried
/// internally.
#[derive(Debug, thiserror::Error)]
pub enum BeamError {
    #[error("invalid secret: {reason}")]
    InvalidSecret { reason: String },

    #[error("no peer found for this secret")]
    PeerNotFound,

    #[error("rendezvous failed: {0}")]
    Rendezvous(#[source] anyhow::Error),

    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("pipe destroyed")]
    Destroyed,

    /// Write or finish after this side already finished. Not fatal.
    #[error("pipe already finished writing")]
    Finished,

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_secret() {
        let err = BeamError::InvalidSecret {
            reason: "unknown word: zzz".into(),
        };
        assert_eq!(err.to_string(), "invalid secret: unknown word: zzz");
    }

    #[test]
    fn test_display_peer_not_found() {
        assert_eq!(BeamError::PeerNotFound.to_string(), "no peer found for this secret");
    }

    #[test]
    fn test_display_rendezvous_keeps_source() {
        let err = BeamError::Rendezvous(anyhow::anyhow!("dht offline"));
        assert_eq!(err.to_string(), "rendezvous failed: dht offline");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_display_transport() {
        let err = BeamError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert_eq!(err.to_string(), "transport error: reset by peer");
    }

    #[test]
    fn test_display_finished() {
        assert_eq!(BeamError::Finished.to_string(), "pipe already finished writing");
    }
}
