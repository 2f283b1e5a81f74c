use serde::Serialize;

/// Lifecycle of a bytestream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamState {
    /// Open request in flight
    Opening,

    /// Data may flow both ways
    Open,

    /// Local close sent, waiting for the peer's answer
    Closing,

    /// Terminal; the stream is no longer registered
    Closed,
}

impl StreamState {
    /// Whether the stream still belongs in the multiplexer registry
    pub fn is_registered(&self) -> bool {
        !matches!(self, StreamState::Closed)
    }

    /// Whether inbound data is accepted in this state
    pub fn accepts_data(&self) -> bool {
        matches!(
            self,
            StreamState::Opening | StreamState::Open | StreamState::Closing
        )
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Opening => "opening",
            StreamState::Open => "open",
            StreamState::Closing => "closing",
            StreamState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_closed_leaves_registry() {
        assert!(StreamState::Opening.is_registered());
        assert!(StreamState::Open.is_registered());
        assert!(StreamState::Closing.is_registered());
        assert!(!StreamState::Closed.is_registered());
        assert!(!StreamState::Closed.accepts_data());
    }
}
