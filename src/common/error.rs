use thiserror::Error;

/// Configuration errors. Together with [`NodeError`] the only errors the
/// application must handle; everything that goes wrong while processing
/// peer traffic is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cabinet has no members")]
    EmptyCabinet,

    #[error("threshold {threshold} too large for {members} members (need n >= 3t + 1)")]
    ThresholdTooLarge { members: usize, threshold: usize },

    #[error("local identity is not a cabinet member")]
    NotAMember,
}

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode rbc frame: {0}")]
    Encode(bincode::Error),

    #[error("failed to decode rbc frame: {0}")]
    Decode(bincode::Error),
}

/// Best-effort delivery failures reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no route to peer {0}")]
    UnknownPeer(String),

    #[error("transport closed")]
    Closed,

    #[error("endpoint already has a subscriber")]
    AlreadySubscribed,

    #[error("no tokio runtime to drive the endpoint")]
    NoRuntime,
}

/// Errors from starting a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to subscribe to transport: {0}")]
    Transport(#[from] TransportError),
}
