//! Reliable broadcast configuration.

/// Channel used when none is configured.
pub const DEFAULT_CHANNEL: u16 = 1;

/// Per-engine settings. Cabinet and threshold are not part of this: they
/// change per epoch and travel with the [`Cabinet`](crate::broadcast::Cabinet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbcConfig {
    /// Channel id stamped into every message; traffic for other channels is dropped.
    pub channel: u16,

    /// Hold finalized messages until every lower sequence number from the
    /// same sender has been delivered.
    pub ordered_delivery: bool,
}

impl Default for RbcConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL,
            ordered_delivery: true,
        }
    }
}

impl RbcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel id.
    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = channel;
        self
    }

    /// Enable or disable per-sender ordered delivery.
    pub fn with_ordered_delivery(mut self, ordered: bool) -> Self {
        self.ordered_delivery = ordered;
        self
    }
}
