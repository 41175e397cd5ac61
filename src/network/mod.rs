pub mod channel;
pub mod node;
pub mod sim;

pub use channel::*;
pub use node::*;
pub use sim::*;

use std::sync::Arc;

use crate::broadcast::cabinet::MemberId;
use crate::common::error::TransportError;

/*
    The engine assumes nothing about delivery: frames may be lost,
    duplicated or reordered. Lost Broadcasts are recovered through
    Request/Answer, duplicates are filtered per sender and kind, and
    reordering only affects when a message finalizes, never the order in
    which one sender's messages are handed to the application.
*/

/// Inbound dispatch callback: `(from, frame bytes)`.
pub type InboundHandler = Arc<dyn Fn(&MemberId, &[u8]) + Send + Sync>;

/// Point-to-point delivery between cabinet members.
///
/// Sends are best effort and must not block: implementations queue the
/// frame and return.
pub trait Transport: Send + Sync {
    /// Deliver `bytes` to a single member. Fan-out to the cabinet is the
    /// engine's job, since only it knows the current membership.
    fn send(&self, to: &MemberId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Register the inbound handler. Fails if the transport cannot start
    /// delivering to it.
    fn subscribe(&self, handler: InboundHandler) -> Result<(), TransportError>;
}
