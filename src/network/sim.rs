//! Deterministic in-memory network.
//!
//! Frames are queued on send and only delivered when the owner of the
//! [`SimNetwork`] steps it, so a test decides exactly when and in what
//! order traffic moves. Filters can drop frames outright or hold them back
//! until released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::trace;

use super::{InboundHandler, Transport};
use crate::broadcast::cabinet::MemberId;
use crate::broadcast::message::{RbcMessage, WireFrame};
use crate::common::error::TransportError;

/// Upper bound on frames delivered by a single [`SimNetwork::run`].
const MAX_RUN_STEPS: usize = 1_000_000;

/// Predicate over `(from, to, message)`.
pub type PacketFilter = Box<dyn Fn(&MemberId, &MemberId, &RbcMessage) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Packet {
    pub from: MemberId,
    pub to: MemberId,
    pub bytes: Vec<u8>,
}

impl Packet {
    /// Decoded message, if the frame is well formed.
    pub fn message(&self) -> Option<RbcMessage> {
        WireFrame::decode(&self.bytes).ok().map(|frame| frame.message)
    }

    fn matches(&self, filter: &PacketFilter) -> bool {
        self.message()
            .map_or(false, |message| filter(&self.from, &self.to, &message))
    }
}

#[derive(Default)]
struct SimInner {
    endpoints: Vec<MemberId>,
    handlers: HashMap<MemberId, InboundHandler>,
    queue: VecDeque<Packet>,
    held: Vec<Packet>,
    drop_filters: Vec<PacketFilter>,
    hold_filters: Vec<PacketFilter>,
    history: Vec<Packet>,
    dropped: usize,
}

#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<SimInner>>,
}

pub struct SimEndpoint {
    id: MemberId,
    inner: Arc<Mutex<SimInner>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member to the network.
    pub fn endpoint(&self, id: MemberId) -> Arc<SimEndpoint> {
        let mut inner = self.inner.lock();
        if !inner.endpoints.contains(&id) {
            inner.endpoints.push(id.clone());
        }
        Arc::new(SimEndpoint {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Permanently drop every frame matching `filter`.
    pub fn drop_if(&self, filter: PacketFilter) {
        self.inner.lock().drop_filters.push(filter);
    }

    /// Hold back frames matching `filter` until [`release_held`](Self::release_held).
    pub fn hold_if(&self, filter: PacketFilter) {
        self.inner.lock().hold_filters.push(filter);
    }

    /// Requeue every held frame and stop holding new ones.
    pub fn release_held(&self) {
        let mut inner = self.inner.lock();
        inner.hold_filters.clear();
        let held = std::mem::take(&mut inner.held);
        inner.queue.extend(held);
    }

    /// Shuffle the frames currently in flight.
    pub fn shuffle(&self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut inner = self.inner.lock();
        inner.queue.make_contiguous().shuffle(&mut rng);
    }

    /// Deliver the next frame. Returns `false` once nothing is in flight.
    pub fn step(&self) -> bool {
        let (packet, handler) = {
            let mut inner = self.inner.lock();
            let Some(packet) = inner.queue.pop_front() else {
                return false;
            };

            if inner.drop_filters.iter().any(|filter| packet.matches(filter)) {
                trace!(from = %packet.from, to = %packet.to, "sim network dropped frame");
                inner.dropped += 1;
                return true;
            }

            if inner.hold_filters.iter().any(|filter| packet.matches(filter)) {
                inner.held.push(packet);
                return true;
            }

            inner.history.push(packet.clone());
            let handler = inner.handlers.get(&packet.to).cloned();
            (packet, handler)
        };

        // The handler sends through this network, so it runs unlocked.
        if let Some(handler) = handler {
            handler(&packet.from, &packet.bytes);
        }
        true
    }

    /// Deliver frames until the network is quiet. Returns the number of steps.
    pub fn run(&self) -> usize {
        let mut steps = 0;
        while steps < MAX_RUN_STEPS && self.step() {
            steps += 1;
        }
        steps
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn held(&self) -> usize {
        self.inner.lock().held.len()
    }

    pub fn dropped(&self) -> usize {
        self.inner.lock().dropped
    }

    /// Every frame handed to a handler so far, in delivery order.
    pub fn history(&self) -> Vec<Packet> {
        self.inner.lock().history.clone()
    }
}

impl Transport for SimEndpoint {
    fn send(&self, to: &MemberId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.endpoints.contains(to) {
            return Err(TransportError::UnknownPeer(to.to_string()));
        }
        inner.queue.push_back(Packet {
            from: self.id.clone(),
            to: to.clone(),
            bytes,
        });
        Ok(())
    }

    fn subscribe(&self, handler: InboundHandler) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.handlers.contains_key(&self.id) {
            return Err(TransportError::AlreadySubscribed);
        }
        inner.handlers.insert(self.id.clone(), handler);
        Ok(())
    }
}
