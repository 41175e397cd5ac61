use std::collections::HashMap;

use crate::common::crypto::{self, Digest};

/// Where a tag stands from the local member's point of view. Variants are
/// declared in protocol order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Phase {
    Unknown,
    Echoed,
    /// Ready quorum reached, waiting for a payload that matches it.
    ReadyPending,
    ReadySent,
    Delivered,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PayloadUpdate {
    Stored,
    Duplicate,
    Conflict,
}

/// Bookkeeping for a single tag.
#[derive(Debug, Default, Clone)]
pub struct BroadcastRecord {
    payload: Option<Vec<u8>>,
    hash: Option<Digest>,
    echo_count_by_hash: HashMap<Digest, usize>,
    ready_count_by_hash: HashMap<Digest, usize>,
    // Hash that reached ready quorum; the payload must match it to be delivered.
    quorum_hash: Option<Digest>,
    echoed: bool,
    ready_sent: bool,
    requested: bool,
}

impl BroadcastRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Store the payload unless one is already known.
    pub fn set_payload(&mut self, payload: &[u8]) -> PayloadUpdate {
        match &self.payload {
            None => {
                self.hash = Some(crypto::hash(payload));
                self.payload = Some(payload.to_vec());
                PayloadUpdate::Stored
            }
            Some(known) if known.as_slice() == payload => PayloadUpdate::Duplicate,
            Some(_) => PayloadUpdate::Conflict,
        }
    }

    pub fn clear_payload(&mut self) {
        self.payload = None;
        self.hash = None;
    }

    pub fn payload_matches(&self, hash: &Digest) -> bool {
        self.hash.as_ref() == Some(hash)
    }

    pub fn add_echo(&mut self, hash: Digest) -> usize {
        let count = self.echo_count_by_hash.entry(hash).or_insert(0);
        *count += 1;
        *count
    }

    pub fn add_ready(&mut self, hash: Digest) -> usize {
        let count = self.ready_count_by_hash.entry(hash).or_insert(0);
        *count += 1;
        *count
    }

    pub fn echo_count(&self, hash: &Digest) -> usize {
        self.echo_count_by_hash.get(hash).copied().unwrap_or(0)
    }

    pub fn ready_count(&self, hash: &Digest) -> usize {
        self.ready_count_by_hash.get(hash).copied().unwrap_or(0)
    }

    /// Returns `true` the first time only.
    pub fn mark_echoed(&mut self) -> bool {
        !std::mem::replace(&mut self.echoed, true)
    }

    /// Returns `true` the first time only.
    pub fn mark_ready_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.ready_sent, true)
    }

    /// Returns `true` the first time only.
    pub fn mark_requested(&mut self) -> bool {
        !std::mem::replace(&mut self.requested, true)
    }

    pub fn set_quorum_hash(&mut self, hash: Digest) {
        self.quorum_hash = Some(hash);
    }

    pub fn quorum_hash(&self) -> Option<&Digest> {
        self.quorum_hash.as_ref()
    }

    pub fn phase(&self, delivered: bool) -> Phase {
        if delivered {
            Phase::Delivered
        } else if self.quorum_hash.is_some() {
            Phase::ReadyPending
        } else if self.ready_sent {
            Phase::ReadySent
        } else if self.echoed {
            Phase::Echoed
        } else {
            Phase::Unknown
        }
    }
}
