use std::collections::{BTreeMap, HashMap};

use super::message::KindFlag;
use super::tag::{Sequence, Tag, FIRST_SEQUENCE};

/// What the local member knows about one cabinet member.
///
/// Flags are keyed by the tag *and* by this member acting as the relay, so
/// a member gets exactly one Echo, one Ready, one Request and one Answer
/// counted per tag. Delivery state refers to broadcasts this member
/// originated.
#[derive(Debug, Clone)]
pub struct PartyState {
    seen_kinds: HashMap<Tag, u8>,
    // Wider than Sequence so that delivering sequence 255 does not wrap.
    deliver_cursor: u16,
    pending: BTreeMap<Sequence, Tag>,
}

impl Default for PartyState {
    fn default() -> Self {
        Self::new()
    }
}

impl PartyState {
    pub fn new() -> Self {
        PartyState {
            seen_kinds: HashMap::new(),
            deliver_cursor: FIRST_SEQUENCE as u16,
            pending: BTreeMap::new(),
        }
    }

    /// Record that a message of `flag` kind arrived for `tag`.
    /// Returns `false` if one was already recorded.
    pub fn mark_seen(&mut self, tag: Tag, flag: KindFlag) -> bool {
        let flags = self.seen_kinds.entry(tag).or_insert(0);
        if *flags & flag.bit() != 0 {
            return false;
        }
        *flags |= flag.bit();
        true
    }

    pub fn deliver_cursor(&self) -> u16 {
        self.deliver_cursor
    }

    /// Park a finalized message until it is next in line.
    /// Returns `false` for sequences already behind the cursor or already parked.
    pub fn hold(&mut self, sequence: Sequence, tag: Tag) -> bool {
        if (sequence as u16) < self.deliver_cursor || self.pending.contains_key(&sequence) {
            return false;
        }
        self.pending.insert(sequence, tag);
        true
    }

    /// Take every parked message that is now contiguous with the cursor,
    /// in sequence order, advancing the cursor past them.
    pub fn release(&mut self) -> Vec<Tag> {
        let mut ready = Vec::new();
        while let Ok(next) = Sequence::try_from(self.deliver_cursor) {
            match self.pending.remove(&next) {
                Some(tag) => {
                    ready.push(tag);
                    self.deliver_cursor += 1;
                }
                None => break,
            }
        }
        ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
