use std::fmt;

use super::cabinet::Rank;

/// Per-sender message sequence number. Sequences start at 1.
pub type Sequence = u8;

pub const FIRST_SEQUENCE: Sequence = 1;

/// Identifies one (channel, sender, sequence) message slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u64);

/*
    Bit layout, most significant first:

        | unused (8) | channel (16) | sender rank (32) | sequence (8) |

    Fields occupy disjoint ranges, so the mapping is injective over the
    whole input domain.
*/
const SEQUENCE_BITS: u32 = Sequence::BITS;
const RANK_BITS: u32 = Rank::BITS;

pub struct TagCodec;

impl TagCodec {
    pub fn encode(channel: u16, sender: Rank, sequence: Sequence) -> Tag {
        let value = ((channel as u64) << (RANK_BITS + SEQUENCE_BITS))
            | ((sender as u64) << SEQUENCE_BITS)
            | sequence as u64;
        Tag(value)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:#016x})", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
