use serde::{Deserialize, Serialize};

use super::cabinet::Rank;
use super::tag::{Sequence, Tag, TagCodec};
use crate::common::crypto::{self, Digest};
use crate::common::error::CodecError;

/*
    Bracha reliable broadcast, as run per tag:

    1. the sender sends <broadcast, m> to everyone
    2. on <broadcast, m> from the sender, send <echo, H(m)> to everyone
    3. on n - t <echo, h>, send <ready, h> if not already sent
    4. on t + 1 <ready, h>, send <ready, h> if not already sent
    5. on 2t + 1 <ready, h>, deliver m once H(m) = h is known

    A member that reaches step 5 without m asks with <request> and takes the
    first <answer, m'> with H(m') = h.
*/

/// One RBC protocol message. `sender` is the rank of the member that
/// originated the broadcast, not of whoever relayed this message.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RbcMessage {
    pub channel: u16,
    pub sender: Rank,
    pub sequence: Sequence,
    pub kind: MessageKind,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum MessageKind {
    Broadcast { payload: Vec<u8> },
    Echo { hash: Digest },
    Ready { hash: Digest },
    Request,
    Answer { payload: Vec<u8> },
}

/// Kind discriminant, used for per-party dedup flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum KindFlag {
    Broadcast,
    Echo,
    Ready,
    Request,
    Answer,
}

impl KindFlag {
    pub fn bit(self) -> u8 {
        match self {
            KindFlag::Broadcast => 1 << 0,
            KindFlag::Echo => 1 << 1,
            KindFlag::Ready => 1 << 2,
            KindFlag::Request => 1 << 3,
            KindFlag::Answer => 1 << 4,
        }
    }
}

impl MessageKind {
    pub fn flag(&self) -> KindFlag {
        match self {
            MessageKind::Broadcast { .. } => KindFlag::Broadcast,
            MessageKind::Echo { .. } => KindFlag::Echo,
            MessageKind::Ready { .. } => KindFlag::Ready,
            MessageKind::Request => KindFlag::Request,
            MessageKind::Answer { .. } => KindFlag::Answer,
        }
    }
}

impl RbcMessage {
    pub fn broadcast(channel: u16, sender: Rank, sequence: Sequence, payload: Vec<u8>) -> Self {
        RbcMessage {
            channel,
            sender,
            sequence,
            kind: MessageKind::Broadcast { payload },
        }
    }

    /// Echo vote for the payload of `self`, which must be a Broadcast.
    pub fn echo_for(&self, payload: &[u8]) -> Self {
        self.with_kind(MessageKind::Echo {
            hash: crypto::hash(payload),
        })
    }

    pub fn ready(&self, hash: Digest) -> Self {
        self.with_kind(MessageKind::Ready { hash })
    }

    pub fn request(&self) -> Self {
        self.with_kind(MessageKind::Request)
    }

    pub fn answer(&self, payload: Vec<u8>) -> Self {
        self.with_kind(MessageKind::Answer { payload })
    }

    fn with_kind(&self, kind: MessageKind) -> Self {
        RbcMessage {
            channel: self.channel,
            sender: self.sender,
            sequence: self.sequence,
            kind,
        }
    }

    pub fn tag(&self) -> Tag {
        TagCodec::encode(self.channel, self.sender, self.sequence)
    }

    pub fn flag(&self) -> KindFlag {
        self.kind.flag()
    }
}

/// What goes over the wire: a message stamped with the sender's epoch.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WireFrame {
    pub epoch: u64,
    pub message: RbcMessage,
}

impl WireFrame {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_messages_share_tag() {
        let broadcast = RbcMessage::broadcast(3, 2, 9, b"payload".to_vec());
        let echo = broadcast.echo_for(b"payload");

        assert_eq!(echo.tag(), broadcast.tag());
        assert_eq!(echo.kind, MessageKind::Echo { hash: crypto::hash(b"payload") });
        assert_eq!(broadcast.request().tag(), broadcast.tag());
        assert_eq!(broadcast.request().flag(), KindFlag::Request);
    }

    #[test]
    fn test_flag_bits_are_distinct() {
        let flags = [
            KindFlag::Broadcast,
            KindFlag::Echo,
            KindFlag::Ready,
            KindFlag::Request,
            KindFlag::Answer,
        ];
        let combined = flags.iter().fold(0u8, |acc, flag| {
            assert_eq!(acc & flag.bit(), 0);
            acc | flag.bit()
        });
        assert_eq!(combined.count_ones(), 5);
    }

    #[test]
    fn test_wire_frame_decode() {
        let frame = WireFrame {
            epoch: 42,
            message: RbcMessage::broadcast(1, 0, 1, b"hello".to_vec()).ready([7u8; 32]),
        };
        let bytes = frame.encode().unwrap();

        assert_eq!(WireFrame::decode(&bytes).unwrap(), frame);
        assert!(WireFrame::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(WireFrame::decode(&[0xff; 3]).is_err());
    }
}
