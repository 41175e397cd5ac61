use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::cabinet::{Cabinet, MemberId, Rank};
use super::message::{KindFlag, MessageKind, RbcMessage, WireFrame};
use super::party::PartyState;
use super::record::{BroadcastRecord, PayloadUpdate, Phase};
use super::tag::{Sequence, Tag};
use crate::common::config::RbcConfig;
use crate::common::crypto::{self, Digest};
use crate::common::error::ConfigError;
use crate::network::Transport;

/// Application callback: `(original sender, payload)`.
pub type DeliverCallback = Arc<dyn Fn(&MemberId, &[u8]) + Send + Sync>;

/// Reliable broadcast engine for one member of a cabinet.
///
/// All protocol state sits behind one lock. Handlers only record what has
/// to happen (frames to send, messages to deliver); frames go out through
/// the transport and deliveries reach the application after the lock is
/// released.
pub struct RbcEngine {
    transport: Arc<dyn Transport>,
    on_deliver: DeliverCallback,
    state: Mutex<EngineState>,
    // Held by whichever thread is currently running delivery callbacks.
    delivering: Mutex<()>,
}

enum Outbound {
    All(RbcMessage),
    To(MemberId, RbcMessage),
}

/// Frames produced under the lock, with what is needed to send them once
/// it is released.
struct Outgoing {
    epoch: u64,
    // Every cabinet member except the local one.
    peers: Vec<MemberId>,
    frames: Vec<Outbound>,
}

struct Delivery {
    sender: MemberId,
    payload: Vec<u8>,
}

struct EngineState {
    id: MemberId,
    rank: Rank,
    cabinet: Cabinet,
    epoch: u64,
    config: RbcConfig,
    enabled: bool,
    // Last sequence number used by the local member.
    msg_counter: Sequence,
    broadcasts: HashMap<Tag, BroadcastRecord>,
    parties: Vec<PartyState>,
    delivered: HashSet<Tag>,
    outbox: Vec<Outbound>,
    deliveries: VecDeque<Delivery>,
}

impl RbcEngine {
    /// Create an engine for `id`. Fails if `id` is not in `cabinet`.
    pub fn new(
        id: MemberId,
        cabinet: Cabinet,
        config: RbcConfig,
        transport: Arc<dyn Transport>,
        on_deliver: DeliverCallback,
    ) -> Result<Self, ConfigError> {
        let state = EngineState::new(id, cabinet, config)?;
        Ok(RbcEngine {
            transport,
            on_deliver,
            state: Mutex::new(state),
            delivering: Mutex::new(()),
        })
    }

    /// Reliably broadcast `payload` to the cabinet under the next sequence
    /// number. Returns the tag used, or `None` if the engine is disabled or
    /// this epoch's sequence numbers are exhausted.
    pub fn broadcast(&self, payload: Vec<u8>) -> Option<Tag> {
        let (tag, outgoing) = {
            let mut state = self.state.lock();
            if !state.enabled {
                trace!(node = state.rank, "broadcast ignored while disabled");
                return None;
            }
            if state.msg_counter == Sequence::MAX {
                warn!(node = state.rank, "sequence numbers exhausted for this epoch");
                return None;
            }
            state.msg_counter += 1;

            let msg = RbcMessage::broadcast(
                state.config.channel,
                state.rank,
                state.msg_counter,
                payload,
            );
            let tag = msg.tag();
            debug!(node = state.rank, %tag, sequence = state.msg_counter, "broadcasting");

            state.outbox.push(Outbound::All(msg.clone()));
            let rank = state.rank;
            state.on_message(rank, msg);
            (tag, state.take_outgoing())
        };

        self.dispatch(outgoing);
        self.drain_deliveries();
        Some(tag)
    }

    /// Entry point for inbound traffic already decoded by the caller.
    /// The message is taken to belong to the current epoch.
    pub fn on_message(&self, from: &MemberId, msg: RbcMessage) {
        self.process(from, None, msg);
    }

    /// Entry point for raw frames from the transport.
    pub fn on_wire(&self, from: &MemberId, bytes: &[u8]) {
        match WireFrame::decode(bytes) {
            Ok(frame) => self.process(from, Some(frame.epoch), frame.message),
            Err(err) => warn!(%from, %err, "dropping undecodable frame"),
        }
    }

    /// Start a fresh epoch for `cabinet`, discarding all protocol state and
    /// restarting the local sequence at 1.
    pub fn reset_cabinet(&self, cabinet: Cabinet) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        state.reset(cabinet)
    }

    /// Pause or resume participation. Accumulated state is kept.
    pub fn enable(&self, enabled: bool) {
        let mut state = self.state.lock();
        debug!(node = state.rank, enabled, "rbc enable");
        state.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn rank(&self) -> Rank {
        self.state.lock().rank
    }

    pub fn cabinet(&self) -> Cabinet {
        self.state.lock().cabinet.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Sequence number the next local broadcast will use.
    pub fn next_sequence(&self) -> Option<Sequence> {
        self.state.lock().msg_counter.checked_add(1)
    }

    pub fn echo_tally(&self, tag: Tag, hash: &Digest) -> usize {
        self.state
            .lock()
            .broadcasts
            .get(&tag)
            .map_or(0, |record| record.echo_count(hash))
    }

    pub fn ready_tally(&self, tag: Tag, hash: &Digest) -> usize {
        self.state
            .lock()
            .broadcasts
            .get(&tag)
            .map_or(0, |record| record.ready_count(hash))
    }

    pub fn phase(&self, tag: Tag) -> Phase {
        let state = self.state.lock();
        let delivered = state.delivered.contains(&tag);
        state
            .broadcasts
            .get(&tag)
            .map_or(Phase::Unknown, |record| record.phase(delivered))
    }

    /// Whether `tag` has finalized. Finalized messages may still be waiting
    /// for an earlier sequence number before reaching the application.
    pub fn is_delivered(&self, tag: Tag) -> bool {
        self.state.lock().delivered.contains(&tag)
    }

    /// Finalized messages from `sender` held back by ordering.
    pub fn pending_len(&self, sender: Rank) -> usize {
        self.state
            .lock()
            .parties
            .get(sender as usize)
            .map_or(0, PartyState::pending_len)
    }

    fn process(&self, from: &MemberId, epoch: Option<u64>, msg: RbcMessage) {
        let outgoing = {
            let mut state = self.state.lock();
            if let Some(epoch) = epoch {
                if epoch != state.epoch {
                    trace!(node = state.rank, %from, epoch, "dropping frame from another epoch");
                    return;
                }
            }
            let Some(from_rank) = state.basic_message_check(from, &msg) else {
                return;
            };
            state.on_message(from_rank, msg);
            state.take_outgoing()
        };

        self.dispatch(outgoing);
        self.drain_deliveries();
    }

    /// Send queued frames. `All` fans out to the cabinet captured with the
    /// frames, so a reset racing with this call cannot widen the audience.
    fn dispatch(&self, outgoing: Outgoing) {
        let Outgoing {
            epoch,
            peers,
            frames,
        } = outgoing;

        for out in frames {
            let (target, message) = match out {
                Outbound::All(message) => (None, message),
                Outbound::To(member, message) => (Some(member), message),
            };

            let bytes = match (WireFrame { epoch, message }).encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%err, "failed to encode outbound frame");
                    continue;
                }
            };

            let targets = match &target {
                Some(member) => std::slice::from_ref(member),
                None => peers.as_slice(),
            };
            for to in targets {
                if let Err(err) = self.transport.send(to, bytes.clone()) {
                    warn!(%to, %err, "transport send failed");
                }
            }
        }
    }

    /// Hand queued deliveries to the application, one thread at a time so
    /// that per-sender order survives concurrent callers. The callback runs
    /// without the state lock and may call back into the engine.
    fn drain_deliveries(&self) {
        loop {
            let Some(guard) = self.delivering.try_lock() else {
                return;
            };

            loop {
                let next = self.state.lock().deliveries.pop_front();
                match next {
                    Some(delivery) => (self.on_deliver)(&delivery.sender, &delivery.payload),
                    None => break,
                }
            }
            drop(guard);

            // A delivery queued while we were releasing the guard would
            // otherwise wait for the next inbound message.
            if self.state.lock().deliveries.is_empty() {
                return;
            }
        }
    }
}

impl EngineState {
    fn new(id: MemberId, cabinet: Cabinet, config: RbcConfig) -> Result<Self, ConfigError> {
        let rank = cabinet.rank(&id).ok_or(ConfigError::NotAMember)?;
        Ok(EngineState {
            id,
            rank,
            epoch: cabinet.fingerprint(),
            parties: vec![PartyState::new(); cabinet.size()],
            cabinet,
            config,
            enabled: true,
            msg_counter: 0,
            broadcasts: HashMap::new(),
            delivered: HashSet::new(),
            outbox: Vec::new(),
            deliveries: VecDeque::new(),
        })
    }

    fn reset(&mut self, cabinet: Cabinet) -> Result<(), ConfigError> {
        let rank = cabinet.rank(&self.id).ok_or(ConfigError::NotAMember)?;
        debug!(
            node = rank,
            members = cabinet.size(),
            threshold = cabinet.threshold(),
            "resetting cabinet"
        );

        self.rank = rank;
        self.epoch = cabinet.fingerprint();
        self.parties = vec![PartyState::new(); cabinet.size()];
        self.cabinet = cabinet;
        self.msg_counter = 0;
        self.broadcasts.clear();
        self.delivered.clear();
        self.outbox.clear();
        Ok(())
    }

    fn take_outgoing(&mut self) -> Outgoing {
        let frames = std::mem::take(&mut self.outbox);
        let peers = if frames.is_empty() {
            Vec::new()
        } else {
            self.cabinet
                .members()
                .iter()
                .filter(|member| **member != self.id)
                .cloned()
                .collect()
        };
        Outgoing {
            epoch: self.epoch,
            peers,
            frames,
        }
    }

    /// Returns the rank of `from` if the message may be processed.
    fn basic_message_check(&self, from: &MemberId, msg: &RbcMessage) -> Option<Rank> {
        if !self.enabled {
            return None;
        }

        let Some(from_rank) = self.cabinet.rank(from) else {
            warn!(node = self.rank, %from, "message from unknown sender");
            return None;
        };

        if msg.channel != self.config.channel {
            warn!(node = self.rank, from = from_rank, channel = msg.channel, "message on wrong channel");
            return None;
        }

        if msg.sender as usize >= self.cabinet.size() {
            warn!(node = self.rank, from = from_rank, sender = msg.sender, "message with unknown sender rank");
            return None;
        }

        Some(from_rank)
    }

    fn on_message(&mut self, from: Rank, msg: RbcMessage) {
        trace!(node = self.rank, from, tag = %msg.tag(), kind = ?msg.flag(), "received");
        match &msg.kind {
            MessageKind::Broadcast { payload } => self.on_broadcast(&msg, payload, from),
            MessageKind::Echo { hash } => self.on_echo(&msg, *hash, from),
            MessageKind::Ready { hash } => self.on_ready(&msg, *hash, from),
            MessageKind::Request => self.on_request(&msg, from),
            MessageKind::Answer { payload } => self.on_answer(&msg, payload, from),
        }
    }

    /// Record the first (from, tag, kind) and reject repeats.
    fn set_party_flag(&mut self, from: Rank, tag: Tag, flag: KindFlag) -> bool {
        let fresh = self.parties[from as usize].mark_seen(tag, flag);
        if !fresh {
            warn!(node = self.rank, from, %tag, kind = ?flag, "repeated message");
        }
        fresh
    }

    fn on_broadcast(&mut self, msg: &RbcMessage, payload: &[u8], from: Rank) {
        let tag = msg.tag();
        if !self.set_party_flag(from, tag, KindFlag::Broadcast) {
            return;
        }

        if msg.sender != from {
            warn!(node = self.rank, from, sender = msg.sender, %tag, "broadcast relayed by non-originator");
            return;
        }

        let record = self.broadcasts.entry(tag).or_default();
        if let Some(quorum_hash) = record.quorum_hash() {
            if crypto::hash(payload) != *quorum_hash {
                warn!(node = self.rank, from, %tag, "broadcast does not match ready quorum");
                return;
            }
        }

        let update = record.set_payload(payload);
        if update == PayloadUpdate::Conflict {
            warn!(node = self.rank, from, %tag, "broadcast conflicts with known payload");
            return;
        }
        // The ready quorum may have formed before the payload arrived.
        let completes = update == PayloadUpdate::Stored && record.quorum_hash().is_some();
        let first_echo = record.mark_echoed();

        if first_echo {
            let echo = msg.echo_for(payload);
            self.outbox.push(Outbound::All(echo.clone()));
            let rank = self.rank;
            self.on_message(rank, echo);
        }
        if completes {
            self.finalize(msg.sender, msg.sequence, tag);
        }
    }

    fn on_echo(&mut self, msg: &RbcMessage, hash: Digest, from: Rank) {
        let tag = msg.tag();
        if !self.set_party_flag(from, tag, KindFlag::Echo) {
            return;
        }

        let echo_quorum = self.cabinet.echo_quorum();
        let record = self.broadcasts.entry(tag).or_default();
        let echoes = record.add_echo(hash);
        if echoes >= echo_quorum && record.mark_ready_sent() {
            trace!(node = self.rank, %tag, echoes, "echo quorum");
            self.send_ready(msg, hash);
        }
    }

    fn on_ready(&mut self, msg: &RbcMessage, hash: Digest, from: Rank) {
        let tag = msg.tag();
        if !self.set_party_flag(from, tag, KindFlag::Ready) {
            return;
        }

        let amplify_quorum = self.cabinet.amplify_quorum();
        let record = self.broadcasts.entry(tag).or_default();
        let readies = record.add_ready(hash);
        if readies >= amplify_quorum && record.mark_ready_sent() {
            trace!(node = self.rank, %tag, readies, "ready amplification");
            // Our own Ready is counted by the nested call, which also runs
            // the delivery check.
            self.send_ready(msg, hash);
            return;
        }

        if readies >= self.cabinet.ready_quorum() {
            self.on_ready_quorum(msg, hash);
        }
    }

    fn send_ready(&mut self, msg: &RbcMessage, hash: Digest) {
        let ready = msg.ready(hash);
        self.outbox.push(Outbound::All(ready.clone()));
        let rank = self.rank;
        self.on_message(rank, ready);
    }

    fn on_ready_quorum(&mut self, msg: &RbcMessage, hash: Digest) {
        let tag = msg.tag();
        if self.delivered.contains(&tag) {
            return;
        }

        let rank = self.rank;
        let record = self.broadcasts.entry(tag).or_default();
        match record.quorum_hash().copied() {
            Some(known) if known != hash => {
                warn!(node = rank, %tag, "second hash reached ready quorum");
                return;
            }
            Some(_) => {}
            None => record.set_quorum_hash(hash),
        }

        if record.payload_matches(&hash) {
            self.finalize(msg.sender, msg.sequence, tag);
            return;
        }

        if record.payload().is_some() {
            warn!(node = rank, %tag, "stored payload does not match ready quorum");
            record.clear_payload();
        }

        if record.mark_requested() {
            debug!(node = rank, %tag, "requesting missing payload");
            self.outbox.push(Outbound::All(msg.request()));
        }
    }

    fn on_request(&mut self, msg: &RbcMessage, from: Rank) {
        let tag = msg.tag();
        if !self.set_party_flag(from, tag, KindFlag::Request) {
            return;
        }

        let Some(payload) = self.broadcasts.get(&tag).and_then(BroadcastRecord::payload) else {
            trace!(node = self.rank, from, %tag, "cannot answer request");
            return;
        };
        let Some(requester) = self.cabinet.member(from).cloned() else {
            return;
        };

        trace!(node = self.rank, from, %tag, "answering request");
        let answer = msg.answer(payload.to_vec());
        self.outbox.push(Outbound::To(requester, answer));
    }

    fn on_answer(&mut self, msg: &RbcMessage, payload: &[u8], from: Rank) {
        let tag = msg.tag();
        let awaiting = self
            .broadcasts
            .get(&tag)
            .map_or(false, |record| record.quorum_hash().is_some() && record.payload().is_none());
        if !awaiting {
            trace!(node = self.rank, from, %tag, "ignoring unsolicited answer");
            return;
        }

        if !self.set_party_flag(from, tag, KindFlag::Answer) {
            return;
        }

        let rank = self.rank;
        let Some(record) = self.broadcasts.get_mut(&tag) else {
            return;
        };
        let Some(&quorum_hash) = record.quorum_hash() else {
            return;
        };

        if crypto::hash(payload) != quorum_hash {
            warn!(node = rank, from, %tag, "answer does not match ready quorum");
            return;
        }

        record.set_payload(payload);
        debug!(node = rank, from, %tag, "recovered payload");
        self.finalize(msg.sender, msg.sequence, tag);
    }

    fn finalize(&mut self, sender: Rank, sequence: Sequence, tag: Tag) {
        if !self.delivered.insert(tag) {
            return;
        }

        if !self.config.ordered_delivery {
            self.queue_delivery(sender, tag);
            return;
        }

        let party = &mut self.parties[sender as usize];
        if !party.hold(sequence, tag) {
            warn!(
                node = self.rank,
                sender,
                sequence,
                cursor = party.deliver_cursor(),
                %tag,
                "finalized message behind delivery cursor"
            );
            return;
        }
        let ready = party.release();
        if ready.is_empty() {
            debug!(node = self.rank, sender, sequence, "holding message until earlier sequences deliver");
        }
        for tag in ready {
            self.queue_delivery(sender, tag);
        }
    }

    fn queue_delivery(&mut self, sender: Rank, tag: Tag) {
        let payload = self
            .broadcasts
            .get(&tag)
            .and_then(BroadcastRecord::payload)
            .map(<[u8]>::to_vec);
        let (Some(payload), Some(member)) = (payload, self.cabinet.member(sender).cloned()) else {
            warn!(node = self.rank, sender, %tag, "finalized message without payload");
            return;
        };

        debug!(node = self.rank, sender, %tag, "delivered");
        self.deliveries.push_back(Delivery {
            sender: member,
            payload,
        });
    }
}
