use std::sync::{Arc, Weak};

use tracing::info;

use super::Transport;
use crate::broadcast::cabinet::{Cabinet, MemberId};
use crate::broadcast::engine::{DeliverCallback, RbcEngine};
use crate::common::config::RbcConfig;
use crate::common::error::NodeError;

/// A cabinet member: an engine subscribed to its transport.
pub struct Node {
    pub id: MemberId,
    engine: Arc<RbcEngine>,
}

impl Node {
    /// Build the engine and route the transport's inbound frames into it.
    /// Fails if `id` is not in `cabinet` or the transport refuses the
    /// subscription.
    pub fn start(
        id: MemberId,
        cabinet: Cabinet,
        config: RbcConfig,
        transport: Arc<dyn Transport>,
        on_deliver: DeliverCallback,
    ) -> Result<Self, NodeError> {
        let engine = Arc::new(RbcEngine::new(
            id.clone(),
            cabinet,
            config,
            Arc::clone(&transport),
            on_deliver,
        )?);

        // Weak, so that engine -> transport -> handler is not a cycle.
        let inbound: Weak<RbcEngine> = Arc::downgrade(&engine);
        transport.subscribe(Arc::new(move |from: &MemberId, bytes: &[u8]| {
            if let Some(engine) = inbound.upgrade() {
                engine.on_wire(from, bytes);
            }
        }))?;

        info!(member = %id, rank = engine.rank(), "rbc node started");
        Ok(Node { id, engine })
    }

    pub fn engine(&self) -> &Arc<RbcEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::common::error::TransportError;
    use crate::network::ChannelNetwork;

    type Log = Arc<Mutex<Vec<(MemberId, Vec<u8>)>>>;

    const MEMBERS: usize = 4;
    const ROUNDS: u8 = 8;

    fn ids() -> Vec<MemberId> {
        (0..MEMBERS)
            .map(|index| MemberId::new(format!("member-{index}")))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end() {
        let network = ChannelNetwork::new();
        let ids = ids();
        let cabinet = Cabinet::with_max_threshold(ids.clone()).unwrap();

        // Every route exists before any member starts sending.
        let endpoints: Vec<_> = ids.iter().map(|id| network.endpoint(id.clone())).collect();

        let mut nodes = Vec::new();
        let mut logs: Vec<Log> = Vec::new();
        for (id, endpoint) in ids.iter().zip(endpoints) {
            let log: Log = Arc::default();
            let sink = Arc::clone(&log);
            let node = Node::start(
                id.clone(),
                cabinet.clone(),
                RbcConfig::default(),
                endpoint,
                Arc::new(move |sender: &MemberId, payload: &[u8]| {
                    sink.lock().push((sender.clone(), payload.to_vec()));
                }),
            )
            .unwrap();
            nodes.push(node);
            logs.push(log);
        }

        let mut senders = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            let engine = Arc::clone(node.engine());
            senders.push(tokio::spawn(async move {
                for round in 0..ROUNDS {
                    assert!(engine.broadcast(vec![index as u8, round]).is_some());
                    tokio::task::yield_now().await;
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let expected = MEMBERS * ROUNDS as usize;
        tokio::time::timeout(Duration::from_secs(10), async {
            while logs.iter().any(|log| log.lock().len() < expected) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Give any duplicate delivery a chance to show up.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for (receiver, log) in logs.iter().enumerate() {
            let log = log.lock();
            assert_eq!(log.len(), expected, "member {receiver}");
            for (sender, id) in ids.iter().enumerate() {
                let from_sender: Vec<Vec<u8>> = log
                    .iter()
                    .filter(|(from, _)| from == id)
                    .map(|(_, payload)| payload.clone())
                    .collect();
                let in_order: Vec<Vec<u8>> =
                    (0..ROUNDS).map(|round| vec![sender as u8, round]).collect();
                assert_eq!(from_sender, in_order, "member {receiver} sender {sender}");
            }
        }
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let network = ChannelNetwork::new();
        let ids = ids();
        let cabinet = Cabinet::with_max_threshold(ids.clone()).unwrap();

        let result = Node::start(
            ids[0].clone(),
            cabinet,
            RbcConfig::default(),
            network.endpoint(ids[0].clone()),
            Arc::new(|_: &MemberId, _: &[u8]| {}),
        );
        assert!(matches!(
            result,
            Err(NodeError::Transport(TransportError::NoRuntime))
        ));
    }

    #[test]
    fn test_start_rejects_non_member() {
        let network = ChannelNetwork::new();
        let cabinet = Cabinet::with_max_threshold(ids()).unwrap();
        let stranger = MemberId::from("stranger");

        let result = Node::start(
            stranger.clone(),
            cabinet,
            RbcConfig::default(),
            network.endpoint(stranger),
            Arc::new(|_: &MemberId, _: &[u8]| {}),
        );
        assert!(matches!(
            result,
            Err(NodeError::Config(crate::common::error::ConfigError::NotAMember))
        ));
    }
}
