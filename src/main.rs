/*
    Reliable broadcast lets a member send a message to a cabinet of n members
    such that, with at most t < n / 3 of them Byzantine, either every honest
    member delivers the same message or none does, and an honest sender's
    message is always delivered.

    This binary runs a four member cabinet in one process over tokio channels.
    Every member broadcasts one message and logs what it delivers.
*/

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use simple_rbc::broadcast::{Cabinet, MemberId};
use simple_rbc::common::crypto::Keypair;
use simple_rbc::common::RbcConfig;
use simple_rbc::network::{ChannelNetwork, Node};

const CABINET_SIZE: usize = 4;
const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let keys: Vec<Keypair> = (0..CABINET_SIZE).map(|_| Keypair::new_pair()).collect();
    let cabinet = match Cabinet::with_max_threshold(keys.iter().map(Keypair::member_id)) {
        Ok(cabinet) => cabinet,
        Err(err) => {
            warn!(%err, "invalid cabinet");
            return;
        }
    };
    info!(members = cabinet.size(), threshold = cabinet.threshold(), "cabinet ready");

    let network = ChannelNetwork::new();
    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();

    let mut nodes = Vec::new();
    for key in &keys {
        let id = key.member_id();
        let delivered_tx = delivered_tx.clone();
        let receiver = id.clone();
        let node = Node::start(
            id.clone(),
            cabinet.clone(),
            RbcConfig::default(),
            network.endpoint(id),
            Arc::new(move |sender: &MemberId, payload: &[u8]| {
                let _ = delivered_tx.send((receiver.clone(), sender.clone(), payload.to_vec()));
            }),
        );
        match node {
            Ok(node) => nodes.push(node),
            Err(err) => {
                warn!(%err, "failed to start node");
                return;
            }
        }
    }
    drop(delivered_tx);

    for node in &nodes {
        let payload = format!("hello from {}", node.id).into_bytes();
        if let Some(tag) = node.engine().broadcast(payload) {
            info!(member = %node.id, %tag, "broadcast");
        }
    }

    let expected = CABINET_SIZE * CABINET_SIZE;
    let mut count = 0;
    let collect = async {
        while let Some((receiver, sender, payload)) = delivered_rx.recv().await {
            count += 1;
            info!(
                member = %receiver,
                %sender,
                payload = %String::from_utf8_lossy(&payload),
                "delivered"
            );
            if count == expected {
                break;
            }
        }
    };

    if tokio::time::timeout(DEADLINE, collect).await.is_err() {
        warn!(count, expected, "timed out waiting for deliveries");
        return;
    }
    info!(count, "all members delivered every broadcast");
}
