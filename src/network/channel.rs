use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

use super::{InboundHandler, Transport};
use crate::broadcast::cabinet::MemberId;
use crate::common::error::TransportError;

type Inbound = (MemberId, Vec<u8>);

/// In-process network over tokio channels. Each endpoint owns an
/// unbounded inbox drained by a task spawned on `subscribe`.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    routes: Arc<RwLock<HashMap<MemberId, UnboundedSender<Inbound>>>>,
}

pub struct ChannelEndpoint {
    id: MemberId,
    routes: Arc<RwLock<HashMap<MemberId, UnboundedSender<Inbound>>>>,
    inbox: Mutex<Option<UnboundedReceiver<Inbound>>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member, replacing any earlier endpoint with the same id.
    pub fn endpoint(&self, id: MemberId) -> Arc<ChannelEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(id.clone(), tx);
        Arc::new(ChannelEndpoint {
            id,
            routes: Arc::clone(&self.routes),
            inbox: Mutex::new(Some(rx)),
        })
    }

    /// Detach a member. Frames addressed to it fail with `UnknownPeer`.
    pub fn disconnect(&self, id: &MemberId) {
        self.routes.write().remove(id);
    }
}

impl Transport for ChannelEndpoint {
    fn send(&self, to: &MemberId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let routes = self.routes.read();
        let route = routes
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        route
            .send((self.id.clone(), bytes))
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self, handler: InboundHandler) -> Result<(), TransportError> {
        // Checked first so that a failed call leaves the inbox in place.
        let runtime = Handle::try_current().map_err(|_| {
            warn!(member = %self.id, "subscribe called outside a tokio runtime");
            TransportError::NoRuntime
        })?;

        let taken = self.inbox.lock().take();
        let Some(mut inbox) = taken else {
            return Err(TransportError::AlreadySubscribed);
        };

        trace!(member = %self.id, "endpoint subscribed");
        runtime.spawn(async move {
            while let Some((from, bytes)) = inbox.recv().await {
                handler(&from, &bytes);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    #[tokio::test]
    async fn test_send_reaches_subscriber() {
        let network = ChannelNetwork::new();
        let a = network.endpoint(MemberId::from("a"));
        let b = network.endpoint(MemberId::from("b"));

        let (seen_tx, mut seen_rx) = unbounded_channel();
        b.subscribe(Arc::new(move |from: &MemberId, bytes: &[u8]| {
            seen_tx.send((from.clone(), bytes.to_vec())).unwrap();
        }))
        .unwrap();

        a.send(&MemberId::from("b"), b"ping".to_vec()).unwrap();

        let (from, bytes) = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, MemberId::from("a"));
        assert_eq!(bytes, b"ping".to_vec());
    }

    #[tokio::test]
    async fn test_second_subscribe_and_disconnect() {
        let network = ChannelNetwork::new();
        let a = network.endpoint(MemberId::from("a"));
        let _b = network.endpoint(MemberId::from("b"));

        a.subscribe(Arc::new(|_: &MemberId, _: &[u8]| {})).unwrap();
        assert_eq!(
            a.subscribe(Arc::new(|_: &MemberId, _: &[u8]| {})),
            Err(TransportError::AlreadySubscribed)
        );

        assert!(a.send(&MemberId::from("b"), Vec::new()).is_ok());
        network.disconnect(&MemberId::from("b"));
        assert!(matches!(
            a.send(&MemberId::from("b"), Vec::new()),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_subscribe_outside_runtime_fails() {
        let network = ChannelNetwork::new();
        let a = network.endpoint(MemberId::from("a"));

        assert_eq!(
            a.subscribe(Arc::new(|_: &MemberId, _: &[u8]| {})),
            Err(TransportError::NoRuntime)
        );
        // The inbox is still there for a later attempt.
        assert!(a.inbox.lock().is_some());
    }
}
