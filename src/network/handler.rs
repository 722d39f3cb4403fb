//! Message dispatch
//!
//! Inbound messages are routed by [`MessageKind`] through a registry that is
//! built once when the node is created and never mutated afterwards.

use crate::network::error::P2pError;
use crate::network::message::{BlockResponse, Message, MessageKind};
use crate::network::node::{Node, NodeEvent};
use crate::network::peers::PeerHandle;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;

/// Most blocks returned for a single request
pub const MAX_BLOCKS_PER_RESPONSE: u32 = 128;

/// Handler entry point
pub type HandlerFunc = for<'a> fn(
    &'a Node,
    &'a Arc<dyn PeerHandle>,
    &'a Message,
) -> BoxFuture<'a, Result<(), P2pError>>;

/// An inbound message together with the peer it came from
#[derive(Clone)]
pub struct OnMessage {
    pub peer: Arc<dyn PeerHandle>,
    pub message: Message,
}

/// A handler bound to the message kind it processes
#[derive(Clone, Copy)]
pub struct Handler {
    pub kind: MessageKind,
    pub func: HandlerFunc,
}

/// Immutable kind → handler table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Handler>,
}

impl HandlerRegistry {
    /// Registry with no handlers
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style registration under `kind`.
    ///
    /// The handler is stored under `kind` even if it declares another kind;
    /// dispatch rejects such entries.
    pub fn with(mut self, kind: MessageKind, handler: Handler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<&Handler> {
        self.handlers.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered for the message's kind.
    ///
    /// The handler's own error is returned unchanged.
    pub async fn dispatch(
        &self,
        node: &Node,
        peer: &Arc<dyn PeerHandle>,
        message: &Message,
    ) -> Result<(), P2pError> {
        let kind = message.kind();
        let handler = self.get(kind).ok_or(P2pError::NoHandler(kind))?;

        if handler.kind != kind {
            return Err(P2pError::WrongHandler {
                registered: handler.kind,
                message: kind,
            });
        }

        log::debug!("Dispatching {:?} from {}", kind, peer.get_id());
        (handler.func)(node, peer, message).await
    }
}

/// Registry carrying a handler for every message kind
pub fn default_registry() -> HandlerRegistry {
    let entries: [(MessageKind, HandlerFunc); 5] = [
        (MessageKind::Status, handle_status),
        (MessageKind::BlockRequest, handle_block_request),
        (MessageKind::BlockResponse, forward_to_events),
        (MessageKind::BlockAnnounce, forward_to_events),
        (MessageKind::Transactions, forward_to_events),
    ];

    entries
        .into_iter()
        .fold(HandlerRegistry::empty(), |registry, (kind, func)| {
            registry.with(kind, Handler { kind, func })
        })
}

fn handle_status<'a>(
    _node: &'a Node,
    peer: &'a Arc<dyn PeerHandle>,
    message: &'a Message,
) -> BoxFuture<'a, Result<(), P2pError>> {
    async move {
        if let Message::Status(status) = message {
            log::debug!(
                "Peer {} at block #{} ({})",
                peer.get_id(),
                status.best_number,
                status.best_hash
            );
            peer.set_status(status.clone()).await;
        }
        Ok(())
    }
    .boxed()
}

fn handle_block_request<'a>(
    node: &'a Node,
    peer: &'a Arc<dyn PeerHandle>,
    message: &'a Message,
) -> BoxFuture<'a, Result<(), P2pError>> {
    async move {
        let Message::BlockRequest(req) = message else {
            return Ok(());
        };

        let max = req.max.min(MAX_BLOCKS_PER_RESPONSE);
        let blocks = node.chain().blocks(req.from, max).await;
        log::debug!(
            "Serving {} blocks from #{} to {}",
            blocks.len(),
            req.from,
            peer.get_id()
        );

        peer.send(Message::BlockResponse(BlockResponse { id: req.id, blocks }))
            .await
    }
    .boxed()
}

fn forward_to_events<'a>(
    node: &'a Node,
    peer: &'a Arc<dyn PeerHandle>,
    message: &'a Message,
) -> BoxFuture<'a, Result<(), P2pError>> {
    async move {
        node.emit(NodeEvent::Message {
            peer: peer.get_id(),
            message: message.clone(),
        });
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::config::{ClientConfig, P2pConfig};
    use crate::network::dial_queue::tests::StubPeer;
    use crate::network::message::{BlockRequest, StatusMessage, PROTOCOL_VERSION};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    static STATUS_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting<'a>(
        _node: &'a Node,
        _peer: &'a Arc<dyn PeerHandle>,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), P2pError>> {
        async move {
            assert_eq!(message.kind(), MessageKind::Status);
            STATUS_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn failing<'a>(
        _node: &'a Node,
        _peer: &'a Arc<dyn PeerHandle>,
        _message: &'a Message,
    ) -> BoxFuture<'a, Result<(), P2pError>> {
        async move { Err(P2pError::Disconnected) }.boxed()
    }

    fn node() -> (Node, mpsc::Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let node = Node::new(
            CancellationToken::new(),
            tx,
            Some(ClientConfig::with_p2p(P2pConfig::generate())),
            Some(Arc::new(MemoryChain::new())),
        )
        .unwrap();
        (node, rx)
    }

    fn status() -> Message {
        Message::Status(StatusMessage {
            version: PROTOCOL_VERSION,
            best_number: 42,
            best_hash: "ab".into(),
            genesis_hash: "00".into(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler_once() {
        let (node, _rx) = node();
        let peer: Arc<dyn PeerHandle> = StubPeer::new();
        let registry = HandlerRegistry::empty().with(
            MessageKind::Status,
            Handler {
                kind: MessageKind::Status,
                func: counting,
            },
        );

        let before = STATUS_CALLS.load(Ordering::SeqCst);
        registry.dispatch(&node, &peer, &status()).await.unwrap();
        assert_eq!(STATUS_CALLS.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn test_dispatch_unregistered_kind() {
        let (node, _rx) = node();
        let peer: Arc<dyn PeerHandle> = StubPeer::new();
        let registry = HandlerRegistry::empty();

        assert!(matches!(
            registry.dispatch(&node, &peer, &status()).await,
            Err(P2pError::NoHandler(MessageKind::Status))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_wrong_handler() {
        let (node, _rx) = node();
        let peer: Arc<dyn PeerHandle> = StubPeer::new();
        let registry = HandlerRegistry::empty().with(
            MessageKind::Status,
            Handler {
                kind: MessageKind::Transactions,
                func: failing,
            },
        );

        assert!(matches!(
            registry.dispatch(&node, &peer, &status()).await,
            Err(P2pError::WrongHandler {
                registered: MessageKind::Transactions,
                message: MessageKind::Status,
            })
        ));
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let (node, _rx) = node();
        let peer: Arc<dyn PeerHandle> = StubPeer::new();
        let registry = HandlerRegistry::empty().with(
            MessageKind::Transactions,
            Handler {
                kind: MessageKind::Transactions,
                func: failing,
            },
        );

        assert!(matches!(
            registry
                .dispatch(&node, &peer, &Message::Transactions(vec![]))
                .await,
            Err(P2pError::Disconnected)
        ));
    }

    #[test]
    fn test_default_registry_is_complete() {
        let registry = default_registry();
        assert_eq!(registry.len(), MessageKind::ALL.len());
        for kind in MessageKind::ALL {
            assert_eq!(registry.get(kind).map(|h| h.kind), Some(kind));
        }
    }

    #[tokio::test]
    async fn test_status_recorded_on_peer() {
        let (node, _rx) = node();
        let stub = StubPeer::new();
        let peer: Arc<dyn PeerHandle> = stub.clone();

        default_registry()
            .dispatch(&node, &peer, &status())
            .await
            .unwrap();
        assert_eq!(stub.status().await.map(|s| s.best_number), Some(42));
    }

    #[tokio::test]
    async fn test_block_request_answered() {
        let (node, _rx) = node();
        let stub = StubPeer::new();
        let peer: Arc<dyn PeerHandle> = stub.clone();
        let msg = Message::BlockRequest(BlockRequest {
            id: 3,
            from: 0,
            max: 10,
        });

        default_registry().dispatch(&node, &peer, &msg).await.unwrap();
        assert_eq!(stub.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forwarded_to_events() {
        let (node, mut rx) = node();
        let peer: Arc<dyn PeerHandle> = StubPeer::new();
        let msg = Message::Transactions(vec![vec![7]]);

        default_registry().dispatch(&node, &peer, &msg).await.unwrap();
        match rx.recv().await {
            Some(NodeEvent::Message { peer: from, message }) => {
                assert_eq!(from, peer.get_id());
                assert_eq!(message, msg);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
