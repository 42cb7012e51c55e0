//! The mesh replicator: link ownership, fan-out, and relay discipline.
//!
//! One replicator wraps one store. It owns every peer link — sockets the
//! peer accepted (served links) and sockets it opened (dialer links) —
//! and is the only component talking to the network; everything it
//! receives is routed through the store.
//!
//! Relay rules: local updates go to every link; an update received on a
//! link is relayed to the other *served* links only, and only when the
//! merge actually changed local state. Dialed links never relay. Combined
//! with origin suppression and merge idempotence this bounds flooding:
//! a message that merges to a no-op stops travelling.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, info, warn};

use pluresdb_core::{Store, StoreEvent};

use crate::message::MeshMessage;

/// Per-link outbound queue bound; a full queue drops frames, and the next
/// sync request restores convergence.
const SEND_QUEUE_CAPACITY: usize = 256;

/// Whether this peer accepted the link or opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Served,
    Dialer,
}

struct PeerLink {
    role: LinkRole,
    tx: mpsc::Sender<MeshMessage>,
}

struct ReplicatorInner {
    store: Store,
    links: DashMap<u64, PeerLink>,
    next_link_id: AtomicU64,
    debug: bool,
}

/// Cheaply cloneable handle to the replication mesh of one peer.
#[derive(Clone)]
pub struct MeshReplicator {
    inner: Arc<ReplicatorInner>,
}

impl std::fmt::Debug for MeshReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshReplicator")
            .field("peer_id", &self.inner.store.peer_id())
            .field("links", &self.inner.links.len())
            .finish()
    }
}

/// Running accept loop returned by [`MeshReplicator::serve`].
pub struct MeshServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MeshServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Existing links keep running until
    /// their sockets close.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl MeshReplicator {
    /// Wraps `store` and starts forwarding its outbound events to every
    /// link.
    pub fn new(store: Store) -> Self {
        let debug = store.debug_enabled();
        let replicator = Self {
            inner: Arc::new(ReplicatorInner {
                store,
                links: DashMap::new(),
                next_link_id: AtomicU64::new(1),
                debug,
            }),
        };
        replicator.spawn_event_pump();
        replicator
    }

    pub fn peer_id(&self) -> &str {
        self.inner.store.peer_id()
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }

    /// Accepts inbound peer connections at `ws://{addr}/sync`.
    pub async fn serve(&self, addr: SocketAddr) -> anyhow::Result<MeshServer> {
        let app = Router::new()
            .route("/sync", get(ws_handler))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(peer_id = %self.peer_id(), %local_addr, "mesh replicator serving");
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("mesh server stopped: {err}");
            }
        });
        Ok(MeshServer { local_addr, handle })
    }

    /// Opens an outbound link to a peer URL (e.g. `ws://host:port/sync`)
    /// and immediately requests its state.
    pub async fn dial(&self, url: &str) -> anyhow::Result<()> {
        let (socket, _response) = connect_async(url).await?;
        info!(peer_id = %self.peer_id(), url, "dialed mesh peer");

        let (link_id, rx) = self.register_link(LinkRole::Dialer);
        self.send_to_link(
            link_id,
            MeshMessage::SyncRequest {
                origin_id: self.peer_id().to_string(),
            },
        );

        let replicator = self.clone();
        tokio::spawn(async move {
            replicator.run_dialer_link(link_id, socket, rx).await;
        });
        Ok(())
    }

    // -- link plumbing ------------------------------------------------------

    fn register_link(&self, role: LinkRole) -> (u64, mpsc::Receiver<MeshMessage>) {
        let link_id = self.inner.next_link_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        self.inner.links.insert(link_id, PeerLink { role, tx });
        (link_id, rx)
    }

    fn drop_link(&self, link_id: u64) {
        self.inner.links.remove(&link_id);
        if self.inner.debug {
            debug!(link_id, "mesh link removed");
        }
    }

    async fn run_served_link(self, socket: WebSocket) {
        let (link_id, mut rx) = self.register_link(LinkRole::Served);
        if self.inner.debug {
            debug!(link_id, "accepted mesh link");
        }
        // Request the dialer's state so a fresh connection exchanges both
        // ways: the dialer's own sync request covers the other direction.
        self.send_to_link(
            link_id,
            MeshMessage::SyncRequest {
                origin_id: self.peer_id().to_string(),
            },
        );

        let (mut sink, mut stream) = socket.split();
        let pump = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.handle_frame(link_id, text.as_str()).await,
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.drop_link(link_id);
        pump.abort();
    }

    async fn run_dialer_link(
        self,
        link_id: u64,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut rx: mpsc::Receiver<MeshMessage>,
    ) {
        let (mut sink, mut stream) = socket.split();
        let pump = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if sink.send(TungsteniteMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(TungsteniteMessage::Text(text)) => {
                    self.handle_frame(link_id, text.as_str()).await
                }
                Ok(TungsteniteMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.drop_link(link_id);
        pump.abort();
    }

    // -- inbound ------------------------------------------------------------

    async fn handle_frame(&self, link_id: u64, raw: &str) {
        let Ok(message) = serde_json::from_str::<MeshMessage>(raw) else {
            debug!(link_id, "ignoring unparseable mesh frame");
            return;
        };
        self.handle_message(link_id, message).await;
    }

    async fn handle_message(&self, link_id: u64, message: MeshMessage) {
        if message.origin_id() == self.peer_id()
            && !matches!(message, MeshMessage::SyncRequest { .. })
        {
            // Our own update came back around; drop it.
            return;
        }
        match message {
            MeshMessage::Put { origin_id, node } => {
                if self.inner.debug {
                    debug!(link_id, origin = %origin_id, id = %node.id, "mesh put received");
                }
                match self.inner.store.apply_remote(node.clone()).await {
                    Ok(true) => self.relay(link_id, MeshMessage::Put { origin_id, node }),
                    Ok(false) => {}
                    Err(err) => warn!(link_id, "remote put rejected: {err}"),
                }
            }
            MeshMessage::Delete { origin_id, id } => {
                if self.inner.debug {
                    debug!(link_id, origin = %origin_id, %id, "mesh delete received");
                }
                match self.inner.store.apply_remote_delete(&id).await {
                    Ok(true) => self.relay(link_id, MeshMessage::Delete { origin_id, id }),
                    Ok(false) => {}
                    Err(err) => warn!(link_id, "remote delete rejected: {err}"),
                }
            }
            MeshMessage::SyncRequest { origin_id } => {
                if self.inner.debug {
                    debug!(link_id, origin = %origin_id, "sync request received");
                }
                match self.inner.store.list().await {
                    Ok(records) => {
                        for node in records {
                            self.send_to_link(
                                link_id,
                                MeshMessage::Put {
                                    origin_id: self.peer_id().to_string(),
                                    node,
                                },
                            );
                        }
                    }
                    Err(err) => warn!(link_id, "cannot answer sync request: {err}"),
                }
            }
        }
    }

    // -- outbound -----------------------------------------------------------

    fn spawn_event_pump(&self) {
        let replicator = self.clone();
        // Subscribe before the task is spawned so no event published after
        // construction can slip past the pump.
        let mut events = replicator.inner.store.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::Put { node }) => replicator.send_to_all(MeshMessage::Put {
                        origin_id: replicator.peer_id().to_string(),
                        node,
                    }),
                    Ok(StoreEvent::Delete { id }) => {
                        replicator.send_to_all(MeshMessage::Delete {
                            origin_id: replicator.peer_id().to_string(),
                            id,
                        })
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "outbound event stream lagged; frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Local updates go to every link, whatever its role.
    fn send_to_all(&self, message: MeshMessage) {
        for entry in self.inner.links.iter() {
            self.enqueue(*entry.key(), entry.value(), message.clone());
        }
    }

    /// Received updates are relayed to the other served links only, never
    /// back to their source.
    fn relay(&self, source_link: u64, message: MeshMessage) {
        for entry in self.inner.links.iter() {
            if *entry.key() == source_link || entry.value().role != LinkRole::Served {
                continue;
            }
            self.enqueue(*entry.key(), entry.value(), message.clone());
        }
    }

    fn send_to_link(&self, link_id: u64, message: MeshMessage) {
        if let Some(link) = self.inner.links.get(&link_id) {
            self.enqueue(link_id, link.value(), message);
        }
    }

    fn enqueue(&self, link_id: u64, link: &PeerLink, message: MeshMessage) {
        match link.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Bounded queue; the frame is dropped and reconciliation
                // happens on the next sync request.
                debug!(link_id, "send queue full; mesh frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn ws_handler(
    State(replicator): State<MeshReplicator>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| replicator.run_served_link(socket))
}
