//! Mesh Coordinator: the API the presentation layer talks to. Owns the session registry and
//! wires discovery, sessions and the catalog together.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mesh_core::{
    ArtifactId, CatalogEntry, MeshError, Message, Offer, PeerDescriptor, PeerId, SessionId,
    TransferSession,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::catalog::Catalog;
use crate::discovery::{PeerEvent, PeerTable, RemovalReason};
use crate::generation::GenerationResponse;
use crate::session::{Driver, SessionConfig, SessionHandle};
use crate::transport::{Connector, FrameChannel, Listener};

/// Finished sessions kept for `session`/`sessions` before pruning.
const MAX_RETAINED: usize = 256;
const SESSION_EVENT_CAPACITY: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Coordinator<C: Connector> {
    local: PeerId,
    catalog: Arc<Catalog>,
    peers: Arc<PeerTable>,
    connector: C,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    new_sessions: broadcast::Sender<SessionHandle>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Coordinator<C> {
    /// Build a coordinator and start its peer-loss watcher. Must run inside a Tokio runtime.
    pub fn new(
        catalog: Arc<Catalog>,
        peers: Arc<PeerTable>,
        connector: C,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (new_sessions, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let this = Arc::new(Self {
            local: peers.local_peer().clone(),
            catalog,
            peers,
            connector,
            config,
            sessions: Mutex::new(HashMap::new()),
            new_sessions,
            watcher: Mutex::new(None),
        });
        let task = spawn_peer_watch(Arc::downgrade(&this), this.peers.subscribe());
        *this.watcher.lock() = Some(task);
        this
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn list_peers(&self) -> Arc<[PeerDescriptor]> {
        self.peers.snapshot()
    }

    pub fn subscribe_peers(&self) -> broadcast::Receiver<PeerEvent> {
        self.peers.subscribe()
    }

    /// Every session registered from now on, local or opened by a peer.
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionHandle> {
        self.new_sessions.subscribe()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Request cancellation. False if the session had already ended.
    pub fn cancel(&self, id: SessionId) -> Result<bool, MeshError> {
        let handle = self
            .session(id)
            .ok_or_else(|| MeshError::NotFound(format!("session {id}")))?;
        Ok(handle.cancel())
    }

    /// Register a session unless its (peer, artifact) pair already has a live one.
    fn register(&self, handle: &SessionHandle) -> Result<(), MeshError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&handle.id()) {
            return Err(MeshError::Conflict(format!("session {} already exists", handle.id())));
        }
        let busy = sessions.values().any(|s| {
            s.peer_id() == handle.peer_id()
                && s.artifact_id() == handle.artifact_id()
                && !s.is_terminal()
        });
        if busy {
            return Err(MeshError::already_in_progress());
        }
        if sessions.len() >= MAX_RETAINED {
            sessions.retain(|_, s| !s.is_terminal());
        }
        sessions.insert(handle.id(), handle.clone());
        let _ = self.new_sessions.send(handle.clone());
        Ok(())
    }

    /// Pull an artifact a peer advertises. Validation is synchronous; the transfer runs in
    /// its own task.
    pub fn request_download(
        self: &Arc<Self>,
        peer_id: &PeerId,
        artifact_id: &ArtifactId,
    ) -> Result<SessionHandle, MeshError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| MeshError::NotFound(format!("peer {peer_id}")))?;
        let summary = peer
            .advertised_artifact(artifact_id)
            .cloned()
            .ok_or_else(|| {
                MeshError::NotFound(format!("artifact {artifact_id} not advertised by {peer_id}"))
            })?;
        if self.catalog.contains(artifact_id) {
            return Err(MeshError::Conflict(format!(
                "artifact {artifact_id} already in catalog"
            )));
        }
        let session = TransferSession::download(
            SessionId::new(),
            peer_id.clone(),
            artifact_id.clone(),
            Some(summary),
        );
        let (driver, handle) = Driver::new(session, self.config.clone(), self.local.clone());
        self.register(&handle)?;
        tracing::info!(
            session_id = %handle.id(),
            peer_id = %peer_id,
            artifact_id = %artifact_id,
            "download requested"
        );
        let this = self.clone();
        tokio::spawn(async move {
            driver.download(&this.connector, &this.catalog).await;
        });
        Ok(handle)
    }

    /// Push a catalog artifact to a known peer.
    pub fn request_upload(
        self: &Arc<Self>,
        peer_id: &PeerId,
        artifact_id: &ArtifactId,
    ) -> Result<SessionHandle, MeshError> {
        if self.peers.get(peer_id).is_none() {
            return Err(MeshError::NotFound(format!("peer {peer_id}")));
        }
        if !self.catalog.contains(artifact_id) {
            return Err(MeshError::NotFound(format!("artifact {artifact_id}")));
        }
        let session =
            TransferSession::upload(SessionId::new(), peer_id.clone(), artifact_id.clone());
        let (driver, handle) = Driver::new(session, self.config.clone(), self.local.clone());
        self.register(&handle)?;
        tracing::info!(
            session_id = %handle.id(),
            peer_id = %peer_id,
            artifact_id = %artifact_id,
            "upload requested"
        );
        let this = self.clone();
        tokio::spawn(async move {
            driver.push(&this.connector, &this.catalog).await;
        });
        Ok(handle)
    }

    /// Save a generated artifact into the catalog.
    pub async fn import_generated(
        &self,
        response: GenerationResponse,
        language: &str,
    ) -> Result<CatalogEntry, MeshError> {
        let (meta, payload) = response.into_artifact(language)?;
        self.catalog.save(&payload, meta).await
    }

    /// Accept channels opened by peers until the listener fails for good.
    pub async fn serve<L: Listener>(self: Arc<Self>, mut listener: L) {
        loop {
            match listener.accept().await {
                Ok(channel) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_inbound(channel).await });
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::info!("listener closed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, mut channel: FrameChannel) {
        let first = match tokio::time::timeout(self.config.idle_timeout, channel.recv()).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                tracing::debug!(remote = channel.remote(), error = %e, "inbound channel closed");
                return;
            }
            Err(_) => {
                tracing::debug!(remote = channel.remote(), "inbound channel idle");
                return;
            }
        };
        match first {
            Message::Request {
                session_id,
                from,
                artifact_id,
            } => self.serve_request(channel, session_id, from, artifact_id).await,
            Message::Offer {
                session_id,
                from,
                offer,
            } => self.receive_push(channel, session_id, from, offer).await,
            other => {
                tracing::warn!(
                    remote = channel.remote(),
                    kind = other.kind(),
                    "unexpected opening frame"
                );
                channel.close().await;
            }
        }
    }

    async fn serve_request(
        &self,
        mut channel: FrameChannel,
        session_id: SessionId,
        from: PeerId,
        artifact_id: ArtifactId,
    ) {
        if !self.catalog.contains(&artifact_id) {
            let reason = format!("artifact {artifact_id} not found");
            return reject(&mut channel, session_id, &from, reason).await;
        }
        let session = TransferSession::upload(session_id, from.clone(), artifact_id.clone());
        let (driver, handle) = Driver::new(session, self.config.clone(), self.local.clone());
        if let Err(e) = self.register(&handle) {
            return reject(&mut channel, session_id, &from, e.to_string()).await;
        }
        tracing::info!(
            session_id = %session_id,
            peer_id = %from,
            artifact_id = %artifact_id,
            "serving request"
        );
        driver.serve_request(channel, &self.catalog).await;
    }

    async fn receive_push(
        &self,
        mut channel: FrameChannel,
        session_id: SessionId,
        from: PeerId,
        offer: Offer,
    ) {
        let artifact_id = offer.artifact.id.clone();
        if !self.config.accept_pushes {
            return reject(&mut channel, session_id, &from, "pushes disabled".into()).await;
        }
        if self.catalog.contains(&artifact_id) {
            let reason = format!("artifact {artifact_id} already in catalog");
            return reject(&mut channel, session_id, &from, reason).await;
        }
        let advertised = self
            .peers
            .get(&from)
            .and_then(|p| p.advertised_artifact(&artifact_id).cloned());
        let session = TransferSession::download(session_id, from.clone(), artifact_id, advertised);
        let (driver, handle) = Driver::new(session, self.config.clone(), self.local.clone());
        if let Err(e) = self.register(&handle) {
            return reject(&mut channel, session_id, &from, e.to_string()).await;
        }
        tracing::info!(
            session_id = %session_id,
            peer_id = %from,
            artifact_id = %handle.artifact_id(),
            bytes = offer.size_bytes,
            "accepting push"
        );
        driver.receive_push(channel, offer, &self.catalog).await;
    }

    /// Fail live sessions with a peer discovery has expired.
    fn peer_expired(&self, peer_id: &PeerId) {
        let affected: Vec<SessionHandle> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.peer_id() == peer_id && !s.is_terminal())
            .cloned()
            .collect();
        for handle in affected {
            if handle.peer_lost() {
                tracing::warn!(
                    session_id = %handle.id(),
                    peer_id = %peer_id,
                    "peer lost mid-session"
                );
            }
        }
    }
}

impl<C: Connector> Drop for Coordinator<C> {
    fn drop(&mut self) {
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
    }
}

async fn reject(channel: &mut FrameChannel, session_id: SessionId, from: &PeerId, reason: String) {
    tracing::warn!(session_id = %session_id, peer_id = %from, %reason, "rejecting inbound session");
    let msg = Message::Reject { session_id, reason };
    if let Err(e) = channel.send(&msg).await {
        tracing::debug!(error = %e, "reject not delivered");
    }
    channel.close().await;
}

fn spawn_peer_watch<C: Connector>(
    coordinator: Weak<Coordinator<C>>,
    mut events: broadcast::Receiver<PeerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PeerEvent::Removed {
                    peer_id,
                    reason: RemovalReason::Expired,
                }) => {
                    let Some(this) = coordinator.upgrade() else {
                        return;
                    };
                    this.peer_expired(&peer_id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "peer events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use mesh_core::{ArtifactSummary, Role, SignalQuality};
    use tempfile::TempDir;

    fn hub_descriptor(artifacts: Vec<ArtifactSummary>) -> PeerDescriptor {
        PeerDescriptor {
            peer_id: "hub-001".into(),
            display_name: "Hub".into(),
            role: Role::Hub,
            signal_quality: SignalQuality::Good,
            advertised: artifacts,
        }
    }

    async fn receiver(
        tmp: &TempDir,
        net: &MemoryNetwork,
    ) -> Arc<Coordinator<crate::transport::MemoryConnector>> {
        let catalog = Arc::new(Catalog::open(tmp.path()).await.unwrap());
        let peers = Arc::new(PeerTable::new("rx-1".into(), Duration::from_secs(16)));
        Coordinator::new(catalog, peers, net.connector("rx-1"), SessionConfig::default())
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let coordinator = receiver(&tmp, &MemoryNetwork::new()).await;
        let err = coordinator
            .request_download(&"hub-001".into(), &ArtifactId::new("pdf-001").unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, MeshError::NotFound(_)));
    }

    #[tokio::test]
    async fn unadvertised_artifact_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let coordinator = receiver(&tmp, &MemoryNetwork::new()).await;
        coordinator.peers.observe(hub_descriptor(Vec::new()));
        let err = coordinator
            .request_download(&"hub-001".into(), &ArtifactId::new("pdf-001").unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, MeshError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let coordinator = receiver(&tmp, &MemoryNetwork::new()).await;
        assert!(matches!(
            coordinator.cancel(SessionId::new()),
            Err(MeshError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_fails_session() {
        let tmp = TempDir::new().unwrap();
        let coordinator = receiver(&tmp, &MemoryNetwork::new()).await;
        let id = ArtifactId::new("pdf-001").unwrap();
        coordinator.peers.observe(hub_descriptor(vec![ArtifactSummary {
            id: id.clone(),
            title: "Fractions".into(),
            size_bytes: 10,
        }]));
        let handle = coordinator.request_download(&"hub-001".into(), &id).unwrap();
        let done = handle.wait().await;
        assert!(matches!(
            done.error,
            Some(mesh_core::FailureReason::Unreachable(_))
        ));
        assert!(coordinator.session(handle.id()).unwrap().is_terminal());
        // The pair is free again.
        assert!(coordinator.request_download(&"hub-001".into(), &id).is_ok());
    }

    #[tokio::test]
    async fn generated_worksheet_is_imported_once() {
        let tmp = TempDir::new().unwrap();
        let coordinator = receiver(&tmp, &MemoryNetwork::new()).await;
        let json = r#"{"success": true, "pdf_id": "3f2a9c1e", "title": "Volcanoes",
            "subject": "science", "grade": "5", "created_at": "2024-03-01T09:30:15",
            "pdf_base64": "JVBERi0xLjQ=", "message": "ok"}"#;
        let response: GenerationResponse = serde_json::from_str(json).unwrap();

        let entry = coordinator
            .import_generated(response.clone(), "en")
            .await
            .unwrap();
        assert_eq!(entry.size_bytes, 8);
        assert_eq!(entry.meta.language, "en");
        assert_eq!(coordinator.catalog().summaries()[0].title, "Volcanoes");
        assert!(matches!(
            coordinator.import_generated(response, "en").await,
            Err(MeshError::Conflict(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_fails_session() {
        let tmp = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        net.set_unresponsive("hub-001");
        let coordinator = receiver(&tmp, &net).await;
        let id = ArtifactId::new("pdf-001").unwrap();
        coordinator.peers.observe(hub_descriptor(vec![ArtifactSummary {
            id: id.clone(),
            title: "Fractions".into(),
            size_bytes: 10,
        }]));
        let handle = coordinator.request_download(&"hub-001".into(), &id).unwrap();
        let done = handle.wait().await;
        assert_eq!(done.error, Some(mesh_core::FailureReason::Timeout));
    }
}
