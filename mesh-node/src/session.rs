//! Session drivers: run one `TransferSession` over a framed channel.
//!
//! One task per session. The task owns the state machine, so progress leaves it in order.
//! Cancellation and peer loss arrive through a `watch` signal and are observed between
//! chunks and while waiting for the next frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_core::chunk::{split_into_chunks, DEFAULT_CHUNK_SIZE};
use mesh_core::{
    integrity, ArtifactId, ChunkOutcome, Direction, FailureReason, MeshError, Message, Offer,
    PeerId, Progress, SessionError, SessionId, SessionState, TransferSession,
};
use tokio::sync::{broadcast, watch};

use crate::catalog::Catalog;
use crate::transport::{Connector, FrameChannel};

const PROGRESS_CAPACITY: usize = 1024;
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Chunk size offered when this device sends.
    pub chunk_size: u32,
    pub connect_timeout: Duration,
    /// Longest wait for the next frame once connected.
    pub idle_timeout: Duration,
    /// Accept artifacts pushed by hubs.
    pub accept_pushes: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(15),
            accept_pushes: true,
        }
    }
}

/// Out-of-band request to end a session. The first one set wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Cancel,
    PeerLost,
}

/// Shared between the session task and its handles.
struct SessionControl {
    id: SessionId,
    peer_id: PeerId,
    artifact_id: ArtifactId,
    direction: Direction,
    events: broadcast::Sender<Progress>,
    latest: watch::Sender<Progress>,
    signal: watch::Sender<Signal>,
}

impl SessionControl {
    /// The latest value is replaced first so a subscriber reacting to an event sees it there.
    fn publish(&self, progress: Progress) {
        self.latest.send_replace(progress.clone());
        let _ = self.events.send(progress);
    }

    /// Set the signal unless one is set or the outcome is already decided: a terminal
    /// session, or a download that is verifying and saving a complete payload.
    fn raise(&self, signal: Signal) -> bool {
        self.signal.send_if_modified(|current| {
            let latest = self.latest.borrow();
            let decided = latest.state.is_terminal()
                || (self.direction == Direction::Download
                    && latest.state == SessionState::Completing);
            if *current == Signal::None && !decided {
                *current = signal;
                true
            } else {
                false
            }
        })
    }
}

/// Observer and controller of one session. Cheap to clone; dropping it never affects the
/// session.
#[derive(Clone)]
pub struct SessionHandle {
    control: Arc<SessionControl>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.control.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.control.peer_id
    }

    pub fn artifact_id(&self) -> &ArtifactId {
        &self.control.artifact_id
    }

    pub fn direction(&self) -> Direction {
        self.control.direction
    }

    /// Ordered progress events from now on. A subscriber that falls behind sees `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.control.events.subscribe()
    }

    pub fn latest(&self) -> Progress {
        self.control.latest.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.control.latest.borrow().state.is_terminal()
    }

    /// Ask the session to stop. Returns false if it already ended, was already asked, or is
    /// a download saving its complete payload.
    pub fn cancel(&self) -> bool {
        self.control.raise(Signal::Cancel)
    }

    pub(crate) fn peer_lost(&self) -> bool {
        self.control.raise(Signal::PeerLost)
    }

    /// Resolves with the terminal progress.
    pub async fn wait(&self) -> Progress {
        let mut rx = self.control.latest.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if current.state.is_terminal() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// How the peer is told a session ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    Cancel,
    Reject,
    Receipt,
    Silent,
}

#[derive(Debug)]
enum Stop {
    Cancelled,
    PeerCancelled,
    Failed(FailureReason, Notify),
}

fn fail(reason: FailureReason) -> Stop {
    Stop::Failed(reason, Notify::Cancel)
}

fn channel_error(e: MeshError) -> Stop {
    match e {
        MeshError::Protocol(m) => fail(FailureReason::Protocol(m)),
        other => Stop::Failed(FailureReason::Unreachable(other.to_string()), Notify::Silent),
    }
}

async fn wait_signal(rx: &mut watch::Receiver<Signal>) -> Stop {
    loop {
        let current = *rx.borrow_and_update();
        match current {
            Signal::Cancel => return Stop::Cancelled,
            Signal::PeerLost => {
                return Stop::Failed(FailureReason::PeerLost, Notify::Cancel);
            }
            Signal::None => {}
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs one session to a terminal state.
pub(crate) struct Driver {
    session: TransferSession,
    control: Arc<SessionControl>,
    signal: watch::Receiver<Signal>,
    config: SessionConfig,
    local: PeerId,
    /// A send was abandoned mid-frame; nothing more may be written.
    poisoned: bool,
}

impl Driver {
    pub(crate) fn new(
        session: TransferSession,
        config: SessionConfig,
        local: PeerId,
    ) -> (Self, SessionHandle) {
        let initial = session.progress(Instant::now());
        let (events, _) = broadcast::channel(PROGRESS_CAPACITY);
        let (latest, _) = watch::channel(initial);
        let (signal, signal_rx) = watch::channel(Signal::None);
        let control = Arc::new(SessionControl {
            id: session.id(),
            peer_id: session.peer_id().clone(),
            artifact_id: session.artifact_id().clone(),
            direction: session.direction(),
            events,
            latest,
            signal,
        });
        let handle = SessionHandle {
            control: control.clone(),
        };
        let driver = Self {
            session,
            control,
            signal: signal_rx,
            config,
            local,
            poisoned: false,
        };
        (driver, handle)
    }

    fn id(&self) -> SessionId {
        self.session.id()
    }

    fn publish(&self, progress: Progress) {
        self.control.publish(progress);
    }

    fn step(&self, r: Result<Progress, SessionError>) -> Result<(), Stop> {
        match r {
            Ok(p) => {
                self.publish(p);
                Ok(())
            }
            Err(e) => Err(fail(FailureReason::Protocol(e.to_string()))),
        }
    }

    fn pending_signal(&mut self) -> Option<Stop> {
        match *self.signal.borrow_and_update() {
            Signal::None => None,
            Signal::Cancel => Some(Stop::Cancelled),
            Signal::PeerLost => Some(Stop::Failed(FailureReason::PeerLost, Notify::Cancel)),
        }
    }

    fn unexpected(&self, msg: &Message) -> Stop {
        fail(FailureReason::Protocol(format!(
            "unexpected {} while {}",
            msg.kind(),
            self.session.state().name()
        )))
    }

    async fn connect<C: Connector>(&mut self, connector: &C) -> Result<FrameChannel, Stop> {
        let peer = self.session.peer_id().clone();
        let limit = self.config.connect_timeout;
        tokio::select! {
            biased;
            stop = wait_signal(&mut self.signal) => Err(stop),
            res = tokio::time::timeout(limit, connector.connect(&peer)) => match res {
                Err(_) => Err(Stop::Failed(FailureReason::Timeout, Notify::Silent)),
                Ok(Err(e)) => Err(Stop::Failed(
                    FailureReason::Unreachable(e.to_string()),
                    Notify::Silent,
                )),
                Ok(Ok(channel)) => Ok(channel),
            },
        }
    }

    async fn send(&mut self, channel: &mut FrameChannel, msg: &Message) -> Result<(), Stop> {
        match tokio::time::timeout(self.config.idle_timeout, channel.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(channel_error(e))
            }
            Err(_) => {
                self.poisoned = true;
                Err(Stop::Failed(FailureReason::Stalled, Notify::Silent))
            }
        }
    }

    /// Next frame of this session, within the idle timeout.
    async fn next_frame(&mut self, channel: &mut FrameChannel) -> Result<Message, Stop> {
        let deadline = tokio::time::Instant::now() + self.config.idle_timeout;
        self.next_frame_before(channel, deadline).await
    }

    /// Next frame of this session. `Stalled` once `deadline` passes; a `Cancel` from the
    /// peer ends the session.
    async fn next_frame_before(
        &mut self,
        channel: &mut FrameChannel,
        deadline: tokio::time::Instant,
    ) -> Result<Message, Stop> {
        let msg = tokio::select! {
            biased;
            stop = wait_signal(&mut self.signal) => return Err(stop),
            res = tokio::time::timeout_at(deadline, channel.recv()) => match res {
                Err(_) => return Err(fail(FailureReason::Stalled)),
                Ok(Err(e)) => return Err(channel_error(e)),
                Ok(Ok(msg)) => msg,
            },
        };
        if msg.session_id() != Some(self.id()) {
            return Err(fail(FailureReason::Protocol(format!(
                "{} frame for another session",
                msg.kind()
            ))));
        }
        if let Message::Cancel { .. } = msg {
            return Err(Stop::PeerCancelled);
        }
        Ok(msg)
    }

    /// Send a chunk while watching for the signal and for frames from the peer.
    async fn send_chunk(&mut self, channel: &mut FrameChannel, msg: &Message) -> Result<(), Stop> {
        let limit = self.config.idle_timeout;
        let (reader, writer) = channel.halves();
        let result = tokio::select! {
            biased;
            stop = wait_signal(&mut self.signal) => Err(stop),
            frame = reader.recv() => Err(match frame {
                Ok(Message::Cancel { .. }) => Stop::PeerCancelled,
                Ok(Message::Reject { reason, .. }) => {
                    Stop::Failed(FailureReason::Rejected(reason), Notify::Silent)
                }
                Ok(other) => fail(FailureReason::Protocol(format!(
                    "unexpected {} while sending",
                    other.kind()
                ))),
                Err(e) => channel_error(e),
            }),
            sent = tokio::time::timeout(limit, writer.send(msg)) => match sent {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => Err(channel_error(e)),
                Err(_) => Err(Stop::Failed(FailureReason::Stalled, Notify::Silent)),
            },
        };
        self.poisoned = true;
        result
    }

    /// Offer was accepted locally: validate, answer `Accept`.
    async fn accept(&mut self, channel: &mut FrameChannel, offer: &Offer) -> Result<(), Stop> {
        match self.session.accept_offer(offer, Instant::now()) {
            Ok(p) => self.publish(p),
            Err(reason) => return Err(Stop::Failed(reason, Notify::Reject)),
        }
        tracing::debug!(
            session_id = %self.id(),
            artifact_id = %offer.artifact.id,
            bytes = offer.size_bytes,
            chunk_size = offer.chunk_size,
            "offer accepted"
        );
        self.send(channel, &Message::Accept {
            session_id: self.id(),
        })
        .await
    }

    /// Chunks until `Done`, then verify, persist and confirm with a receipt. Only applied
    /// chunks count as progress: duplicates and gaps do not hold off `Stalled`.
    async fn receive_payload(
        &mut self,
        channel: &mut FrameChannel,
        catalog: &Catalog,
    ) -> Result<(), Stop> {
        let idle = self.config.idle_timeout;
        let mut deadline = tokio::time::Instant::now() + idle;
        loop {
            match self.next_frame_before(channel, deadline).await? {
                Message::Chunk {
                    index,
                    total_size,
                    data,
                    ..
                } => match self
                    .session
                    .apply_chunk(index, total_size, &data, Instant::now())
                {
                    Ok(ChunkOutcome::Applied(p)) => {
                        tracing::debug!(
                            session_id = %self.id(),
                            index,
                            bytes = p.bytes_transferred,
                            "chunk applied"
                        );
                        self.publish(p);
                        deadline = tokio::time::Instant::now() + idle;
                    }
                    Ok(ChunkOutcome::Dropped(anomaly)) => {
                        tracing::warn!(session_id = %self.id(), ?anomaly, "chunk dropped");
                    }
                    Err(reason) => return Err(fail(reason)),
                },
                Message::Done { .. } => break,
                other => return Err(self.unexpected(&other)),
            }
        }
        match self.session.finish_transfer(Instant::now()) {
            Ok(p) => self.publish(p),
            Err(reason) => return Err(fail(reason)),
        }
        let payload = self
            .session
            .verify()
            .map_err(|reason| Stop::Failed(reason, Notify::Receipt))?;
        let meta = match self.session.offer() {
            Some(offer) => offer.artifact.clone(),
            None => return Err(fail(FailureReason::Protocol("no negotiated offer".into()))),
        };
        if let Err(e) = catalog.save(&payload, meta).await {
            let reason = match e {
                MeshError::Conflict(m) => FailureReason::Conflict(m),
                other => FailureReason::Storage(other.to_string()),
            };
            return Err(Stop::Failed(reason, Notify::Receipt));
        }
        let receipt = Message::Receipt {
            session_id: self.id(),
            accepted: true,
            reason: None,
        };
        if self.send(channel, &receipt).await.is_err() {
            tracing::warn!(session_id = %self.id(), "receipt not delivered");
        }
        let r = self.session.complete(Instant::now());
        self.step(r)
    }

    /// Offer sent: wait for `Accept`, stream chunks, send `Done`, wait for the receipt.
    async fn send_payload(
        &mut self,
        channel: &mut FrameChannel,
        offer: Offer,
        payload: Vec<u8>,
    ) -> Result<(), Stop> {
        match self.next_frame(channel).await? {
            Message::Accept { .. } => {}
            Message::Reject { reason, .. } => {
                return Err(Stop::Failed(FailureReason::Rejected(reason), Notify::Silent))
            }
            other => return Err(self.unexpected(&other)),
        }
        let r = self.session.start_sending(&offer, Instant::now());
        self.step(r)?;
        for range in split_into_chunks(offer.size_bytes, offer.chunk_size) {
            if let Some(stop) = self.pending_signal() {
                return Err(stop);
            }
            let msg = Message::Chunk {
                session_id: self.id(),
                index: range.index,
                total_size: offer.size_bytes,
                data: range.slice(&payload).to_vec(),
            };
            self.send_chunk(channel, &msg).await?;
            let r = self.session.record_sent(range.len(), Instant::now());
            self.step(r)?;
        }
        self.send(channel, &Message::Done {
            session_id: self.id(),
        })
        .await?;
        match self.session.finish_transfer(Instant::now()) {
            Ok(p) => self.publish(p),
            Err(reason) => return Err(fail(reason)),
        }
        match self.next_frame(channel).await? {
            Message::Receipt { accepted: true, .. } => {
                let r = self.session.complete(Instant::now());
                self.step(r)
            }
            Message::Receipt { reason, .. } => Err(Stop::Failed(
                FailureReason::Rejected(reason.unwrap_or_else(|| "receipt declined".into())),
                Notify::Silent,
            )),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Offer for a catalog artifact, with the payload to send.
    async fn prepare_offer(&self, catalog: &Catalog) -> Result<(Offer, Vec<u8>), Stop> {
        let (entry, payload) = catalog
            .read_artifact(self.session.artifact_id())
            .await
            .map_err(|e| match e {
                MeshError::NotFound(m) => Stop::Failed(FailureReason::Rejected(m), Notify::Reject),
                other => Stop::Failed(FailureReason::Storage(other.to_string()), Notify::Reject),
            })?;
        let offer = Offer {
            artifact: entry.meta,
            size_bytes: payload.len() as u64,
            checksum: Some(integrity::checksum(&payload)),
            chunk_size: self.config.chunk_size.max(1),
        };
        Ok((offer, payload))
    }

    async fn offer_and_send(
        &mut self,
        channel: &mut FrameChannel,
        catalog: &Catalog,
    ) -> Result<(), Stop> {
        let (offer, payload) = self.prepare_offer(catalog).await?;
        let msg = Message::Offer {
            session_id: self.id(),
            from: self.local.clone(),
            offer: offer.clone(),
        };
        self.send(channel, &msg).await?;
        self.send_payload(channel, offer, payload).await
    }

    async fn download_flow<C: Connector>(
        &mut self,
        connector: &C,
        catalog: &Catalog,
        slot: &mut Option<FrameChannel>,
    ) -> Result<(), Stop> {
        let r = self.session.start_connecting(Instant::now());
        self.step(r)?;
        let channel = slot.insert(self.connect(connector).await?);
        let r = self.session.connected(Instant::now());
        self.step(r)?;
        let request = Message::Request {
            session_id: self.id(),
            from: self.local.clone(),
            artifact_id: self.session.artifact_id().clone(),
        };
        self.send(channel, &request).await?;
        let offer = match self.next_frame(channel).await? {
            Message::Offer { offer, .. } => offer,
            Message::Reject { reason, .. } => {
                return Err(Stop::Failed(FailureReason::Rejected(reason), Notify::Silent))
            }
            other => return Err(self.unexpected(&other)),
        };
        self.accept(channel, &offer).await?;
        self.receive_payload(channel, catalog).await
    }

    async fn push_flow<C: Connector>(
        &mut self,
        connector: &C,
        catalog: &Catalog,
        slot: &mut Option<FrameChannel>,
    ) -> Result<(), Stop> {
        let r = self.session.start_connecting(Instant::now());
        self.step(r)?;
        let channel = slot.insert(self.connect(connector).await?);
        let r = self.session.connected(Instant::now());
        self.step(r)?;
        self.offer_and_send(channel, catalog).await
    }

    /// Pull `artifact_id` from the peer and save it.
    pub(crate) async fn download<C: Connector>(
        mut self,
        connector: &C,
        catalog: &Catalog,
    ) -> Progress {
        let mut slot = None;
        let outcome = self.download_flow(connector, catalog, &mut slot).await;
        self.conclude(slot, outcome).await
    }

    /// Connect to the peer and push a catalog artifact.
    pub(crate) async fn push<C: Connector>(
        mut self,
        connector: &C,
        catalog: &Catalog,
    ) -> Progress {
        let mut slot = None;
        let outcome = self.push_flow(connector, catalog, &mut slot).await;
        self.conclude(slot, outcome).await
    }

    /// Answer a peer's `Request` on an inbound channel.
    pub(crate) async fn serve_request(
        mut self,
        mut channel: FrameChannel,
        catalog: &Catalog,
    ) -> Progress {
        let outcome = match self.session.accept_inbound(Instant::now()) {
            Ok(p) => {
                self.publish(p);
                self.offer_and_send(&mut channel, catalog).await
            }
            Err(e) => Err(fail(FailureReason::Protocol(e.to_string()))),
        };
        self.conclude(Some(channel), outcome).await
    }

    /// Receive an artifact a hub pushed with `offer`.
    pub(crate) async fn receive_push(
        mut self,
        mut channel: FrameChannel,
        offer: Offer,
        catalog: &Catalog,
    ) -> Progress {
        let outcome = match self.session.accept_inbound(Instant::now()) {
            Ok(p) => {
                self.publish(p);
                match self.accept(&mut channel, &offer).await {
                    Ok(()) => self.receive_payload(&mut channel, catalog).await,
                    Err(stop) => Err(stop),
                }
            }
            Err(e) => Err(fail(FailureReason::Protocol(e.to_string()))),
        };
        self.conclude(Some(channel), outcome).await
    }

    /// Settle the terminal state, tell the peer if needed and publish the final progress.
    async fn conclude(
        mut self,
        mut channel: Option<FrameChannel>,
        outcome: Result<(), Stop>,
    ) -> Progress {
        let now = Instant::now();
        let sid = self.id();
        let (transition, notice) = match outcome {
            Ok(()) => {
                tracing::info!(
                    session_id = %sid,
                    peer_id = %self.session.peer_id(),
                    artifact_id = %self.session.artifact_id(),
                    direction = ?self.session.direction(),
                    bytes = self.session.bytes_transferred(),
                    "session complete"
                );
                (None, None)
            }
            Err(Stop::Cancelled) => {
                tracing::info!(session_id = %sid, "session cancelled");
                (self.session.cancel(now), Some(Message::Cancel { session_id: sid }))
            }
            Err(Stop::PeerCancelled) => {
                tracing::info!(
                    session_id = %sid,
                    peer_id = %self.session.peer_id(),
                    "peer cancelled session"
                );
                (self.session.cancel(now), None)
            }
            Err(Stop::Failed(reason, notify)) => {
                tracing::warn!(
                    session_id = %sid,
                    peer_id = %self.session.peer_id(),
                    artifact_id = %self.session.artifact_id(),
                    error = %reason,
                    "session failed"
                );
                let notice = match notify {
                    Notify::Cancel => Some(Message::Cancel { session_id: sid }),
                    Notify::Reject => Some(Message::Reject {
                        session_id: sid,
                        reason: reason.to_string(),
                    }),
                    Notify::Receipt => Some(Message::Receipt {
                        session_id: sid,
                        accepted: false,
                        reason: Some(reason.to_string()),
                    }),
                    Notify::Silent => None,
                };
                (self.session.fail(reason, now), notice)
            }
        };
        if let Some(ch) = channel.as_mut() {
            if let Some(msg) = notice.filter(|_| !self.poisoned) {
                let _ = tokio::time::timeout(NOTIFY_TIMEOUT, ch.send(&msg)).await;
            }
            ch.close().await;
        }
        let progress = self.session.progress(now);
        if transition.is_some() || progress.state != SessionState::Complete {
            self.publish(progress.clone());
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{payload, worksheet};
    use crate::transport::{Listener, MemoryNetwork};
    use tempfile::TempDir;

    fn pdf_001() -> ArtifactId {
        ArtifactId::new("pdf-001").unwrap()
    }

    async fn hub_catalog(tmp: &TempDir, len: usize) -> Arc<Catalog> {
        let catalog = Arc::new(Catalog::open(tmp.path()).await.unwrap());
        catalog
            .save(&payload(len), worksheet("pdf-001", "Fractions", 0))
            .await
            .unwrap();
        catalog
    }

    fn download_driver(session_id: SessionId) -> (Driver, SessionHandle) {
        let session = TransferSession::download(session_id, "hub-001".into(), pdf_001(), None);
        Driver::new(session, SessionConfig::default(), "rx-1".into())
    }

    fn upload_driver(session_id: SessionId) -> (Driver, SessionHandle) {
        let session = TransferSession::upload(session_id, "rx-1".into(), pdf_001());
        Driver::new(session, SessionConfig::default(), "hub-001".into())
    }

    #[tokio::test]
    async fn cancel_before_connect_never_dials() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let net = MemoryNetwork::new();
        let mut listener = net.listen("hub-001");
        let (driver, handle) = download_driver(SessionId::new());

        assert!(handle.cancel());
        assert!(!handle.cancel());
        let done = driver.download(&net.connector("rx-1"), &catalog).await;
        assert_eq!(done.state, SessionState::Cancelled);
        assert_eq!(handle.latest().state, SessionState::Cancelled);
        assert!(!handle.peer_lost());
        let dialled = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(dialled.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_hub_stalls_download() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let net = MemoryNetwork::new();
        let mut listener = net.listen("hub-001");
        let hub = tokio::spawn(async move {
            let mut channel = listener.accept().await.unwrap();
            assert!(matches!(channel.recv().await.unwrap(), Message::Request { .. }));
            channel.recv().await.unwrap()
        });

        let (driver, handle) = download_driver(SessionId::new());
        let done = driver.download(&net.connector("rx-1"), &catalog).await;
        assert_eq!(done.error, Some(FailureReason::Stalled));
        assert!(handle.is_terminal());
        assert!(matches!(hub.await.unwrap(), Message::Cancel { .. }));
    }

    #[tokio::test]
    async fn peer_cancel_ends_upload_quietly() {
        let tmp = TempDir::new().unwrap();
        let catalog = hub_catalog(&tmp, 40_000).await;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let session_id = SessionId::new();
        let (driver, handle) = upload_driver(session_id);
        let mut events = handle.subscribe();

        let task = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                driver
                    .serve_request(FrameChannel::from_stream(ours, "rx-1"), &catalog)
                    .await
            })
        };
        let mut peer = FrameChannel::from_stream(theirs, "hub-001");
        match peer.recv().await.unwrap() {
            Message::Offer { offer, from, .. } => {
                assert_eq!(from, PeerId::from("hub-001"));
                assert_eq!(offer.size_bytes, 40_000);
                assert_eq!(offer.checksum, Some(integrity::checksum(&payload(40_000))));
            }
            other => panic!("expected offer, got {other:?}"),
        }
        peer.send(&Message::Cancel { session_id }).await.unwrap();

        let done = task.await.unwrap();
        assert_eq!(done.state, SessionState::Cancelled);
        // Nothing follows a peer's cancel.
        assert!(peer.recv().await.is_err());
        let mut states = Vec::new();
        while let Ok(p) = events.try_recv() {
            states.push(p.state);
        }
        assert_eq!(states.last(), Some(&SessionState::Cancelled));
    }

    #[tokio::test]
    async fn frame_for_another_session_is_protocol_error() {
        let tmp = TempDir::new().unwrap();
        let catalog = hub_catalog(&tmp, 1_000).await;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (driver, _handle) = upload_driver(SessionId::new());

        let task = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                driver
                    .serve_request(FrameChannel::from_stream(ours, "rx-1"), &catalog)
                    .await
            })
        };
        let mut peer = FrameChannel::from_stream(theirs, "hub-001");
        assert!(matches!(peer.recv().await.unwrap(), Message::Offer { .. }));
        peer.send(&Message::Accept {
            session_id: SessionId::new(),
        })
        .await
        .unwrap();

        let done = task.await.unwrap();
        assert!(matches!(done.error, Some(FailureReason::Protocol(_))), "{done:?}");
        assert!(matches!(peer.recv().await.unwrap(), Message::Cancel { .. }));
    }

    #[tokio::test]
    async fn upload_of_missing_artifact_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (driver, _handle) = upload_driver(SessionId::new());
        let mut peer = FrameChannel::from_stream(theirs, "hub-001");

        let done = driver
            .serve_request(FrameChannel::from_stream(ours, "rx-1"), &catalog)
            .await;
        assert!(matches!(done.error, Some(FailureReason::Rejected(_))));
        assert!(matches!(peer.recv().await.unwrap(), Message::Reject { .. }));
    }

    #[tokio::test]
    async fn cancel_while_saving_is_refused() {
        let tmp = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::open(tmp.path()).await.unwrap());
        let bytes = payload(20_000);
        let offer = Offer {
            artifact: worksheet("pdf-001", "Fractions", 0),
            size_bytes: 20_000,
            checksum: Some(integrity::checksum(&bytes)),
            chunk_size: 16 * 1024,
        };
        let session_id = SessionId::new();
        let (driver, handle) = download_driver(session_id);
        let mut events = handle.subscribe();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);

        let task = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                let channel = FrameChannel::from_stream(ours, "hub-001");
                driver.receive_push(channel, offer, &catalog).await
            })
        };
        let mut hub = FrameChannel::from_stream(theirs, "rx-1");
        assert!(matches!(hub.recv().await.unwrap(), Message::Accept { .. }));
        for (index, data) in bytes.chunks(16 * 1024).enumerate() {
            hub.send(&Message::Chunk {
                session_id,
                index: index as u64,
                total_size: 20_000,
                data: data.to_vec(),
            })
            .await
            .unwrap();
        }
        hub.send(&Message::Done { session_id }).await.unwrap();
        loop {
            let p = events.recv().await.unwrap();
            if p.state == SessionState::Completing {
                break;
            }
            assert!(!p.state.is_terminal(), "ended before Done: {p:?}");
        }

        // The whole payload is in hand; the save goes ahead.
        assert!(!handle.cancel());
        let done = task.await.unwrap();
        assert_eq!(done.state, SessionState::Complete);
        assert!(catalog.contains(&pdf_001()));
        assert!(matches!(
            hub.recv().await.unwrap(),
            Message::Receipt { accepted: true, .. }
        ));
    }
}
