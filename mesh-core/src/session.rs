//! Transfer session state machine. Host-driven: no I/O; the host reports events
//! (connected, offer, chunk, done) and the session validates them and reports progress.
//!
//! ```text
//! Idle -> Connecting -> Negotiating -> Transferring -> Completing -> Complete
//!   \__________\_____________\______________\______________\-> Failed(reason) | Cancelled
//! ```

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::{ArtifactId, ArtifactSummary};
use crate::chunk::{ChunkApply, Reassembly};
use crate::error::FailureReason;
use crate::integrity;
use crate::peer::PeerId;
use crate::protocol::{Offer, MAX_ARTIFACT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Negotiating,
    Transferring,
    Completing,
    Complete,
    Failed(FailureReason),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Failed(_) | SessionState::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Transferring => "transferring",
            SessionState::Completing => "completing",
            SessionState::Complete => "complete",
            SessionState::Failed(_) => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Progress event. Per session, `bytes_transferred` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub session_id: SessionId,
    pub state: SessionState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Fraction in 0.0..=1.0.
    pub progress: f64,
    pub speed_bps: u64,
    pub error: Option<FailureReason>,
}

/// Local misuse of the state machine (as opposed to a misbehaving peer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {event} while {state}")]
pub struct SessionError {
    pub state: &'static str,
    pub event: &'static str,
}

/// What happened to a received chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Applied(Progress),
    /// Duplicate or out-of-order chunk, dropped without touching the payload.
    Dropped(ChunkApply),
}

/// One chunked exchange of a single artifact with a single peer.
pub struct TransferSession {
    id: SessionId,
    peer_id: PeerId,
    artifact_id: ArtifactId,
    direction: Direction,
    state: SessionState,
    advertised: Option<ArtifactSummary>,
    offer: Option<Offer>,
    reassembly: Option<Reassembly>,
    bytes_transferred: u64,
    total_bytes: u64,
    started_at: Option<Instant>,
    transfer_started_at: Option<Instant>,
    last_progress_at: Option<Instant>,
}

impl TransferSession {
    /// Session pulling `artifact_id` from `peer_id`. `advertised` is the peer's summary, if any;
    /// the offer must match it.
    pub fn download(
        id: SessionId,
        peer_id: PeerId,
        artifact_id: ArtifactId,
        advertised: Option<ArtifactSummary>,
    ) -> Self {
        Self::new(id, peer_id, artifact_id, Direction::Download, advertised)
    }

    /// Session sending `artifact_id` to `peer_id`.
    pub fn upload(id: SessionId, peer_id: PeerId, artifact_id: ArtifactId) -> Self {
        Self::new(id, peer_id, artifact_id, Direction::Upload, None)
    }

    fn new(
        id: SessionId,
        peer_id: PeerId,
        artifact_id: ArtifactId,
        direction: Direction,
        advertised: Option<ArtifactSummary>,
    ) -> Self {
        Self {
            id,
            peer_id,
            artifact_id,
            direction,
            state: SessionState::Idle,
            advertised,
            offer: None,
            reassembly: None,
            bytes_transferred: 0,
            total_bytes: 0,
            started_at: None,
            transfer_started_at: None,
            last_progress_at: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn artifact_id(&self) -> &ArtifactId {
        &self.artifact_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn last_progress_at(&self) -> Option<Instant> {
        self.last_progress_at
    }

    /// The negotiated offer: accepted (download) or sent (upload).
    pub fn offer(&self) -> Option<&Offer> {
        self.offer.as_ref()
    }

    /// Idle -> Connecting. Outbound sessions only.
    pub fn start_connecting(&mut self, now: Instant) -> Result<Progress, SessionError> {
        self.expect(SessionState::Idle, "connect")?;
        self.state = SessionState::Connecting;
        self.started_at = Some(now);
        Ok(self.progress(now))
    }

    /// Connecting -> Negotiating.
    pub fn connected(&mut self, now: Instant) -> Result<Progress, SessionError> {
        self.expect(SessionState::Connecting, "finish connecting")?;
        self.state = SessionState::Negotiating;
        Ok(self.progress(now))
    }

    /// Idle -> Negotiating, for sessions opened by the remote peer on an existing channel.
    pub fn accept_inbound(&mut self, now: Instant) -> Result<Progress, SessionError> {
        self.expect(SessionState::Idle, "accept inbound")?;
        self.state = SessionState::Negotiating;
        self.started_at = Some(now);
        Ok(self.progress(now))
    }

    /// Validate the peer's offer against the request and the advertised summary.
    /// Negotiating -> Transferring, or Failed on any mismatch.
    pub fn accept_offer(&mut self, offer: &Offer, now: Instant) -> Result<Progress, FailureReason> {
        if self.direction != Direction::Download || self.state != SessionState::Negotiating {
            return Err(self.fail_with(FailureReason::Protocol(format!(
                "unexpected offer while {}",
                self.state.name()
            ))));
        }
        if offer.artifact.id != self.artifact_id {
            return Err(self.fail_with(FailureReason::Mismatch(format!(
                "offered artifact {}, requested {}",
                offer.artifact.id, self.artifact_id
            ))));
        }
        if let Some(adv) = &self.advertised {
            if adv.size_bytes != offer.size_bytes {
                return Err(self.fail_with(FailureReason::Mismatch(format!(
                    "offered {} bytes, advertised {}",
                    offer.size_bytes, adv.size_bytes
                ))));
            }
        }
        if offer.size_bytes > MAX_ARTIFACT_SIZE {
            return Err(self.fail_with(FailureReason::Protocol(format!(
                "offered {} bytes, limit is {}",
                offer.size_bytes, MAX_ARTIFACT_SIZE
            ))));
        }
        if offer.chunk_size == 0 {
            return Err(self.fail_with(FailureReason::Protocol("zero chunk size".into())));
        }
        self.total_bytes = offer.size_bytes;
        self.reassembly = Some(Reassembly::new(offer.size_bytes, offer.chunk_size));
        self.offer = Some(offer.clone());
        self.begin_transfer(now);
        Ok(self.progress(now))
    }

    /// Negotiating -> Transferring on the sending side, once the receiver accepted `offer`.
    pub fn start_sending(&mut self, offer: &Offer, now: Instant) -> Result<Progress, SessionError> {
        if self.direction != Direction::Upload {
            return Err(self.invalid("send"));
        }
        self.expect(SessionState::Negotiating, "send")?;
        self.total_bytes = offer.size_bytes;
        self.offer = Some(offer.clone());
        self.begin_transfer(now);
        Ok(self.progress(now))
    }

    fn begin_transfer(&mut self, now: Instant) {
        self.state = SessionState::Transferring;
        self.transfer_started_at = Some(now);
        self.last_progress_at = Some(now);
    }

    /// Apply a received chunk. Chunks must arrive in index order; duplicates and gaps are
    /// dropped and reported. A chunk disagreeing with the negotiated size fails the session.
    pub fn apply_chunk(
        &mut self,
        index: u64,
        total_size: u64,
        data: &[u8],
        now: Instant,
    ) -> Result<ChunkOutcome, FailureReason> {
        if self.direction != Direction::Download || self.state != SessionState::Transferring {
            return Err(self.fail_with(FailureReason::Protocol(format!(
                "unexpected chunk while {}",
                self.state.name()
            ))));
        }
        if total_size != self.total_bytes {
            return Err(self.fail_with(FailureReason::Mismatch(format!(
                "chunk declares {} bytes, negotiated {}",
                total_size, self.total_bytes
            ))));
        }
        let applied = match self.reassembly.as_mut() {
            Some(r) => r.apply(index, data),
            None => {
                return Err(
                    self.fail_with(FailureReason::Protocol("no reassembly buffer".into()))
                )
            }
        };
        match applied {
            ChunkApply::Applied(received) => {
                self.bytes_transferred = received;
                self.last_progress_at = Some(now);
                Ok(ChunkOutcome::Applied(self.progress(now)))
            }
            ChunkApply::Overflow { index } => Err(self.fail_with(FailureReason::Mismatch(
                format!("chunk {index} overflows negotiated size"),
            ))),
            dropped => Ok(ChunkOutcome::Dropped(dropped)),
        }
    }

    /// Record `n` bytes handed to the channel on the sending side.
    pub fn record_sent(&mut self, n: u64, now: Instant) -> Result<Progress, SessionError> {
        if self.direction != Direction::Upload {
            return Err(self.invalid("record sent bytes"));
        }
        self.expect(SessionState::Transferring, "record sent bytes")?;
        self.bytes_transferred = (self.bytes_transferred + n).min(self.total_bytes);
        self.last_progress_at = Some(now);
        Ok(self.progress(now))
    }

    /// Transferring -> Completing: the sender has no more chunks.
    pub fn finish_transfer(&mut self, now: Instant) -> Result<Progress, FailureReason> {
        if self.state != SessionState::Transferring {
            return Err(self.fail_with(FailureReason::Protocol(format!(
                "unexpected end of transfer while {}",
                self.state.name()
            ))));
        }
        self.state = SessionState::Completing;
        Ok(self.progress(now))
    }

    /// Verify the reassembled payload against declared size and checksum. Hands the payload
    /// out at most once; any mismatch fails the session and discards the bytes.
    pub fn verify(&mut self) -> Result<Vec<u8>, FailureReason> {
        if self.direction != Direction::Download || self.state != SessionState::Completing {
            return Err(self.fail_with(FailureReason::Protocol(format!(
                "cannot verify while {}",
                self.state.name()
            ))));
        }
        let Some(reassembly) = self.reassembly.take() else {
            return Err(self.fail_with(FailureReason::Protocol(
                "payload already handed out".into(),
            )));
        };
        if !reassembly.is_complete() {
            return Err(self.fail_with(FailureReason::Integrity(format!(
                "received {} of {} bytes",
                reassembly.received(),
                reassembly.total_len()
            ))));
        }
        let payload = reassembly.into_bytes();
        if let Some(expected) = self.offer.as_ref().and_then(|o| o.checksum) {
            if !integrity::verify(&payload, &expected) {
                return Err(self.fail_with(FailureReason::Integrity(format!(
                    "checksum mismatch, expected {}",
                    integrity::to_hex(&expected)
                ))));
            }
        }
        Ok(payload)
    }

    /// Completing -> Complete.
    pub fn complete(&mut self, now: Instant) -> Result<Progress, SessionError> {
        self.expect(SessionState::Completing, "complete")?;
        self.state = SessionState::Complete;
        self.last_progress_at = Some(now);
        Ok(self.progress(now))
    }

    /// Move to Failed. Returns the terminal progress, or `None` if already terminal.
    pub fn fail(&mut self, reason: FailureReason, now: Instant) -> Option<Progress> {
        if self.is_terminal() {
            return None;
        }
        self.fail_with(reason);
        Some(self.progress(now))
    }

    /// Move to Cancelled. Returns the terminal progress, or `None` if already terminal.
    pub fn cancel(&mut self, now: Instant) -> Option<Progress> {
        if self.is_terminal() {
            return None;
        }
        self.state = SessionState::Cancelled;
        self.reassembly = None;
        Some(self.progress(now))
    }

    fn fail_with(&mut self, reason: FailureReason) -> FailureReason {
        if !self.is_terminal() {
            self.state = SessionState::Failed(reason.clone());
            self.reassembly = None;
        }
        reason
    }

    fn expect(&self, state: SessionState, event: &'static str) -> Result<(), SessionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.invalid(event))
        }
    }

    fn invalid(&self, event: &'static str) -> SessionError {
        SessionError {
            state: self.state.name(),
            event,
        }
    }

    /// Snapshot for subscribers.
    pub fn progress(&self, now: Instant) -> Progress {
        let fraction = if self.total_bytes == 0 {
            if self.state == SessionState::Complete {
                1.0
            } else {
                0.0
            }
        } else {
            self.bytes_transferred as f64 / self.total_bytes as f64
        };
        let speed_bps = match self.transfer_started_at {
            Some(t) => {
                let secs = now.saturating_duration_since(t).as_secs_f64();
                if secs > 0.0 {
                    (self.bytes_transferred as f64 / secs) as u64
                } else {
                    0
                }
            }
            None => 0,
        };
        let error = match &self.state {
            SessionState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        Progress {
            session_id: self.id,
            state: self.state.clone(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            progress: fraction,
            speed_bps,
            error,
        }
    }
}
