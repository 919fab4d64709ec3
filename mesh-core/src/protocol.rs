//! MeshMind wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactId, ArtifactMeta, ArtifactSummary};
use crate::peer::{PeerId, Role};
use crate::session::SessionId;

/// Current protocol version. Carried in beacons; mismatched beacons are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest artifact a session will negotiate.
pub const MAX_ARTIFACT_SIZE: u64 = 64 * 1024 * 1024;

/// What the sending side declares before any payload bytes move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub artifact: ArtifactMeta,
    pub size_bytes: u64,
    /// SHA-256 of the whole payload, when the sender has it.
    pub checksum: Option<[u8; 32]>,
    pub chunk_size: u32,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence, role and artifact summaries.
    Beacon {
        protocol_version: u8,
        peer_id: PeerId,
        display_name: String,
        role: Role,
        listen_port: u16,
        artifacts: Vec<ArtifactSummary>,
    },
    /// Receiver asks a hub for an artifact.
    Request {
        session_id: SessionId,
        from: PeerId,
        artifact_id: ArtifactId,
    },
    /// Sender declares the artifact. Answer to `Request`, or the opening frame of a push.
    Offer {
        session_id: SessionId,
        from: PeerId,
        offer: Offer,
    },
    /// Receiver accepted the offer; chunks may flow.
    Accept { session_id: SessionId },
    /// Either side declines the session.
    Reject {
        session_id: SessionId,
        reason: String,
    },
    /// One ordered piece of the payload.
    Chunk {
        session_id: SessionId,
        index: u64,
        total_size: u64,
        data: Vec<u8>,
    },
    /// Sender has sent every chunk.
    Done { session_id: SessionId },
    /// Receiver's verdict after verification and storage.
    Receipt {
        session_id: SessionId,
        accepted: bool,
        reason: Option<String>,
    },
    /// Either side abandons the session.
    Cancel { session_id: SessionId },
}

impl Message {
    /// Session the message belongs to; `None` for beacons.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Message::Beacon { .. } => None,
            Message::Request { session_id, .. }
            | Message::Offer { session_id, .. }
            | Message::Accept { session_id }
            | Message::Reject { session_id, .. }
            | Message::Chunk { session_id, .. }
            | Message::Done { session_id }
            | Message::Receipt { session_id, .. }
            | Message::Cancel { session_id } => Some(*session_id),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Beacon { .. } => "beacon",
            Message::Request { .. } => "request",
            Message::Offer { .. } => "offer",
            Message::Accept { .. } => "accept",
            Message::Reject { .. } => "reject",
            Message::Chunk { .. } => "chunk",
            Message::Done { .. } => "done",
            Message::Receipt { .. } => "receipt",
            Message::Cancel { .. } => "cancel",
        }
    }
}
