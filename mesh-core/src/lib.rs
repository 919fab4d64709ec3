//! MeshMind distribution protocol.
//! Host-driven: no I/O; the node runtime feeds events into sessions and moves the bytes.

pub mod artifact;
pub mod chunk;
pub mod error;
pub mod integrity;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod wire;

pub use artifact::{ArtifactId, ArtifactMeta, ArtifactSummary, CatalogEntry};
pub use error::{FailureReason, MeshError};
pub use peer::{PeerDescriptor, PeerId, Role, SignalQuality};
pub use protocol::{Message, Offer, MAX_ARTIFACT_SIZE, PROTOCOL_VERSION};
pub use session::{
    ChunkOutcome, Direction, Progress, SessionError, SessionId, SessionState, TransferSession,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
