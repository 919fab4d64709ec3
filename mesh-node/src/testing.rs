//! Helpers shared by unit and integration tests. Built under `cfg(test)` or the
//! `test-util` feature.

use chrono::{TimeZone, Utc};
use mesh_core::{
    ArtifactId, ArtifactMeta, ArtifactSummary, PeerDescriptor, PeerId, Role, SignalQuality,
};

/// Initialise a tracing subscriber for tests. Respects `RUST_LOG`, defaults to `debug`.
/// Safe to call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Worksheet metadata with a fixed timestamp offset by `secs`.
pub fn worksheet(id: &str, title: &str, secs: i64) -> ArtifactMeta {
    ArtifactMeta {
        id: ArtifactId::new(id).unwrap_or_else(|e| panic!("bad test id {id}: {e}")),
        filename: format!("{title}_{id}.pdf"),
        title: title.to_owned(),
        subject: "math".into(),
        grade: "4".into(),
        language: "en".into(),
        created_at: Utc
            .timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

/// A hub sighting advertising `artifacts` as (id, title, size).
pub fn hub_sighting(peer: &str, artifacts: &[(&str, &str, u64)]) -> PeerDescriptor {
    PeerDescriptor {
        peer_id: PeerId::new(peer),
        display_name: format!("{peer} tablet"),
        role: Role::Hub,
        signal_quality: SignalQuality::Good,
        advertised: artifacts
            .iter()
            .map(|(id, title, size)| ArtifactSummary {
                id: ArtifactId::new(*id).unwrap_or_else(|e| panic!("bad test id {id}: {e}")),
                title: (*title).to_owned(),
                size_bytes: *size,
            })
            .collect(),
    }
}
