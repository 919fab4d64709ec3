//! Peer identity and the descriptors discovery produces.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactSummary;

/// Peer identifier as carried in beacons and session requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hub,
    Receiver,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hub" => Ok(Role::Hub),
            "receiver" => Ok(Role::Receiver),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Ordinal link quality. Not a physical unit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    #[default]
    Unknown,
    Weak,
    Fair,
    Good,
    Excellent,
}

/// A reachable peer and what it advertises. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub display_name: String,
    pub role: Role,
    pub signal_quality: SignalQuality,
    pub advertised: Vec<ArtifactSummary>,
}

impl PeerDescriptor {
    pub fn advertised_artifact(&self, id: &crate::ArtifactId) -> Option<&ArtifactSummary> {
        self.advertised.iter().find(|s| &s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitive() {
        assert_eq!("HUB".parse::<Role>().unwrap(), Role::Hub);
        assert_eq!("receiver".parse::<Role>().unwrap(), Role::Receiver);
        assert!("relay".parse::<Role>().is_err());
    }

    #[test]
    fn signal_quality_is_ordinal() {
        assert!(SignalQuality::Excellent > SignalQuality::Good);
        assert!(SignalQuality::Weak > SignalQuality::Unknown);
    }
}
