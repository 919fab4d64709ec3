//! Artifacts: identifiers, declared metadata, catalog entries and advertised summaries.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

const MAX_ID_LEN: usize = 128;

/// Artifact identifier. Safe to use as a file name: remote peers supply these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Result<Self, MeshError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(MeshError::InvalidInput(format!(
                "artifact id must be 1..={MAX_ID_LEN} bytes"
            )));
        }
        if id.starts_with('.') {
            return Err(MeshError::InvalidInput(format!(
                "artifact id {id:?} must not start with '.'"
            )));
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(MeshError::InvalidInput(format!(
                "artifact id {id:?} contains unsupported characters"
            )));
        }
        Ok(ArtifactId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ArtifactId::new(value)
    }
}

impl From<ArtifactId> for String {
    fn from(id: ArtifactId) -> Self {
        id.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata a hub declares for an artifact. Receivers store it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: ArtifactId,
    pub filename: String,
    pub title: String,
    pub subject: String,
    pub grade: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

/// One artifact owned by this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub size_bytes: u64,
    pub file_path: PathBuf,
}

impl CatalogEntry {
    pub fn id(&self) -> &ArtifactId {
        &self.meta.id
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            id: self.meta.id.clone(),
            title: self.meta.title.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// What a peer advertises about an artifact. A hint, never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: ArtifactId,
    pub title: String,
    pub size_bytes: u64,
}

/// Sort entries for presentation: newest first, id as tie-breaker.
pub fn newest_first(entries: &mut [CatalogEntry]) {
    entries.sort_by(|a, b| {
        b.meta
            .created_at
            .cmp(&a.meta.created_at)
            .then_with(|| a.meta.id.cmp(&b.meta.id))
    });
}
