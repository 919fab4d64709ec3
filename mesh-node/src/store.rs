//! Catalog Store: crash-consistent files under the data directory.
//!
//! Layout:
//! - `artifacts/index.json`: every `CatalogEntry`, replaced atomically (temp file + rename).
//! - `artifacts/payloads/<id>.artifact`: one payload per artifact.
//! - `artifacts/payloads/.<id>.<uuid>.tmp`: payload being written.
//! - `artifacts/payloads/<id>.deleting`: payload of an in-progress delete.
//! - `preferences.json`, `node_id`.
//!
//! Every file is written to a temp file, fsynced, then renamed into place, so readers see
//! either the old or the new content.

use std::io;
use std::path::{Path, PathBuf};

use mesh_core::{ArtifactId, CatalogEntry, MeshError};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

pub const INDEX_VERSION: u32 = 1;
pub const MAX_RECENT_PROMPTS: usize = 10;

const ARTIFACTS_DIR: &str = "artifacts";
const PAYLOADS_DIR: &str = "payloads";
const INDEX_FILE: &str = "index.json";
const PREFERENCES_FILE: &str = "preferences.json";
const NODE_ID_FILE: &str = "node_id";
const PAYLOAD_EXT: &str = "artifact";
const TOMBSTONE_EXT: &str = "deleting";
const TEMP_EXT: &str = "tmp";

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<CatalogEntry>,
}

/// Small per-device preferences record kept next to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub last_subject: Option<String>,
    pub last_grade: Option<String>,
    /// Newest first, no duplicates, at most `MAX_RECENT_PROMPTS`.
    pub recent_prompts: Vec<String>,
    /// Default for "include answer key" on new generations.
    pub include_answers: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            last_subject: None,
            last_grade: None,
            recent_prompts: Vec::new(),
            include_answers: true,
        }
    }
}

impl Preferences {
    pub fn record_prompt(&mut self, prompt: &str) {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return;
        }
        self.recent_prompts.retain(|p| p != prompt);
        self.recent_prompts.insert(0, prompt.to_owned());
        self.recent_prompts.truncate(MAX_RECENT_PROMPTS);
    }
}

/// A file found in the payload directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadFile {
    Payload(ArtifactId, PathBuf),
    Tombstone(ArtifactId, PathBuf),
    Temp(ArtifactId, PathBuf),
    Unknown(PathBuf),
}

pub struct CatalogStore {
    data_dir: PathBuf,
    artifacts_dir: PathBuf,
    payload_dir: PathBuf,
    prefs_lock: tokio::sync::Mutex<()>,
}

impl CatalogStore {
    /// Open the store rooted at `data_dir`, creating directories as needed.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, MeshError> {
        let data_dir = data_dir.into();
        let artifacts_dir = data_dir.join(ARTIFACTS_DIR);
        let payload_dir = artifacts_dir.join(PAYLOADS_DIR);
        tokio::fs::create_dir_all(&payload_dir).await.map_err(|e| {
            MeshError::storage(format!("create {}", payload_dir.display()), e)
        })?;
        Ok(Self {
            data_dir,
            artifacts_dir,
            payload_dir,
            prefs_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.artifacts_dir.join(INDEX_FILE)
    }

    pub fn payload_path(&self, id: &ArtifactId) -> PathBuf {
        self.payload_dir.join(format!("{id}.{PAYLOAD_EXT}"))
    }

    fn tombstone_path(&self, id: &ArtifactId) -> PathBuf {
        self.payload_dir.join(format!("{id}.{TOMBSTONE_EXT}"))
    }

    /// Write a payload durably. Returns its final path once the bytes, the rename and the
    /// directory entry are all on disk. A failure removes the temp file.
    pub async fn write_payload(&self, id: &ArtifactId, bytes: &[u8]) -> Result<PathBuf, MeshError> {
        let path = self.payload_path(id);
        let temp = self
            .payload_dir
            .join(format!(".{id}.{}.{TEMP_EXT}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = write_synced(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(MeshError::storage(format!("write {}", temp.display()), e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(MeshError::storage(format!("rename {}", path.display()), e));
        }
        sync_dir(&self.payload_dir)
            .await
            .map_err(|e| MeshError::storage(format!("sync {}", self.payload_dir.display()), e))?;
        match self.payload_len(&path).await? {
            Some(len) if len == bytes.len() as u64 => Ok(path),
            other => Err(MeshError::storage(
                format!("verify {}", path.display()),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("wrote {} bytes, found {:?}", bytes.len(), other),
                ),
            )),
        }
    }

    pub async fn read_payload(&self, path: &Path) -> Result<Vec<u8>, MeshError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| MeshError::storage(format!("read {}", path.display()), e))
    }

    /// Length of the file at `path`, or `None` if it does not exist.
    pub async fn payload_len(&self, path: &Path) -> Result<Option<u64>, MeshError> {
        match tokio::fs::metadata(path).await {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MeshError::storage(format!("stat {}", path.display()), e)),
        }
    }

    /// Remove a payload. Missing files are not an error.
    pub async fn remove_payload(&self, id: &ArtifactId) -> Result<(), MeshError> {
        remove_if_exists(&self.payload_path(id)).await
    }

    /// First half of a delete: move the payload aside. Returns false if there was none.
    pub async fn tombstone_payload(&self, id: &ArtifactId) -> Result<bool, MeshError> {
        let from = self.payload_path(id);
        let to = self.tombstone_path(id);
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MeshError::storage(format!("rename {}", from.display()), e)),
        }
    }

    /// Undo `tombstone_payload`.
    pub async fn restore_tombstone(&self, id: &ArtifactId) -> Result<(), MeshError> {
        let from = self.tombstone_path(id);
        let to = self.payload_path(id);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| MeshError::storage(format!("restore {}", to.display()), e))
    }

    pub async fn purge_tombstone(&self, id: &ArtifactId) -> Result<(), MeshError> {
        remove_if_exists(&self.tombstone_path(id)).await
    }

    pub async fn remove_file(&self, path: &Path) -> Result<(), MeshError> {
        remove_if_exists(path).await
    }

    /// Read the index. A missing index is an empty catalog.
    pub async fn load_index(&self) -> Result<Vec<CatalogEntry>, MeshError> {
        let path = self.index_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MeshError::storage(format!("read {}", path.display()), e)),
        };
        let index: IndexFile = serde_json::from_slice(&bytes).map_err(|e| {
            MeshError::storage(
                format!("parse {}", path.display()),
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;
        if index.version != INDEX_VERSION {
            return Err(MeshError::storage(
                format!("parse {}", path.display()),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported index version {}", index.version),
                ),
            ));
        }
        Ok(index.entries)
    }

    /// Replace the index atomically.
    pub async fn write_index(&self, entries: &[CatalogEntry]) -> Result<(), MeshError> {
        let index = IndexFile {
            version: INDEX_VERSION,
            entries: entries.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&index).map_err(|e| {
            MeshError::storage("encode index", io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        replace_file(&self.artifacts_dir, &self.index_path(), &bytes).await
    }

    /// Classify every file in the payload directory.
    pub async fn scan_payloads(&self) -> Result<Vec<PayloadFile>, MeshError> {
        let mut dir = tokio::fs::read_dir(&self.payload_dir).await.map_err(|e| {
            MeshError::storage(format!("list {}", self.payload_dir.display()), e)
        })?;
        let mut out = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(MeshError::storage(
                        format!("list {}", self.payload_dir.display()),
                        e,
                    ))
                }
            };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(classify(&name, path));
        }
        Ok(out)
    }

    pub async fn load_preferences(&self) -> Result<Preferences, MeshError> {
        let path = self.data_dir.join(PREFERENCES_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                MeshError::storage(
                    format!("parse {}", path.display()),
                    io::Error::new(io::ErrorKind::InvalidData, e),
                )
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Preferences::default()),
            Err(e) => Err(MeshError::storage(format!("read {}", path.display()), e)),
        }
    }

    /// Read-modify-write the preferences record under the store's preferences lock.
    pub async fn update_preferences(
        &self,
        update: impl FnOnce(&mut Preferences),
    ) -> Result<Preferences, MeshError> {
        let _guard = self.prefs_lock.lock().await;
        let mut prefs = self.load_preferences().await?;
        update(&mut prefs);
        let bytes = serde_json::to_vec_pretty(&prefs).map_err(|e| {
            MeshError::storage(
                "encode preferences",
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;
        replace_file(&self.data_dir, &self.data_dir.join(PREFERENCES_FILE), &bytes).await?;
        Ok(prefs)
    }

    /// Peer id persisted in `node_id`, generated on first use.
    pub async fn load_or_create_peer_id(&self) -> Result<String, MeshError> {
        let path = self.data_dir.join(NODE_ID_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) if !s.trim().is_empty() => return Ok(s.trim().to_owned()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(MeshError::storage(format!("read {}", path.display()), e)),
        }
        let id = format!("node-{}", uuid::Uuid::new_v4().simple());
        replace_file(&self.data_dir, &path, id.as_bytes()).await?;
        tracing::info!(peer_id = %id, "generated peer id");
        Ok(id)
    }
}

fn classify(name: &str, path: PathBuf) -> PayloadFile {
    if let Some(rest) = name.strip_prefix('.') {
        if let Some(stem) = rest.strip_suffix(&format!(".{TEMP_EXT}")) {
            if let Some((id, _nonce)) = stem.rsplit_once('.') {
                if let Ok(id) = ArtifactId::new(id) {
                    return PayloadFile::Temp(id, path);
                }
            }
        }
        return PayloadFile::Unknown(path);
    }
    if let Some(id) = name.strip_suffix(&format!(".{PAYLOAD_EXT}")) {
        if let Ok(id) = ArtifactId::new(id) {
            return PayloadFile::Payload(id, path);
        }
    }
    if let Some(id) = name.strip_suffix(&format!(".{TOMBSTONE_EXT}")) {
        if let Ok(id) = ArtifactId::new(id) {
            return PayloadFile::Tombstone(id, path);
        }
    }
    PayloadFile::Unknown(path)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Temp file in `dir`, fsync, rename over `target`, sync `dir`.
async fn replace_file(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), MeshError> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(
        ".{name}.{}.{TEMP_EXT}",
        uuid::Uuid::new_v4().simple()
    ));
    if let Err(e) = write_synced(&temp, bytes).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(MeshError::storage(format!("write {}", temp.display()), e));
    }
    if let Err(e) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(MeshError::storage(format!("rename {}", target.display()), e));
    }
    sync_dir(dir)
        .await
        .map_err(|e| MeshError::storage(format!("sync {}", dir.display()), e))
}

async fn remove_if_exists(path: &Path) -> Result<(), MeshError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MeshError::storage(format!("remove {}", path.display()), e)),
    }
}

async fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        tokio::fs::File::open(dir).await?.sync_all().await?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
