//! Artifact Catalog: the single writer of truth for artifacts held on this device.
//!
//! Readers get `Arc` snapshots and never observe a half-applied change. Index mutations are
//! serialized by `write_lock`; payload writes for different artifacts run in parallel and
//! happen before the index is touched, so a crash leaves at worst an orphan payload that
//! `sweep` removes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mesh_core::artifact::newest_first;
use mesh_core::{ArtifactId, ArtifactMeta, ArtifactSummary, CatalogEntry, MeshError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::store::{CatalogStore, PayloadFile};

type Entries = Arc<HashMap<ArtifactId, CatalogEntry>>;

/// What a maintenance pass repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Index entries dropped because their payload was missing or the wrong length.
    pub dropped_entries: Vec<ArtifactId>,
    pub removed_orphan_payloads: usize,
    pub removed_temp_files: usize,
    pub removed_tombstones: usize,
    pub restored_tombstones: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.dropped_entries.is_empty()
            && self.removed_orphan_payloads == 0
            && self.removed_temp_files == 0
            && self.removed_tombstones == 0
            && self.restored_tombstones == 0
    }
}

pub struct Catalog {
    store: CatalogStore,
    entries: RwLock<Entries>,
    /// Ids with a save in flight; reserved before the payload write starts.
    pending: Mutex<HashSet<ArtifactId>>,
    write_lock: tokio::sync::Mutex<()>,
    summaries: watch::Sender<Vec<ArtifactSummary>>,
}

/// Releases a pending id when a save finishes, whatever the outcome.
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<ArtifactId>>,
    id: ArtifactId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl Catalog {
    /// Open the catalog under `data_dir`, load its index and run one sweep.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, MeshError> {
        let store = CatalogStore::open(data_dir.as_ref()).await?;
        let mut map = HashMap::new();
        let mut relocated = 0usize;
        for mut entry in store.load_index().await? {
            let id = entry.id().clone();
            if map.contains_key(&id) {
                tracing::warn!(artifact_id = %id, "duplicate index entry ignored");
                continue;
            }
            // Payloads always live in this store; the recorded path may predate a move.
            let path = store.payload_path(&id);
            if entry.file_path != path {
                tracing::debug!(
                    artifact_id = %id,
                    from = %entry.file_path.display(),
                    to = %path.display(),
                    "payload path rebound"
                );
                entry.file_path = path;
                relocated += 1;
            }
            map.insert(id, entry);
        }
        tracing::info!(
            data_dir = %data_dir.as_ref().display(),
            entries = map.len(),
            relocated,
            "catalog opened"
        );
        let entries: Entries = Arc::new(map);
        let (summaries, _) = watch::channel(summaries_of(&entries));
        let catalog = Self {
            store,
            entries: RwLock::new(entries),
            pending: Mutex::new(HashSet::new()),
            write_lock: tokio::sync::Mutex::new(()),
            summaries,
        };
        if relocated > 0 {
            let _w = catalog.write_lock.lock().await;
            let current = (*catalog.snapshot()).clone();
            catalog.commit(current).await?;
        }
        if let Err(e) = catalog.sweep().await {
            tracing::warn!(error = %e, "initial catalog sweep failed");
        }
        Ok(catalog)
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    fn snapshot(&self) -> Entries {
        self.entries.read().clone()
    }

    /// All entries, newest first.
    pub fn list(&self) -> Vec<CatalogEntry> {
        let mut out: Vec<CatalogEntry> = self.snapshot().values().cloned().collect();
        newest_first(&mut out);
        out
    }

    pub fn get(&self, id: &ArtifactId) -> Option<CatalogEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries for advertising, newest first.
    pub fn summaries(&self) -> Vec<ArtifactSummary> {
        self.summaries.borrow().clone()
    }

    /// Updated after every successful save, delete or repairing sweep.
    pub fn watch_summaries(&self) -> watch::Receiver<Vec<ArtifactSummary>> {
        self.summaries.subscribe()
    }

    fn reserve(&self, id: &ArtifactId) -> Result<Reservation<'_>, MeshError> {
        let mut pending = self.pending.lock();
        if self.contains(id) || pending.contains(id) {
            return Err(MeshError::Conflict(format!("artifact {id} already exists")));
        }
        pending.insert(id.clone());
        Ok(Reservation {
            pending: &self.pending,
            id: id.clone(),
        })
    }

    /// Persist `payload` under `meta.id`: payload first (durable), then the index.
    /// A duplicate id is a conflict. On a payload failure the index is untouched.
    pub async fn save(
        &self,
        payload: &[u8],
        meta: ArtifactMeta,
    ) -> Result<CatalogEntry, MeshError> {
        let id = meta.id.clone();
        let _reservation = self.reserve(&id)?;
        let file_path = self.store.write_payload(&id, payload).await?;
        let entry = CatalogEntry {
            meta,
            size_bytes: payload.len() as u64,
            file_path,
        };
        {
            let _w = self.write_lock.lock().await;
            let mut next = (*self.snapshot()).clone();
            next.insert(id.clone(), entry.clone());
            if let Err(e) = self.commit(next).await {
                if let Err(cleanup) = self.store.remove_payload(&id).await {
                    tracing::warn!(
                        artifact_id = %id,
                        error = %cleanup,
                        "orphan payload left for sweep"
                    );
                }
                return Err(e);
            }
        }
        tracing::info!(
            artifact_id = %id,
            title = %entry.meta.title,
            bytes = entry.size_bytes,
            "artifact saved"
        );
        Ok(entry)
    }

    pub async fn read_payload(&self, id: &ArtifactId) -> Result<Vec<u8>, MeshError> {
        self.read_artifact(id).await.map(|(_, bytes)| bytes)
    }

    /// Entry and payload bytes. The payload length is checked against `size_bytes`.
    pub async fn read_artifact(
        &self,
        id: &ArtifactId,
    ) -> Result<(CatalogEntry, Vec<u8>), MeshError> {
        let entry = self
            .get(id)
            .ok_or_else(|| MeshError::NotFound(format!("artifact {id}")))?;
        let bytes = self.store.read_payload(&entry.file_path).await?;
        if bytes.len() as u64 != entry.size_bytes {
            tracing::warn!(
                artifact_id = %id,
                expected = entry.size_bytes,
                found = bytes.len(),
                "payload length differs from catalog"
            );
            return Err(MeshError::storage(
                format!("read {}", entry.file_path.display()),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("expected {} bytes, found {}", entry.size_bytes, bytes.len()),
                ),
            ));
        }
        Ok((entry, bytes))
    }

    /// Remove an artifact's payload and index entry, or neither. Unknown ids succeed.
    pub async fn delete(&self, id: &ArtifactId) -> Result<(), MeshError> {
        let _w = self.write_lock.lock().await;
        let current = self.snapshot();
        if !current.contains_key(id) {
            return Ok(());
        }
        let moved = self.store.tombstone_payload(id).await?;
        let mut next = (*current).clone();
        next.remove(id);
        if let Err(e) = self.commit(next).await {
            if moved {
                if let Err(restore) = self.store.restore_tombstone(id).await {
                    tracing::warn!(artifact_id = %id, error = %restore, "tombstone left for sweep");
                }
            }
            return Err(e);
        }
        if let Err(e) = self.store.purge_tombstone(id).await {
            tracing::warn!(artifact_id = %id, error = %e, "tombstone left for sweep");
        }
        tracing::info!(artifact_id = %id, "artifact deleted");
        Ok(())
    }

    /// Write the index, then publish it. Caller holds `write_lock`.
    async fn commit(&self, next: HashMap<ArtifactId, CatalogEntry>) -> Result<(), MeshError> {
        let mut entries: Vec<CatalogEntry> = next.values().cloned().collect();
        newest_first(&mut entries);
        self.store.write_index(&entries).await?;
        let next: Entries = Arc::new(next);
        let summaries = summaries_of(&next);
        *self.entries.write() = next;
        self.summaries.send_replace(summaries);
        Ok(())
    }

    /// Maintenance pass: restore or purge tombstones, remove stale temp files and orphan
    /// payloads, and drop index entries whose payload is missing or the wrong length.
    pub async fn sweep(&self) -> Result<SweepReport, MeshError> {
        let _w = self.write_lock.lock().await;
        let current = self.snapshot();
        let mut report = SweepReport::default();

        for file in self.store.scan_payloads().await? {
            match file {
                PayloadFile::Tombstone(id, path) => {
                    let payload = self.store.payload_path(&id);
                    let missing = self.store.payload_len(&payload).await?.is_none();
                    if current.contains_key(&id) && missing {
                        self.store.restore_tombstone(&id).await?;
                        tracing::warn!(artifact_id = %id, "restored interrupted delete");
                        report.restored_tombstones += 1;
                    } else {
                        self.store.remove_file(&path).await?;
                        report.removed_tombstones += 1;
                    }
                }
                PayloadFile::Temp(id, path) => {
                    if !self.pending.lock().contains(&id) {
                        self.store.remove_file(&path).await?;
                        report.removed_temp_files += 1;
                    }
                }
                PayloadFile::Payload(id, path) => {
                    if !current.contains_key(&id) && !self.pending.lock().contains(&id) {
                        self.store.remove_file(&path).await?;
                        tracing::warn!(artifact_id = %id, "removed orphan payload");
                        report.removed_orphan_payloads += 1;
                    }
                }
                PayloadFile::Unknown(path) => {
                    tracing::debug!(path = %path.display(), "ignoring unknown file");
                }
            }
        }

        let mut next = (*current).clone();
        for (id, entry) in current.iter() {
            let path = self.store.payload_path(id);
            let len = self.store.payload_len(&path).await?;
            if len == Some(entry.size_bytes) {
                continue;
            }
            tracing::warn!(
                artifact_id = %id,
                expected = entry.size_bytes,
                found = ?len,
                "dropping index entry with bad payload"
            );
            if len.is_some() {
                self.store.remove_file(&path).await?;
            }
            next.remove(id);
            report.dropped_entries.push(id.clone());
        }
        if !report.dropped_entries.is_empty() {
            report.dropped_entries.sort();
            self.commit(next).await?;
        }
        if !report.is_clean() {
            tracing::info!(?report, "catalog sweep repaired state");
        }
        Ok(report)
    }
}

fn summaries_of(entries: &HashMap<ArtifactId, CatalogEntry>) -> Vec<ArtifactSummary> {
    let mut list: Vec<CatalogEntry> = entries.values().cloned().collect();
    newest_first(&mut list);
    list.iter().map(CatalogEntry::summary).collect()
}

/// Run `sweep` every `interval` until the task is aborted.
pub fn spawn_maintenance(
    catalog: Arc<Catalog>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = catalog.sweep().await {
                tracing::warn!(error = %e, "catalog sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn meta(id: &str, secs: i64) -> ArtifactMeta {
        ArtifactMeta {
            id: ArtifactId::new(id).unwrap(),
            filename: format!("Worksheet_{id}.pdf"),
            title: format!("Worksheet {id}"),
            subject: "science".into(),
            grade: "5".into(),
            language: "en".into(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn aid(s: &str) -> ArtifactId {
        ArtifactId::new(s).unwrap()
    }

    #[tokio::test]
    async fn save_then_get_round_trip() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let payload = b"%PDF-1.4 plants need light".to_vec();
        let m = meta("pdf-001", 0);
        let saved = catalog.save(&payload, m.clone()).await.unwrap();

        let got = catalog.get(&aid("pdf-001")).unwrap();
        assert_eq!(got, saved);
        assert_eq!(got.meta, m);
        assert_eq!(got.size_bytes, payload.len() as u64);
        assert_eq!(got.file_path, catalog.store().payload_path(&aid("pdf-001")));
        assert_eq!(catalog.read_payload(&aid("pdf-001")).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        catalog.save(b"a", meta("old", 0)).await.unwrap();
        catalog.save(b"b", meta("new", 20)).await.unwrap();
        catalog.save(b"c", meta("mid", 10)).await.unwrap();
        let ids: Vec<String> = catalog
            .list()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        let summary_ids: Vec<String> =
            catalog.summaries().iter().map(|s| s.id.to_string()).collect();
        assert_eq!(summary_ids, ids);
    }

    #[tokio::test]
    async fn duplicate_id_is_conflict() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        catalog.save(b"first", meta("pdf-001", 0)).await.unwrap();
        let err = catalog.save(b"second!", meta("pdf-001", 5)).await.unwrap_err();
        assert!(matches!(err, MeshError::Conflict(_)));
        let (entry, bytes) = catalog.read_artifact(&aid("pdf-001")).await.unwrap();
        assert_eq!(bytes, b"first");
        assert_eq!(entry.size_bytes, 5);
    }

    #[tokio::test]
    async fn concurrent_saves_same_id_one_wins() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let (a, b) = tokio::join!(
            catalog.save(b"aaaa", meta("pdf-001", 0)),
            catalog.save(b"bbbbbb", meta("pdf-001", 0))
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_saves_distinct_ids_all_persist() {
        let tmp = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::open(tmp.path()).await.unwrap());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let catalog = catalog.clone();
            tasks.push(tokio::spawn(async move {
                catalog
                    .save(&vec![i as u8; 100 + i], meta(&format!("pdf-{i:03}"), i as i64))
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(catalog.len(), 8);
        let reopened = Catalog::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.len(), 8);
        assert_eq!(reopened.get(&aid("pdf-007")).unwrap().size_bytes, 107);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let entry = catalog.save(b"payload", meta("pdf-001", 0)).await.unwrap();
        catalog.delete(&aid("pdf-001")).await.unwrap();
        catalog.delete(&aid("pdf-001")).await.unwrap();
        assert!(catalog.get(&aid("pdf-001")).is_none());
        assert!(!entry.file_path.exists());
        assert!(catalog.store().scan_payloads().await.unwrap().is_empty());
        assert!(Catalog::open(tmp.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_id_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        catalog.save(b"keep", meta("keep", 0)).await.unwrap();
        catalog.delete(&aid("never-saved")).await.unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn payload_failure_leaves_index_untouched() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        catalog.save(b"existing", meta("existing", 0)).await.unwrap();
        let index_before = tokio::fs::read(catalog.store().index_path()).await.unwrap();

        // A regular file where the payload directory should be makes every payload write fail.
        let payloads = tmp.path().join("artifacts/payloads");
        tokio::fs::remove_dir_all(&payloads).await.unwrap();
        tokio::fs::write(&payloads, b"not a directory").await.unwrap();

        let err = catalog.save(b"new", meta("new", 1)).await.unwrap_err();
        assert!(matches!(err, MeshError::Storage { .. }));
        assert!(catalog.get(&aid("new")).is_none());
        let index_after = tokio::fs::read(catalog.store().index_path()).await.unwrap();
        assert_eq!(index_before, index_after);
        // The id is free again once the failed save released it.
        tokio::fs::remove_file(&payloads).await.unwrap();
        tokio::fs::create_dir_all(&payloads).await.unwrap();
        catalog.save(b"new", meta("new", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_index_write_keeps_deleted_artifact() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let entry = catalog.save(b"payload", meta("pdf-001", 0)).await.unwrap();

        // A directory at the index path makes the atomic rename fail.
        let index = catalog.store().index_path();
        tokio::fs::remove_file(&index).await.unwrap();
        tokio::fs::create_dir(&index).await.unwrap();

        assert!(catalog.delete(&aid("pdf-001")).await.is_err());
        assert!(catalog.get(&aid("pdf-001")).is_some());
        assert_eq!(tokio::fs::read(&entry.file_path).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn sweep_repairs_inconsistencies() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let gone = catalog.save(b"gone", meta("gone", 0)).await.unwrap();
        let short = catalog.save(b"0123456789", meta("short", 1)).await.unwrap();
        catalog.save(b"fine", meta("fine", 2)).await.unwrap();

        tokio::fs::remove_file(&gone.file_path).await.unwrap();
        tokio::fs::write(&short.file_path, b"01234").await.unwrap();
        let store = catalog.store();
        tokio::fs::write(store.payload_path(&aid("orphan")), b"x")
            .await
            .unwrap();
        let payload_dir = store.payload_path(&aid("x")).parent().unwrap().to_path_buf();
        tokio::fs::write(payload_dir.join(".stale.0011.tmp"), b"x")
            .await
            .unwrap();
        tokio::fs::write(payload_dir.join("old.deleting"), b"x")
            .await
            .unwrap();

        let report = catalog.sweep().await.unwrap();
        assert_eq!(report.dropped_entries, vec![aid("gone"), aid("short")]);
        assert_eq!(report.removed_orphan_payloads, 1);
        assert_eq!(report.removed_temp_files, 1);
        assert_eq!(report.removed_tombstones, 1);

        let ids: Vec<String> = catalog.list().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["fine"]);
        assert!(catalog.sweep().await.unwrap().is_clean());
        assert_eq!(Catalog::open(tmp.path()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn open_drops_entries_without_payload() {
        let tmp = TempDir::new().unwrap();
        {
            let catalog = Catalog::open(tmp.path()).await.unwrap();
            let entry = catalog.save(b"payload", meta("pdf-001", 0)).await.unwrap();
            catalog.save(b"other", meta("pdf-002", 1)).await.unwrap();
            tokio::fs::remove_file(&entry.file_path).await.unwrap();
        }
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        assert!(catalog.get(&aid("pdf-001")).is_none());
        assert!(catalog.get(&aid("pdf-002")).is_some());
    }

    #[tokio::test]
    async fn sweep_restores_interrupted_delete() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let entry = catalog.save(b"payload", meta("pdf-001", 0)).await.unwrap();
        // Crash after the payload was moved aside but before the index was rewritten.
        catalog.store().tombstone_payload(&aid("pdf-001")).await.unwrap();

        let report = catalog.sweep().await.unwrap();
        assert_eq!(report.restored_tombstones, 1);
        assert!(report.dropped_entries.is_empty());
        assert_eq!(tokio::fs::read(&entry.file_path).await.unwrap(), b"payload");
    }

    fn copy_tree(from: &Path, to: &Path) {
        std::fs::create_dir_all(to).unwrap();
        for entry in std::fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            let target = to.join(entry.file_name());
            if entry.file_type().unwrap().is_dir() {
                copy_tree(&entry.path(), &target);
            } else {
                std::fs::copy(entry.path(), &target).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn moved_data_dir_keeps_artifacts() {
        let original = TempDir::new().unwrap();
        {
            let catalog = Catalog::open(original.path()).await.unwrap();
            catalog.save(b"payload", meta("pdf-001", 0)).await.unwrap();
        }
        let moved = TempDir::new().unwrap();
        copy_tree(original.path(), moved.path());
        drop(original);

        let catalog = Catalog::open(moved.path()).await.unwrap();
        assert_eq!(catalog.len(), 1);
        let entry = catalog.get(&aid("pdf-001")).unwrap();
        assert_eq!(entry.file_path, catalog.store().payload_path(&aid("pdf-001")));
        assert!(entry.file_path.starts_with(moved.path()));
        assert_eq!(catalog.read_payload(&aid("pdf-001")).await.unwrap(), b"payload");
        assert!(catalog.sweep().await.unwrap().is_clean());
        assert!(entry.file_path.exists());

        // The rebound path was written back.
        let index = catalog.store().load_index().await.unwrap();
        assert_eq!(index[0].file_path, entry.file_path);
    }

    #[tokio::test]
    async fn summaries_watch_follows_changes() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::open(tmp.path()).await.unwrap();
        let mut rx = catalog.watch_summaries();
        assert!(rx.borrow_and_update().is_empty());
        catalog.save(b"12345", meta("pdf-001", 0)).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update()[0].size_bytes, 5);
        catalog.delete(&aid("pdf-001")).await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }
}
