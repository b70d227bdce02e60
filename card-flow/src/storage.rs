use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{ClozeMode, SlideResult};

/// Version written into every checkpoint. Files with a higher version are ignored.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    CHECKPOINT_SCHEMA_VERSION
}

/// Durable per-document progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub doc_id: String,
    pub total_slides: usize,
    #[serde(default)]
    pub cloze_mode: ClozeMode,
    #[serde(default)]
    pub completed_slide_ids: BTreeSet<u32>,
    #[serde(default)]
    pub accumulated_results: Vec<SlideResult>,
    /// Set once refinement finished, so a packaging retry does not refine again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_results: Option<Vec<SlideResult>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(doc_id: impl Into<String>, total_slides: usize, cloze_mode: ClozeMode) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            doc_id: doc_id.into(),
            total_slides,
            cloze_mode,
            completed_slide_ids: BTreeSet::new(),
            accumulated_results: Vec::new(),
            refined_results: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold one batch of results in. Completed ids only ever grow; a result for an
    /// id that is already present replaces the earlier one.
    pub fn absorb(&mut self, results: Vec<SlideResult>) {
        for result in results {
            self.completed_slide_ids.insert(result.page_id);
            match self
                .accumulated_results
                .iter_mut()
                .find(|existing| existing.page_id == result.page_id)
            {
                Some(existing) => *existing = result,
                None => self.accumulated_results.push(result),
            }
        }
        self.accumulated_results.sort_by_key(|r| r.page_id);
        self.updated_at = Utc::now();
    }

    pub fn is_completed(&self, page_id: u32) -> bool {
        self.completed_slide_ids.contains(&page_id)
    }
}

/// Coarse progress over a collection of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionProgress {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub completed_doc_ids: BTreeSet<String>,
    #[serde(default)]
    pub total_docs: usize,
    pub updated_at: DateTime<Utc>,
}

impl Default for CollectionProgress {
    fn default() -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            completed_doc_ids: BTreeSet::new(),
            total_docs: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Trait for storing and retrieving per-document checkpoints.
///
/// `load` returns `Ok(None)` when nothing usable exists, including unreadable or
/// corrupt checkpoints.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self, doc_id: &str) -> Result<Option<ProgressRecord>, StoreError>;
    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError>;
    async fn clear(&self, doc_id: &str) -> Result<(), StoreError>;
}

/// In-memory implementation of ProgressStore
#[derive(Default, Clone)]
pub struct InMemoryProgressStore {
    records: Arc<DashMap<String, ProgressRecord>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.records.contains_key(doc_id)
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn load(&self, doc_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.records.get(doc_id).map(|entry| entry.clone()))
    }

    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        self.records.insert(record.doc_id.clone(), record.clone());
        Ok(())
    }

    async fn clear(&self, doc_id: &str) -> Result<(), StoreError> {
        self.records.remove(doc_id);
        Ok(())
    }
}

/// JSON checkpoints under `<dir>/<doc_id>_progress.json`.
///
/// Assumes a single writer per directory; concurrent runs against the same
/// output directory are not guarded.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, doc_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}_progress.json", sanitize_file_stem(doc_id)))
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self, doc_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let path = self.path_for(doc_id);
        let record = read_versioned::<ProgressRecord>(&path).await;
        match record {
            Some(record) if record.doc_id != doc_id => {
                warn!(
                    doc_id,
                    found = %record.doc_id,
                    path = %path.display(),
                    "Checkpoint belongs to a different document, ignoring it"
                );
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        write_atomically(&self.path_for(&record.doc_id), &serde_json::to_vec_pretty(record)?)
            .await?;
        debug!(
            doc_id = %record.doc_id,
            completed = record.completed_slide_ids.len(),
            total = record.total_slides,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn clear(&self, doc_id: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.path_for(doc_id)).await
    }
}

/// Collection-level checkpoint at `<dir>/collection_progress.json`.
#[derive(Debug, Clone)]
pub struct CollectionStore {
    path: PathBuf,
}

impl CollectionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("collection_progress.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Option<CollectionProgress> {
        read_versioned(&self.path).await
    }

    pub async fn save(&self, progress: &CollectionProgress) -> Result<(), StoreError> {
        write_atomically(&self.path, &serde_json::to_vec_pretty(progress)?).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        remove_if_exists(&self.path).await
    }
}

/// Read a checkpoint file, treating absence, corruption and unknown future
/// versions as "no checkpoint".
async fn read_versioned<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read checkpoint, starting fresh");
            return None;
        }
    };

    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt checkpoint, starting fresh");
            return None;
        }
    };

    let version = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(u64::from(CHECKPOINT_SCHEMA_VERSION));
    if version > u64::from(CHECKPOINT_SCHEMA_VERSION) {
        warn!(
            path = %path.display(),
            version,
            supported = CHECKPOINT_SCHEMA_VERSION,
            "Checkpoint written by a newer format, ignoring it"
        );
        return None;
    }

    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable checkpoint, starting fresh");
            None
        }
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// File-system friendly form of a document id. Ids that need rewriting get a
/// short digest of the original appended, so `Week 1` and `Week_1` stay apart.
pub fn sanitize_file_stem(doc_id: &str) -> String {
    let stem: String = doc_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !stem.is_empty() && stem == doc_id {
        return stem;
    }

    let digest = Sha256::digest(doc_id.as_bytes());
    let fingerprint = digest[..4]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    let stem = if stem.is_empty() { "document" } else { stem.as_str() };
    format!("{stem}-{fingerprint}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CardRecord;

    fn result(page_id: u32, cards: usize) -> SlideResult {
        SlideResult {
            page_id,
            cards: (0..cards)
                .map(|i| CardRecord::new(page_id, format!("{{{{c1::fact {i}}}}}")))
                .collect(),
        }
    }

    #[test]
    fn absorb_grows_completed_ids_and_sorts() {
        let mut record = ProgressRecord::new("lecture", 4, ClozeMode::MultiGroup);
        record.absorb(vec![result(3, 1), result(1, 2)]);
        record.absorb(vec![result(2, 0)]);

        assert_eq!(
            record.completed_slide_ids.iter().copied().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let ids: Vec<_> = record.accumulated_results.iter().map(|r| r.page_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn file_store_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path());

        assert!(store.load("lecture one").await.unwrap().is_none());

        let mut record = ProgressRecord::new("lecture one", 3, ClozeMode::SingleGroup);
        record.absorb(vec![result(1, 1)]);
        store.save(&record).await.unwrap();
        assert!(store.path_for("lecture one").exists());

        let loaded = store.load("lecture one").await.unwrap().unwrap();
        assert_eq!(loaded, record);

        store.clear("lecture one").await.unwrap();
        assert!(!store.path_for("lecture one").exists());
        store.clear("lecture one").await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path());
        std::fs::write(store.path_for("broken"), b"{not json").unwrap();

        assert!(store.load("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn newer_schema_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path());
        let mut value =
            serde_json::to_value(ProgressRecord::new("future", 2, ClozeMode::MultiGroup)).unwrap();
        value["schema_version"] = serde_json::json!(CHECKPOINT_SCHEMA_VERSION + 1);
        std::fs::write(store.path_for("future"), value.to_string()).unwrap();

        assert!(store.load("future").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unversioned_checkpoint_with_extra_fields_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path());
        let raw = r#"{
            "doc_id": "legacy",
            "total_slides": 2,
            "completed_slide_ids": [1],
            "accumulated_results": [{"page_id": 1, "cards": []}],
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z",
            "start_time": "ignored"
        }"#;
        std::fs::write(store.path_for("legacy"), raw).unwrap();

        let record = store.load("legacy").await.unwrap().unwrap();
        assert_eq!(record.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert!(record.is_completed(1));
        assert!(record.refined_results.is_none());
    }

    #[tokio::test]
    async fn collection_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CollectionStore::new(dir.path());
        assert!(store.load().await.is_none());

        let mut progress = CollectionProgress::default();
        progress.completed_doc_ids.insert("a".into());
        progress.total_docs = 2;
        store.save(&progress).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert!(loaded.completed_doc_ids.contains("a"));
        store.clear().await.unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn sanitize_keeps_clean_ids_as_they_are() {
        assert_eq!(sanitize_file_stem("Cardio_Week-1.2"), "Cardio_Week-1.2");
        assert_eq!(sanitize_file_stem("document"), "document");
    }

    #[test]
    fn sanitize_replaces_unsafe_characters_and_tags_the_result() {
        let stem = sanitize_file_stem("Cardio Week 1/2");
        assert!(stem.starts_with("Cardio_Week_1_2-"), "{stem}");
        assert_eq!(stem.len(), "Cardio_Week_1_2-".len() + 8);
        assert!(stem.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)));
        assert_eq!(sanitize_file_stem("Cardio Week 1/2"), stem);

        let empty = sanitize_file_stem("");
        assert!(empty.starts_with("document-"), "{empty}");
        assert_ne!(empty, "document");
    }

    #[test]
    fn ids_that_sanitize_alike_get_distinct_stems() {
        let ids = ["Week 1", "Week_1", "Week/1", "Week:1"];
        let stems: std::collections::HashSet<_> =
            ids.iter().map(|id| sanitize_file_stem(id)).collect();
        assert_eq!(stems.len(), ids.len());
    }

    #[tokio::test]
    async fn colliding_ids_keep_separate_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path());
        store
            .save(&ProgressRecord::new("Week 1", 3, ClozeMode::MultiGroup))
            .await
            .unwrap();
        store
            .save(&ProgressRecord::new("Week_1", 5, ClozeMode::MultiGroup))
            .await
            .unwrap();

        assert_ne!(store.path_for("Week 1"), store.path_for("Week_1"));
        assert_eq!(store.load("Week 1").await.unwrap().unwrap().total_slides, 3);
        assert_eq!(store.load("Week_1").await.unwrap().unwrap().total_slides, 5);
    }
}
