use crate::common::types::UploadRecord;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Table holding one document per uploaded workout.
pub const HISTORY_TABLE: &str = "garminUploadHistory";

#[derive(Debug)]
pub enum HistoryError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Corrupt(String),
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::Io(e) => write!(f, "IO error: {e}"),
            HistoryError::Serialization(e) => write!(f, "Serialization error: {e}"),
            HistoryError::Corrupt(msg) => write!(f, "Corrupt upload history: {msg}"),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<std::io::Error> for HistoryError {
    fn from(err: std::io::Error) -> Self {
        HistoryError::Io(err)
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        HistoryError::Serialization(err)
    }
}

/// An open handle on the upload history.
pub trait UploadHistory {
    fn contains(&self, workout_id: &str) -> Result<bool, HistoryError>;
    /// Appends `record`. Callers check `contains` first, duplicates are not rejected here.
    fn insert(&mut self, record: UploadRecord) -> Result<(), HistoryError>;
    fn close(self) -> Result<(), HistoryError>
    where
        Self: Sized;
}

/// Opens handles on an upload history; one handle is live at a time.
pub trait HistoryBackend {
    type Store: UploadHistory;

    fn open(&self) -> Result<Self::Store, HistoryError>;
}

/// Upload history kept in a JSON document database file.
///
/// The layout is `{"garminUploadHistory": {"1": {...}, "2": {...}}}` with ascending
/// numeric document ids. Other top-level tables are carried along untouched.
#[derive(Debug, Clone)]
pub struct JsonHistoryFile {
    path: PathBuf,
}

impl JsonHistoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryBackend for JsonHistoryFile {
    type Store = JsonUploadHistory;

    fn open(&self) -> Result<JsonUploadHistory, HistoryError> {
        JsonUploadHistory::open(&self.path)
    }
}

#[derive(Debug)]
pub struct JsonUploadHistory {
    path: PathBuf,
    document: Map<String, Value>,
    workout_ids: HashSet<String>,
    last_doc_id: u64,
}

impl JsonUploadHistory {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let document = match fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => Map::new(),
            Ok(contents) => serde_json::from_str::<Map<String, Value>>(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No upload history at {}, starting fresh", path.display());
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut workout_ids = HashSet::new();
        let mut last_doc_id = 0;

        match document.get(HISTORY_TABLE) {
            Some(Value::Object(table)) => {
                for (doc_id, record) in table {
                    let workout_id = record
                        .get("workoutId")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            HistoryError::Corrupt(format!("document {doc_id} has no workoutId"))
                        })?;
                    workout_ids.insert(workout_id.to_string());
                    if let Ok(id) = doc_id.parse::<u64>() {
                        last_doc_id = last_doc_id.max(id);
                    }
                }
            }
            Some(_) => {
                return Err(HistoryError::Corrupt(format!(
                    "{HISTORY_TABLE} is not a table"
                )));
            }
            None => {}
        }

        info!(
            "Loaded upload history with {} workouts from {}",
            workout_ids.len(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            document,
            workout_ids,
            last_doc_id,
        })
    }

    /// Every record in document order; malformed documents are skipped.
    pub fn records(&self) -> Vec<UploadRecord> {
        let Some(Value::Object(table)) = self.document.get(HISTORY_TABLE) else {
            return Vec::new();
        };

        let mut entries: Vec<(u64, UploadRecord)> = Vec::with_capacity(table.len());
        for (doc_id, value) in table {
            match serde_json::from_value::<UploadRecord>(value.clone()) {
                Ok(record) => entries.push((doc_id.parse().unwrap_or(u64::MAX), record)),
                Err(e) => warn!("Skipping malformed upload history document {}: {}", doc_id, e),
            }
        }
        entries.sort_by_key(|(doc_id, _)| *doc_id);
        entries.into_iter().map(|(_, record)| record).collect()
    }

    pub fn len(&self) -> usize {
        self.workout_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workout_ids.is_empty()
    }

    fn persist(&self) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let serialized = serde_json::to_vec(&self.document)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, serialized)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl UploadHistory for JsonUploadHistory {
    fn contains(&self, workout_id: &str) -> Result<bool, HistoryError> {
        Ok(self.workout_ids.contains(workout_id))
    }

    fn insert(&mut self, record: UploadRecord) -> Result<(), HistoryError> {
        let value = serde_json::to_value(&record)?;
        let table = self
            .document
            .entry(HISTORY_TABLE)
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(table) = table else {
            return Err(HistoryError::Corrupt(format!(
                "{HISTORY_TABLE} is not a table"
            )));
        };

        let doc_id = self.last_doc_id + 1;
        table.insert(doc_id.to_string(), value);
        self.last_doc_id = doc_id;
        self.workout_ids.insert(record.workout_id.clone());

        self.persist()?;
        debug!(
            "Recorded upload of workout {} as document {}",
            record.workout_id, doc_id
        );
        Ok(())
    }

    fn close(self) -> Result<(), HistoryError> {
        debug!("Closed upload history {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tempdir::TempDir;

    fn record(workout_id: &str) -> UploadRecord {
        UploadRecord {
            workout_id: workout_id.to_string(),
            title: format!("Ride {workout_id}"),
            upload_dt: NaiveDateTime::parse_from_str("2024-01-02 03:04:05", "%Y-%m-%d %H:%M:%S")
                .unwrap(),
        }
    }

    #[test]
    fn test_missing_file_opens_empty() {
        let dir = TempDir::new("history").unwrap();
        let store = JsonHistoryFile::new(dir.path().join("database.json"))
            .open()
            .unwrap();

        assert!(store.is_empty());
        assert!(!store.contains("w1").unwrap());
    }

    #[test]
    fn test_inserts_persist_across_reopen() {
        let dir = TempDir::new("history").unwrap();
        let backend = JsonHistoryFile::new(dir.path().join("database.json"));

        let mut store = backend.open().unwrap();
        store.insert(record("w1")).unwrap();
        store.insert(record("w2")).unwrap();
        assert!(store.contains("w1").unwrap());
        store.close().unwrap();

        let reopened = backend.open().unwrap();
        assert!(reopened.contains("w1").unwrap());
        assert!(reopened.contains("w2").unwrap());
        assert!(!reopened.contains("w3").unwrap());
        assert_eq!(reopened.records(), vec![record("w1"), record("w2")]);
    }

    #[test]
    fn test_document_layout() {
        let dir = TempDir::new("history").unwrap();
        let path = dir.path().join("database.json");
        fs::write(
            &path,
            r#"{"_default": {"1": {"note": "kept"}}, "garminUploadHistory": {"7": {"workoutId": "old", "title": "Old ride", "uploadDt": "2023-05-06 07:08:09"}}}"#,
        )
        .unwrap();

        let mut store = JsonUploadHistory::open(&path).unwrap();
        assert!(store.contains("old").unwrap());
        store.insert(record("new")).unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["_default"]["1"]["note"], "kept");
        assert_eq!(saved[HISTORY_TABLE]["8"]["workoutId"], "new");
        assert_eq!(saved[HISTORY_TABLE]["8"]["uploadDt"], "2024-01-02 03:04:05");
        assert_eq!(saved[HISTORY_TABLE]["7"]["title"], "Old ride");
    }

    #[test]
    fn test_corrupt_table_is_rejected() {
        let dir = TempDir::new("history").unwrap();
        let path = dir.path().join("database.json");
        fs::write(&path, r#"{"garminUploadHistory": [1, 2, 3]}"#).unwrap();

        let result = JsonUploadHistory::open(&path);
        assert!(matches!(result, Err(HistoryError::Corrupt(_))));
    }
}
