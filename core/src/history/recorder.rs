//! History recorder implementation

use crate::error::{HistoryError, Result};
use crate::history::QueryHistory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

/// Keeps the history of every query a tree answered, optionally mirrored to a JSON file
pub struct HistoryRecorder {
    entries: RwLock<Vec<QueryHistory>>,
    file_path: Option<PathBuf>,
    auto_save: bool,
}

/// History file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryFile {
    pub metadata: HistoryMetadata,
    pub entries: Vec<QueryHistory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMetadata {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: String,
    pub total_queries: usize,
    pub total_seconds: f64,
}

impl HistoryRecorder {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            file_path: None,
            auto_save: false,
        }
    }

    /// Save to `path` after every recorded query
    pub fn with_file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            file_path: Some(path.as_ref().to_path_buf()),
            auto_save: true,
        }
    }

    /// Record a query; a repeated query id replaces the earlier entry
    pub async fn record(&self, entry: QueryHistory) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            entries.retain(|e| e.query_id != entry.query_id);
            entries.push(entry);
        }

        if self.auto_save {
            self.save().await?;
        }
        Ok(())
    }

    pub async fn get(&self, query_id: &str) -> Option<QueryHistory> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.query_id == query_id)
            .cloned()
    }

    pub async fn get_entries(&self) -> Vec<QueryHistory> {
        self.entries.read().await.clone()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Write the history file, if one is set
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };

        let file = self.build_file().await;
        let json = serde_json::to_string_pretty(&file).map_err(|e| HistoryError::RecordingFailed {
            message: format!("Failed to serialize history: {}", e),
        })?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, json).await?;
        tracing::debug!("History saved to {}", path.display());
        Ok(())
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<HistoryFile> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HistoryError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }
            .into());
        }

        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|_| HistoryError::InvalidFormat.into())
    }

    async fn build_file(&self) -> HistoryFile {
        let entries = self.entries.read().await.clone();
        let started_at = entries
            .first()
            .map(|e| e.recorded_at)
            .unwrap_or_else(Utc::now);

        HistoryFile {
            metadata: HistoryMetadata {
                id: uuid::Uuid::new_v4().to_string(),
                started_at,
                updated_at: entries.last().map(|e| e.recorded_at),
                version: "1.0".to_string(),
                total_queries: entries.len(),
                total_seconds: entries.iter().map(|e| e.time_taken_seconds).sum(),
            },
            entries,
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }
}

impl Default for HistoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(query_id: &str, seconds: f64) -> QueryHistory {
        QueryHistory {
            query_id: query_id.to_string(),
            user_prompt: "hello".to_string(),
            num_trees_completed: 1,
            tree_data: None,
            action_information: Vec::new(),
            decision_history: vec!["search".to_string(), "query".to_string()],
            base_lm_used: "mock-model".to_string(),
            complex_lm_used: "mock-model".to_string(),
            time_taken_seconds: seconds,
            initialisation: "one_branch".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_replaces_same_query() {
        let recorder = HistoryRecorder::new();
        recorder.record(entry("q1", 1.0)).await.unwrap();
        recorder.record(entry("q2", 1.0)).await.unwrap();
        recorder.record(entry("q1", 2.5)).await.unwrap();

        assert_eq!(recorder.entry_count().await, 2);
        assert_eq!(recorder.get("q1").await.unwrap().time_taken_seconds, 2.5);
        assert!(recorder.get("missing").await.is_none());
    }

    #[test]
    fn test_empty_recorder() {
        let recorder = HistoryRecorder::new();
        tokio_test::block_on(async {
            assert_eq!(recorder.entry_count().await, 0);
            assert!(recorder.get("q1").await.is_none());
        });
    }

    #[tokio::test]
    async fn test_auto_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.json");
        let recorder = HistoryRecorder::with_file(&path);
        recorder.record(entry("q1", 1.5)).await.unwrap();
        recorder.record(entry("q2", 0.5)).await.unwrap();

        let file = HistoryRecorder::load(&path).await.unwrap();
        assert_eq!(file.metadata.total_queries, 2);
        assert_eq!(file.metadata.total_seconds, 2.0);
        assert_eq!(file.entries[1].query_id, "q2");

        let tools = vec!["query".to_string()];
        assert_eq!(file.entries[0].tools_used(&tools).collect::<Vec<_>>(), vec!["query"]);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = HistoryRecorder::load("/nonexistent/history.json").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::History(HistoryError::LoadFailed { .. })
        ));
    }
}
