//! Durable history of completed generations with quota-aware eviction.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::GenError,
    model::{now_ms, GeneratedImage},
};

pub mod sqlite;

pub use sqlite::SqliteHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Millisecond timestamp, unique and increasing across restarts.
    pub id: i64,
    pub timestamp: i64,
    pub kind: RecordKind,
    pub prompt: String,
    #[serde(default)]
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEstimate {
    pub used: u64,
    pub quota: u64,
}

impl StorageEstimate {
    pub fn available(&self) -> u64 {
        self.quota.saturating_sub(self.used)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Key-value persistence for history records, keyed by record id.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Insert or replace. Fails with [`StoreError::QuotaExceeded`] when the
    /// record does not fit in the remaining space.
    async fn put(&self, record: &HistoryRecord) -> Result<(), StoreError>;

    async fn get_all(&self) -> Result<Vec<HistoryRecord>, StoreError>;

    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    async fn clear(&self) -> Result<usize, StoreError>;

    async fn oldest_id(&self) -> Result<Option<i64>, StoreError>;

    async fn newest_id(&self) -> Result<Option<i64>, StoreError>;

    async fn estimate(&self) -> Result<StorageEstimate, StoreError>;
}

/// Serialized size of a record as the backends account for it.
pub fn estimate_size(record: &HistoryRecord) -> u64 {
    serde_json::to_vec(record).map(|v| v.len() as u64).unwrap_or(0)
}

const SUGGEST_SHRINK: &str =
    "reduce the number of images per generation, or lower the image resolution";
const SUGGEST_CLEAR: &str =
    "clear more history manually from the gallery, or reduce the number of images per generation";

/// Result of a [`HistoryStore::save`] attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved { evicted: u32 },
    /// Larger than the single-record ceiling; nothing was evicted.
    TooLarge { record_size: u64, ceiling: u64 },
    /// Eviction cap reached without the write fitting.
    Exhausted { record_size: u64, quota: u64, evicted: u32 },
    /// Quota exceeded but the store had nothing left to evict.
    NothingToEvict { record_size: u64, evicted: u32 },
    Failed { evicted: u32, message: String },
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }

    pub fn evicted(&self) -> u32 {
        match self {
            Self::Saved { evicted }
            | Self::Exhausted { evicted, .. }
            | Self::NothingToEvict { evicted, .. }
            | Self::Failed { evicted, .. } => *evicted,
            Self::TooLarge { .. } => 0,
        }
    }

    pub fn error(&self) -> Option<GenError> {
        match self {
            Self::Saved { .. } => None,
            Self::TooLarge { record_size, ceiling } => Some(GenError::RecordTooLarge {
                record_size: *record_size,
                ceiling: *ceiling,
            }),
            Self::Exhausted { evicted, .. } | Self::NothingToEvict { evicted, .. } => {
                Some(GenError::Quota { evicted: *evicted })
            }
            Self::Failed { message, .. } => Some(GenError::Storage(message.clone())),
        }
    }

    pub fn report(&self) -> SaveReport {
        let error = self.error();
        let details = match self {
            Self::Saved { .. } | Self::Failed { .. } => None,
            Self::TooLarge { record_size, ceiling } => Some(SaveDetails {
                record_size: *record_size,
                quota_ceiling: Some(*ceiling),
                evicted: 0,
                suggestion: SUGGEST_SHRINK,
            }),
            Self::Exhausted { record_size, quota, evicted } => Some(SaveDetails {
                record_size: *record_size,
                quota_ceiling: Some(*quota),
                evicted: *evicted,
                suggestion: SUGGEST_CLEAR,
            }),
            Self::NothingToEvict { record_size, evicted } => Some(SaveDetails {
                record_size: *record_size,
                quota_ceiling: None,
                evicted: *evicted,
                suggestion: SUGGEST_SHRINK,
            }),
        };
        SaveReport {
            success: self.is_saved(),
            evicted_count: self.evicted(),
            reason: error.as_ref().map(GenError::reason),
            error: error.map(|e| e.to_string()),
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub success: bool,
    pub evicted_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<SaveDetails>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDetails {
    pub record_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_ceiling: Option<u64>,
    pub evicted: u32,
    pub suggestion: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub count: usize,
    pub total_size: u64,
    pub used: u64,
    pub quota: u64,
    pub available: u64,
    pub usage_percentage: f64,
}

pub struct HistoryStore {
    backend: Arc<dyn HistoryBackend>,
    max_evictions: u32,
    writer: tokio::sync::Mutex<()>,
    last_id: tokio::sync::Mutex<Option<i64>>,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn HistoryBackend>, max_evictions: u32) -> Self {
        Self {
            backend,
            max_evictions,
            writer: tokio::sync::Mutex::new(()),
            last_id: tokio::sync::Mutex::new(None),
        }
    }

    /// Next record id: the current millisecond, bumped past the last id
    /// issued. The first call seeds from the newest stored id so a clock that
    /// moved backwards across a restart never reuses an existing id.
    pub async fn next_id(&self) -> i64 {
        let mut last = self.last_id.lock().await;
        let floor = match *last {
            Some(id) => id,
            None => match self.backend.newest_id().await {
                Ok(newest) => newest.unwrap_or(0),
                Err(err) => {
                    tracing::warn!(error = %err, "could not read newest history id");
                    0
                }
            },
        };
        let id = now_ms().max(floor + 1);
        *last = Some(id);
        id
    }

    /// Persist `record`, evicting the oldest records while the backend
    /// reports the quota as exceeded.
    ///
    /// A record above 80% of the total quota is refused up front since no
    /// amount of eviction could make it fit.
    pub async fn save(&self, record: &HistoryRecord) -> SaveOutcome {
        let _writer = self.writer.lock().await;

        let record_size = estimate_size(record);
        let estimate = match self.backend.estimate().await {
            Ok(estimate) => estimate,
            Err(err) => {
                tracing::error!(error = %err, "history storage estimate failed");
                return SaveOutcome::Failed { evicted: 0, message: err.to_string() };
            }
        };

        tracing::info!(
            id = record.id,
            record_size,
            used = estimate.used,
            quota = estimate.quota,
            "saving history record"
        );

        let ceiling = (u128::from(estimate.quota) * 4 / 5) as u64;
        if record_size > ceiling {
            tracing::warn!(record_size, ceiling, "history record exceeds single-record ceiling");
            return SaveOutcome::TooLarge { record_size, ceiling };
        }
        if record_size > estimate.available() {
            tracing::info!(
                record_size,
                available = estimate.available(),
                "history space is short, older records may be evicted"
            );
        }

        let mut evicted = 0u32;
        loop {
            match self.backend.put(record).await {
                Ok(()) => {
                    if evicted > 0 {
                        tracing::info!(id = record.id, evicted, "history record saved after eviction");
                    }
                    return SaveOutcome::Saved { evicted };
                }
                Err(StoreError::QuotaExceeded) => {}
                Err(StoreError::Other(err)) => {
                    tracing::error!(error = %err, "history write failed");
                    return SaveOutcome::Failed { evicted, message: err.to_string() };
                }
            }

            if evicted >= self.max_evictions {
                tracing::warn!(evicted, record_size, "history eviction cap reached");
                return SaveOutcome::Exhausted {
                    record_size,
                    quota: estimate.quota,
                    evicted,
                };
            }

            let oldest = match self.backend.oldest_id().await {
                Ok(Some(id)) => id,
                Ok(None) => return SaveOutcome::NothingToEvict { record_size, evicted },
                Err(err) => return SaveOutcome::Failed { evicted, message: err.to_string() },
            };
            if let Err(err) = self.backend.delete(oldest).await {
                return SaveOutcome::Failed {
                    evicted,
                    message: format!("failed to evict record {oldest}: {err}"),
                };
            }
            evicted += 1;
            tracing::warn!(evicted_id = oldest, round = evicted, "evicted oldest history record");
        }
    }

    /// All records, newest first.
    pub async fn get_all(&self) -> Result<Vec<HistoryRecord>, GenError> {
        let mut records = self.backend.get_all().await.map_err(storage_error)?;
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    pub async fn delete_one(&self, id: i64) -> Result<bool, GenError> {
        let _writer = self.writer.lock().await;
        self.backend.delete(id).await.map_err(storage_error)
    }

    pub async fn clear_all(&self) -> Result<usize, GenError> {
        let _writer = self.writer.lock().await;
        self.backend.clear().await.map_err(storage_error)
    }

    pub async fn stats(&self) -> Result<HistoryStats, GenError> {
        let records = self.backend.get_all().await.map_err(storage_error)?;
        let estimate = self.backend.estimate().await.map_err(storage_error)?;
        let usage_percentage = if estimate.quota == 0 {
            0.0
        } else {
            estimate.used as f64 / estimate.quota as f64 * 100.0
        };
        Ok(HistoryStats {
            count: records.len(),
            total_size: records.iter().map(estimate_size).sum(),
            used: estimate.used,
            quota: estimate.quota,
            available: estimate.available(),
            usage_percentage,
        })
    }
}

fn storage_error(err: StoreError) -> GenError {
    match err {
        StoreError::QuotaExceeded => GenError::Quota { evicted: 0 },
        StoreError::Other(err) => GenError::Storage(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    /// Map-backed store that enforces a byte quota on put.
    struct MemoryBackend {
        quota: u64,
        records: Mutex<BTreeMap<i64, HistoryRecord>>,
        puts: Mutex<u32>,
    }

    impl MemoryBackend {
        fn new(quota: u64) -> Arc<Self> {
            Arc::new(Self {
                quota,
                records: Mutex::new(BTreeMap::new()),
                puts: Mutex::new(0),
            })
        }

        fn used(records: &BTreeMap<i64, HistoryRecord>) -> u64 {
            records.values().map(estimate_size).sum()
        }

        fn ids(&self) -> Vec<i64> {
            self.records.lock().unwrap().keys().copied().collect()
        }
    }

    #[async_trait]
    impl HistoryBackend for MemoryBackend {
        async fn put(&self, record: &HistoryRecord) -> Result<(), StoreError> {
            *self.puts.lock().unwrap() += 1;
            let mut records = self.records.lock().unwrap();
            let others: u64 = records
                .iter()
                .filter(|(id, _)| **id != record.id)
                .map(|(_, r)| estimate_size(r))
                .sum();
            if others + estimate_size(record) > self.quota {
                return Err(StoreError::QuotaExceeded);
            }
            records.insert(record.id, record.clone());
            Ok(())
        }

        async fn get_all(&self) -> Result<Vec<HistoryRecord>, StoreError> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn delete(&self, id: i64) -> Result<bool, StoreError> {
            Ok(self.records.lock().unwrap().remove(&id).is_some())
        }

        async fn clear(&self) -> Result<usize, StoreError> {
            let mut records = self.records.lock().unwrap();
            let n = records.len();
            records.clear();
            Ok(n)
        }

        async fn oldest_id(&self) -> Result<Option<i64>, StoreError> {
            Ok(self.records.lock().unwrap().keys().next().copied())
        }

        async fn newest_id(&self) -> Result<Option<i64>, StoreError> {
            Ok(self.records.lock().unwrap().keys().next_back().copied())
        }

        async fn estimate(&self) -> Result<StorageEstimate, StoreError> {
            let records = self.records.lock().unwrap();
            Ok(StorageEstimate {
                used: Self::used(&records),
                quota: self.quota,
            })
        }
    }

    /// A record whose serialized size is exactly `size` bytes.
    fn record_of_size(id: i64, size: u64) -> HistoryRecord {
        let mut record = HistoryRecord {
            id,
            timestamp: id,
            kind: RecordKind::Image,
            prompt: String::new(),
            images: Vec::new(),
            video_url: None,
            params: serde_json::Value::Null,
        };
        let base = estimate_size(&record);
        record.prompt = "x".repeat((size - base) as usize);
        assert_eq!(estimate_size(&record), size);
        record
    }

    #[tokio::test]
    async fn oversized_record_is_refused_without_eviction() {
        let backend = MemoryBackend::new(10_000);
        let store = HistoryStore::new(backend.clone(), 10);
        store.save(&record_of_size(1, 500)).await;

        let outcome = store.save(&record_of_size(2, 9_000)).await;
        assert_matches!(outcome, SaveOutcome::TooLarge { record_size: 9_000, ceiling: 8_000 });
        assert_eq!(outcome.evicted(), 0);
        assert_eq!(backend.ids(), vec![1]);
        assert_eq!(*backend.puts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn evicts_oldest_until_the_record_fits() {
        let backend = MemoryBackend::new(10_000);
        let store = HistoryStore::new(backend.clone(), 10);
        for id in 1..=19 {
            assert!(store.save(&record_of_size(id, 500)).await.is_saved());
        }
        // 9_500 used, 500 free (5%); the new record needs 1_000 (10%).
        let outcome = store.save(&record_of_size(100, 1_000)).await;
        assert_eq!(outcome, SaveOutcome::Saved { evicted: 1 });
        assert!(!backend.ids().contains(&1));
        assert!(backend.ids().contains(&100));

        let report = outcome.report();
        assert!(report.success);
        assert_eq!(report.evicted_count, 1);
    }

    #[tokio::test]
    async fn eviction_cap_is_honoured() {
        let backend = MemoryBackend::new(10_000);
        let store = HistoryStore::new(backend.clone(), 2);
        for id in 1..=79 {
            store.save(&record_of_size(id, 125)).await;
        }
        // Full at 9_875; a 1_000 byte record needs 7 evictions of 125 bytes.
        let outcome = store.save(&record_of_size(100, 1_000)).await;
        assert_matches!(outcome, SaveOutcome::Exhausted { evicted: 2, .. });
        assert_eq!(backend.ids().first(), Some(&3));

        let report = outcome.report();
        assert!(!report.success);
        assert_eq!(report.reason, Some("quota"));
        assert_eq!(report.details.unwrap().evicted, 2);
    }

    #[tokio::test]
    async fn get_all_is_newest_first_and_unchanged() {
        let store = HistoryStore::new(MemoryBackend::new(1_000_000), 10);
        let mut saved = Vec::new();
        for _ in 0..3 {
            let mut record = record_of_size(store.next_id().await, 200);
            record.params = serde_json::json!({ "aspectRatio": "16:9" });
            store.save(&record).await;
            saved.push(record);
        }

        let all = store.get_all().await.unwrap();
        saved.reverse();
        assert_eq!(all, saved);
        assert!(all.windows(2).all(|w| w[0].id > w[1].id));
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let store = HistoryStore::new(MemoryBackend::new(1_000_000), 10);
        for id in 1..=3 {
            store.save(&record_of_size(id, 200)).await;
        }
        assert!(store.delete_one(2).await.unwrap());
        assert!(!store.delete_one(2).await.unwrap());
        assert_eq!(store.stats().await.unwrap().count, 2);
        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let store = HistoryStore::new(MemoryBackend::new(1), 1);
        let mut ids = Vec::new();
        for _ in 0..100 {
            ids.push(store.next_id().await);
        }
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn ids_start_past_the_newest_stored_record() {
        let backend = MemoryBackend::new(1_000_000);
        let future = now_ms() + 60 * 60 * 1000;
        backend.records.lock().unwrap().insert(future, record_of_size(future, 200));

        let store = HistoryStore::new(backend.clone(), 10);
        let id = store.next_id().await;
        assert_eq!(id, future + 1);

        assert!(store.save(&record_of_size(id, 200)).await.is_saved());
        assert_eq!(backend.ids(), vec![future, future + 1]);
    }

    #[tokio::test]
    async fn ceiling_is_exactly_four_fifths_of_quota() {
        let store = HistoryStore::new(MemoryBackend::new(10_004), 10);
        assert_matches!(
            store.save(&record_of_size(1, 8_004)).await,
            SaveOutcome::TooLarge { ceiling: 8_003, .. }
        );
        assert_eq!(store.save(&record_of_size(2, 8_003)).await, SaveOutcome::Saved { evicted: 0 });
    }
}
