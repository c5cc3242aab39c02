use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::StoreError;
use crate::transport::CollectorResponse;
use crate::usage::UsageDoc;

/// Lifecycle of the resource behind a carry-over record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordState {
    Started,
    Stopped,
}

/// Tenant and resource identifiers addressing one resource instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageKey {
    pub organization_id: String,
    pub space_id: String,
    pub consumer_id: String,
    pub resource_id: String,
    pub plan_id: String,
    pub resource_instance_id: String,
}

impl UsageKey {
    pub fn from_usage(usage: &UsageDoc) -> Self {
        Self {
            organization_id: usage.organization_id.clone(),
            space_id: usage.space_id.clone(),
            consumer_id: usage.consumer_id.clone(),
            resource_id: usage.resource_id.clone(),
            plan_id: usage.plan_id.clone(),
            resource_instance_id: usage.resource_instance_id.clone(),
        }
    }

    /// Identity of the resource instance, used as record id
    pub fn path(&self) -> String {
        format!(
            "k/{}/{}/{}/{}/{}/{}",
            self.organization_id,
            self.space_id,
            self.consumer_id,
            self.resource_id,
            self.plan_id,
            self.resource_instance_id
        )
    }
}

/// Pointer to the last accepted usage submission of a resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarryOverRecord {
    pub id: String,
    /// Platform guid of the event that started tracking the resource
    pub guid: String,
    #[serde(flatten)]
    pub key: UsageKey,
    /// Location of the accepted submission in the collector
    pub collector_id: String,
    pub state: RecordState,
    /// Last renewal, epoch milliseconds
    pub timestamp: i64,
}

/// Which records a scan enumerates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Inclusive lower bound on record timestamps
    pub from: i64,
    /// Exclusive upper bound on record timestamps
    pub to: i64,
    pub page_size: usize,
}

/// One page of a scan and the cursor of the page after it
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<CarryOverRecord>,
    pub next: Option<String>,
}

/// Durable storage of carry-over records
#[async_trait]
pub trait CarryOverStore: Send + Sync {
    /// Reads the page following `after` (the first page when `None`)
    async fn read_page(&self, options: &ScanOptions, after: Option<&str>) -> Result<Page, StoreError>;

    /// Records `usage` as the latest accepted submission of its resource instance
    async fn insert(
        &self,
        usage: &UsageDoc,
        response: &CollectorResponse,
        guid: &str,
        state: RecordState,
    ) -> Result<(), StoreError>;
}

/// In-memory carry-over store, optionally mirrored to a JSON file
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, CarryOverRecord>>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Indexes `records` by resource instance. Ids are rewritten to the
    /// instance key path and, for duplicate instances, the latest record wins.
    pub fn with_records(records: Vec<CarryOverRecord>) -> Self {
        let mut indexed: BTreeMap<String, CarryOverRecord> = BTreeMap::new();
        for mut record in records {
            let id = record.key.path();
            if record.id != id {
                log::debug!("Re-keying carry-over record {} as {id}", record.id);
                record.id = id.clone();
            }
            match indexed.get(&id) {
                Some(kept) if kept.timestamp > record.timestamp => {
                    log::warn!("Dropping stale duplicate carry-over record for {id}");
                }
                _ => {
                    indexed.insert(id, record);
                }
            }
        }

        Self {
            records: RwLock::new(indexed),
            path: None,
        }
    }

    /// Loads the records stored at `path` (if any) and writes every insert back to it
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records: Vec<CarryOverRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        log::info!("Loaded {} carry-over records from {}", records.len(), path.display());

        let mut store = Self::with_records(records);
        store.path = Some(path);
        Ok(store)
    }

    pub async fn records(&self) -> Vec<CarryOverRecord> {
        self.records.read().await.values().cloned().collect()
    }

    async fn flush(&self, records: &BTreeMap<String, CarryOverRecord>) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            let all: Vec<&CarryOverRecord> = records.values().collect();
            tokio::fs::write(path, serde_json::to_vec_pretty(&all)?).await?;
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CarryOverStore for MemoryStore {
    async fn read_page(&self, options: &ScanOptions, after: Option<&str>) -> Result<Page, StoreError> {
        let records = self.records.read().await;
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.to_string()),
            None => Bound::Unbounded,
        };

        let mut matching = records
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| record.timestamp >= options.from && record.timestamp < options.to);

        let page_size = options.page_size.max(1);
        let page: Vec<CarryOverRecord> = matching.by_ref().take(page_size).cloned().collect();
        let next = match (matching.next(), page.last()) {
            (Some(_), Some(last)) => Some(last.id.clone()),
            _ => None,
        };

        Ok(Page { records: page, next })
    }

    async fn insert(
        &self,
        usage: &UsageDoc,
        response: &CollectorResponse,
        guid: &str,
        state: RecordState,
    ) -> Result<(), StoreError> {
        let collector_id = response.location().ok_or(StoreError::MissingLocation)?;
        let key = UsageKey::from_usage(usage);
        let record = CarryOverRecord {
            id: key.path(),
            guid: guid.to_string(),
            key,
            collector_id: collector_id.to_string(),
            state,
            timestamp: usage.start,
        };

        let mut records = self.records.write().await;
        log::debug!("Storing carry-over record {} -> {}", record.id, record.collector_id);
        records.insert(record.id.clone(), record);
        self.flush(&records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::tests::app_usage;
    use serde_json::json;

    fn record(instance: &str, timestamp: i64) -> CarryOverRecord {
        let mut key = UsageKey::from_usage(&app_usage());
        key.resource_instance_id = instance.to_string();
        CarryOverRecord {
            id: key.path(),
            guid: format!("guid-{instance}"),
            key,
            collector_id: format!("collector-{instance}"),
            state: RecordState::Started,
            timestamp,
        }
    }

    fn instances(records: &[CarryOverRecord]) -> Vec<&str> {
        records.iter().map(|r| r.key.resource_instance_id.as_str()).collect()
    }

    fn window(page_size: usize) -> ScanOptions {
        ScanOptions { from: 100, to: 200, page_size }
    }

    #[tokio::test]
    async fn test_pages_follow_key_order() {
        let store = MemoryStore::with_records(vec![
            record("app3", 150),
            record("app1", 110),
            record("app2", 120),
        ]);

        let first = store.read_page(&window(2), None).await.unwrap();
        assert_eq!(instances(&first.records), vec!["app1", "app2"]);
        assert_eq!(first.next, Some(record("app2", 120).id));

        let second = store.read_page(&window(2), first.next.as_deref()).await.unwrap();
        assert_eq!(instances(&second.records), vec!["app3"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_scan_window_filters_timestamps() {
        let store = MemoryStore::with_records(vec![
            record("early", 99),
            record("first", 100),
            record("last", 199),
            record("renewed", 200),
        ]);

        let page = store.read_page(&window(10), None).await.unwrap();
        assert_eq!(instances(&page.records), vec!["first", "last"]);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_insert_replaces_record_of_instance() {
        let store = MemoryStore::new();
        let usage = app_usage();
        let response = CollectorResponse::new(202, json!({})).with_header("location", "loc-1");
        store.insert(&usage, &response, "guid", RecordState::Started).await.unwrap();

        let response = CollectorResponse::new(202, json!({})).with_header("location", "loc-2");
        store.insert(&usage, &response, "guid", RecordState::Stopped).await.unwrap();

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].collector_id, "loc-2");
        assert_eq!(records[0].state, RecordState::Stopped);
        assert_eq!(records[0].timestamp, usage.start);
        assert_eq!(records[0].key.organization_id, "1");
    }

    #[tokio::test]
    async fn test_loaded_record_is_replaced_by_renewal() {
        let usage = app_usage();
        let mut loaded = record(&usage.resource_instance_id, 110);
        loaded.id = "app1".to_string();
        let store = MemoryStore::with_records(vec![loaded]);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, UsageKey::from_usage(&usage).path());

        let response = CollectorResponse::new(202, json!({})).with_header("location", "loc-1");
        store.insert(&usage, &response, "guid", RecordState::Started).await.unwrap();

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].collector_id, "loc-1");
        assert_eq!(records[0].timestamp, usage.start);
    }

    #[test]
    fn test_duplicate_instances_keep_latest() {
        let mut stale = record("app1", 110);
        stale.id = "old".to_string();
        stale.collector_id = "stale".to_string();
        let store = MemoryStore::with_records(vec![record("app1", 150), stale]);

        let records = store.records.try_read().unwrap();
        assert_eq!(records.len(), 1);
        let kept = records.values().next().unwrap();
        assert_eq!(kept.timestamp, 150);
        assert_eq!(kept.collector_id, "collector-app1");
    }

    #[tokio::test]
    async fn test_insert_requires_location() {
        let store = MemoryStore::new();
        let result = store
            .insert(&app_usage(), &CollectorResponse::new(202, json!({})), "guid", RecordState::Started)
            .await;
        assert!(matches!(result, Err(StoreError::MissingLocation)));
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carry-over.json");

        let store = MemoryStore::open(&path).await.unwrap();
        let response = CollectorResponse::new(202, json!({})).with_header("location", "loc-1");
        store.insert(&app_usage(), &response, "guid", RecordState::Started).await.unwrap();

        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.records().await, store.records().await);
    }

    #[test]
    fn test_record_wire_format() {
        let value = serde_json::to_value(record("app1", 110)).unwrap();
        assert_eq!(value["state"], json!("STARTED"));
        assert_eq!(value["organization_id"], json!("1"));
        assert_eq!(value["collector_id"], json!("collector-app1"));
    }
}
