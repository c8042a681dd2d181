//! Audit sink
//!
//! The core emits one record per completed execution through a bounded,
//! non-blocking channel: a full buffer drops the record with a warning and
//! never stalls the execution path. A worker task drains the channel into
//! an [`AuditStore`] with exponential-backoff retry. Durable storage is
//! external; the in-memory store backs development and tests.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

const WRITE_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

/// One completed execution, shaped for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub language: String,
    pub code_hash: String,
    pub exit_code: i32,
    pub output: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub security_events: usize,
    pub status: String,
    pub request_ip: String,
    pub created_at_ms: u64,
    pub completed_at_ms: u64,
}

/// Query filter for the list endpoint.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub language: Option<String>,
    pub status: Option<String>,
    pub limit: usize,
}

/// Write-and-query interface the core consumes. Implementations own
/// schemas and durability.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn write(&self, record: AuditRecord) -> Result<(), String>;

    async fn list(&self, filter: RecordFilter) -> Result<Vec<AuditRecord>, String>;

    async fn get(&self, id: &str) -> Result<Option<AuditRecord>, String>;

    async fn healthy(&self) -> bool;
}

/// Bounded in-memory store; newest records first.
pub struct InMemoryAuditStore {
    records: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl InMemoryAuditStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn write(&self, record: AuditRecord) -> Result<(), String> {
        let mut records = self.records.write().await;
        if records.len() == self.capacity {
            records.pop_back();
        }
        records.push_front(record);
        Ok(())
    }

    async fn list(&self, filter: RecordFilter) -> Result<Vec<AuditRecord>, String> {
        let records = self.records.read().await;
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        Ok(records
            .iter()
            .filter(|r| {
                filter
                    .language
                    .as_ref()
                    .map_or(true, |l| &r.language == l)
                    && filter.status.as_ref().map_or(true, |s| &r.status == s)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<AuditRecord>, String> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Cheap, cloneable producer half of the audit sink.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditLogger {
    /// Enqueue without blocking; drops on overflow.
    pub fn log(&self, record: AuditRecord) {
        if let Err(mpsc::error::TrySendError::Full(record)) = self.tx.try_send(record) {
            warn!(exec_id = %record.id, "audit buffer full, dropping record");
        }
    }
}

/// Owns the worker task; call [`AuditWorker::flush`] at shutdown.
pub struct AuditWorker {
    handle: tokio::task::JoinHandle<()>,
}

/// Start the sink: returns the producer handle and the worker.
pub fn start_audit_sink(
    store: std::sync::Arc<dyn AuditStore>,
    buffer_size: usize,
) -> (AuditLogger, AuditWorker) {
    let (tx, mut rx) = mpsc::channel(buffer_size.max(1));

    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            write_with_retry(store.as_ref(), record).await;
        }
    });

    (AuditLogger { tx }, AuditWorker { handle })
}

impl AuditWorker {
    /// Close the channel and wait for the worker to drain, bounded by
    /// `timeout`.
    pub async fn flush(self, logger: AuditLogger, timeout: Duration) {
        drop(logger);
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(_) => info!("audit sink flushed"),
            Err(_) => warn!("audit sink flush timed out"),
        }
    }
}

async fn write_with_retry(store: &dyn AuditStore, record: AuditRecord) {
    for attempt in 0..=WRITE_RETRIES {
        match store.write(record.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < WRITE_RETRIES => {
                let backoff = RETRY_BASE * 2u32.pow(attempt);
                warn!(
                    exec_id = %record.id,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "audit write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!(exec_id = %record.id, error = %e, "audit write failed permanently");
            }
        }
    }
}

/// Milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn record(id: &str, language: &str, status: &str) -> AuditRecord {
        AuditRecord {
            id: id.to_string(),
            language: language.to_string(),
            code_hash: "abc".into(),
            exit_code: 0,
            output: String::new(),
            stderr: String::new(),
            duration_ms: 5,
            security_events: 0,
            status: status.to_string(),
            request_ip: "127.0.0.1".into(),
            created_at_ms: now_ms(),
            completed_at_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = InMemoryAuditStore::new(16);
        store.write(record("a", "python", "success")).await.unwrap();
        store.write(record("b", "bash", "timeout")).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().language, "python");
        assert!(store.get("missing").await.unwrap().is_none());

        // Newest first.
        let all = store.list(RecordFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "b");
    }

    #[tokio::test]
    async fn test_memory_store_filters() {
        let store = InMemoryAuditStore::new(16);
        store.write(record("a", "python", "success")).await.unwrap();
        store.write(record("b", "bash", "timeout")).await.unwrap();
        store.write(record("c", "python", "timeout")).await.unwrap();

        let timeouts = store
            .list(RecordFilter {
                status: Some("timeout".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(timeouts.len(), 2);

        let python_timeouts = store
            .list(RecordFilter {
                language: Some("python".into()),
                status: Some("timeout".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(python_timeouts.len(), 1);
        assert_eq!(python_timeouts[0].id, "c");
    }

    #[tokio::test]
    async fn test_memory_store_evicts_oldest() {
        let store = InMemoryAuditStore::new(2);
        for id in ["a", "b", "c"] {
            store.write(record(id, "python", "success")).await.unwrap();
        }
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sink_delivers_and_flushes() {
        let store = Arc::new(InMemoryAuditStore::new(16));
        let (logger, worker) = start_audit_sink(store.clone(), 8);

        logger.log(record("x", "python", "success"));
        worker.flush(logger, Duration::from_secs(1)).await;

        assert!(store.get("x").await.unwrap().is_some());
    }

    /// A store that fails twice then succeeds, to exercise the retry loop.
    struct FlakyStore {
        inner: InMemoryAuditStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn write(&self, record: AuditRecord) -> Result<(), String> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err("transient".into());
            }
            self.inner.write(record).await
        }

        async fn list(&self, filter: RecordFilter) -> Result<Vec<AuditRecord>, String> {
            self.inner.list(filter).await
        }

        async fn get(&self, id: &str) -> Result<Option<AuditRecord>, String> {
            self.inner.get(id).await
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_sink_retries_transient_failures() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryAuditStore::new(16),
            failures_left: AtomicU32::new(2),
        });
        let (logger, worker) = start_audit_sink(store.clone(), 8);

        logger.log(record("retry", "python", "success"));
        worker.flush(logger, Duration::from_secs(5)).await;

        assert!(store.get("retry").await.unwrap().is_some());
    }
}
