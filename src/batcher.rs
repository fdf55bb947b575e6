//! Batched transaction writer.
//!
//! Capture records flow through a bounded input queue into an aggregator
//! task that coalesces them into batches. Full batches (and, on a periodic
//! ticker, partial ones) are handed to writer workers that persist each
//! batch in a single store transaction with retry. Producers that hit a
//! full queue — or a stopped batcher — fall back to a direct synchronous
//! insert so capture delivery is never lost.

use crate::error::{CatalystError, Result};
use crate::observability;
use crate::store::{Store, TransactionRecord};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Batcher tuning. Any field left at zero falls back to its default.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queue_size: usize,
    pub max_batch_queue: usize,
    pub max_workers: usize,
    pub timeout: Duration,
    pub retry_attempts: u32,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(2),
            max_queue_size: 10_000,
            max_batch_queue: 1_000,
            max_workers: 3,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
        }
    }
}

impl BatcherConfig {
    /// Replace zeroed fields with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = defaults.flush_interval;
        }
        if self.max_queue_size == 0 {
            self.max_queue_size = defaults.max_queue_size;
        }
        if self.max_batch_queue == 0 {
            self.max_batch_queue = defaults.max_batch_queue;
        }
        if self.max_workers == 0 {
            self.max_workers = defaults.max_workers;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.retry_attempts == 0 {
            self.retry_attempts = defaults.retry_attempts;
        }
        self
    }
}

/// An ordered group of records persisted within one store transaction.
pub struct Batch {
    pub id: String,
    pub operations: Vec<TransactionRecord>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            id: format!("batch_{nanos}"),
            operations: Vec::with_capacity(capacity),
            created_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.operations.len()
    }
}

/// Point-in-time batcher statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatcherStats {
    pub running: bool,
    pub current_batch_size: usize,
    pub total_processed: u64,
    pub total_batches: u64,
    pub total_errors: u64,
    pub batch_size: usize,
    pub max_workers: usize,
}

struct Shared {
    store: Store,
    config: BatcherConfig,
    running: AtomicBool,
    current: Mutex<Batch>,
    total_processed: AtomicU64,
    total_batches: AtomicU64,
    total_errors: AtomicU64,
}

/// The batched transaction writer.
pub struct Batcher {
    shared: Arc<Shared>,
    input_tx: mpsc::Sender<TransactionRecord>,
    input_rx: Mutex<Option<mpsc::Receiver<TransactionRecord>>>,
    result_rx: Mutex<Option<mpsc::Receiver<Result<usize>>>>,
    result_tx: mpsc::Sender<Result<usize>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Batcher {
    pub fn new(store: Store, config: BatcherConfig) -> Self {
        let config = config.normalized();
        let (input_tx, input_rx) = mpsc::channel(config.max_queue_size);
        let (result_tx, result_rx) = mpsc::channel(config.max_batch_queue);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            current: Mutex::new(Batch::new(config.batch_size)),
            store,
            config,
            running: AtomicBool::new(false),
            total_processed: AtomicU64::new(0),
            total_batches: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        });

        Self {
            shared,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            result_rx: Mutex::new(Some(result_rx)),
            result_tx,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the aggregator, the periodic flusher and the writer workers.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let input_rx = self
            .input_rx
            .lock()
            .take()
            .expect("batcher started more than once");

        let config = &self.shared.config;
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(config.max_batch_queue);
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));

        let mut handles = self.handles.lock();

        for worker_id in 0..config.max_workers {
            let shared = Arc::clone(&self.shared);
            let batch_rx = Arc::clone(&batch_rx);
            let result_tx = self.result_tx.clone();
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, shared, batch_rx, result_tx).await;
            }));
        }

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let aggregator_tx = batch_tx.clone();
        handles.push(tokio::spawn(async move {
            run_aggregator(shared, input_rx, aggregator_tx, shutdown_rx).await;
        }));

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            run_flusher(shared, batch_tx, shutdown_rx).await;
        }));

        info!(
            workers = config.max_workers,
            batch_size = config.batch_size,
            "Batcher started"
        );
    }

    /// Enqueue a capture record. Falls back to a direct insert when the
    /// batcher is stopped or the input queue is full, so exactly one row
    /// eventually lands in the store either way.
    pub async fn add(&self, record: TransactionRecord) -> Result<()> {
        if !self.is_running() {
            debug!("Batcher not running, inserting capture record directly");
            return self.insert_direct(record, CatalystError::NotRunning).await;
        }

        match self.input_tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!("Capture queue full, inserting record directly");
                self.insert_direct(record, CatalystError::QueueFull).await
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.insert_direct(record, CatalystError::NotRunning).await
            }
        }
    }

    async fn insert_direct(&self, record: TransactionRecord, cause: CatalystError) -> Result<()> {
        observability::record_capture_fallback();
        let store = self.shared.store.clone();
        let result = tokio::task::spawn_blocking(move || store.insert(&record))
            .await
            .map_err(|e| CatalystError::Internal(format!("insert task panicked: {e}")))?;

        match result {
            Ok(()) => {
                self.shared.total_processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.total_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, cause = %cause, "Direct capture insert failed");
                Err(e)
            }
        }
    }

    /// Stop the batcher: flush the in-progress batch, drain the workers,
    /// and join every task.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        // Surface any late batch outcomes before shutdown completes.
        if let Some(mut result_rx) = self.result_rx.lock().take() {
            while let Ok(result) = result_rx.try_recv() {
                if let Err(e) = result {
                    error!(error = %e, "Batch failed during shutdown drain");
                }
            }
        }

        info!("Batcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            running: self.is_running(),
            current_batch_size: self.shared.current.lock().size(),
            total_processed: self.shared.total_processed.load(Ordering::Relaxed),
            total_batches: self.shared.total_batches.load(Ordering::Relaxed),
            total_errors: self.shared.total_errors.load(Ordering::Relaxed),
            batch_size: self.shared.config.batch_size,
            max_workers: self.shared.config.max_workers,
        }
    }
}

/// Pull records, fill the current batch, hand full batches to the workers.
async fn run_aggregator(
    shared: Arc<Shared>,
    mut input_rx: mpsc::Receiver<TransactionRecord>,
    batch_tx: mpsc::Sender<Batch>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                // Drain whatever is already queued, then flush.
                while let Ok(record) = input_rx.try_recv() {
                    append_record(&shared, &batch_tx, record).await;
                }
                flush_current(&shared, &batch_tx).await;
                return;
            }
            maybe = input_rx.recv() => match maybe {
                Some(record) => append_record(&shared, &batch_tx, record).await,
                None => {
                    flush_current(&shared, &batch_tx).await;
                    return;
                }
            }
        }
    }
}

async fn append_record(
    shared: &Arc<Shared>,
    batch_tx: &mpsc::Sender<Batch>,
    record: TransactionRecord,
) {
    let full = {
        let mut current = shared.current.lock();
        current.operations.push(record);
        if current.size() >= shared.config.batch_size {
            Some(std::mem::replace(
                &mut *current,
                Batch::new(shared.config.batch_size),
            ))
        } else {
            None
        }
    };

    if let Some(batch) = full {
        dispatch_batch(shared, batch_tx, batch).await;
    }
}

async fn flush_current(shared: &Arc<Shared>, batch_tx: &mpsc::Sender<Batch>) {
    let pending = {
        let mut current = shared.current.lock();
        if current.size() == 0 {
            None
        } else {
            Some(std::mem::replace(
                &mut *current,
                Batch::new(shared.config.batch_size),
            ))
        }
    };

    if let Some(batch) = pending {
        dispatch_batch(shared, batch_tx, batch).await;
    }
}

/// Hand a batch to the worker queue, or commit it inline when the queue is
/// full or already closed.
async fn dispatch_batch(shared: &Arc<Shared>, batch_tx: &mpsc::Sender<Batch>, batch: Batch) {
    match batch_tx.try_send(batch) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(batch))
        | Err(mpsc::error::TrySendError::Closed(batch)) => {
            warn!(batch_id = %batch.id, "Batch queue unavailable, committing inline");
            if let Err(e) = commit_with_retry(shared, &batch).await {
                error!(batch_id = %batch.id, error = %e, "Inline batch commit failed");
            }
        }
    }
}

/// Dispatch the partial batch on every tick.
async fn run_flusher(
    shared: Arc<Shared>,
    batch_tx: mpsc::Sender<Batch>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => flush_current(&shared, &batch_tx).await,
        }
    }
}

/// Pull batches and commit them until the queue closes.
async fn run_worker(
    worker_id: usize,
    shared: Arc<Shared>,
    batch_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
    result_tx: mpsc::Sender<Result<usize>>,
) {
    debug!(worker_id, "Batch worker started");

    loop {
        let batch = {
            let mut rx = batch_rx.lock().await;
            rx.recv().await
        };

        let Some(batch) = batch else {
            debug!(worker_id, "Batch queue closed, worker stopping");
            return;
        };

        let result = commit_with_retry(&shared, &batch).await;
        if let Err(e) = &result {
            error!(worker_id, batch_id = %batch.id, error = %e, "Batch commit failed");
        }
        let _ = result_tx.try_send(result);
    }
}

/// Commit one batch with up to `retry_attempts` tries, linear backoff of
/// `attempt × 1s` between them and a fresh per-attempt timeout.
async fn commit_with_retry(shared: &Arc<Shared>, batch: &Batch) -> Result<usize> {
    let attempts = shared.config.retry_attempts;
    let mut last_error = CatalystError::Internal("no attempt made".to_string());

    for attempt in 1..=attempts {
        let store = shared.store.clone();
        let records = batch.operations.clone();
        let insert = tokio::task::spawn_blocking(move || store.insert_batch(&records));

        let outcome = match tokio::time::timeout(shared.config.timeout, insert).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CatalystError::Internal(format!(
                "batch insert task panicked: {join_err}"
            ))),
            Err(_) => Err(CatalystError::Database(format!(
                "batch commit timed out after {:?}",
                shared.config.timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                let size = batch.size();
                shared
                    .total_processed
                    .fetch_add(size as u64, Ordering::Relaxed);
                shared.total_batches.fetch_add(1, Ordering::Relaxed);
                observability::record_batch_committed(size);
                return Ok(size);
            }
            Err(e) => {
                last_error = e;
                if attempt < attempts {
                    warn!(
                        batch_id = %batch.id,
                        attempt,
                        error = %last_error,
                        "Batch commit attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
    }

    shared.total_errors.fetch_add(1, Ordering::Relaxed);
    observability::record_batch_error();
    error!(
        batch_id = %batch.id,
        records = batch.size(),
        "Batch lost after {attempts} attempts"
    );
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(uuid: &str) -> TransactionRecord {
        TransactionRecord {
            uuid: uuid.to_string(),
            reception_id: "rec".to_string(),
            sender_id: "snd".to_string(),
            request_headers: "{}".to_string(),
            request_method: "GET".to_string(),
            request_endpoint: "/api/test".to_string(),
            request_body: Vec::new(),
            response_headers: "{}".to_string(),
            response_body: Vec::new(),
            response_status_code: 200,
            timestamp: Utc::now(),
        }
    }

    fn small_config() -> BatcherConfig {
        BatcherConfig {
            batch_size: 2,
            flush_interval: Duration::from_millis(50),
            max_queue_size: 16,
            max_batch_queue: 4,
            max_workers: 1,
            timeout: Duration::from_secs(5),
            retry_attempts: 1,
        }
    }

    #[test]
    fn test_config_zero_fields_take_defaults() {
        let config = BatcherConfig {
            batch_size: 0,
            flush_interval: Duration::ZERO,
            max_queue_size: 0,
            max_batch_queue: 0,
            max_workers: 0,
            timeout: Duration::ZERO,
            retry_attempts: 0,
        }
        .normalized();

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.max_batch_queue, 1_000);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
    }

    #[tokio::test]
    async fn test_full_batch_is_committed() {
        let store = Store::open_in_memory().unwrap();
        let batcher = Batcher::new(store.clone(), small_config());
        batcher.start();

        for i in 0..4 {
            batcher.add(test_record(&format!("u-{i}"))).await.unwrap();
        }
        batcher.stop().await;

        assert_eq!(store.count().unwrap(), 4);
        let stats = batcher.stats();
        assert_eq!(stats.total_processed, 4);
        assert!(stats.total_batches >= 2);
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_on_stop() {
        let store = Store::open_in_memory().unwrap();
        let batcher = Batcher::new(store.clone(), small_config());
        batcher.start();

        batcher.add(test_record("only")).await.unwrap();
        batcher.stop().await;

        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_when_stopped_falls_back_to_direct_insert() {
        let store = Store::open_in_memory().unwrap();
        let batcher = Batcher::new(store.clone(), small_config());

        batcher.add(test_record("direct")).await.unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_one_commits_individually() {
        let store = Store::open_in_memory().unwrap();
        let mut config = small_config();
        config.batch_size = 1;
        let batcher = Batcher::new(store.clone(), config);
        batcher.start();

        for i in 0..3 {
            batcher.add(test_record(&format!("solo-{i}"))).await.unwrap();
        }
        batcher.stop().await;

        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(batcher.stats().total_batches, 3);
    }

    #[tokio::test]
    async fn test_periodic_flush_commits_partial_batch() {
        let store = Store::open_in_memory().unwrap();
        let mut config = small_config();
        config.batch_size = 100;
        let batcher = Batcher::new(store.clone(), config);
        batcher.start();

        batcher.add(test_record("ticked")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.count().unwrap(), 1);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_backpressure_never_loses_records() {
        let store = Store::open_in_memory().unwrap();
        let config = BatcherConfig {
            batch_size: 10,
            flush_interval: Duration::from_millis(100),
            max_queue_size: 1,
            max_batch_queue: 1,
            max_workers: 1,
            timeout: Duration::from_secs(5),
            retry_attempts: 1,
        };
        let batcher = Arc::new(Batcher::new(store.clone(), config));
        batcher.start();

        let mut joins = Vec::new();
        for i in 0..100 {
            let batcher = Arc::clone(&batcher);
            joins.push(tokio::spawn(async move {
                batcher.add(test_record(&format!("load-{i}"))).await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }
        batcher.stop().await;

        assert_eq!(store.count().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let store = Store::open_in_memory().unwrap();
        let batcher = Batcher::new(store, small_config());
        let stats = batcher.stats();
        assert!(!stats.running);
        assert_eq!(stats.total_processed, 0);
        assert_eq!(stats.batch_size, 2);
    }
}
