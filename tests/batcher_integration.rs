//! Batcher integration: capture delivery through the HTTP path under
//! backpressure, and graceful drain on shutdown.

mod common;

use catalyst::batcher::{Batcher, BatcherConfig};
use catalyst::random::RandomCaches;
use catalyst::store::Store;
use catalyst::supervisor::Supervisor;
use common::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_backpressure_all_requests_captured() {
    // Tiny queues so most captures take the direct-insert fallback.
    let store = Store::open_in_memory().unwrap();
    let batcher = Arc::new(Batcher::new(
        store.clone(),
        BatcherConfig {
            batch_size: 10,
            max_queue_size: 1,
            max_batch_queue: 1,
            max_workers: 1,
            ..Default::default()
        },
    ));
    batcher.start();

    let supervisor = Supervisor::new(None, Arc::clone(&batcher), RandomCaches::new());
    let port = free_port();
    supervisor
        .create_servers(&tree(server(
            "pressure",
            port,
            vec![get_location("/api/burst", r#"{"ok":true}"#)],
        )))
        .await
        .unwrap();
    supervisor.start_all().await;
    assert!(wait_for_listener(port).await);

    let client = reqwest::Client::new();
    let mut joins = Vec::new();
    for _ in 0..100 {
        let client = client.clone();
        let url = format!("http://127.0.0.1:{port}/api/burst");
        joins.push(tokio::spawn(async move {
            client.get(&url).send().await.unwrap().status().as_u16()
        }));
    }
    for join in joins {
        assert_eq!(join.await.unwrap(), 200);
    }

    // All 100 appear as capture rows, some via the fallback.
    let probe = store.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let store = probe.clone();
            async move { store.count().unwrap_or(0) == 100 }
        })
        .await
    );

    supervisor.stop_all().await;
    batcher.stop().await;
    assert_eq!(store.count().unwrap(), 100);
}

#[tokio::test]
async fn test_shutdown_flushes_partial_batch() {
    let store = Store::open_in_memory().unwrap();
    let batcher = Arc::new(Batcher::new(
        store.clone(),
        BatcherConfig {
            batch_size: 50,
            flush_interval: Duration::from_secs(60),
            ..Default::default()
        },
    ));
    batcher.start();

    let supervisor = Supervisor::new(None, Arc::clone(&batcher), RandomCaches::new());
    let port = free_port();
    supervisor
        .create_servers(&tree(server(
            "drain",
            port,
            vec![get_location("/api/drain", r#"{"ok":true}"#)],
        )))
        .await
        .unwrap();
    supervisor.start_all().await;
    assert!(wait_for_listener(port).await);

    for _ in 0..3 {
        reqwest::get(format!("http://127.0.0.1:{port}/api/drain"))
            .await
            .unwrap();
    }

    // With a 50-record batch and a long flush interval, nothing has
    // committed yet; give the enqueue tasks a moment, then stop.
    let probe = store.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let batcher = Arc::clone(&batcher);
            async move { batcher.stats().current_batch_size == 3 }
        })
        .await
    );
    assert_eq!(probe.count().unwrap(), 0);

    supervisor.stop_all().await;
    batcher.stop().await;

    // The in-progress batch drained on shutdown.
    assert_eq!(store.count().unwrap(), 3);
}
