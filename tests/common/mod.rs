//! Common test utilities for integration tests.

#![allow(dead_code)]

use catalyst::batcher::{Batcher, BatcherConfig};
use catalyst::config::{Http, HttpMethod, Location, MockServer, Server};
use catalyst::random::RandomCaches;
use catalyst::store::Store;
use catalyst::supervisor::Supervisor;
use std::future::Future;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Find an available port for testing.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// Find multiple available ports.
pub fn free_ports(count: usize) -> Vec<u16> {
    (0..count).map(|_| free_port()).collect()
}

/// A supervisor wired to an in-memory store, ready to create listeners.
pub struct TestStack {
    pub store: Store,
    pub batcher: Arc<Batcher>,
    pub supervisor: Arc<Supervisor>,
}

impl TestStack {
    pub fn new(config_dir: Option<PathBuf>) -> Self {
        let store = Store::open_in_memory().expect("in-memory store");
        let config = BatcherConfig {
            batch_size: 2,
            flush_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let batcher = Arc::new(Batcher::new(store.clone(), config));
        batcher.start();

        let supervisor = Supervisor::new(config_dir, Arc::clone(&batcher), RandomCaches::new());
        Self {
            store,
            batcher,
            supervisor,
        }
    }

    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
        self.batcher.stop().await;
    }
}

/// A one-server descriptor tree.
pub fn tree(server: Server) -> MockServer {
    MockServer {
        http: Http {
            servers: vec![server],
        },
    }
}

/// A server entry with the given locations.
pub fn server(name: &str, port: u16, locations: Vec<Location>) -> Server {
    Server {
        listen: port,
        name: name.to_string(),
        version: "1.0".to_string(),
        location: locations,
        ..Default::default()
    }
}

/// A simple templated GET location.
pub fn get_location(path: &str, response: &str) -> Location {
    Location {
        path: path.to_string(),
        method: HttpMethod::GET,
        status_code: 200,
        response: response.to_string(),
        ..Default::default()
    }
}

/// Poll `condition` until it returns true or the deadline passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition().await
}

/// Wait for an HTTP listener to accept requests on the given port.
pub async fn wait_for_listener(port: u16) -> bool {
    wait_until(Duration::from_secs(5), || async move {
        tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
    })
    .await
}
