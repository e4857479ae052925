//! `warpstore`: client for the fleet's coordination store.
//!
//! The store is a Redis-compatible key/value + pub/sub service. Everything
//! the rest of the fleet needs goes through the [`StoreOps`] trait so tests
//! (and `warpd --store mem`) can run against the in-memory [`MemStore`]
//! instead of a network service.
//!
//! [`Store`] is the lifecycle shell: it owns the monotonic running flag and
//! the auto-reconnecting subscriber task. The flag goes false -> true on
//! `start` and true -> false on `stop`, never back; a stopped shell stays
//! stopped.

pub mod memory;
pub mod net;
pub mod resp;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use memory::MemStore;
pub use net::{NetStore, NetStoreConfig};

#[derive(Debug)]
pub enum StoreError {
    /// The shell has been stopped; the operation was not attempted.
    Stopped,
    Timeout,
    Io(std::io::Error),
    /// The peer spoke something that is not RESP.
    Protocol(String),
    /// The store returned an error reply.
    Server(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Stopped => write!(f, "store is not running"),
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Io(e) => write!(f, "store io error: {e}"),
            StoreError::Protocol(s) => write!(f, "store protocol error: {s}"),
            StoreError::Server(s) => write!(f, "store error reply: {s}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// The store operations the coordination layer uses. All calls are atomic
/// per-call; no multi-key transactions exist or are assumed.
#[async_trait]
pub trait StoreOps: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn setex(&self, key: &str, seconds: u64, value: &str) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Remaining TTL in seconds; -1 for no expiry, -2 for a missing key.
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Establish one subscription and forward payloads into `tx`.
    ///
    /// Returns `Ok(())` when the receiver side of `tx` is gone (clean
    /// shutdown) and `Err` when the subscription itself failed or dropped;
    /// the caller decides whether to reconnect.
    async fn subscribe_once(
        &self,
        channel: &str,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), StoreError>;
}

const SUB_BACKOFF_START: Duration = Duration::from_secs(1);
const SUB_BACKOFF_CAP: Duration = Duration::from_secs(15);
/// A subscription session that survived this long counts as healthy and
/// resets the backoff.
const SUB_HEALTHY_SESSION: Duration = Duration::from_secs(5);

/// Lifecycle shell around a [`StoreOps`] implementation.
#[derive(Clone)]
pub struct Store {
    ops: Arc<dyn StoreOps>,
    running: Arc<AtomicBool>,
    sub_task: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Store {
    pub fn new(ops: Arc<dyn StoreOps>) -> Self {
        Self {
            ops,
            running: Arc::new(AtomicBool::new(false)),
            sub_task: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// True only between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the store running and spawn the subscriber for `channel`.
    ///
    /// The subscriber reconnects with exponential backoff (1 s doubling,
    /// capped at 15 s) until `stop` is called or the receiving side of `tx`
    /// goes away.
    pub fn start(&self, channel: String, tx: mpsc::Sender<String>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("store start() called while already running");
            return;
        }

        let ops = self.ops.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = SUB_BACKOFF_START;
            while running.load(Ordering::SeqCst) {
                let session_start = tokio::time::Instant::now();
                match ops.subscribe_once(&channel, &tx).await {
                    Ok(()) => break,
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        if session_start.elapsed() >= SUB_HEALTHY_SESSION {
                            backoff = SUB_BACKOFF_START;
                        }
                        warn!(channel = %channel, err = %e, "store subscribe loop error; reconnecting");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(SUB_BACKOFF_CAP);
                    }
                }
            }
        });

        *self.sub_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        info!(running = true, "store started");
    }

    /// Safe to call multiple times; the flag never returns to true.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .sub_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
        info!(running = false, "store stopped");
    }

    fn gate(&self) -> Result<(), StoreError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StoreError::Stopped)
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.gate()?;
        self.ops.get(key).await
    }

    pub async fn setex(&self, key: &str, seconds: u64, value: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.ops.setex(key, seconds, value).await
    }

    pub async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.ops.del(key).await
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        self.gate()?;
        self.ops.ttl(key).await
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.ops.publish(channel, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gates_ops_on_running_flag() {
        let store = Store::new(Arc::new(MemStore::new()));
        assert!(matches!(store.get("k").await, Err(StoreError::Stopped)));

        let (tx, _rx) = mpsc::channel(8);
        store.start("c".to_string(), tx);
        assert!(store.is_running());
        store.setex("k", 60, "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.stop();
        assert!(!store.is_running());
        assert!(matches!(store.get("k").await, Err(StoreError::Stopped)));
    }

    #[tokio::test]
    async fn subscriber_delivers_published_messages() {
        let mem = Arc::new(MemStore::new());
        let store = Store::new(mem.clone());
        let (tx, mut rx) = mpsc::channel(8);
        store.start("warpnet:compute".to_string(), tx);

        // The subscriber task needs a moment to register.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.publish("warpnet:compute", "hello").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
        store.stop();
    }
}
