//! In-memory store fake: TTL'd key/value plus broadcast-backed pub/sub.
//!
//! Used by tests and by `warpd --store mem` single-node smoke runs. Expiry
//! is lazy: a key past its deadline is dropped on the next touch.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::{StoreError, StoreOps};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

pub struct MemStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    /// Simulated per-op latency; zero by default.
    latency: Duration,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::new()
        }
    }

    async fn lag(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        match data.get(key) {
            Some(e) if e.expires_at.is_none_or(|at| at > Instant::now()) => Some(e.value.clone()),
            Some(_) => {
                data.remove(key);
                None
            }
            None => None,
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Test helper: number of live keys.
    pub fn live_keys(&self) -> usize {
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        data.values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreOps for MemStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.lag().await;
        Ok(self.live_value(key))
    }

    async fn setex(&self, key: &str, seconds: u64, value: &str) -> Result<(), StoreError> {
        self.lag().await;
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(seconds.max(1))),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.lag().await;
        self.data
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        self.lag().await;
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        match data.get(key) {
            None => Ok(-2),
            Some(e) => match e.expires_at {
                None => Ok(-1),
                Some(at) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        Ok(-2)
                    } else {
                        Ok(left.as_secs().max(1) as i64)
                    }
                }
            },
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.lag().await;
        // No subscribers is fine; the message just evaporates.
        let _ = self.channel(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe_once(
        &self,
        channel: &str,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), StoreError> {
        let mut rx = self.channel(channel).subscribe();
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del() {
        let s = MemStore::new();
        assert_eq!(s.get("k").await.unwrap(), None);
        s.setex("k", 60, "v").await.unwrap();
        assert_eq!(s.get("k").await.unwrap().as_deref(), Some("v"));
        s.del("k").await.unwrap();
        assert_eq!(s.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_expire() {
        let s = MemStore::new();
        s.setex("k", 1, "v").await.unwrap();
        assert!(s.ttl("k").await.unwrap() >= 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(s.get("k").await.unwrap(), None);
        assert_eq!(s.ttl("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn ttl_of_missing_key_is_minus_two() {
        let s = MemStore::new();
        assert_eq!(s.ttl("nope").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscriber() {
        let s = std::sync::Arc::new(MemStore::new());
        let (tx, mut rx) = mpsc::channel(8);
        let sub = {
            let s = s.clone();
            tokio::spawn(async move { s.subscribe_once("chan", &tx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        s.publish("chan", "one").await.unwrap();
        s.publish("other", "ignored").await.unwrap();
        s.publish("chan", "two").await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        drop(rx);
        // Next publish notices the dropped receiver and ends the session.
        s.publish("chan", "three").await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), sub)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
    }
}
