//! The component context: everything the coordination services share.
//!
//! Listeners and services take a `Ctx` at construction instead of reaching
//! back into a plugin singleton; tests substitute fakes for each field.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use warpproto::{Keys, PlayerId};
use warpproto::records::Location;
use warpstore::Store;

use crate::config::ConfigHandle;
use crate::game::GameHandle;

/// Asks the proxy to move a connected player to another backend. The bool
/// means "accepted for delivery", not "arrived"; false is a permanent
/// failure for the current attempt.
pub trait ProxyConnector: Send + Sync {
    fn request_switch(&self, player: PlayerId, server: &str) -> bool;
}

/// Finds a world-valid safe location, or None when the configured tries are
/// exhausted. May take seconds and perform async chunk loads.
#[async_trait]
pub trait SafeFinder: Send + Sync {
    async fn find_safe(&self, world: &str) -> Option<Location>;
}

#[derive(Clone)]
pub struct Ctx {
    pub cfg: ConfigHandle,
    pub keys: Keys,
    pub store: Store,
    pub game: GameHandle,
    pub proxy: Arc<dyn ProxyConnector>,
    pub finder: Arc<dyn SafeFinder>,
}

impl Ctx {
    pub fn server_name(&self) -> String {
        self.cfg.get().server_name.clone()
    }

    /// Best-effort background delete; failures are logged and dropped.
    pub fn del_async(&self, key: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.del(&key).await {
                debug!(key = %key, err = %e, "background delete failed");
            }
        });
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
