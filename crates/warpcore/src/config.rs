//! Backend configuration: one TOML file per backend, env overrides in warpd.
//!
//! Every section tolerates missing fields (serde defaults) and `sanitize`
//! clamps the numeric knobs into their supported ranges, so a sloppy config
//! degrades instead of failing the boot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_name: String,
    pub store: StoreConfig,
    pub spawning: SpawningConfig,
    pub rtp: RtpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: "unknown".to_string(),
            store: StoreConfig::default(),
            spawning: SpawningConfig::default(),
            rtp: RtpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub database: u32,
    pub timeout_ms: u64,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            database: 0,
            timeout_ms: 5000,
            key_prefix: "warpnet:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawningConfig {
    pub cross_server_respawn: bool,
    pub always_spawn_at_spawn: bool,
    pub random_teleport_respawn: bool,
    pub respect_bed_spawn: bool,
    pub respect_anchor_spawn: bool,
}

impl Default for SpawningConfig {
    fn default() -> Self {
        Self {
            cross_server_respawn: false,
            always_spawn_at_spawn: false,
            random_teleport_respawn: false,
            respect_bed_spawn: true,
            respect_anchor_spawn: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    #[default]
    First,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    #[default]
    SquareRingUniform,
    SquareRingBiasedOuter,
    CircleRingUniformArea,
    CircleRingUniformRadius,
    GaussianClamped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    pub radius: u32,
    pub min_radius: u32,
    pub max_tries: u32,
    pub request_ttl_seconds: u64,
    pub cooldown_seconds: u64,
    pub pregen_attempts: u32,
    pub max_unique_chunks_per_search: u32,
    pub response_poll_interval_ticks: u64,
    pub countdown_seconds: u32,
    pub pending_max_finalize_attempts: u32,
    pub fallback_enabled_servers: Vec<String>,
    pub fallback_mode: FallbackMode,
    pub distribution: Distribution,
    pub gaussian_sigma: f64,
    pub servers: HashMap<String, ServerRtp>,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            radius: 8000,
            min_radius: 250,
            max_tries: 30,
            request_ttl_seconds: 30,
            cooldown_seconds: 60,
            pregen_attempts: 8,
            max_unique_chunks_per_search: 10,
            response_poll_interval_ticks: 4,
            countdown_seconds: 5,
            pending_max_finalize_attempts: 2,
            fallback_enabled_servers: Vec::new(),
            fallback_mode: FallbackMode::First,
            distribution: Distribution::SquareRingUniform,
            gaussian_sigma: 0.35,
            servers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerRtp {
    pub enabled: bool,
    pub default_world: String,
    pub worlds: HashMap<String, WorldRtp>,
}

impl Default for ServerRtp {
    fn default() -> Self {
        Self {
            enabled: false,
            default_world: "world".to_string(),
            worlds: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorldRtp {
    pub enabled: bool,
    pub radius: Option<u32>,
    pub min_radius: Option<u32>,
    pub distribution: Option<Distribution>,
    pub gaussian_sigma: Option<f64>,
}

impl Config {
    pub fn load_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::load_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn load_str(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = toml::from_str(raw).context("invalid toml")?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn sanitize(&mut self) {
        self.server_name = self.server_name.trim().to_string();
        if self.server_name.is_empty() {
            self.server_name = "unknown".to_string();
        }

        let s = &mut self.store;
        if s.host.trim().is_empty() {
            s.host = "127.0.0.1".to_string();
        }
        if s.port == 0 {
            s.port = 6379;
        }
        s.database = s.database.min(15);
        s.timeout_ms = s.timeout_ms.clamp(250, 60_000);
        if s.key_prefix.trim().is_empty() {
            s.key_prefix = "warpnet:".to_string();
        }

        let r = &mut self.rtp;
        r.min_radius = r.min_radius.min(r.radius);
        r.max_tries = r.max_tries.max(1);
        r.request_ttl_seconds = r.request_ttl_seconds.max(5);
        r.max_unique_chunks_per_search = r.max_unique_chunks_per_search.max(1);
        r.response_poll_interval_ticks = r.response_poll_interval_ticks.clamp(1, 40);
        r.countdown_seconds = r.countdown_seconds.min(30);
        r.pending_max_finalize_attempts = r.pending_max_finalize_attempts.clamp(1, 10);
        if !(r.gaussian_sigma > 0.0) {
            r.gaussian_sigma = 0.35;
        }
        r.gaussian_sigma = r.gaussian_sigma.min(1.0);
    }
}

impl RtpConfig {
    pub fn server(&self, name: &str) -> Option<&ServerRtp> {
        self.servers.get(name)
    }

    pub fn is_server_enabled(&self, name: &str) -> bool {
        self.servers.get(name).is_some_and(|s| s.enabled)
    }

    pub fn is_world_enabled(&self, server: &str, world: &str) -> bool {
        self.servers
            .get(server)
            .is_some_and(|s| s.worlds.get(world).is_some_and(|w| w.enabled))
    }

    fn world(&self, server: &str, world: &str) -> Option<&WorldRtp> {
        self.servers.get(server)?.worlds.get(world)
    }

    pub fn radius_for(&self, server: &str, world: &str) -> u32 {
        match self.world(server, world).and_then(|w| w.radius) {
            Some(r) if r > 0 => r,
            _ => self.radius,
        }
    }

    pub fn min_radius_for(&self, server: &str, world: &str) -> u32 {
        let radius = self.radius_for(server, world);
        let v = self
            .world(server, world)
            .and_then(|w| w.min_radius)
            .unwrap_or(self.min_radius);
        v.min(radius)
    }

    pub fn distribution_for(&self, server: &str, world: &str) -> Distribution {
        self.world(server, world)
            .and_then(|w| w.distribution)
            .unwrap_or(self.distribution)
    }

    pub fn gaussian_sigma_for(&self, server: &str, world: &str) -> f64 {
        let v = self
            .world(server, world)
            .and_then(|w| w.gaussian_sigma)
            .unwrap_or(self.gaussian_sigma);
        if v > 0.0 { v.min(1.0) } else { self.gaussian_sigma }
    }
}

/// Shared, reloadable config snapshot. `/rtp reload` swaps the whole Arc;
/// in-flight operations keep the snapshot they started with.
#[derive(Clone)]
pub struct ConfigHandle(Arc<RwLock<Arc<Config>>>);

impl ConfigHandle {
    pub fn new(cfg: Config) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(cfg))))
    }

    pub fn get(&self) -> Arc<Config> {
        self.0.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn replace(&self, cfg: Config) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(cfg);
    }
}
