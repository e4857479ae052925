//! In-process backend fixture for unit and scenario tests.
//!
//! A `TestBackend` is one full backend (game loop, services, store shell)
//! wired to a shared [`MemStore`] and a captured gateway channel. Spinning
//! two of them against one store gives a faithful two-server fleet inside a
//! single test process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use warpproto::{Keys, PlayerId};
use warpproto::gateway::GatewayResp;
use warpproto::records::Location;
use warpstore::{MemStore, Store};

use crate::Backend;
use crate::config::{Config, ConfigHandle, ServerRtp, WorldRtp};
use crate::ctx::Ctx;
use crate::finder::{RingFinder, SurfacePolicy};
use crate::game::{Environment, GameHandle, GameState, WorldState, spawn_game_loop};
use crate::proxy::GatewayProxy;

pub const TEST_TICK_MS: u64 = 10;

static NEXT_PLAYER: AtomicU64 = AtomicU64::new(1);

/// Enable `server` with `world` as its default RTP world in a config.
pub fn enable_server_world(cfg: &mut Config, server: &str, world: &str) {
    let srv = cfg
        .rtp
        .servers
        .entry(server.to_string())
        .or_insert_with(|| ServerRtp {
            enabled: true,
            default_world: world.to_string(),
            ..Default::default()
        });
    srv.enabled = true;
    srv.worlds.insert(
        world.to_string(),
        WorldRtp {
            enabled: true,
            ..Default::default()
        },
    );
}

pub struct TestBackend {
    pub ctx: Ctx,
    pub backend: Arc<Backend>,
    pub rtp: crate::attempt::RtpService,
    pub death: crate::death::DeathPipeline,
    pub finalizer: crate::finalize::JoinFinalizer,
    pub spawnsync: crate::spawnsync::SpawnSync,
    pub commands: crate::command::CommandRouter,
    pub mem: Arc<MemStore>,
    out_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<GatewayResp>>,
    /// Events `wait_for_event` skipped over; `drain_events` returns them
    /// first so nothing is silently lost.
    seen: tokio::sync::Mutex<Vec<GatewayResp>>,
}

impl TestBackend {
    pub async fn new(
        server_name: &str,
        store: Arc<MemStore>,
        mutate: impl FnOnce(&mut Config),
    ) -> Self {
        let mut cfg = Config::default();
        cfg.server_name = server_name.to_string();
        cfg.rtp.cooldown_seconds = 0;
        cfg.rtp.countdown_seconds = 0;
        mutate(&mut cfg);
        let cfg = ConfigHandle::new(cfg);

        let mut gs = GameState::new(server_name);
        for (name, env) in [
            ("world", Environment::Normal),
            ("world_nether", Environment::Nether),
            ("world_the_end", Environment::End),
        ] {
            gs.worlds.insert(name.to_string(), WorldState::new(name, env));
        }
        let (game, _task) = spawn_game_loop(gs, TEST_TICK_MS);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        game.run(move |gs| gs.set_output(out_tx));

        let keys = Keys::new(&cfg.get().store.key_prefix);
        let ctx = Ctx {
            cfg: cfg.clone(),
            keys,
            store: Store::new(store.clone()),
            game: game.clone(),
            proxy: Arc::new(GatewayProxy::new(game.clone())),
            finder: Arc::new(RingFinder::new(cfg, game, Arc::new(SurfacePolicy))),
        };

        let reload: Arc<crate::command::ReloadFn> = Arc::new(|| Ok(()));
        let backend = Backend::start(ctx.clone(), reload);

        Self {
            rtp: backend.rtp.clone(),
            death: backend.death.clone(),
            finalizer: backend.finalizer.clone(),
            spawnsync: backend.spawnsync.clone(),
            commands: backend.commands.clone(),
            ctx,
            backend,
            mem: store,
            out_rx: tokio::sync::Mutex::new(out_rx),
            seen: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Single default backend named "lobby" on its own fresh store.
    pub async fn lobby() -> Self {
        Self::new("lobby", Arc::new(MemStore::new()), |_| {}).await
    }

    pub async fn lobby_with(mutate: impl FnOnce(&mut Config)) -> Self {
        Self::new("lobby", Arc::new(MemStore::new()), mutate).await
    }

    pub fn game(&self) -> GameHandle {
        self.ctx.game.clone()
    }

    /// Run a closure on this backend's game thread and wait for it.
    pub async fn run_on_game(&self, f: impl FnOnce(&mut GameState) + Send + 'static) {
        self.ctx.game.query(f).await;
    }

    /// Attach a fresh player standing at the world spawn.
    pub async fn join_player(&self, name: &str, admin: bool) -> PlayerId {
        let id = PlayerId(NEXT_PLAYER.fetch_add(1, Ordering::SeqCst) as u128);
        self.join_player_with_id(id, name, admin).await;
        id
    }

    /// Attach a specific id (simulates the proxy moving a known player
    /// here).
    pub async fn join_player_with_id(&self, id: PlayerId, name: &str, admin: bool) {
        let backend = self.backend.clone();
        let name = name.to_string();
        self.ctx
            .game
            .query(move |gs| {
                let pos = gs
                    .world("world")
                    .map(|w| w.spawn.clone())
                    .unwrap_or_else(|| Location::new("world", 0.5, 65.0, 0.5, 0.0, 0.0));
                backend.handle_attach(gs, id, &name, admin, pos);
            })
            .await;
    }

    pub async fn detach_player(&self, id: PlayerId) {
        let backend = self.backend.clone();
        self.ctx
            .game
            .query(move |gs| backend.handle_detach(gs, id))
            .await;
    }

    /// Collect everything the gateway has been sent so far, including
    /// events earlier `wait_for_event` calls skipped over.
    pub async fn drain_events(&self) -> Vec<GatewayResp> {
        let mut out: Vec<GatewayResp> = self.seen.lock().await.drain(..).collect();
        let mut rx = self.out_rx.lock().await;
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Wait (bounded) for an event matching the predicate. Skipped events
    /// are kept for a later `drain_events`.
    pub async fn wait_for_event(
        &self,
        timeout_ms: u64,
        mut pred: impl FnMut(&GatewayResp) -> bool,
    ) -> Option<GatewayResp> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        let mut rx = self.out_rx.lock().await;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(ev)) if pred(&ev) => return Some(ev),
                Ok(Some(ev)) => {
                    self.seen.lock().await.push(ev);
                }
                _ => return None,
            }
        }
    }
}
