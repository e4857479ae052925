//! Death-driven respawn routing.
//!
//! All the expensive work (remote compute, chunk loads, store reads) runs
//! while the player sits on the death screen; the respawn handler only
//! applies a pre-built plan. It never starts a remote compute itself: if
//! the death-time plan is not ready within the await budget, the player
//! respawns locally and that is that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use warpproto::PlayerId;
use warpproto::records::{ComputeRequest, Location, PendingTeleport, SpawnKind, SpawnPoint};

use crate::attempt::RtpService;
use crate::config::{Config, FallbackMode};
use crate::ctx::{Ctx, now_ms};
use crate::dispatch;
use crate::finder::Rng64;
use crate::game::{Environment, GameState, Recipient};
use crate::spawnsync::SpawnSync;

const PLAN_TTL_MS: u64 = 15_000;
const SAFE_CACHE_TTL_MS: u64 = 45_000;
const SHARED_SPAWN_CACHE_TTL_MS: u64 = 20_000;

/// How long (ticks) the respawn handler waits for the death-time remote
/// compute to finish.
const REMOTE_AWAIT_MAX_TICKS: u64 = 40; // 2 s
const REMOTE_AWAIT_POLL_TICKS: u64 = 2;

/// If the switch never takes effect, drop the pending so it cannot fire on
/// a much later join.
const REMOTE_SWITCH_FALLBACK_TICKS: u64 = 30; // 1.5 s

/// Blindness+invisibility window masking the brief local respawn before a
/// switch.
const RESPAWN_MASK_TICKS: u64 = 30;

/// Write-once slot for the death-time remote plan. `get` returns None
/// while the compute is still in flight, then Some(outcome).
pub struct PlanCell {
    done: Mutex<Option<Option<PendingTeleport>>>,
}

impl PlanCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(None),
        })
    }

    fn set(&self, v: Option<PendingTeleport>) {
        let mut slot = self.done.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(v);
        }
    }

    pub fn get(&self) -> Option<Option<PendingTeleport>> {
        self.done.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[derive(Clone)]
enum DeathPlan {
    Local {
        world: String,
        loc: Location,
        created_ms: u64,
    },
    Remote {
        cell: Arc<PlanCell>,
        created_ms: u64,
    },
}

impl DeathPlan {
    fn created_ms(&self) -> u64 {
        match self {
            DeathPlan::Local { created_ms, .. } | DeathPlan::Remote { created_ms, .. } => *created_ms,
        }
    }
}

struct CachedSafe {
    loc: Location,
    at_ms: u64,
}

struct CachedSpawn {
    sp: SpawnPoint,
    at_ms: u64,
}

/// Cheap-to-clone handle; clones share every cache.
#[derive(Clone)]
pub struct DeathPipeline {
    ctx: Ctx,
    rtp: RtpService,
    spawnsync: SpawnSync,
    plans: Arc<Mutex<HashMap<PlayerId, DeathPlan>>>,
    safe_cache: Arc<Mutex<HashMap<String, CachedSafe>>>,
    shared_spawn: Arc<Mutex<HashMap<PlayerId, CachedSpawn>>>,
    last_death_env: Arc<Mutex<HashMap<PlayerId, Environment>>>,
    rng: Arc<Mutex<Rng64>>,
}

impl DeathPipeline {
    pub fn new(ctx: Ctx, rtp: RtpService, spawnsync: SpawnSync) -> Self {
        Self {
            ctx,
            rtp,
            spawnsync,
            plans: Arc::new(Mutex::new(HashMap::new())),
            safe_cache: Arc::new(Mutex::new(HashMap::new())),
            shared_spawn: Arc::new(Mutex::new(HashMap::new())),
            last_death_env: Arc::new(Mutex::new(HashMap::new())),
            rng: Arc::new(Mutex::new(Rng64::from_entropy())),
        }
    }

    fn cleanup(&self, player: PlayerId) {
        self.plans.lock().unwrap_or_else(|p| p.into_inner()).remove(&player);
        self.shared_spawn
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&player);
        self.last_death_env
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&player);
    }

    // ---------- death ----------

    pub fn on_death(&self, gs: &mut GameState, player: PlayerId) {
        self.plans.lock().unwrap_or_else(|p| p.into_inner()).remove(&player);

        let Some(p) = gs.player(player) else { return };
        let death_world = p.pos.world.clone();
        let env = gs
            .world(&death_world)
            .map(|w| w.environment)
            .unwrap_or(Environment::Normal);
        self.last_death_env
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(player, env);

        let spawning = self.ctx.cfg.get().spawning.clone();
        if spawning.cross_server_respawn && self.ctx.store.is_running() {
            self.cache_shared_spawn_async(player);
        } else {
            self.shared_spawn
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&player);
        }

        if spawning.random_teleport_respawn {
            self.prepare_death_plan(gs, player, env, &death_world);
        }
    }

    fn prepare_death_plan(
        &self,
        gs: &mut GameState,
        player: PlayerId,
        env: Environment,
        death_world: &str,
    ) {
        let cfg = self.ctx.cfg.get();
        let local = cfg.server_name.clone();
        let force_overworld = matches!(env, Environment::Nether | Environment::End);

        let (mut server, mut world) =
            if !force_overworld && cfg.rtp.is_world_enabled(&local, death_world) {
                (local.clone(), death_world.to_string())
            } else {
                let Some(srv) = self.choose_server_for_overworld(&cfg) else {
                    return;
                };
                let Some(w) = resolve_overworld_world(&cfg, &srv) else {
                    return;
                };
                (srv, w)
            };

        // Without the store we cannot precompute remotely; collapse to a
        // local plan or nothing.
        if !self.ctx.store.is_running() && !local.eq_ignore_ascii_case(&server) {
            if is_overworld_rtp_enabled(&cfg, &local) {
                let Some(w) = resolve_overworld_world(&cfg, &local) else {
                    return;
                };
                server = local.clone();
                world = w;
            } else {
                return;
            }
        }

        if local.eq_ignore_ascii_case(&server) {
            // Warm-cache candidate now, real compute refresh in parallel.
            let cached = {
                let cache = self.safe_cache.lock().unwrap_or_else(|p| p.into_inner());
                cache
                    .get(&world)
                    .filter(|c| now_ms().saturating_sub(c.at_ms) <= SAFE_CACHE_TTL_MS)
                    .map(|c| c.loc.clone())
            };
            if let Some(loc) = cached {
                if let Some(w) = gs.world(&world) {
                    self.plans.lock().unwrap_or_else(|p| p.into_inner()).insert(
                        player,
                        DeathPlan::Local {
                            world: world.clone(),
                            loc: w.clamp(loc),
                            created_ms: now_ms(),
                        },
                    );
                }
            }

            let this = self.clone();
            let world = world.clone();
            tokio::spawn(async move {
                let Some(loc) = this.ctx.finder.find_safe(&world).await else {
                    return;
                };
                this.ctx.game.run(move |gs| {
                    let Some(w) = gs.world(&world) else { return };
                    let clamped = w.clamp(loc);
                    this.safe_cache.lock().unwrap_or_else(|p| p.into_inner()).insert(
                        world.clone(),
                        CachedSafe {
                            loc: clamped.clone(),
                            at_ms: now_ms(),
                        },
                    );
                    this.plans.lock().unwrap_or_else(|p| p.into_inner()).insert(
                        player,
                        DeathPlan::Local {
                            world,
                            loc: clamped,
                            created_ms: now_ms(),
                        },
                    );
                });
            });
            return;
        }

        // Remote plan: compute during the death screen and pre-write the
        // pending the moment the response lands.
        let cell = PlanCell::new();
        self.plans.lock().unwrap_or_else(|p| p.into_inner()).insert(
            player,
            DeathPlan::Remote {
                cell: cell.clone(),
                created_ms: now_ms(),
            },
        );

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if !ctx.store.is_running() {
                cell.set(None);
                return;
            }

            let request_id = dispatch::new_request_id();
            let req = ComputeRequest {
                request_id: request_id.clone(),
                player,
                target_server: server,
                world,
                created_at_ms: now_ms(),
            };
            let Ok(json) = serde_json::to_string(&req) else {
                cell.set(None);
                return;
            };
            if ctx.store.publish(&ctx.keys.compute_channel(), &json).await.is_err() {
                cell.set(None);
                return;
            }

            let resp = dispatch::wait_for_compute_response(&ctx, &request_id, || false).await;
            let Some(resp) = resp.filter(|r| r.ok) else {
                cell.set(None);
                return;
            };

            let pending = PendingTeleport::new(&resp.server, &resp.location(), now_ms());
            let key = ctx.keys.pending(player);
            let ttl = ctx.cfg.get().rtp.request_ttl_seconds;
            match serde_json::to_string(&pending) {
                Ok(json) => match ctx.store.setex(&key, ttl, &json).await {
                    Ok(()) => cell.set(Some(pending)),
                    Err(_) => cell.set(None),
                },
                Err(_) => cell.set(None),
            }
        });
    }

    // ---------- respawn ----------

    pub fn on_respawn(&self, gs: &mut GameState, player: PlayerId) {
        let Some(p) = gs.player(player) else { return };
        if !p.dead {
            return;
        }
        let spawning = self.ctx.cfg.get().spawning.clone();

        if spawning.always_spawn_at_spawn {
            self.cleanup(player);
            self.vanilla_respawn(gs, player);
            return;
        }

        // A local bed/anchor respawn that its knob honors stays vanilla.
        let vanilla_kind = self.vanilla_target(gs, player).and_then(|(_, k)| k);
        let honored = match vanilla_kind {
            Some((SpawnKind::Bed, _)) => spawning.respect_bed_spawn,
            Some((SpawnKind::Anchor, _)) => spawning.respect_anchor_spawn,
            _ => false,
        };
        if honored {
            self.cleanup(player);
            self.vanilla_respawn(gs, player);
            return;
        }

        if spawning.cross_server_respawn && self.ctx.store.is_running() {
            if self.try_route_shared_spawn(gs, player) {
                self.cleanup(player);
                return;
            }
        } else {
            self.shared_spawn
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&player);
        }

        if !spawning.random_teleport_respawn {
            self.cleanup(player);
            self.vanilla_respawn(gs, player);
            return;
        }

        let plan = self
            .plans
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&player)
            .cloned();
        if let Some(plan) = plan {
            if now_ms().saturating_sub(plan.created_ms()) <= PLAN_TTL_MS {
                match plan {
                    DeathPlan::Local { world, loc, .. } => {
                        if let Some(w) = gs.world(&world) {
                            let clamped = w.clamp(loc);
                            gs.respawn_at(player, clamped);
                            self.refresh_cache_async(world);
                            self.cleanup(player);
                            return;
                        }
                    }
                    DeathPlan::Remote { cell, .. } => {
                        // Mask the brief local respawn, then poll the plan.
                        self.apply_respawn_mask(gs, player);
                        self.vanilla_respawn(gs, player);
                        let this = self.clone();
                        gs.schedule_in(1, move |gs| {
                            poll_remote_plan(gs, this, player, cell, 0);
                        });
                        return;
                    }
                }
            }
        }

        // No plan (or too old): warm cache still gives a seamless respawn.
        let respawn_world = self
            .vanilla_target(gs, player)
            .map(|(loc, _)| loc.world)
            .unwrap_or_else(|| gs.player(player).map(|p| p.pos.world.clone()).unwrap_or_default());

        let cached = {
            let cache = self.safe_cache.lock().unwrap_or_else(|p| p.into_inner());
            cache
                .get(&respawn_world)
                .filter(|c| now_ms().saturating_sub(c.at_ms) <= SAFE_CACHE_TTL_MS)
                .map(|c| c.loc.clone())
        };
        if let Some(loc) = cached {
            if let Some(w) = gs.world(&respawn_world) {
                let clamped = w.clamp(loc);
                gs.respawn_at(player, clamped);
                self.refresh_cache_async(respawn_world);
                self.cleanup(player);
                return;
            }
        }

        // Final fallback: respawn locally, then a local-only RTP with no
        // countdown. Never a remote compute from here.
        let env = self
            .last_death_env
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&player)
            .unwrap_or(Environment::Normal);
        let force_overworld = matches!(env, Environment::Nether | Environment::End);

        let cfg = self.ctx.cfg.get();
        let local = cfg.server_name.clone();
        let chosen_world = if !force_overworld
            && !respawn_world.is_empty()
            && cfg.rtp.is_world_enabled(&local, &respawn_world)
        {
            Some(respawn_world)
        } else if is_overworld_rtp_enabled(&cfg, &local) {
            resolve_overworld_world(&cfg, &local)
        } else {
            None
        };

        self.vanilla_respawn(gs, player);
        if let Some(world) = chosen_world {
            let rtp = self.rtp.clone();
            let server = local;
            gs.schedule_in(1, move |gs| {
                rtp.start_rtp(gs, player, Recipient::Player(player), &server, &world, true);
            });
        }
        self.cleanup(player);
    }

    /// Route a respawn to the cached shared bed/anchor record; true when
    /// this function owned the respawn.
    fn try_route_shared_spawn(&self, gs: &mut GameState, player: PlayerId) -> bool {
        let cached = {
            let mut cache = self.shared_spawn.lock().unwrap_or_else(|p| p.into_inner());
            match cache.get(&player) {
                Some(c) if now_ms().saturating_sub(c.at_ms) <= SHARED_SPAWN_CACHE_TTL_MS => {
                    Some(c.sp.clone())
                }
                Some(_) => {
                    cache.remove(&player);
                    None
                }
                None => None,
            }
        };
        let Some(sp) = cached else { return false };
        if sp.server.trim().is_empty() || sp.world.trim().is_empty() {
            return false;
        }

        let spawning = self.ctx.cfg.get().spawning.clone();
        let local = gs.server_name.clone();

        if sp.server.eq_ignore_ascii_case(&local) {
            let Some((kind, pos)) = gs.classify_spawn_block_near(&sp.world, sp.x, sp.y, sp.z) else {
                // Block gone; the record is dead.
                self.ctx.del_async(self.ctx.keys.spawn(player));
                return false;
            };
            match kind {
                SpawnKind::Bed if !spawning.respect_bed_spawn => return false,
                SpawnKind::Anchor if !spawning.respect_anchor_spawn => return false,
                _ => {}
            }

            let Some(w) = gs.world(&sp.world) else { return false };
            let loc = w.clamp(sp.location());
            gs.respawn_at(player, loc);

            if kind == SpawnKind::Anchor {
                if let Some(remaining) = gs.consume_anchor_charge(&sp.world, pos) {
                    if remaining == 0 {
                        self.ctx.del_async(self.ctx.keys.spawn(player));
                    }
                }
            }
            return true;
        }

        // Remote shared spawn. The explicit kind decides which knob gates
        // it; unknown-kind records still need both.
        let allowed = match sp.kind {
            SpawnKind::Bed => spawning.respect_bed_spawn,
            SpawnKind::Anchor => spawning.respect_anchor_spawn,
            SpawnKind::Unknown => spawning.respect_bed_spawn && spawning.respect_anchor_spawn,
        };
        if !allowed || !self.ctx.store.is_running() {
            return false;
        }

        self.apply_respawn_mask(gs, player);
        self.vanilla_respawn(gs, player);

        let pending = PendingTeleport::new(&sp.server, &sp.location(), now_ms());
        let target_server = sp.server.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let key = ctx.keys.pending(player);
            let ttl = ctx.cfg.get().rtp.request_ttl_seconds;
            let Ok(json) = serde_json::to_string(&pending) else { return };
            if ctx.store.setex(&key, ttl, &json).await.is_err() {
                return;
            }
            let value = ctx.clone();
            ctx.game.run(move |gs| {
                if !gs.is_online(player) {
                    value.del_async(key);
                    return;
                }
                if !value.proxy.request_switch(player, &target_server) {
                    value.del_async(key);
                }
            });
        });
        true
    }

    // ---------- helpers ----------

    /// Where vanilla would respawn this player: their bed/anchor when still
    /// standing, else the default world spawn.
    fn vanilla_target(
        &self,
        gs: &GameState,
        player: PlayerId,
    ) -> Option<(Location, Option<(SpawnKind, (i32, i32, i32))>)> {
        let p = gs.player(player)?;

        if let Some(rl) = &p.respawn_location {
            if let Some((kind, pos)) = gs.classify_spawn_block_near(&rl.world, rl.x, rl.y, rl.z) {
                if let Some(w) = gs.world(&rl.world) {
                    return Some((w.clamp(rl.clone()), Some((kind, pos))));
                }
            }
        }

        let cfg = self.ctx.cfg.get();
        let default_world = cfg
            .rtp
            .server(&cfg.server_name)
            .map(|s| s.default_world.clone());
        let w = default_world
            .and_then(|n| gs.world(&n))
            .or_else(|| gs.world(&p.pos.world))?;
        Some((w.spawn.clone(), None))
    }

    fn vanilla_respawn(&self, gs: &mut GameState, player: PlayerId) {
        let Some((loc, kind)) = self.vanilla_target(gs, player) else {
            // No worlds at all; stand them back up where they fell.
            if let Some(pos) = gs.player(player).map(|p| p.pos.clone()) {
                gs.respawn_at(player, pos);
            }
            return;
        };

        if let Some((kind, pos)) = kind {
            if kind == SpawnKind::Anchor {
                let _ = gs.consume_anchor_charge(&loc.world, pos);
            }
            gs.respawn_at(player, loc.clone());
            self.spawnsync.on_respawn_observed(gs, player, kind, &loc, pos);
            return;
        }

        gs.respawn_at(player, loc);
    }

    fn apply_respawn_mask(&self, gs: &mut GameState, player: PlayerId) {
        let until = gs.now_tick + RESPAWN_MASK_TICKS;
        if let Some(p) = gs.player_mut(player) {
            p.blindness_until_tick = until;
            p.invisibility_until_tick = until;
        }
    }

    fn cache_shared_spawn_async(&self, player: PlayerId) {
        let this = self.clone();
        tokio::spawn(async move {
            if !this.ctx.store.is_running() {
                return;
            }
            let key = this.ctx.keys.spawn(player);
            let raw = match this.ctx.store.get(&key).await {
                Ok(Some(raw)) if !raw.trim().is_empty() => raw,
                _ => {
                    this.shared_spawn
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .remove(&player);
                    return;
                }
            };
            let sp: SpawnPoint = match serde_json::from_str(&raw) {
                Ok(sp) => sp,
                Err(e) => {
                    debug!(player = %player, err = %e, "deleting malformed spawn record");
                    this.ctx.del_async(key);
                    return;
                }
            };
            if sp.server.trim().is_empty() || sp.world.trim().is_empty() {
                this.shared_spawn
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&player);
                return;
            }
            this.shared_spawn
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(
                    player,
                    CachedSpawn {
                        sp,
                        at_ms: now_ms(),
                    },
                );
        });
    }

    fn refresh_cache_async(&self, world: String) {
        if world.trim().is_empty() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let Some(loc) = this.ctx.finder.find_safe(&world).await else {
                return;
            };
            this.ctx.game.run(move |gs| {
                let Some(w) = gs.world(&world) else { return };
                let clamped = w.clamp(loc);
                this.safe_cache.lock().unwrap_or_else(|p| p.into_inner()).insert(
                    world,
                    CachedSafe {
                        loc: clamped,
                        at_ms: now_ms(),
                    },
                );
            });
        });
    }

    fn choose_server_for_overworld(&self, cfg: &Config) -> Option<String> {
        let local = &cfg.server_name;
        if is_overworld_rtp_enabled(cfg, local) {
            return Some(local.clone());
        }
        if !self.ctx.store.is_running() {
            return None;
        }

        let enabled: Vec<&String> = cfg
            .rtp
            .fallback_enabled_servers
            .iter()
            .filter(|s| is_overworld_rtp_enabled(cfg, s))
            .collect();
        if enabled.is_empty() {
            return None;
        }

        let idx = match cfg.rtp.fallback_mode {
            FallbackMode::First => 0,
            FallbackMode::Random => {
                let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                rng.next_range(enabled.len() as u64) as usize
            }
        };
        Some(enabled[idx].clone())
    }
}

fn poll_remote_plan(
    gs: &mut GameState,
    this: DeathPipeline,
    player: PlayerId,
    cell: Arc<PlanCell>,
    elapsed_ticks: u64,
) {
    if !gs.is_online(player) {
        this.cleanup(player);
        return;
    }
    if elapsed_ticks >= REMOTE_AWAIT_MAX_TICKS {
        // Give up: the mask wears off and the player stays local.
        this.cleanup(player);
        return;
    }

    match cell.get() {
        None => {
            let next = elapsed_ticks + REMOTE_AWAIT_POLL_TICKS;
            gs.schedule_in(REMOTE_AWAIT_POLL_TICKS, move |gs| {
                poll_remote_plan(gs, this, player, cell, next);
            });
        }
        Some(None) => {
            this.cleanup(player);
        }
        Some(Some(pending)) => {
            if pending.server.trim().is_empty() {
                this.cleanup(player);
                return;
            }
            let key = this.ctx.keys.pending(player);
            let sent = this.ctx.proxy.request_switch(player, &pending.server);
            if !sent {
                this.ctx.del_async(key);
                this.cleanup(player);
                return;
            }

            // If the player is still here after a grace period, the switch
            // went nowhere; drop the pending.
            let ctx = this.ctx.clone();
            gs.schedule_in(REMOTE_SWITCH_FALLBACK_TICKS, move |gs| {
                if gs.is_online(player) {
                    ctx.del_async(key);
                }
            });
            this.cleanup(player);
        }
    }
}

fn is_overworld_rtp_enabled(cfg: &Config, server: &str) -> bool {
    if server.trim().is_empty() {
        return false;
    }
    let Some(srv) = cfg.rtp.server(server) else {
        return false;
    };
    if !srv.enabled || srv.default_world.trim().is_empty() {
        return false;
    }
    srv.worlds.get(&srv.default_world).is_some_and(|w| w.enabled)
}

fn resolve_overworld_world(cfg: &Config, server: &str) -> Option<String> {
    let srv = cfg.rtp.server(server)?;
    let world = srv.default_world.trim();
    if world.is_empty() {
        return None;
    }
    if !srv.worlds.get(world).is_some_and(|w| w.enabled) {
        return None;
    }
    Some(world.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestBackend;
    use std::time::Duration;

    #[tokio::test]
    async fn local_plan_is_applied_on_respawn() {
        let tb = TestBackend::lobby_with(|cfg| {
            cfg.spawning.random_teleport_respawn = true;
            enable_local_world(cfg, "lobby");
        })
        .await;
        let player = tb.join_player("Alice", false).await;

        tb.run_on_game({
            let death = tb.death.clone();
            move |gs| {
                gs.player_mut(player).unwrap().dead = true;
                death.on_death(gs, player);
            }
        })
        .await;

        // Let the finder refresh the plan.
        tokio::time::sleep(Duration::from_millis(200)).await;

        tb.run_on_game({
            let death = tb.death.clone();
            move |gs| death.on_respawn(gs, player)
        })
        .await;

        let events = tb.drain_events().await;
        let respawn = events.iter().find_map(|e| match e {
            warpproto::gateway::GatewayResp::RespawnAt { loc, .. } => Some(loc.clone()),
            _ => None,
        });
        let loc = respawn.expect("seamless respawn location");
        assert_eq!(loc.world, "world");
        // The plan location is a finder result, not the world spawn.
        let spawn = tb
            .game()
            .query(|gs| gs.world("world").unwrap().spawn.clone())
            .await
            .unwrap();
        assert_ne!((loc.x, loc.z), (spawn.x, spawn.z));
    }

    #[tokio::test]
    async fn respawn_without_feature_is_vanilla() {
        let tb = TestBackend::lobby().await;
        let player = tb.join_player("Bob", false).await;

        tb.run_on_game({
            let death = tb.death.clone();
            move |gs| {
                gs.player_mut(player).unwrap().dead = true;
                death.on_death(gs, player);
                death.on_respawn(gs, player);
            }
        })
        .await;

        let events = tb.drain_events().await;
        assert!(events.iter().any(|e| matches!(
            e,
            warpproto::gateway::GatewayResp::RespawnAt { .. }
        )));
        let alive = tb
            .game()
            .query(move |gs| gs.player(player).map(|p| p.dead))
            .await
            .unwrap();
        assert_eq!(alive, Some(false));
    }

    #[tokio::test]
    async fn shared_spawn_on_this_server_consumes_anchor_charge() {
        let tb = TestBackend::lobby_with(|cfg| {
            cfg.spawning.cross_server_respawn = true;
        })
        .await;
        let player = tb.join_player("Carol", false).await;

        tb.run_on_game(move |gs| {
            let w = gs.world_mut("world").unwrap();
            w.spawn_blocks
                .insert((40, 64, 40), crate::game::SpawnBlock::Anchor { charges: 1 });
        })
        .await;

        let sp = SpawnPoint::new(
            SpawnKind::Anchor,
            "lobby",
            &Location::new("world", 40.5, 65.0, 40.5, 0.0, 0.0),
            now_ms(),
        );
        tb.ctx
            .store
            .setex(
                &tb.ctx.keys.spawn(player),
                60,
                &serde_json::to_string(&sp).unwrap(),
            )
            .await
            .unwrap();

        tb.run_on_game({
            let death = tb.death.clone();
            move |gs| {
                gs.player_mut(player).unwrap().dead = true;
                death.on_death(gs, player);
            }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        tb.run_on_game({
            let death = tb.death.clone();
            move |gs| death.on_respawn(gs, player)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pos = tb
            .game()
            .query(move |gs| gs.player(player).unwrap().pos.clone())
            .await
            .unwrap();
        assert_eq!((pos.x, pos.z), (40.5, 40.5));

        // The single charge was consumed, and the drained record cleared.
        let charges = tb
            .game()
            .query(|gs| {
                gs.world("world")
                    .unwrap()
                    .spawn_blocks
                    .get(&(40, 64, 40))
                    .copied()
            })
            .await
            .unwrap();
        assert_eq!(charges, Some(crate::game::SpawnBlock::Anchor { charges: 0 }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            tb.ctx
                .store
                .get(&tb.ctx.keys.spawn(player))
                .await
                .unwrap()
                .is_none()
        );
    }

    fn enable_local_world(cfg: &mut crate::config::Config, server: &str) {
        use crate::config::{ServerRtp, WorldRtp};
        let mut srv = ServerRtp {
            enabled: true,
            default_world: "world".to_string(),
            ..Default::default()
        };
        srv.worlds.insert(
            "world".to_string(),
            WorldRtp {
                enabled: true,
                ..Default::default()
            },
        );
        cfg.rtp.servers.insert(server.to_string(), srv);
    }
}
