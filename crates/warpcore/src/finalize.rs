//! Join finalizer: lands cross-server teleports after a proxy switch.
//!
//! On join, read `pending:<player>`; if it names this backend and is not
//! stale, freeze the player, preload the destination chunk, teleport, then
//! delete the record. Finalize is idempotent: success deletes the pending,
//! so a crash between teleport and delete just re-snaps on the next join.
//!
//! The visual freeze always releases: success path, failure path, or the
//! 4-second failsafe scheduled the moment the freeze is applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use warpproto::PlayerId;
use warpproto::records::{PendingTeleport, SpawnKind, SpawnPoint};

use crate::ctx::{Ctx, now_ms};
use crate::game::{GameState, Recipient};

const FREEZE_FAILSAFE_TICKS: u64 = 80; // 4 s
const FREEZE_BLINDNESS_TICKS: u64 = 200; // 10 s, removed early on unfreeze

/// How close the stored spawn record must be to the pending destination to
/// count as a shared-spawn route.
const SHARED_MATCH_XZ: f64 = 0.75;
const SHARED_MATCH_Y: f64 = 1.75;

struct FreezeState {
    walk_speed: f32,
    fly_speed: f32,
    flying: bool,
    allow_flight: bool,
}

/// Cheap-to-clone handle; clones share the freeze table.
#[derive(Clone)]
pub struct JoinFinalizer {
    ctx: Ctx,
    frozen: Arc<Mutex<HashMap<PlayerId, FreezeState>>>,
}

impl JoinFinalizer {
    pub fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            frozen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join hook. Store read happens in a worker; everything that touches
    /// the player happens back on the game thread.
    pub fn on_join(&self, player: PlayerId) {
        if !self.ctx.store.is_running() {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let key = this.ctx.keys.pending(player);
            let raw = match this.ctx.store.get(&key).await {
                Ok(Some(raw)) if !raw.trim().is_empty() => raw,
                _ => return,
            };

            let pending: PendingTeleport = match serde_json::from_str(&raw) {
                Ok(p) => p,
                Err(e) => {
                    // Poison record: drop it so it can't wedge every join.
                    warn!(player = %player, err = %e, "deleting malformed pending record");
                    this.ctx.del_async(key);
                    return;
                }
            };

            let value = this.clone();
            this.ctx.game.run(move |gs| {
                value.finalize_start(gs, player, key, pending);
            });
        });
    }

    fn finalize_start(
        &self,
        gs: &mut GameState,
        player: PlayerId,
        pending_key: String,
        pending: PendingTeleport,
    ) {
        if !gs.is_online(player) || !self.ctx.store.is_running() {
            return;
        }
        if pending.server.trim().is_empty() || pending.world.trim().is_empty() {
            return;
        }
        // A pending for another backend is someone else's to finalize.
        if !pending.server.eq_ignore_ascii_case(&gs.server_name) {
            return;
        }
        if pending.at_ms > 0 {
            let ttl_ms = self.ctx.cfg.get().rtp.request_ttl_seconds * 1000;
            if now_ms().saturating_sub(pending.at_ms) > ttl_ms {
                debug!(player = %player, "dropping stale pending teleport");
                self.ctx.del_async(pending_key);
                return;
            }
        }

        if gs.world(&pending.world).is_none() {
            gs.notify(
                Recipient::Player(player),
                "errors.unknown-world",
                &[("server", pending.server.clone()), ("world", pending.world.clone())],
            );
            self.bump_or_delete(pending_key, pending);
            return;
        }

        self.freeze(gs, player);
        {
            let this = self.clone();
            gs.schedule_in(FREEZE_FAILSAFE_TICKS, move |gs| {
                this.unfreeze(gs, player);
            });
        }

        let spawning = self.ctx.cfg.get().spawning.clone();
        let shared_possible = spawning.cross_server_respawn
            && gs
                .classify_spawn_block_near(&pending.world, pending.x, pending.y, pending.z)
                .is_some();

        if !shared_possible {
            self.finalize_teleport(gs, player, pending_key, pending, false);
            return;
        }

        // Destination looks like a bed/anchor: check whether it is the
        // player's shared spawn record before finalizing.
        let this = self.clone();
        tokio::spawn(async move {
            let spawn_key = this.ctx.keys.spawn(player);
            let shared = match this.ctx.store.get(&spawn_key).await {
                Ok(Some(raw)) => serde_json::from_str::<SpawnPoint>(&raw)
                    .ok()
                    .is_some_and(|sp| {
                        sp.server.eq_ignore_ascii_case(&pending.server)
                            && sp.world.eq_ignore_ascii_case(&pending.world)
                            && (sp.x - pending.x).abs() <= SHARED_MATCH_XZ
                            && (sp.y - pending.y).abs() <= SHARED_MATCH_Y
                            && (sp.z - pending.z).abs() <= SHARED_MATCH_XZ
                    }),
                _ => false,
            };

            let value = this.clone();
            this.ctx.game.run(move |gs| {
                if !gs.is_online(player) {
                    return;
                }
                value.finalize_teleport(gs, player, pending_key, pending, shared);
            });
        });
    }

    fn finalize_teleport(
        &self,
        gs: &mut GameState,
        player: PlayerId,
        pending_key: String,
        pending: PendingTeleport,
        shared_spawn_route: bool,
    ) {
        if !gs.is_online(player) {
            return;
        }
        let Some(world) = gs.world(&pending.world) else {
            gs.notify(
                Recipient::Player(player),
                "errors.unknown-world",
                &[("server", pending.server.clone()), ("world", pending.world.clone())],
            );
            self.bump_or_delete(pending_key, pending);
            self.unfreeze(gs, player);
            return;
        };
        let loc = world.clamp(pending.location());

        let spawning = self.ctx.cfg.get().spawning.clone();
        let mut anchor_pos = None;
        if shared_spawn_route {
            match gs.classify_spawn_block_near(&pending.world, pending.x, pending.y, pending.z) {
                None => {
                    // The bed/anchor is gone (or discharged); both records
                    // are dead.
                    self.ctx.del_async(self.ctx.keys.spawn(player));
                    self.ctx.del_async(pending_key);
                    gs.notify(Recipient::Player(player), "errors.no-safe-location", &[]);
                    self.unfreeze(gs, player);
                    return;
                }
                Some((SpawnKind::Bed, _)) if !spawning.respect_bed_spawn => {
                    self.ctx.del_async(self.ctx.keys.spawn(player));
                    self.ctx.del_async(pending_key);
                    self.unfreeze(gs, player);
                    return;
                }
                Some((SpawnKind::Anchor, pos)) => {
                    if !spawning.respect_anchor_spawn {
                        self.ctx.del_async(self.ctx.keys.spawn(player));
                        self.ctx.del_async(pending_key);
                        self.unfreeze(gs, player);
                        return;
                    }
                    anchor_pos = Some(pos);
                }
                Some(_) => {}
            }
        }

        let this = self.clone();
        let (cx, cz) = (loc.chunk_x(), loc.chunk_z());
        let world_name = loc.world.clone();
        tokio::spawn(async move {
            let loaded = this.ctx.game.preload_chunk(world_name, cx, cz).await;
            let value = this.clone();
            this.ctx.game.run(move |gs| {
                if !gs.is_online(player) {
                    return;
                }
                if !loaded || !gs.teleport(player, loc.clone()) {
                    gs.notify(Recipient::Player(player), "errors.no-safe-location", &[]);
                    value.bump_or_delete(pending_key, pending);
                    value.unfreeze(gs, player);
                    return;
                }

                // Anchor routes consume one charge on arrival.
                if let Some(pos) = anchor_pos {
                    if let Some(remaining) = gs.consume_anchor_charge(&pending.world, pos) {
                        if remaining == 0 {
                            value.ctx.del_async(value.ctx.keys.spawn(player));
                        }
                    }
                }

                value.ctx.del_async(pending_key);
                value.unfreeze(gs, player);
                gs.notify(
                    Recipient::Player(player),
                    "success.teleported",
                    &[("world", pending.world.clone())],
                );
            });
        });
    }

    /// Bump the finalize counter, deleting the record once the configured
    /// attempt budget is spent.
    fn bump_or_delete(&self, pending_key: String, pending: PendingTeleport) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if !ctx.store.is_running() {
                return;
            }
            let cfg = ctx.cfg.get();
            let max = cfg.rtp.pending_max_finalize_attempts;
            let bumped = pending.bumped();

            if bumped.attempts >= max {
                let _ = ctx.store.del(&pending_key).await;
                return;
            }
            if let Ok(json) = serde_json::to_string(&bumped) {
                let _ = ctx
                    .store
                    .setex(&pending_key, cfg.rtp.request_ttl_seconds, &json)
                    .await;
            }
        });
    }

    fn freeze(&self, gs: &mut GameState, player: PlayerId) {
        let now_tick = gs.now_tick;
        let Some(p) = gs.player_mut(player) else { return };

        let mut frozen = self.frozen.lock().unwrap_or_else(|p| p.into_inner());
        if frozen.contains_key(&player) {
            return;
        }
        frozen.insert(
            player,
            FreezeState {
                walk_speed: p.walk_speed,
                fly_speed: p.fly_speed,
                flying: p.flying,
                allow_flight: p.allow_flight,
            },
        );

        p.invulnerable = true;
        p.allow_flight = true;
        p.flying = true;
        p.walk_speed = 0.0;
        p.fly_speed = 0.0;
        p.blindness_until_tick = now_tick + FREEZE_BLINDNESS_TICKS;
    }

    fn unfreeze(&self, gs: &mut GameState, player: PlayerId) {
        let now_tick = gs.now_tick;
        let Some(st) = self
            .frozen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&player)
        else {
            return;
        };
        let Some(p) = gs.player_mut(player) else { return };

        p.blindness_until_tick = now_tick;
        p.walk_speed = st.walk_speed;
        p.fly_speed = st.fly_speed;
        p.allow_flight = st.allow_flight;
        p.flying = st.flying;
        p.invulnerable = false;
    }

    /// Whether a freeze is currently applied (diagnostics/tests).
    pub fn is_frozen(&self, player: PlayerId) -> bool {
        self.frozen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&player)
    }
}
