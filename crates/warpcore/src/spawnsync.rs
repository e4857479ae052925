//! Cross-backend spawn record sync.
//!
//! Keeps `spawn:<player>` in the store pointing at the player's bed or
//! charged respawn anchor, so another backend can route their respawn here.
//! Hosts feed this from whatever events they have: an explicit
//! "spawn set" event when the platform exposes one, otherwise bed-enter /
//! anchor-interact / block-break relays plus the respawn observations the
//! death pipeline makes.
//!
//! Clearing is guarded: only the backend named in the stored record may
//! clear it, and only when the broken block matches the stored coordinates.

use tracing::debug;

use warpproto::PlayerId;
use warpproto::records::{Location, SpawnKind, SpawnPoint};

use crate::ctx::{Ctx, now_ms};
use crate::game::GameState;

pub const SPAWN_TTL_SECS: u64 = 60 * 60 * 24 * 30; // 30 days

/// How close a stored spawn must be to a block to be considered "that
/// spawn".
const MATCH_XZ_BLOCKS: f64 = 1.25;
const MATCH_Y_BLOCKS: f64 = 2.25;

#[derive(Clone)]
pub struct SpawnSync {
    ctx: Ctx,
}

impl SpawnSync {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    fn enabled(&self) -> bool {
        self.ctx.cfg.get().spawning.cross_server_respawn && self.ctx.store.is_running()
    }

    fn respect(&self, kind: SpawnKind) -> bool {
        let s = self.ctx.cfg.get().spawning.clone();
        match kind {
            SpawnKind::Bed => s.respect_bed_spawn,
            SpawnKind::Anchor => s.respect_anchor_spawn,
            SpawnKind::Unknown => s.respect_bed_spawn && s.respect_anchor_spawn,
        }
    }

    /// Host reported a new spawn point (bed entered, anchor charged, or an
    /// explicit platform spawn-set event).
    pub fn on_spawn_set(&self, player: PlayerId, kind: SpawnKind, loc: &Location) {
        if !self.enabled() || !self.respect(kind) {
            return;
        }
        self.write_spawn_async(player, SpawnPoint::new(kind, &self.ctx.server_name(), loc, now_ms()));
    }

    /// Host reported the spawn block at `loc` gone (broken bed/anchor, or
    /// an anchor at zero charges).
    pub fn on_spawn_clear(&self, player: PlayerId, loc: &Location) {
        if !self.enabled() {
            return;
        }
        self.clear_if_matches_async(player, loc.world.clone(), loc.x, loc.y, loc.z);
    }

    /// The death pipeline observed a vanilla bed/anchor respawn; rewrite the
    /// record, and drop it when the anchor just ran out of charges.
    pub fn on_respawn_observed(
        &self,
        gs: &GameState,
        player: PlayerId,
        kind: SpawnKind,
        loc: &Location,
        block_pos: (i32, i32, i32),
    ) {
        if !self.enabled() || !self.respect(kind) {
            return;
        }

        self.write_spawn_async(player, SpawnPoint::new(kind, &self.ctx.server_name(), loc, now_ms()));

        if kind == SpawnKind::Anchor {
            let drained = gs
                .world(&loc.world)
                .and_then(|w| w.spawn_blocks.get(&block_pos))
                .is_none_or(|b| matches!(b, crate::game::SpawnBlock::Anchor { charges: 0 }));
            if drained {
                self.clear_if_matches_async(player, loc.world.clone(), loc.x, loc.y, loc.z);
            }
        }
    }

    fn write_spawn_async(&self, player: PlayerId, record: SpawnPoint) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if !ctx.store.is_running() {
                return;
            }
            let key = ctx.keys.spawn(player);
            match serde_json::to_string(&record) {
                Ok(json) => {
                    if let Err(e) = ctx.store.setex(&key, SPAWN_TTL_SECS, &json).await {
                        debug!(player = %player, err = %e, "spawn record write failed");
                    }
                }
                Err(e) => debug!(err = %e, "spawn record encode failed"),
            }
        });
    }

    fn clear_if_matches_async(&self, player: PlayerId, world: String, x: f64, y: f64, z: f64) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if !ctx.store.is_running() {
                return;
            }
            let key = ctx.keys.spawn(player);
            let raw = match ctx.store.get(&key).await {
                Ok(Some(raw)) if !raw.trim().is_empty() => raw,
                _ => return,
            };
            let sp: SpawnPoint = match serde_json::from_str(&raw) {
                Ok(sp) => sp,
                Err(_) => {
                    // Poison record; delete outright.
                    let _ = ctx.store.del(&key).await;
                    return;
                }
            };

            // Only the backend that wrote the record may clear it.
            let local = ctx.server_name();
            if !sp.server.eq_ignore_ascii_case(&local) || !sp.world.eq_ignore_ascii_case(&world) {
                return;
            }
            if (sp.x - x).abs() <= MATCH_XZ_BLOCKS
                && (sp.z - z).abs() <= MATCH_XZ_BLOCKS
                && (sp.y - y).abs() <= MATCH_Y_BLOCKS
            {
                let _ = ctx.store.del(&key).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestBackend;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_and_clears_matching_spawn() {
        let tb = TestBackend::lobby_with(|cfg| {
            cfg.spawning.cross_server_respawn = true;
        })
        .await;
        let player = tb.join_player("Alice", false).await;
        let loc = Location::new("world", 10.5, 64.0, 10.5, 0.0, 0.0);

        tb.spawnsync.on_spawn_set(player, SpawnKind::Bed, &loc);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let key = tb.ctx.keys.spawn(player);
        let sp: SpawnPoint =
            serde_json::from_str(&tb.ctx.store.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(sp.kind, SpawnKind::Bed);
        assert_eq!(sp.server, "lobby");

        // A far-away break must not clear it.
        tb.spawnsync
            .on_spawn_clear(player, &Location::new("world", 99.0, 64.0, 99.0, 0.0, 0.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tb.ctx.store.get(&key).await.unwrap().is_some());

        // Breaking the actual bed clears it.
        tb.spawnsync.on_spawn_clear(player, &loc);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tb.ctx.store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_feature_writes_nothing() {
        let tb = TestBackend::lobby().await; // cross_server_respawn off
        let player = tb.join_player("Bob", false).await;
        tb.spawnsync.on_spawn_set(
            player,
            SpawnKind::Bed,
            &Location::new("world", 1.0, 64.0, 1.0, 0.0, 0.0),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tb.ctx.store.get(&tb.ctx.keys.spawn(player)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn foreign_record_is_never_cleared() {
        let tb = TestBackend::lobby_with(|cfg| {
            cfg.spawning.cross_server_respawn = true;
        })
        .await;
        let player = tb.join_player("Carol", false).await;
        let key = tb.ctx.keys.spawn(player);
        let foreign = SpawnPoint::new(
            SpawnKind::Bed,
            "smp",
            &Location::new("world", 10.5, 64.0, 10.5, 0.0, 0.0),
            now_ms(),
        );
        tb.ctx
            .store
            .setex(&key, 60, &serde_json::to_string(&foreign).unwrap())
            .await
            .unwrap();

        tb.spawnsync
            .on_spawn_clear(player, &Location::new("world", 10.5, 64.0, 10.5, 0.0, 0.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tb.ctx.store.get(&key).await.unwrap().is_some());
    }
}
