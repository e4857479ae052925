//! Advisory presence: `presence:<player> -> server_name`, refreshed while
//! the player stays online. Nothing blocks on these keys; every failure is
//! silently dropped.

use std::time::Duration;

use tracing::debug;

use warpproto::PlayerId;

use crate::ctx::Ctx;

pub const PRESENCE_TTL_SECS: u64 = 90;
const HEARTBEAT_SECS: u64 = 30;

#[derive(Clone)]
pub struct PresenceService {
    ctx: Ctx,
}

impl PresenceService {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub fn on_join(&self, player: PlayerId) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let key = ctx.keys.presence(player);
            if let Err(e) = ctx.store.setex(&key, PRESENCE_TTL_SECS, &ctx.server_name()).await {
                debug!(player = %player, err = %e, "presence write failed");
            }
        });
    }

    pub fn on_quit(&self, player: PlayerId) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let key = ctx.keys.presence(player);
            if let Err(e) = ctx.store.del(&key).await {
                debug!(player = %player, err = %e, "presence delete failed");
            }
        });
    }

    /// Every 30 s: snapshot the online ids on the game thread, then write
    /// all presence keys from a worker.
    pub fn start_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick fires immediately; skip it

            loop {
                tick.tick().await;
                if !ctx.store.is_running() {
                    continue;
                }

                let Some(ids) = ctx
                    .game
                    .query(|gs| gs.players.keys().copied().collect::<Vec<PlayerId>>())
                    .await
                else {
                    return;
                };
                if ids.is_empty() {
                    continue;
                }

                let server = ctx.server_name();
                for id in ids {
                    let key = ctx.keys.presence(id);
                    if let Err(e) = ctx.store.setex(&key, PRESENCE_TTL_SECS, &server).await {
                        debug!(player = %id, err = %e, "presence heartbeat write failed");
                    }
                }
            }
        })
    }
}
