//! `warpcore`: the cross-server RTP and respawn coordination layer.
//!
//! One [`Backend`] per game process. The gateway feeds it joins, inputs,
//! movement and death/respawn events; the backend coordinates with the rest
//! of the fleet through the shared store and pushes messages, teleports and
//! switch requests back out.

pub mod attempt;
pub mod command;
pub mod config;
pub mod ctx;
pub mod death;
pub mod dispatch;
pub mod finalize;
pub mod finder;
pub mod game;
pub mod presence;
pub mod proxy;
pub mod responder;
pub mod spawnsync;

pub mod testutil;

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::info;

use warpproto::PlayerId;
use warpproto::records::{Location, SpawnKind};

use crate::attempt::RtpService;
use crate::command::{CommandRouter, ReloadFn};
use crate::ctx::Ctx;
use crate::death::DeathPipeline;
use crate::finalize::JoinFinalizer;
use crate::game::{GameState, Player};
use crate::presence::PresenceService;
use crate::responder::ComputeResponder;
use crate::spawnsync::SpawnSync;

/// All coordination services of one backend, wired to a shared [`Ctx`].
pub struct Backend {
    pub ctx: Ctx,
    pub rtp: RtpService,
    pub death: DeathPipeline,
    pub finalizer: JoinFinalizer,
    pub presence: PresenceService,
    pub spawnsync: SpawnSync,
    pub commands: CommandRouter,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Backend {
    /// Build every service, start the store subscriber + compute responder
    /// (when the store is enabled) and the presence heartbeat.
    pub fn start(ctx: Ctx, reload: Arc<ReloadFn>) -> Arc<Self> {
        let rtp = RtpService::new(ctx.clone());
        let spawnsync = SpawnSync::new(ctx.clone());
        let death = DeathPipeline::new(ctx.clone(), rtp.clone(), spawnsync.clone());
        let finalizer = JoinFinalizer::new(ctx.clone());
        let presence = PresenceService::new(ctx.clone());
        let commands = CommandRouter::new(ctx.clone(), rtp.clone(), reload);

        let mut tasks = Vec::new();
        if ctx.cfg.get().store.enabled {
            let (tx, rx) = mpsc::channel(256);
            ctx.store.start(ctx.keys.compute_channel(), tx);
            tasks.push(ComputeResponder::new(ctx.clone()).start(rx));
            info!(channel = %ctx.keys.compute_channel(), "compute responder started");
        }
        tasks.push(presence.start_heartbeat());

        Arc::new(Self {
            ctx,
            rtp,
            death,
            finalizer,
            presence,
            spawnsync,
            commands,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn shutdown(&self) {
        self.ctx.store.stop();
        for t in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            t.abort();
        }
    }

    // ---- gateway event entrypoints; all run on the game thread ----

    pub fn handle_attach(
        &self,
        gs: &mut GameState,
        player: PlayerId,
        name: &str,
        admin: bool,
        pos: Location,
    ) {
        // A re-attach for a live id replaces the old session outright.
        gs.players.insert(player, Player::new(player, name, admin, pos));
        self.presence.on_join(player);
        self.finalizer.on_join(player);
    }

    pub fn handle_detach(&self, gs: &mut GameState, player: PlayerId) {
        if gs.players.remove(&player).is_some() {
            self.presence.on_quit(player);
        }
    }

    pub fn handle_input(&self, gs: &mut GameState, player: PlayerId, line: &str) {
        let line = line.trim();
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        match cmd.trim_start_matches('/').to_ascii_lowercase().as_str() {
            "rtp" => self.commands.handle(gs, player, rest),
            _ => gs.send(warpproto::gateway::GatewayResp::Err {
                player,
                msg: "unknown command".to_string(),
            }),
        }
    }

    pub fn handle_move(&self, gs: &mut GameState, player: PlayerId, pos: Location) {
        if let Some(p) = gs.player_mut(player) {
            if !p.dead {
                p.pos = pos;
            }
        }
    }

    pub fn handle_died(&self, gs: &mut GameState, player: PlayerId) {
        let Some(p) = gs.player_mut(player) else { return };
        p.dead = true;
        self.death.on_death(gs, player);
    }

    pub fn handle_respawn(&self, gs: &mut GameState, player: PlayerId) {
        self.death.on_respawn(gs, player);
    }

    pub fn handle_spawn_set(&self, gs: &mut GameState, player: PlayerId, loc: Location) {
        let kind = gs
            .classify_spawn_block_near(&loc.world, loc.x, loc.y, loc.z)
            .map(|(k, _)| k)
            .unwrap_or(SpawnKind::Unknown);
        self.spawnsync.on_spawn_set(player, kind, &loc);
        if let Some(p) = gs.player_mut(player) {
            p.respawn_location = Some(loc);
        }
    }

    pub fn handle_spawn_clear(&self, gs: &mut GameState, player: PlayerId, loc: Location) {
        self.spawnsync.on_spawn_clear(player, &loc);
        if let Some(p) = gs.player_mut(player) {
            if p
                .respawn_location
                .as_ref()
                .is_some_and(|rl| rl.world == loc.world)
            {
                p.respawn_location = None;
            }
        }
    }
}
