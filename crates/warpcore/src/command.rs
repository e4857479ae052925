//! `/rtp` command routing.
//!
//! Grammar (the host hands us the raw argument line):
//! - ``                      self RTP on the default server/world
//! - `<server>`              self cross-server
//! - `<world-alias>`         overworld|nether|end shortcut on the default server
//! - `<server> <world>`      explicit world (aliases accepted)
//! - `<player> [srv] [wld]`  admin form, targets another online player
//! - `reload`                re-read the config
//!
//! Friendly aliases map to the stock world folder names; the aliased folder
//! names themselves stay valid input.

use std::sync::{Arc, Mutex};

use tracing::error;

use warpproto::PlayerId;

use crate::attempt::RtpService;
use crate::config::{Config, FallbackMode};
use crate::ctx::Ctx;
use crate::finder::Rng64;
use crate::game::{GameState, Recipient};

pub type ReloadFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;

#[derive(Clone)]
pub struct CommandRouter {
    ctx: Ctx,
    rtp: RtpService,
    reload: Arc<ReloadFn>,
    rng: Arc<Mutex<Rng64>>,
}

fn is_world_alias(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "overworld" | "nether" | "end"
    )
}

fn map_world_alias(s: &str) -> String {
    match s.to_ascii_lowercase().as_str() {
        "overworld" => "world".to_string(),
        "nether" => "world_nether".to_string(),
        "end" => "world_the_end".to_string(),
        _ => s.to_string(),
    }
}

impl CommandRouter {
    pub fn new(ctx: Ctx, rtp: RtpService, reload: Arc<ReloadFn>) -> Self {
        Self {
            ctx,
            rtp,
            reload,
            rng: Arc::new(Mutex::new(Rng64::from_entropy())),
        }
    }

    /// Handle one `/rtp` invocation from `sender`; game thread.
    pub fn handle(&self, gs: &mut GameState, sender: PlayerId, args_line: &str) {
        let feedback = Recipient::Player(sender);
        let args: Vec<&str> = args_line.split_whitespace().collect();
        let cfg = self.ctx.cfg.get();

        if args.first().is_some_and(|a| a.eq_ignore_ascii_case("reload")) {
            let is_admin = gs.player(sender).is_some_and(|p| p.admin);
            if !is_admin {
                gs.notify(feedback, "errors.no-permission", &[]);
                return;
            }
            match (self.reload)() {
                Ok(()) => gs.notify(feedback, "admin.reloaded", &[]),
                Err(e) => {
                    error!(err = %e, "config reload failed");
                    gs.notify(feedback, "errors.reload-failed", &[]);
                }
            }
            return;
        }

        let Some(p) = gs.player(sender) else { return };
        let sender_is_admin = p.admin;

        // Admin form: /rtp <player> [server|alias] [world|alias]
        let target = args
            .first()
            .filter(|_| sender_is_admin)
            .and_then(|name| gs.find_player_by_name(name))
            .map(|p| p.id);
        if let Some(target) = target {
            let (server, world) = match args.get(1) {
                None => (None, None),
                Some(a2) if cfg.rtp.server(a2).is_some() => {
                    (Some(a2.to_string()), args.get(2).map(|s| s.to_string()))
                }
                Some(a2) if is_world_alias(a2) => (None, Some(a2.to_string())),
                Some(a2) => {
                    gs.notify(feedback, "errors.unknown-server", &[("server", a2.to_string())]);
                    return;
                }
            };

            let server = match server {
                Some(s) => {
                    if !self.validate_server(gs, &cfg, &s, feedback) {
                        return;
                    }
                    s
                }
                None => match self.choose_default_server(&cfg) {
                    Some(s) => s,
                    None => {
                        gs.notify(feedback, "errors.no-enabled-backends", &[]);
                        return;
                    }
                },
            };

            let world = world.as_deref().map(map_world_alias);
            let Some(world) = self.resolve_world_or_default(gs, &cfg, &server, world, feedback)
            else {
                return;
            };

            self.rtp.start_rtp(gs, target, feedback, &server, &world, true);
            return;
        }

        match args.len() {
            0 => {
                let Some(server) = self.choose_default_server(&cfg) else {
                    gs.notify(feedback, "errors.no-enabled-backends", &[]);
                    return;
                };
                let Some(world) = self.resolve_world_or_default(gs, &cfg, &server, None, feedback)
                else {
                    return;
                };
                self.rtp.start_rtp(gs, sender, feedback, &server, &world, false);
            }
            1 => {
                let arg = args[0];

                if cfg.rtp.server(arg).is_some() {
                    if !self.validate_server(gs, &cfg, arg, feedback) {
                        return;
                    }
                    let Some(world) = self.resolve_world_or_default(gs, &cfg, arg, None, feedback)
                    else {
                        return;
                    };
                    self.rtp.start_rtp(gs, sender, feedback, arg, &world, false);
                    return;
                }

                if is_world_alias(arg) {
                    let Some(server) = self.choose_default_server(&cfg) else {
                        gs.notify(feedback, "errors.no-enabled-backends", &[]);
                        return;
                    };
                    if !self.validate_server(gs, &cfg, &server, feedback) {
                        return;
                    }
                    let world = Some(map_world_alias(arg));
                    let Some(world) =
                        self.resolve_world_or_default(gs, &cfg, &server, world, feedback)
                    else {
                        return;
                    };
                    self.rtp.start_rtp(gs, sender, feedback, &server, &world, false);
                    return;
                }

                gs.notify(feedback, "errors.unknown-server", &[("server", arg.to_string())]);
            }
            _ => {
                let server = args[0];
                let world = map_world_alias(args[1]);

                if !self.validate_server(gs, &cfg, server, feedback) {
                    return;
                }
                let Some(world) =
                    self.resolve_world_or_default(gs, &cfg, server, Some(world), feedback)
                else {
                    return;
                };
                self.rtp.start_rtp(gs, sender, feedback, server, &world, false);
            }
        }
    }

    /// Local server when enabled, else a store-backed fallback.
    fn choose_default_server(&self, cfg: &Config) -> Option<String> {
        if cfg.rtp.is_server_enabled(&cfg.server_name) {
            return Some(cfg.server_name.clone());
        }
        if !self.ctx.store.is_running() {
            return None;
        }

        let enabled: Vec<&String> = cfg
            .rtp
            .fallback_enabled_servers
            .iter()
            .filter(|s| cfg.rtp.is_server_enabled(s))
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

    fn validate_server(
        &self,
        gs: &mut GameState,
        cfg: &Config,
        server: &str,
        feedback: Recipient,
    ) -> bool {
        if cfg.rtp.server(server).is_none() {
            gs.notify(feedback, "errors.unknown-server", &[("server", server.to_string())]);
            return false;
        }
        if !cfg.rtp.is_server_enabled(server) {
            gs.notify(feedback, "errors.server-disabled", &[("server", server.to_string())]);
            return false;
        }
        if !cfg.server_name.eq_ignore_ascii_case(server) && !self.ctx.store.is_running() {
            gs.notify(feedback, "errors.no-enabled-backends", &[]);
            return false;
        }
        true
    }

    fn resolve_world_or_default(
        &self,
        gs: &mut GameState,
        cfg: &Config,
        server: &str,
        world: Option<String>,
        feedback: Recipient,
    ) -> Option<String> {
        let Some(srv) = cfg.rtp.server(server) else {
            gs.notify(feedback, "errors.unknown-server", &[("server", server.to_string())]);
            return None;
        };

        let resolved = match world {
            Some(w) if !w.trim().is_empty() => w,
            _ => srv.default_world.clone(),
        };

        if !srv.worlds.contains_key(&resolved) {
            gs.notify(
                feedback,
                "errors.unknown-world",
                &[("server", server.to_string()), ("world", resolved)],
            );
            return None;
        }
        if !srv.worlds.get(&resolved).is_some_and(|w| w.enabled) {
            gs.notify(
                feedback,
                "errors.world-disabled",
                &[("server", server.to_string()), ("world", resolved)],
            );
            return None;
        }

        Some(resolved)
    }
}
