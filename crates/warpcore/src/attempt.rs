//! Per-player RTP attempt state machine.
//!
//! One live attempt per player: starting a new one silently cancels the
//! prior before any of the new attempt's continuations run. The cancel flag
//! is monotonic and every scheduled continuation checks it (plus
//! player-online) on entry, so cancellation needs no task interruption.
//!
//! Movement never cancels during the search phase. The monitor samples the
//! player every 4 ticks, arms a baseline after ~1 s of stillness, and only
//! cancels once the countdown has switched cancel-on-move on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use warpproto::PlayerId;
use warpproto::records::Location;

use crate::ctx::Ctx;
use crate::dispatch;
use crate::game::{GameState, Job, Recipient};

const REQUIRED_STABLE_SAMPLES: u32 = 5; // 5 samples * 4 ticks = ~1 s
const MONITOR_PERIOD_TICKS: u64 = 4;
const MONITOR_INITIAL_DELAY_TICKS: u64 = 4;
const COUNTDOWN_PERIOD_TICKS: u64 = 20;
/// Upward movement beyond this cancels even inside the same block cell.
const JUMP_CANCEL_EPSILON: f64 = 0.20;

#[derive(Debug, Clone, PartialEq)]
struct PosKey {
    world: String,
    bx: i32,
    by: i32,
    bz: i32,
}

impl PosKey {
    fn of(loc: &Location) -> Self {
        Self {
            world: loc.world.clone(),
            bx: loc.block_x(),
            by: loc.block_y(),
            bz: loc.block_z(),
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    armed: bool,
    stable_samples: u32,
    last: PosKey,
    base: PosKey,
    base_y: f64,
}

#[derive(Debug)]
pub struct Attempt {
    player: PlayerId,
    cancelled: AtomicBool,
    cancel_on_move: AtomicBool,
    monitor: Mutex<MonitorState>,
}

impl Attempt {
    fn new(player: PlayerId, start: &Location) -> Self {
        let key = PosKey::of(start);
        Self {
            player,
            cancelled: AtomicBool::new(false),
            cancel_on_move: AtomicBool::new(false),
            monitor: Mutex::new(MonitorState {
                armed: false,
                stable_samples: 0,
                last: key.clone(),
                base: key,
                base_y: start.y,
            }),
        }
    }

    pub fn player(&self) -> PlayerId {
        self.player
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_silently(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn enable_cancel_on_move(&self) {
        self.cancel_on_move.store(true, Ordering::SeqCst);
    }

    fn cancel_on_move_enabled(&self) -> bool {
        self.cancel_on_move.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownVerdict {
    Pass,
    Active { remaining_secs: i64 },
}

/// Cheap-to-clone service handle; every clone shares the attempt table.
#[derive(Clone)]
pub struct RtpService {
    pub(crate) ctx: Ctx,
    attempts: Arc<Mutex<HashMap<PlayerId, Arc<Attempt>>>>,
}

impl RtpService {
    pub fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn live_attempt(&self, player: PlayerId) -> Option<Arc<Attempt>> {
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&player)
            .cloned()
    }

    /// Finish an attempt: set the cancel flag (stops the monitor) and free
    /// the player's slot if it still holds this attempt.
    pub(crate) fn clear(&self, attempt: &Arc<Attempt>) {
        attempt.cancel_silently();
        self.remove_slot(attempt);
    }

    fn remove_slot(&self, attempt: &Arc<Attempt>) {
        let mut map = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cur) = map.get(&attempt.player) {
            if Arc::ptr_eq(cur, attempt) {
                map.remove(&attempt.player);
            }
        }
    }

    /// Entry point; game thread. `admin` marks an admin/bypass invocation:
    /// it skips the cooldown gate and the countdown.
    pub fn start_rtp(
        &self,
        gs: &mut GameState,
        target: PlayerId,
        feedback: Recipient,
        server: &str,
        world: &str,
        admin: bool,
    ) {
        let Some(p) = gs.player(target) else { return };
        let start_pos = p.pos.clone();

        let prev = self
            .attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&target);
        if let Some(prev) = prev {
            prev.cancel_silently();
        }

        let attempt = Arc::new(Attempt::new(target, &start_pos));
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target, attempt.clone());

        {
            let svc = self.clone();
            let attempt = attempt.clone();
            gs.schedule_in(MONITOR_INITIAL_DELAY_TICKS, move |gs| {
                monitor_step(gs, svc, attempt);
            });
        }

        let server = server.to_string();
        let world = world.to_string();

        if admin {
            self.after_cooldown(
                gs,
                attempt,
                target,
                feedback,
                server,
                world,
                true,
                CooldownVerdict::Pass,
            );
            return;
        }

        let svc = self.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let verdict = check_and_set_cooldown(&ctx, target).await;
            ctx.game.run(move |gs| {
                svc.after_cooldown(gs, attempt, target, feedback, server, world, false, verdict);
            });
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn after_cooldown(
        &self,
        gs: &mut GameState,
        attempt: Arc<Attempt>,
        target: PlayerId,
        feedback: Recipient,
        server: String,
        world: String,
        admin: bool,
        verdict: CooldownVerdict,
    ) {
        if attempt.is_cancelled() {
            return;
        }
        if let CooldownVerdict::Active { remaining_secs } = verdict {
            self.clear(&attempt);
            gs.notify(
                feedback,
                "cooldown.active",
                &[("time", format!("{remaining_secs}s"))],
            );
            return;
        }

        let local = server.eq_ignore_ascii_case(&gs.server_name);

        if local {
            gs.notify(feedback, "status.searching-local", &[]);

            let svc = self.clone();
            let ctx = self.ctx.clone();
            let world_for_find = world.clone();
            tokio::spawn(async move {
                let loc = ctx.finder.find_safe(&world_for_find).await;
                ctx.game.run(move |gs| {
                    svc.after_search_local(gs, attempt, target, feedback, server, world, admin, loc);
                });
            });
            return;
        }

        // Remote RTP requires a running store.
        if !self.ctx.store.is_running() {
            self.clear(&attempt);
            gs.notify(feedback, "errors.compute-timeout", &[]);
            return;
        }

        gs.notify(feedback, "status.searching-remote", &[("server", server.clone())]);
        dispatch::run_remote(self.clone(), attempt, target, feedback, server, world, admin);
    }

    #[allow(clippy::too_many_arguments)]
    fn after_search_local(
        &self,
        gs: &mut GameState,
        attempt: Arc<Attempt>,
        target: PlayerId,
        feedback: Recipient,
        server: String,
        world: String,
        admin: bool,
        loc: Option<Location>,
    ) {
        if attempt.is_cancelled() {
            return;
        }
        let Some(loc) = loc else {
            self.clear(&attempt);
            gs.notify(feedback, "errors.no-safe-location", &[]);
            return;
        };

        let svc = self.clone();
        let go_attempt = attempt.clone();
        let do_teleport: Job = Box::new(move |gs| {
            svc.do_local_teleport(gs, go_attempt, target, feedback, server, world, loc, admin);
        });

        if admin {
            do_teleport(gs);
        } else {
            self.countdown_then(gs, attempt, target, do_teleport);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn do_local_teleport(
        &self,
        gs: &mut GameState,
        attempt: Arc<Attempt>,
        target: PlayerId,
        feedback: Recipient,
        server: String,
        world: String,
        loc: Location,
        admin: bool,
    ) {
        if attempt.is_cancelled() || !gs.is_online(target) {
            return;
        }
        self.clear(&attempt);

        let target_name = gs.player(target).map(|p| p.name.clone()).unwrap_or_default();
        let ctx = self.ctx.clone();
        let (cx, cz) = (loc.chunk_x(), loc.chunk_z());
        tokio::spawn(async move {
            let loaded = ctx.game.preload_chunk(loc.world.clone(), cx, cz).await;
            ctx.game.run(move |gs| {
                if !gs.is_online(target) {
                    return;
                }
                let clamped = gs.world(&loc.world).map(|w| w.clamp(loc.clone()));
                let ok = match clamped {
                    Some(l) if loaded => gs.teleport(target, l),
                    _ => false,
                };
                if !ok {
                    gs.notify(feedback, "errors.no-safe-location", &[]);
                    return;
                }

                gs.notify(
                    Recipient::Player(target),
                    "success.teleported",
                    &[("world", world.clone())],
                );
                if admin && feedback != Recipient::Player(target) {
                    gs.notify(
                        feedback,
                        "success.teleported-other",
                        &[
                            ("player", target_name.clone()),
                            ("server", server.clone()),
                            ("world", world.clone()),
                        ],
                    );
                }
            });
        });
    }

    /// Countdown with movement cancel, then run `on_done` on the game
    /// thread. A zero-second countdown runs `on_done` immediately.
    pub(crate) fn countdown_then(
        &self,
        gs: &mut GameState,
        attempt: Arc<Attempt>,
        player: PlayerId,
        on_done: Job,
    ) {
        let secs = self.ctx.cfg.get().rtp.countdown_seconds;
        if secs == 0 {
            on_done(gs);
            return;
        }
        if attempt.is_cancelled() || !gs.is_online(player) {
            return;
        }

        attempt.enable_cancel_on_move();
        countdown_step(gs, self.clone(), attempt, player, secs, on_done);
    }
}

fn countdown_step(
    gs: &mut GameState,
    svc: RtpService,
    attempt: Arc<Attempt>,
    player: PlayerId,
    remaining: u32,
    on_done: Job,
) {
    if attempt.is_cancelled() {
        return;
    }
    if !gs.is_online(player) {
        svc.clear(&attempt);
        return;
    }

    gs.notify(
        Recipient::Player(player),
        "status.teleporting-in",
        &[("seconds", remaining.to_string())],
    );

    if remaining <= 1 {
        gs.schedule_in(COUNTDOWN_PERIOD_TICKS, move |gs| {
            if attempt.is_cancelled() || !gs.is_online(player) {
                return;
            }
            on_done(gs);
        });
    } else {
        gs.schedule_in(COUNTDOWN_PERIOD_TICKS, move |gs| {
            countdown_step(gs, svc, attempt, player, remaining - 1, on_done);
        });
    }
}

fn monitor_step(gs: &mut GameState, svc: RtpService, attempt: Arc<Attempt>) {
    if attempt.is_cancelled() {
        return;
    }
    let Some(p) = gs.player(attempt.player) else {
        attempt.cancel_silently();
        svc.remove_slot(&attempt);
        return;
    };

    let now_key = PosKey::of(&p.pos);
    let now_y = p.pos.y;

    let moved = {
        let mut m = attempt.monitor.lock().unwrap_or_else(|p| p.into_inner());
        if !m.armed {
            // Build a stable baseline first; never cancels.
            if now_key == m.last {
                m.stable_samples += 1;
            } else {
                m.stable_samples = 0;
                m.last = now_key.clone();
            }
            if m.stable_samples >= REQUIRED_STABLE_SAMPLES {
                m.armed = true;
                m.base = now_key;
                m.base_y = now_y;
            }
            false
        } else if attempt.cancel_on_move_enabled() {
            now_key.world != m.base.world
                || now_key.bx != m.base.bx
                || now_key.by != m.base.by
                || now_key.bz != m.base.bz
                || now_y > m.base_y + JUMP_CANCEL_EPSILON
        } else {
            false
        }
    };

    if moved {
        let player = attempt.player;
        attempt.cancel_silently();
        svc.remove_slot(&attempt);
        gs.notify(Recipient::Player(player), "errors.teleport-cancelled-moved", &[]);
        return;
    }

    gs.schedule_in(MONITOR_PERIOD_TICKS, move |gs| {
        monitor_step(gs, svc, attempt);
    });
}

/// Async cooldown check+set. Fails open when the store is unavailable so
/// local RTP keeps working; a rejected check does NOT refresh the cooldown.
async fn check_and_set_cooldown(ctx: &Ctx, player: PlayerId) -> CooldownVerdict {
    let cd = ctx.cfg.get().rtp.cooldown_seconds;
    if cd == 0 || !ctx.store.is_running() {
        return CooldownVerdict::Pass;
    }

    let key = ctx.keys.cooldown(player);
    match ctx.store.get(&key).await {
        Ok(Some(_)) => {
            let remaining = match ctx.store.ttl(&key).await {
                Ok(t) if t >= 0 => t,
                _ => cd as i64,
            };
            CooldownVerdict::Active {
                remaining_secs: remaining,
            }
        }
        Ok(None) => {
            // Best-effort set; a store hiccup here still lets the RTP run.
            let _ = ctx.store.setex(&key, cd, "1").await;
            CooldownVerdict::Pass
        }
        Err(_) => CooldownVerdict::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestBackend;

    #[tokio::test]
    async fn new_attempt_cancels_prior() {
        let tb = TestBackend::lobby().await;
        let player = tb.join_player("Alice", false).await;

        tb.game()
            .query({
                let rtp = tb.rtp.clone();
                move |gs| {
                    rtp.start_rtp(gs, player, Recipient::Player(player), "lobby", "world", false);
                }
            })
            .await;
        let first = tb.rtp.live_attempt(player).expect("first attempt");

        tb.game()
            .query({
                let rtp = tb.rtp.clone();
                move |gs| {
                    rtp.start_rtp(gs, player, Recipient::Player(player), "lobby", "world", false);
                }
            })
            .await;
        let second = tb.rtp.live_attempt(player).expect("second attempt");

        assert!(first.is_cancelled());
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn cooldown_rejects_within_window_and_does_not_refresh() {
        let tb = TestBackend::lobby_with(|cfg| {
            cfg.rtp.cooldown_seconds = 1;
        })
        .await;
        let player = tb.join_player("Bob", false).await;

        let ctx = tb.ctx.clone();
        assert_eq!(check_and_set_cooldown(&ctx, player).await, CooldownVerdict::Pass);
        assert!(matches!(
            check_and_set_cooldown(&ctx, player).await,
            CooldownVerdict::Active { .. }
        ));

        // The rejected check must not have refreshed the key.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(check_and_set_cooldown(&ctx, player).await, CooldownVerdict::Pass);
    }

    #[tokio::test]
    async fn cooldown_fails_open_when_store_is_down() {
        let tb = TestBackend::lobby().await;
        let player = tb.join_player("Eve", false).await;
        tb.ctx.store.stop();
        assert_eq!(
            check_and_set_cooldown(&tb.ctx, player).await,
            CooldownVerdict::Pass
        );
    }
}
