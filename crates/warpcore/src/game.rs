//! Single-threaded game scheduler.
//!
//! One task owns the [`GameState`]; everything that touches players or
//! worlds runs as a job on that task. Workers (store I/O, pollers) hop back
//! with [`GameHandle::run`], or park a job on the tick heap with
//! [`GameHandle::run_later`]. The heap is ordered by `(due_tick, seq)` so
//! same-tick jobs run in schedule order.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use warpproto::PlayerId;
use warpproto::gateway::GatewayResp;
use warpproto::records::{Location, SpawnKind};

pub type Job = Box<dyn FnOnce(&mut GameState) + Send + 'static>;

enum GameMsg {
    Run(Job),
    RunLater { delay_ticks: u64, job: Job },
}

#[derive(Clone)]
pub struct GameHandle {
    tx: mpsc::UnboundedSender<GameMsg>,
    tick_ms: u64,
}

impl GameHandle {
    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    pub fn ticks(&self, n: u64) -> Duration {
        Duration::from_millis(n.saturating_mul(self.tick_ms))
    }

    /// Run a job on the game thread as soon as possible. Returns false when
    /// the game loop is gone.
    pub fn run(&self, job: impl FnOnce(&mut GameState) + Send + 'static) -> bool {
        self.tx.send(GameMsg::Run(Box::new(job))).is_ok()
    }

    pub fn run_later(&self, delay_ticks: u64, job: impl FnOnce(&mut GameState) + Send + 'static) -> bool {
        self.tx
            .send(GameMsg::RunLater {
                delay_ticks,
                job: Box::new(job),
            })
            .is_ok()
    }

    /// Run a closure on the game thread and await its result. `None` when
    /// the loop is gone.
    pub async fn query<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut GameState) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.run(move |gs| {
            let _ = tx.send(f(gs));
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Async chunk preload: resolves once the chunk is loaded (or false when
    /// the world does not exist).
    pub async fn preload_chunk(&self, world: String, cx: i32, cz: i32) -> bool {
        self.query(move |gs| gs.load_chunk(&world, cx, cz))
            .await
            .unwrap_or(false)
    }
}

struct ScheduledJob {
    due_tick: u64,
    seq: u64,
    job: Job,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.due_tick == other.due_tick && self.seq == other.seq
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due_tick
            .cmp(&other.due_tick)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Normal,
    Nether,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnBlock {
    Bed,
    Anchor { charges: u8 },
}

pub fn pack_chunk(cx: i32, cz: i32) -> u64 {
    ((cx as u64) << 32) ^ (cz as u32 as u64)
}

#[derive(Debug, Clone)]
pub struct WorldState {
    pub name: String,
    pub environment: Environment,
    pub min_y: i32,
    pub max_y: i32,
    /// Flat surface height used by the default safety policy.
    pub surface_y: i32,
    pub border_center_x: f64,
    pub border_center_z: f64,
    /// Half the side length of the (square) world border.
    pub border_radius: f64,
    pub spawn: Location,
    /// When false, only chunks in `pregen_chunks` count as generated.
    pub pregen_all: bool,
    pub pregen_chunks: HashSet<u64>,
    pub loaded_chunks: HashSet<u64>,
    pub spawn_blocks: HashMap<(i32, i32, i32), SpawnBlock>,
}

impl WorldState {
    pub fn new(name: &str, environment: Environment) -> Self {
        let (min_y, max_y, surface_y) = match environment {
            Environment::Normal => (-64, 320, 64),
            Environment::Nether => (0, 256, 32),
            Environment::End => (0, 256, 48),
        };
        Self {
            name: name.to_string(),
            environment,
            min_y,
            max_y,
            surface_y,
            border_center_x: 0.0,
            border_center_z: 0.0,
            border_radius: 30_000_000.0,
            spawn: Location::new(name, 0.5, (surface_y + 1) as f64, 0.5, 0.0, 0.0),
            pregen_all: true,
            pregen_chunks: HashSet::new(),
            loaded_chunks: HashSet::new(),
            spawn_blocks: HashMap::new(),
        }
    }

    pub fn in_border(&self, x: f64, z: f64) -> bool {
        (x - self.border_center_x).abs() <= self.border_radius
            && (z - self.border_center_z).abs() <= self.border_radius
    }

    pub fn is_chunk_generated(&self, cx: i32, cz: i32) -> bool {
        self.pregen_all || self.pregen_chunks.contains(&pack_chunk(cx, cz))
    }

    /// Clamp a location into this world: y to `[min+1, max-2]`, pitch to
    /// `[-90, 90]`.
    pub fn clamp(&self, mut loc: Location) -> Location {
        let min_y = (self.min_y + 1) as f64;
        let max_y = (self.max_y - 2) as f64;
        loc.y = loc.y.clamp(min_y, max_y);
        loc.pitch = loc.pitch.clamp(-90.0, 90.0);
        loc.world = self.name.clone();
        loc
    }
}

pub const DEFAULT_WALK_SPEED: f32 = 0.2;
pub const DEFAULT_FLY_SPEED: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    /// Stands in for the host permission surface: admin players may use the
    /// admin command form and reload.
    pub admin: bool,
    pub pos: Location,
    pub dead: bool,
    pub respawn_location: Option<Location>,
    pub walk_speed: f32,
    pub fly_speed: f32,
    pub flying: bool,
    pub allow_flight: bool,
    pub invulnerable: bool,
    pub blindness_until_tick: u64,
    pub invisibility_until_tick: u64,
}

impl Player {
    pub fn new(id: PlayerId, name: &str, admin: bool, pos: Location) -> Self {
        Self {
            id,
            name: name.to_string(),
            admin,
            pos,
            dead: false,
            respawn_location: None,
            walk_speed: DEFAULT_WALK_SPEED,
            fly_speed: DEFAULT_FLY_SPEED,
            flying: false,
            allow_flight: false,
            invulnerable: false,
            blindness_until_tick: 0,
            invisibility_until_tick: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Player(PlayerId),
    Console,
}

pub struct GameState {
    pub server_name: String,
    pub now_tick: u64,
    pub players: HashMap<PlayerId, Player>,
    pub worlds: HashMap<String, WorldState>,
    out: Option<mpsc::UnboundedSender<GatewayResp>>,
    events: BinaryHeap<Reverse<ScheduledJob>>,
    event_seq: u64,
}

impl GameState {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            now_tick: 0,
            players: HashMap::new(),
            worlds: HashMap::new(),
            out: None,
            events: BinaryHeap::new(),
            event_seq: 1,
        }
    }

    /// Attach the gateway output channel (replacing any prior one).
    pub fn set_output(&mut self, tx: mpsc::UnboundedSender<GatewayResp>) {
        self.out = Some(tx);
    }

    pub fn clear_output(&mut self) {
        self.out = None;
    }

    pub fn send(&mut self, resp: GatewayResp) {
        if let Some(tx) = self.out.take() {
            if tx.send(resp).is_ok() {
                self.out = Some(tx);
            }
        }
    }

    pub fn schedule_in(&mut self, delay_ticks: u64, job: impl FnOnce(&mut GameState) + Send + 'static) {
        let seq = self.event_seq;
        self.event_seq += 1;
        self.events.push(Reverse(ScheduledJob {
            due_tick: self.now_tick.saturating_add(delay_ticks),
            seq,
            job: Box::new(job),
        }));
    }

    fn run_due(&mut self) {
        loop {
            match self.events.peek() {
                Some(Reverse(ev)) if ev.due_tick <= self.now_tick => {}
                _ => break,
            }
            let Some(Reverse(ev)) = self.events.pop() else {
                break;
            };
            (ev.job)(self);
        }
    }

    fn next_due_tick(&self) -> Option<u64> {
        self.events.peek().map(|Reverse(ev)| ev.due_tick)
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn is_online(&self, id: PlayerId) -> bool {
        self.players.contains_key(&id)
    }

    pub fn find_player_by_name(&self, name: &str) -> Option<&Player> {
        self.players
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn world(&self, name: &str) -> Option<&WorldState> {
        self.worlds.get(name)
    }

    pub fn world_mut(&mut self, name: &str) -> Option<&mut WorldState> {
        self.worlds.get_mut(name)
    }

    pub fn load_chunk(&mut self, world: &str, cx: i32, cz: i32) -> bool {
        match self.worlds.get_mut(world) {
            Some(w) => {
                w.loaded_chunks.insert(pack_chunk(cx, cz));
                true
            }
            None => false,
        }
    }

    /// Move a player; false when the player is offline or the world is
    /// unknown. Emits the teleport to the gateway.
    pub fn teleport(&mut self, id: PlayerId, loc: Location) -> bool {
        if !self.worlds.contains_key(&loc.world) {
            return false;
        }
        let Some(p) = self.players.get_mut(&id) else {
            return false;
        };
        p.pos = loc.clone();
        self.send(GatewayResp::Teleport { player: id, loc });
        true
    }

    /// Respawn a dead player at `loc` and tell the gateway where.
    pub fn respawn_at(&mut self, id: PlayerId, loc: Location) -> bool {
        let Some(p) = self.players.get_mut(&id) else {
            return false;
        };
        p.dead = false;
        p.pos = loc.clone();
        self.send(GatewayResp::RespawnAt { player: id, loc });
        true
    }

    pub fn notify(&mut self, to: Recipient, key: &str, params: &[(&str, String)]) {
        let mut map = serde_json::Map::new();
        for (k, v) in params {
            map.insert(k.to_string(), serde_json::Value::String(v.clone()));
        }
        let params_json = serde_json::Value::Object(map).to_string();

        match to {
            Recipient::Player(id) => {
                if self.is_online(id) {
                    self.send(GatewayResp::Msg {
                        player: id,
                        key: key.to_string(),
                        params: params_json,
                    });
                }
            }
            Recipient::Console => {
                info!(key = key, params = %params_json, "console message");
            }
        }
    }

    /// Find a bed or charged anchor within one block vertically of the given
    /// coordinates. A discharged anchor does not count.
    pub fn classify_spawn_block_near(
        &self,
        world: &str,
        x: f64,
        y: f64,
        z: f64,
    ) -> Option<(SpawnKind, (i32, i32, i32))> {
        let w = self.worlds.get(world)?;
        let bx = x.floor() as i32;
        let bz = z.floor() as i32;
        let by = (y.floor() as i32).clamp(w.min_y, w.max_y - 1);

        for dy in -1..=1 {
            let yy = by + dy;
            if yy < w.min_y || yy > w.max_y - 1 {
                continue;
            }
            match w.spawn_blocks.get(&(bx, yy, bz)) {
                Some(SpawnBlock::Bed) => return Some((SpawnKind::Bed, (bx, yy, bz))),
                Some(SpawnBlock::Anchor { charges }) if *charges > 0 => {
                    return Some((SpawnKind::Anchor, (bx, yy, bz)));
                }
                _ => {}
            }
        }
        None
    }

    /// Decrement an anchor's charge; returns the remaining charges, or None
    /// when there is no charged anchor at `pos`.
    pub fn consume_anchor_charge(&mut self, world: &str, pos: (i32, i32, i32)) -> Option<u8> {
        let w = self.worlds.get_mut(world)?;
        match w.spawn_blocks.get_mut(&pos) {
            Some(SpawnBlock::Anchor { charges }) if *charges > 0 => {
                *charges -= 1;
                Some(*charges)
            }
            _ => None,
        }
    }
}

/// Spawn the game loop. Jobs sent through the returned handle run on the
/// loop task; the loop wakes for the earliest scheduled tick job.
pub fn spawn_game_loop(gs: GameState, tick_ms: u64) -> (GameHandle, tokio::task::JoinHandle<()>) {
    let tick_ms = tick_ms.max(1);
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = GameHandle { tx, tick_ms };
    let task = tokio::spawn(game_loop(gs, rx, tick_ms));
    (handle, task)
}

async fn game_loop(mut gs: GameState, mut rx: mpsc::UnboundedReceiver<GameMsg>, tick_ms: u64) {
    let start = tokio::time::Instant::now();

    loop {
        gs.now_tick = start.elapsed().as_millis() as u64 / tick_ms;
        gs.run_due();

        let sleep_ms = match gs.next_due_tick() {
            Some(due) => due.saturating_sub(gs.now_tick).max(1) * tick_ms,
            None => 86_400_000,
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                // Wake up to process due jobs.
            }
            msg = rx.recv() => {
                match msg {
                    None => break,
                    Some(GameMsg::Run(job)) => {
                        gs.now_tick = start.elapsed().as_millis() as u64 / tick_ms;
                        job(&mut gs);
                    }
                    Some(GameMsg::RunLater { delay_ticks, job }) => {
                        gs.now_tick = start.elapsed().as_millis() as u64 / tick_ms;
                        gs.schedule_in(delay_ticks, job);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_world() -> GameState {
        let mut gs = GameState::new("smp");
        gs.worlds
            .insert("world".to_string(), WorldState::new("world", Environment::Normal));
        gs
    }

    #[tokio::test]
    async fn query_round_trips() {
        let (game, task) = spawn_game_loop(state_with_world(), 5);
        let name = game.query(|gs| gs.server_name.clone()).await;
        assert_eq!(name.as_deref(), Some("smp"));
        drop(game);
        let _ = task.await;
    }

    #[tokio::test]
    async fn scheduled_jobs_run_in_order() {
        let (game, _task) = spawn_game_loop(state_with_world(), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for (delay, tag) in [(4u64, "late"), (1, "early"), (4, "late2")] {
            let tx = tx.clone();
            game.run_later(delay, move |_| {
                let _ = tx.send(tag);
            });
        }

        assert_eq!(rx.recv().await, Some("early"));
        assert_eq!(rx.recv().await, Some("late"));
        assert_eq!(rx.recv().await, Some("late2"));
    }

    #[tokio::test]
    async fn preload_marks_chunk_loaded() {
        let (game, _task) = spawn_game_loop(state_with_world(), 2);
        assert!(game.preload_chunk("world".to_string(), 3, -2).await);
        assert!(!game.preload_chunk("missing".to_string(), 0, 0).await);
        let loaded = game
            .query(|gs| gs.world("world").unwrap().loaded_chunks.contains(&pack_chunk(3, -2)))
            .await;
        assert_eq!(loaded, Some(true));
    }

    #[test]
    fn clamp_bounds_y_and_pitch() {
        let w = WorldState::new("world", Environment::Normal);
        let clamped = w.clamp(Location::new("world", 0.0, -500.0, 0.0, 0.0, -120.0));
        assert_eq!(clamped.y, (w.min_y + 1) as f64);
        assert_eq!(clamped.pitch, -90.0);
        let clamped = w.clamp(Location::new("world", 0.0, 9000.0, 0.0, 0.0, 120.0));
        assert_eq!(clamped.y, (w.max_y - 2) as f64);
        assert_eq!(clamped.pitch, 90.0);
    }

    #[test]
    fn classifies_spawn_blocks_with_vertical_slack() {
        let mut gs = state_with_world();
        let w = gs.world_mut("world").unwrap();
        w.spawn_blocks.insert((10, 64, 10), SpawnBlock::Bed);
        w.spawn_blocks.insert((20, 64, 20), SpawnBlock::Anchor { charges: 0 });
        w.spawn_blocks.insert((30, 64, 30), SpawnBlock::Anchor { charges: 2 });

        assert_eq!(
            gs.classify_spawn_block_near("world", 10.5, 65.0, 10.5),
            Some((SpawnKind::Bed, (10, 64, 10)))
        );
        // Discharged anchors do not count.
        assert_eq!(gs.classify_spawn_block_near("world", 20.5, 64.0, 20.5), None);
        assert_eq!(
            gs.classify_spawn_block_near("world", 30.5, 65.0, 30.5),
            Some((SpawnKind::Anchor, (30, 64, 30)))
        );

        assert_eq!(gs.consume_anchor_charge("world", (30, 64, 30)), Some(1));
        assert_eq!(gs.consume_anchor_charge("world", (30, 64, 30)), Some(0));
        assert_eq!(gs.consume_anchor_charge("world", (30, 64, 30)), None);
    }
}
