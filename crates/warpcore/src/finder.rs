//! Safe-location search scaffolding.
//!
//! [`RingFinder`] does the candidate sampling (ring distributions, pregen
//! preference, chunk-load budget) and delegates the actual "is this spot
//! safe" verdict to a [`SafetyPolicy`]. The shipped [`SurfacePolicy`] stands
//! players on the world surface; real deployments swap in a richer policy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use warpproto::records::Location;

use crate::config::{ConfigHandle, Distribution};
use crate::ctx::SafeFinder;
use crate::game::{Environment, GameHandle, GameState, pack_chunk};

/// Small deterministic xorshift RNG; seedable for tests, entropy-seeded in
/// production.
pub struct Rng64 {
    s: u64,
}

impl Rng64 {
    pub fn from_seed(seed: u64) -> Self {
        // splitmix64 scramble so small seeds don't correlate.
        let mut z = seed.wrapping_add(0x9e3779b97f4a7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        Self { s: (z ^ (z >> 31)).max(1) }
    }

    pub fn from_entropy() -> Self {
        let mut b = [0u8; 8];
        let _ = getrandom::getrandom(&mut b);
        Self::from_seed(u64::from_be_bytes(b))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.s;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.s = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    /// Uniform in `[0, n)`; n must be > 0.
    pub fn next_range(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }

    /// Uniform in `[lo, hi]`.
    pub fn next_i32_inclusive(&mut self, lo: i32, hi: i32) -> i32 {
        let span = (hi as i64 - lo as i64 + 1) as u64;
        lo + self.next_range(span) as i32
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn next_bool(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }

    /// Standard normal via Box-Muller.
    pub fn next_gaussian(&mut self) -> f64 {
        let u1 = self.next_f64().max(f64::MIN_POSITIVE);
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

fn norm_radii(min_r: u32, max_r: u32) -> (i32, i32) {
    let max = max_r as i32;
    (min_r.min(max_r) as i32, max)
}

pub fn rand_in_square_ring(rng: &mut Rng64, min_r: u32, max_r: u32) -> (i32, i32) {
    let (min, max) = norm_radii(min_r, max_r);
    if max == 0 {
        return (0, 0);
    }
    loop {
        let x = rng.next_i32_inclusive(-max, max);
        let z = rng.next_i32_inclusive(-max, max);
        if x.abs() < min && z.abs() < min {
            continue;
        }
        return (x, z);
    }
}

fn rand_outside_min_biased(rng: &mut Rng64, min: i32, max: i32) -> i32 {
    if max == 0 {
        return 0;
    }
    let mut v = rng.next_i32_inclusive(0, max);
    if v < min {
        v = min + rng.next_i32_inclusive(0, (max - min).max(0));
    }
    if rng.next_bool() { v } else { -v }
}

pub fn rand_square_ring_biased_outer(rng: &mut Rng64, min_r: u32, max_r: u32) -> (i32, i32) {
    let (min, max) = norm_radii(min_r, max_r);
    (
        rand_outside_min_biased(rng, min, max),
        rand_outside_min_biased(rng, min, max),
    )
}

pub fn rand_circle_uniform_area(rng: &mut Rng64, min_r: u32, max_r: u32) -> (i32, i32) {
    let (min, max) = norm_radii(min_r, max_r);
    if max == 0 {
        return (0, 0);
    }
    let (min_f, max_f) = (min as f64, max as f64);
    let u = rng.next_f64();
    let r = (u * (max_f * max_f - min_f * min_f) + min_f * min_f).sqrt();
    let theta = rng.next_f64() * std::f64::consts::TAU;
    clamp_to_annulus(
        rng,
        (r * theta.cos()).round() as i32,
        (r * theta.sin()).round() as i32,
        min,
        max,
    )
}

pub fn rand_circle_uniform_radius(rng: &mut Rng64, min_r: u32, max_r: u32) -> (i32, i32) {
    let (min, max) = norm_radii(min_r, max_r);
    if max == 0 {
        return (0, 0);
    }
    let r = min as f64 + rng.next_f64() * (max - min) as f64;
    let theta = rng.next_f64() * std::f64::consts::TAU;
    clamp_to_annulus(
        rng,
        (r * theta.cos()).round() as i32,
        (r * theta.sin()).round() as i32,
        min,
        max,
    )
}

pub fn rand_gaussian_clamped(rng: &mut Rng64, min_r: u32, max_r: u32, sigma_frac: f64) -> (i32, i32) {
    let (min, max) = norm_radii(min_r, max_r);
    if max == 0 {
        return (0, 0);
    }
    let sigma = (sigma_frac * max as f64).max(1.0);
    let (min2, max2) = ((min as i64 * min as i64), (max as i64 * max as i64));

    for _ in 0..32 {
        let x = ((rng.next_gaussian() * sigma).round() as i32).clamp(-max, max);
        let z = ((rng.next_gaussian() * sigma).round() as i32).clamp(-max, max);
        let d2 = x as i64 * x as i64 + z as i64 * z as i64;
        if d2 < min2 || d2 > max2 {
            continue;
        }
        return (x, z);
    }
    rand_circle_uniform_area(rng, min_r, max_r)
}

/// Pull an out-of-annulus point back inside: bounded re-draws first, then a
/// radial scale toward the violated edge.
fn clamp_to_annulus(rng: &mut Rng64, x: i32, z: i32, min: i32, max: i32) -> (i32, i32) {
    let (min2, max2) = ((min as i64 * min as i64), (max as i64 * max as i64));
    let d2 = x as i64 * x as i64 + z as i64 * z as i64;
    if d2 >= min2 && d2 <= max2 {
        return (x, z);
    }

    for _ in 0..32 {
        let rx = rng.next_i32_inclusive(-max, max);
        let rz = rng.next_i32_inclusive(-max, max);
        let rd2 = rx as i64 * rx as i64 + rz as i64 * rz as i64;
        if rd2 >= min2 && rd2 <= max2 {
            return (rx, rz);
        }
    }

    if x == 0 && z == 0 {
        return (min, 0);
    }
    let len = (d2 as f64).sqrt().max(1.0);
    let target = if d2 > max2 { max as f64 } else { min as f64 };
    let scale = target / len;
    (
        (x as f64 * scale).round() as i32,
        (z as f64 * scale).round() as i32,
    )
}

pub fn pick_offset(
    rng: &mut Rng64,
    dist: Distribution,
    min_r: u32,
    max_r: u32,
    sigma: f64,
) -> (i32, i32) {
    match dist {
        Distribution::SquareRingUniform => rand_in_square_ring(rng, min_r, max_r),
        Distribution::SquareRingBiasedOuter => rand_square_ring_biased_outer(rng, min_r, max_r),
        Distribution::CircleRingUniformArea => rand_circle_uniform_area(rng, min_r, max_r),
        Distribution::CircleRingUniformRadius => rand_circle_uniform_radius(rng, min_r, max_r),
        Distribution::GaussianClamped => rand_gaussian_clamped(rng, min_r, max_r, sigma),
    }
}

/// Block/entity safety verdict for one column. Runs on the game thread
/// after the chunk is loaded.
pub trait SafetyPolicy: Send + Sync {
    fn check(&self, gs: &GameState, world: &str, x: f64, z: f64) -> Option<Location>;
}

/// Stands players on the world's surface height, with per-environment
/// vertical caps (nether roof, end void).
pub struct SurfacePolicy;

const NETHER_MAX_Y: i32 = 112;
const NETHER_MIN_Y: i32 = 20;
const END_MIN_Y: i32 = 35;

impl SafetyPolicy for SurfacePolicy {
    fn check(&self, gs: &GameState, world: &str, x: f64, z: f64) -> Option<Location> {
        let w = gs.world(world)?;
        let feet_y = match w.environment {
            Environment::Normal => w.surface_y + 1,
            Environment::Nether => (w.surface_y + 1)
                .clamp(NETHER_MIN_Y.max(w.min_y + 2), NETHER_MAX_Y.min(w.max_y - 2)),
            Environment::End => {
                let y = w.surface_y + 1;
                if y < END_MIN_Y.max(w.min_y + 2) {
                    return None;
                }
                y
            }
        };
        Some(Location::new(world, x, feet_y as f64, z, 0.0, 0.0))
    }
}

enum Candidate {
    NoWorld,
    Outside,
    Chunk { x: f64, z: f64, cx: i32, cz: i32, generated: bool },
}

pub struct RingFinder {
    cfg: ConfigHandle,
    game: GameHandle,
    policy: Arc<dyn SafetyPolicy>,
    rng: Mutex<Rng64>,
}

impl RingFinder {
    pub fn new(cfg: ConfigHandle, game: GameHandle, policy: Arc<dyn SafetyPolicy>) -> Self {
        Self {
            cfg,
            game,
            policy,
            rng: Mutex::new(Rng64::from_entropy()),
        }
    }

    #[cfg(test)]
    pub fn with_seed(cfg: ConfigHandle, game: GameHandle, policy: Arc<dyn SafetyPolicy>, seed: u64) -> Self {
        Self {
            cfg,
            game,
            policy,
            rng: Mutex::new(Rng64::from_seed(seed)),
        }
    }
}

#[async_trait]
impl SafeFinder for RingFinder {
    async fn find_safe(&self, world: &str) -> Option<Location> {
        let cfg = self.cfg.get();
        let server = cfg.server_name.clone();
        let rtp = &cfg.rtp;

        let radius = rtp.radius_for(&server, world);
        let min_radius = rtp.min_radius_for(&server, world);
        let dist = rtp.distribution_for(&server, world);
        let sigma = rtp.gaussian_sigma_for(&server, world);
        let max_tries = rtp.max_tries;
        let pregen_attempts = rtp.pregen_attempts;
        let max_unique = rtp.max_unique_chunks_per_search as usize;

        let mut visited: HashSet<u64> = HashSet::new();

        for attempt in 0..max_tries {
            let ((off_x, off_z), yaw) = {
                let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                (
                    pick_offset(&mut rng, dist, min_radius, radius, sigma),
                    (rng.next_f64() * 360.0 - 180.0) as f32,
                )
            };

            let world_name = world.to_string();
            let cand = self
                .game
                .query(move |gs| match gs.world(&world_name) {
                    None => Candidate::NoWorld,
                    Some(w) => {
                        let x = w.border_center_x + off_x as f64 + 0.5;
                        let z = w.border_center_z + off_z as f64 + 0.5;
                        if !w.in_border(x, z) {
                            return Candidate::Outside;
                        }
                        let cx = (x.floor() as i32) >> 4;
                        let cz = (z.floor() as i32) >> 4;
                        Candidate::Chunk {
                            x,
                            z,
                            cx,
                            cz,
                            generated: w.is_chunk_generated(cx, cz),
                        }
                    }
                })
                .await?;

            let (x, z, cx, cz, generated) = match cand {
                Candidate::NoWorld => return None,
                Candidate::Outside => continue,
                Candidate::Chunk { x, z, cx, cz, generated } => (x, z, cx, cz, generated),
            };

            // Pregen-only phase: early attempts refuse to trigger generation.
            if attempt < pregen_attempts && !generated {
                continue;
            }

            let key = pack_chunk(cx, cz);
            if visited.contains(&key) {
                continue;
            }
            // Hard cap on distinct chunk loads this search may trigger.
            if visited.len() >= max_unique {
                return None;
            }
            visited.insert(key);

            if !self.game.preload_chunk(world.to_string(), cx, cz).await {
                continue;
            }

            let policy = self.policy.clone();
            let world_name = world.to_string();
            let found = self
                .game
                .query(move |gs| policy.check(gs, &world_name, x, z))
                .await?;

            if let Some(mut loc) = found {
                loc.yaw = yaw;
                return Some(loc);
            }
        }

        None
    }
}
