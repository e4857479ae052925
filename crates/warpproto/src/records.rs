use serde::{Deserialize, Serialize};

use crate::player::PlayerId;

/// A point in a named world. `world` is the backend-local world id; the
/// owning record says which backend it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64, yaw: f32, pitch: f32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw,
            pitch,
        }
    }

    pub fn block_x(&self) -> i32 {
        self.x.floor() as i32
    }

    pub fn block_y(&self) -> i32 {
        self.y.floor() as i32
    }

    pub fn block_z(&self) -> i32 {
        self.z.floor() as i32
    }

    pub fn chunk_x(&self) -> i32 {
        self.block_x() >> 4
    }

    pub fn chunk_z(&self) -> i32 {
        self.block_z() >> 4
    }
}

/// Published on the compute channel by an origin backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComputeRequest {
    pub request_id: String,
    pub player: PlayerId,
    pub target_server: String,
    pub world: String,
    pub created_at_ms: u64,
}

/// Written to `resp:<request_id>` by the target backend. Coordinates are
/// meaningful only when `ok` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComputeResponse {
    pub request_id: String,
    pub ok: bool,
    pub server: String,
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
    pub error: Option<String>,
}

impl ComputeResponse {
    pub fn failure(request_id: &str, server: &str, world: &str, error: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            ok: false,
            server: server.to_string(),
            world: world.to_string(),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn success(request_id: &str, server: &str, loc: &Location) -> Self {
        Self {
            request_id: request_id.to_string(),
            ok: true,
            server: server.to_string(),
            world: loc.world.clone(),
            x: loc.x,
            y: loc.y,
            z: loc.z,
            yaw: loc.yaw,
            pitch: loc.pitch,
            error: None,
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.world.clone(), self.x, self.y, self.z, self.yaw, self.pitch)
    }
}

/// Finalize instruction for the destination backend, keyed by player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PendingTeleport {
    pub server: String,
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
    pub at_ms: u64,
    /// Finalize retry counter; the destination bumps this on failure.
    pub attempts: u32,
}

impl PendingTeleport {
    pub fn new(server: &str, loc: &Location, at_ms: u64) -> Self {
        Self {
            server: server.to_string(),
            world: loc.world.clone(),
            x: loc.x,
            y: loc.y,
            z: loc.z,
            yaw: loc.yaw,
            pitch: loc.pitch,
            at_ms,
            attempts: 0,
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.world.clone(), self.x, self.y, self.z, self.yaw, self.pitch)
    }

    pub fn bumped(&self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnKind {
    Bed,
    Anchor,
    /// Records written before the kind field existed, or by hosts that
    /// cannot classify the spawn block.
    #[default]
    Unknown,
}

impl SpawnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpawnKind::Bed => "bed",
            SpawnKind::Anchor => "anchor",
            SpawnKind::Unknown => "unknown",
        }
    }

    /// Tolerant parse: legacy writers used `RESPAWN_ANCHOR`; anything else
    /// unrecognized collapses to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "bed" => SpawnKind::Bed,
            "anchor" | "respawn_anchor" => SpawnKind::Anchor,
            _ => SpawnKind::Unknown,
        }
    }
}

impl Serialize for SpawnKind {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SpawnKind {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        Ok(SpawnKind::parse(&s))
    }
}

/// Cross-backend bed/anchor spawn record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpawnPoint {
    pub kind: SpawnKind,
    pub server: String,
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
    pub at_ms: u64,
}

impl SpawnPoint {
    pub fn new(kind: SpawnKind, server: &str, loc: &Location, at_ms: u64) -> Self {
        Self {
            kind,
            server: server.to_string(),
            world: loc.world.clone(),
            x: loc.x,
            y: loc.y,
            z: loc.z,
            yaw: loc.yaw,
            pitch: loc.pitch,
            at_ms,
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.world.clone(), self.x, self.y, self.z, self.yaw, self.pitch)
    }
}
