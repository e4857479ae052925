//! Backend<->gateway protocol.
//!
//! The proxy gateway owns the player connections; a backend speaks this
//! protocol to receive joins, inputs, movement and death/respawn events, and
//! to push messages, teleports and server switches back out.
//!
//! Payload layout: 1 type byte, 16-byte player id (u128 big-endian), then a
//! type-specific body. Locations are encoded as
//! `world_len:u8, world, x:f64, y:f64, z:f64, yaw:f32, pitch:f32`
//! (all big-endian).

use bytes::Bytes;

use crate::ProtoError;
use crate::player::PlayerId;
use crate::records::Location;

pub const REQ_ATTACH: u8 = 0x01;
pub const REQ_DETACH: u8 = 0x02;
pub const REQ_INPUT: u8 = 0x03;
pub const REQ_MOVE: u8 = 0x04;
pub const REQ_DIED: u8 = 0x05;
pub const REQ_RESPAWN: u8 = 0x06;
pub const REQ_SPAWNSET: u8 = 0x07;
pub const REQ_SPAWNCLEAR: u8 = 0x08;

pub const RESP_MSG: u8 = 0x81;
pub const RESP_TELEPORT: u8 = 0x82;
pub const RESP_SWITCH: u8 = 0x83;
pub const RESP_RESPAWN_AT: u8 = 0x84;
pub const RESP_ERR: u8 = 0x85;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayReq {
    /// Player landed on this backend.
    ///
    /// Body:
    /// - flags: 1 byte (bit0: admin)
    /// - location (spawn position the proxy placed them at)
    /// - name: remaining bytes (utf-8)
    Attach {
        player: PlayerId,
        admin: bool,
        pos: Location,
        name: String,
    },
    Detach {
        player: PlayerId,
    },
    Input {
        player: PlayerId,
        line: Bytes,
    },
    Move {
        player: PlayerId,
        pos: Location,
    },
    Died {
        player: PlayerId,
    },
    Respawn {
        player: PlayerId,
    },
    /// Player gained a spawn point (bed entered / anchor charged).
    SpawnSet {
        player: PlayerId,
        loc: Location,
    },
    /// The spawn block at `loc` is gone (broken, or anchor discharged).
    SpawnClear {
        player: PlayerId,
        loc: Location,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResp {
    /// Keyed message; `params` is a JSON object the gateway formats.
    Msg {
        player: PlayerId,
        key: String,
        params: String,
    },
    Teleport {
        player: PlayerId,
        loc: Location,
    },
    /// Ask the proxy to move the player to another backend.
    Switch {
        player: PlayerId,
        server: String,
    },
    /// Where the player respawns after a `Respawn` request.
    RespawnAt {
        player: PlayerId,
        loc: Location,
    },
    Err {
        player: PlayerId,
        msg: String,
    },
}

fn need(p: &Bytes, n: usize) -> Result<(), ProtoError> {
    if p.len() < n {
        return Err(ProtoError::TooShort {
            need: n,
            got: p.len(),
        });
    }
    Ok(())
}

fn read_player(p: &Bytes) -> PlayerId {
    let mut id = [0u8; 16];
    id.copy_from_slice(&p[1..1 + 16]);
    PlayerId::from_be_bytes(id)
}

fn read_loc(p: &Bytes, mut i: usize) -> Result<(Location, usize), ProtoError> {
    need(p, i + 1)?;
    let wlen = p[i] as usize;
    i += 1;
    need(p, i + wlen + 24 + 8)?;
    let world = std::str::from_utf8(&p[i..i + wlen])
        .map_err(|_| ProtoError::Malformed("world is not utf-8"))?
        .to_string();
    i += wlen;

    let mut f8 = [0u8; 8];
    let mut f4 = [0u8; 4];

    f8.copy_from_slice(&p[i..i + 8]);
    let x = f64::from_be_bytes(f8);
    i += 8;
    f8.copy_from_slice(&p[i..i + 8]);
    let y = f64::from_be_bytes(f8);
    i += 8;
    f8.copy_from_slice(&p[i..i + 8]);
    let z = f64::from_be_bytes(f8);
    i += 8;
    f4.copy_from_slice(&p[i..i + 4]);
    let yaw = f32::from_be_bytes(f4);
    i += 4;
    f4.copy_from_slice(&p[i..i + 4]);
    let pitch = f32::from_be_bytes(f4);
    i += 4;

    Ok((Location::new(world, x, y, z, yaw, pitch), i))
}

fn write_loc(out: &mut Vec<u8>, loc: &Location) {
    let wb = loc.world.as_bytes();
    let wlen = wb.len().min(u8::MAX as usize);
    out.push(wlen as u8);
    out.extend_from_slice(&wb[..wlen]);
    out.extend_from_slice(&loc.x.to_be_bytes());
    out.extend_from_slice(&loc.y.to_be_bytes());
    out.extend_from_slice(&loc.z.to_be_bytes());
    out.extend_from_slice(&loc.yaw.to_be_bytes());
    out.extend_from_slice(&loc.pitch.to_be_bytes());
}

fn header(t: u8, player: PlayerId) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + PlayerId::LEN + 32);
    out.push(t);
    out.extend_from_slice(&player.to_be_bytes());
    out
}

pub fn parse_req(p: Bytes) -> Result<GatewayReq, ProtoError> {
    need(&p, 1 + PlayerId::LEN)?;
    let t = p[0];
    let player = read_player(&p);
    let body_at = 1 + PlayerId::LEN;

    match t {
        REQ_ATTACH => {
            need(&p, body_at + 1)?;
            let flags = p[body_at];
            let admin = (flags & 0x01) != 0;
            let (pos, i) = read_loc(&p, body_at + 1)?;
            let name = std::str::from_utf8(&p[i..])
                .map_err(|_| ProtoError::Malformed("name is not utf-8"))?
                .trim()
                .to_string();
            Ok(GatewayReq::Attach {
                player,
                admin,
                pos,
                name,
            })
        }
        REQ_DETACH => Ok(GatewayReq::Detach { player }),
        REQ_INPUT => Ok(GatewayReq::Input {
            player,
            line: p.slice(body_at..),
        }),
        REQ_MOVE => {
            let (pos, _) = read_loc(&p, body_at)?;
            Ok(GatewayReq::Move { player, pos })
        }
        REQ_DIED => Ok(GatewayReq::Died { player }),
        REQ_RESPAWN => Ok(GatewayReq::Respawn { player }),
        REQ_SPAWNSET => {
            let (loc, _) = read_loc(&p, body_at)?;
            Ok(GatewayReq::SpawnSet { player, loc })
        }
        REQ_SPAWNCLEAR => {
            let (loc, _) = read_loc(&p, body_at)?;
            Ok(GatewayReq::SpawnClear { player, loc })
        }
        _ => Err(ProtoError::UnknownType(t)),
    }
}

pub fn encode_req(req: &GatewayReq) -> Vec<u8> {
    match req {
        GatewayReq::Attach {
            player,
            admin,
            pos,
            name,
        } => {
            let mut out = header(REQ_ATTACH, *player);
            out.push(if *admin { 0x01 } else { 0x00 });
            write_loc(&mut out, pos);
            out.extend_from_slice(name.as_bytes());
            out
        }
        GatewayReq::Detach { player } => header(REQ_DETACH, *player),
        GatewayReq::Input { player, line } => {
            let mut out = header(REQ_INPUT, *player);
            out.extend_from_slice(line);
            out
        }
        GatewayReq::Move { player, pos } => {
            let mut out = header(REQ_MOVE, *player);
            write_loc(&mut out, pos);
            out
        }
        GatewayReq::Died { player } => header(REQ_DIED, *player),
        GatewayReq::Respawn { player } => header(REQ_RESPAWN, *player),
        GatewayReq::SpawnSet { player, loc } => {
            let mut out = header(REQ_SPAWNSET, *player);
            write_loc(&mut out, loc);
            out
        }
        GatewayReq::SpawnClear { player, loc } => {
            let mut out = header(REQ_SPAWNCLEAR, *player);
            write_loc(&mut out, loc);
            out
        }
    }
}

pub fn parse_resp(p: Bytes) -> Result<GatewayResp, ProtoError> {
    need(&p, 1 + PlayerId::LEN)?;
    let t = p[0];
    let player = read_player(&p);
    let body_at = 1 + PlayerId::LEN;

    match t {
        RESP_MSG => {
            need(&p, body_at + 1)?;
            let klen = p[body_at] as usize;
            let i = body_at + 1;
            need(&p, i + klen)?;
            let key = std::str::from_utf8(&p[i..i + klen])
                .map_err(|_| ProtoError::Malformed("key is not utf-8"))?
                .to_string();
            let params = String::from_utf8_lossy(&p[i + klen..]).to_string();
            Ok(GatewayResp::Msg {
                player,
                key,
                params,
            })
        }
        RESP_TELEPORT => {
            let (loc, _) = read_loc(&p, body_at)?;
            Ok(GatewayResp::Teleport { player, loc })
        }
        RESP_SWITCH => {
            let server = std::str::from_utf8(&p[body_at..])
                .map_err(|_| ProtoError::Malformed("server is not utf-8"))?
                .to_string();
            Ok(GatewayResp::Switch { player, server })
        }
        RESP_RESPAWN_AT => {
            let (loc, _) = read_loc(&p, body_at)?;
            Ok(GatewayResp::RespawnAt { player, loc })
        }
        RESP_ERR => Ok(GatewayResp::Err {
            player,
            msg: String::from_utf8_lossy(&p[body_at..]).to_string(),
        }),
        _ => Err(ProtoError::UnknownType(t)),
    }
}

pub fn encode_resp(resp: &GatewayResp) -> Vec<u8> {
    match resp {
        GatewayResp::Msg {
            player,
            key,
            params,
        } => {
            let mut out = header(RESP_MSG, *player);
            let kb = key.as_bytes();
            let klen = kb.len().min(u8::MAX as usize);
            out.push(klen as u8);
            out.extend_from_slice(&kb[..klen]);
            out.extend_from_slice(params.as_bytes());
            out
        }
        GatewayResp::Teleport { player, loc } => {
            let mut out = header(RESP_TELEPORT, *player);
            write_loc(&mut out, loc);
            out
        }
        GatewayResp::Switch { player, server } => {
            let mut out = header(RESP_SWITCH, *player);
            out.extend_from_slice(server.as_bytes());
            out
        }
        GatewayResp::RespawnAt { player, loc } => {
            let mut out = header(RESP_RESPAWN_AT, *player);
            write_loc(&mut out, loc);
            out
        }
        GatewayResp::Err { player, msg } => {
            let mut out = header(RESP_ERR, *player);
            out.extend_from_slice(msg.as_bytes());
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Location {
        Location::new("world_nether", 100.5, 72.0, -300.5, 90.0, -15.0)
    }

    #[test]
    fn req_round_trips() {
        let reqs = vec![
            GatewayReq::Attach {
                player: PlayerId(9),
                admin: true,
                pos: loc(),
                name: "Alice".to_string(),
            },
            GatewayReq::Detach { player: PlayerId(9) },
            GatewayReq::Input {
                player: PlayerId(9),
                line: Bytes::from_static(b"rtp smp"),
            },
            GatewayReq::Move {
                player: PlayerId(9),
                pos: loc(),
            },
            GatewayReq::Died { player: PlayerId(9) },
            GatewayReq::Respawn { player: PlayerId(9) },
            GatewayReq::SpawnSet {
                player: PlayerId(9),
                loc: loc(),
            },
            GatewayReq::SpawnClear {
                player: PlayerId(9),
                loc: loc(),
            },
        ];
        for req in reqs {
            let bytes = Bytes::from(encode_req(&req));
            assert_eq!(parse_req(bytes).unwrap(), req);
        }
    }

    #[test]
    fn resp_round_trips() {
        let resps = vec![
            GatewayResp::Msg {
                player: PlayerId(1),
                key: "success.teleported".to_string(),
                params: r#"{"world":"world"}"#.to_string(),
            },
            GatewayResp::Teleport {
                player: PlayerId(1),
                loc: loc(),
            },
            GatewayResp::Switch {
                player: PlayerId(1),
                server: "smp".to_string(),
            },
            GatewayResp::RespawnAt {
                player: PlayerId(1),
                loc: loc(),
            },
            GatewayResp::Err {
                player: PlayerId(1),
                msg: "bad frame".to_string(),
            },
        ];
        for resp in resps {
            let bytes = Bytes::from(encode_resp(&resp));
            assert_eq!(parse_resp(bytes).unwrap(), resp);
        }
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(matches!(
            parse_req(Bytes::from_static(&[REQ_ATTACH, 0, 0])),
            Err(ProtoError::TooShort { .. })
        ));
        let mut truncated = encode_req(&GatewayReq::Move {
            player: PlayerId(1),
            pos: loc(),
        });
        truncated.truncate(truncated.len() - 3);
        assert!(matches!(
            parse_req(Bytes::from(truncated)),
            Err(ProtoError::TooShort { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut p = vec![0x7f];
        p.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            parse_req(Bytes::from(p)),
            Err(ProtoError::UnknownType(0x7f))
        ));
    }
}
