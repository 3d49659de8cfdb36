use glam::Vec3;

use super::delta::{read_delta_cmd, write_delta_cmd, SoundBits, UserCmd};
use super::msg::MessageBuffer;
use super::NetError;

pub const PROTOCOL_VERSION: u32 = 13;

/// Largest datagram either side will frame or accept.
pub const MAX_MSG_SIZE: usize = 1400;

/// Frames of state history kept on both sides for delta encoding.
pub const UPDATE_BACKUP: usize = 128;
pub const UPDATE_MASK: usize = UPDATE_BACKUP - 1;

/// Cap on changed-entity records in a single frame message.
pub const MAX_PACKET_ENTITIES: usize = 64;

pub const MAX_ENTITIES: usize = 1024;
pub const MAX_CONFIG_STRINGS: usize = 512;

/// Per-client bandwidth throttle, in bytes per second.
pub const CLIENT_RATE_MIN: u32 = 8192;
pub const CLIENT_RATE_MAX: u32 = 32768;
pub const CLIENT_RATE: u32 = 16384;

pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// User commands carried per move message, newest last.
pub const MOVE_CMDS: usize = 3;

/// Unreliable payloads at least this large are worth compressing.
pub const COMPRESS_THRESHOLD: usize = 600;

const COMPRESS_LEVEL: i32 = 1;

/// Server-to-client opcodes. Value 0 is reserved invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOp {
    Nop = 1,
    MuzzleFlash = 2,
    TempEntity = 3,
    Layout = 4,
    Disconnect = 5,
    Reconnect = 6,
    Sound = 7,
    Print = 8,
    StuffText = 9,
    ServerData = 10,
    ConfigString = 11,
    SpawnBaseline = 12,
    CenterPrint = 13,
    Download = 14,
    Frame = 15,
    Compressed = 16,
}

impl TryFrom<u8> for ServerOp {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ServerOp::Nop,
            2 => ServerOp::MuzzleFlash,
            3 => ServerOp::TempEntity,
            4 => ServerOp::Layout,
            5 => ServerOp::Disconnect,
            6 => ServerOp::Reconnect,
            7 => ServerOp::Sound,
            8 => ServerOp::Print,
            9 => ServerOp::StuffText,
            10 => ServerOp::ServerData,
            11 => ServerOp::ConfigString,
            12 => ServerOp::SpawnBaseline,
            13 => ServerOp::CenterPrint,
            14 => ServerOp::Download,
            15 => ServerOp::Frame,
            16 => ServerOp::Compressed,
            other => return Err(NetError::UnknownOpcode(other)),
        })
    }
}

/// Client-to-server opcodes. Value 0 is reserved invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOp {
    Nop = 1,
    Move = 2,
    UserInfo = 3,
    StringCmd = 4,
}

impl TryFrom<u8> for ClientOp {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ClientOp::Nop,
            2 => ClientOp::Move,
            3 => ClientOp::UserInfo,
            4 => ClientOp::StringCmd,
            other => return Err(NetError::UnknownOpcode(other)),
        })
    }
}

pub mod print_level {
    pub const LOW: u8 = 0;
    pub const MEDIUM: u8 = 1;
    pub const HIGH: u8 = 2;
    pub const CHAT: u8 = 3;
}

pub mod muzzle {
    pub const BLASTER: u8 = 0;
    pub const SHOTGUN: u8 = 1;
    pub const SUPER_SHOTGUN: u8 = 2;
    pub const MACHINEGUN: u8 = 3;
    pub const ROCKET_LAUNCHER: u8 = 4;
    pub const GRENADE_LAUNCHER: u8 = 5;
    pub const HYPERBLASTER: u8 = 6;
    pub const LIGHTNING: u8 = 7;
    pub const RAILGUN: u8 = 8;
    pub const BFG: u8 = 9;
    pub const LOGOUT: u8 = 10;
}

/// Handshake payload sent once the reliable stream opens.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerData {
    pub protocol: u32,
    pub spawn_count: u32,
    pub tick_rate: u8,
    pub gamedir: String,
    pub client_entity: u16,
    pub level_name: String,
}

impl ServerData {
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        msg.write_u32(self.protocol)?;
        msg.write_u32(self.spawn_count)?;
        msg.write_u8(self.tick_rate)?;
        msg.write_string(&self.gamedir)?;
        msg.write_u16(self.client_entity)?;
        msg.write_string(&self.level_name)
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, NetError> {
        Ok(Self {
            protocol: msg.read_u32()?,
            spawn_count: msg.read_u32()?,
            tick_rate: msg.read_u8()?,
            gamedir: msg.read_string()?,
            client_entity: msg.read_u16()?,
            level_name: msg.read_string()?,
        })
    }
}

/// Positioned or entity-relative sound start. Optional pieces ride behind
/// a flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SoundStart {
    pub index: u8,
    pub attenuation: Option<u8>,
    pub origin: Option<Vec3>,
    pub entity: Option<u16>,
}

impl SoundStart {
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        let mut bits = SoundBits::empty();
        if self.attenuation.is_some() {
            bits |= SoundBits::ATTEN;
        }
        if self.origin.is_some() {
            bits |= SoundBits::ORIGIN;
        }
        if self.entity.is_some() {
            bits |= SoundBits::ENTNUM;
        }

        msg.write_u8(bits.bits())?;
        msg.write_u8(self.index)?;
        if let Some(atten) = self.attenuation {
            msg.write_u8(atten)?;
        }
        if let Some(origin) = self.origin {
            msg.write_pos(origin)?;
        }
        if let Some(entity) = self.entity {
            msg.write_u16(entity)?;
        }
        Ok(())
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, NetError> {
        let bits = SoundBits::from_bits_retain(msg.read_u8()?);
        let index = msg.read_u8()?;

        let attenuation = if bits.contains(SoundBits::ATTEN) {
            Some(msg.read_u8()?)
        } else {
            None
        };
        let origin = if bits.contains(SoundBits::ORIGIN) {
            Some(msg.read_pos()?)
        } else {
            None
        };
        let entity = if bits.contains(SoundBits::ENTNUM) {
            Some(msg.read_u16()?)
        } else {
            None
        };

        Ok(Self {
            index,
            attenuation,
            origin,
            entity,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuzzleFlash {
    pub entity: u16,
    pub flash: u8,
}

impl MuzzleFlash {
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        msg.write_u16(self.entity)?;
        msg.write_u8(self.flash)
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, NetError> {
        Ok(Self {
            entity: msg.read_u16()?,
            flash: msg.read_u8()?,
        })
    }
}

/// One-shot visual events with fixed per-kind payloads. An unknown kind is
/// fatal for the stream since its length cannot be known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempEntity {
    Blaster { origin: Vec3, dir: Vec3 },
    Bullet { origin: Vec3, dir: Vec3 },
    Blood { origin: Vec3, dir: Vec3 },
    Sparks { origin: Vec3, dir: Vec3 },
    Explosion { origin: Vec3 },
    Gib { origin: Vec3 },
    Rail { start: Vec3, end: Vec3 },
}

impl TempEntity {
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        match *self {
            TempEntity::Blaster { origin, dir } => {
                msg.write_u8(0)?;
                msg.write_pos(origin)?;
                msg.write_dir(dir)
            }
            TempEntity::Bullet { origin, dir } => {
                msg.write_u8(1)?;
                msg.write_pos(origin)?;
                msg.write_dir(dir)
            }
            TempEntity::Blood { origin, dir } => {
                msg.write_u8(2)?;
                msg.write_pos(origin)?;
                msg.write_dir(dir)
            }
            TempEntity::Sparks { origin, dir } => {
                msg.write_u8(3)?;
                msg.write_pos(origin)?;
                msg.write_dir(dir)
            }
            TempEntity::Explosion { origin } => {
                msg.write_u8(4)?;
                msg.write_pos(origin)
            }
            TempEntity::Gib { origin } => {
                msg.write_u8(5)?;
                msg.write_pos(origin)
            }
            TempEntity::Rail { start, end } => {
                msg.write_u8(6)?;
                msg.write_pos(start)?;
                msg.write_pos(end)
            }
        }
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, NetError> {
        Ok(match msg.read_u8()? {
            0 => TempEntity::Blaster {
                origin: msg.read_pos()?,
                dir: msg.read_dir()?,
            },
            1 => TempEntity::Bullet {
                origin: msg.read_pos()?,
                dir: msg.read_dir()?,
            },
            2 => TempEntity::Blood {
                origin: msg.read_pos()?,
                dir: msg.read_dir()?,
            },
            3 => TempEntity::Sparks {
                origin: msg.read_pos()?,
                dir: msg.read_dir()?,
            },
            4 => TempEntity::Explosion {
                origin: msg.read_pos()?,
            },
            5 => TempEntity::Gib {
                origin: msg.read_pos()?,
            },
            6 => TempEntity::Rail {
                start: msg.read_pos()?,
                end: msg.read_pos()?,
            },
            _ => return Err(NetError::Malformed("temp entity kind")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigString {
    pub index: u16,
    pub text: String,
}

impl ConfigString {
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        if self.index as usize >= MAX_CONFIG_STRINGS {
            return Err(NetError::Malformed("config string index out of range"));
        }
        msg.write_u16(self.index)?;
        msg.write_string(&self.text)
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, NetError> {
        let index = msg.read_u16()?;
        if index as usize >= MAX_CONFIG_STRINGS {
            return Err(NetError::Malformed("config string index out of range"));
        }
        Ok(Self {
            index,
            text: msg.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    Denied,
    Chunk { percent: u8, data: Vec<u8> },
}

impl Download {
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        match self {
            Download::Denied => {
                msg.write_i16(-1)?;
                msg.write_u8(0)
            }
            Download::Chunk { percent, data } => {
                if data.len() > i16::MAX as usize {
                    return Err(NetError::Malformed("download chunk too large"));
                }
                msg.write_i16(data.len() as i16)?;
                msg.write_u8(*percent)?;
                msg.write_bytes(data)
            }
        }
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, NetError> {
        let size = msg.read_i16()?;
        if size < 0 {
            let _ = msg.read_u8()?;
            return Ok(Download::Denied);
        }
        let percent = msg.read_u8()?;
        let data = msg.read_bytes(size as usize)?.to_vec();
        Ok(Download::Chunk { percent, data })
    }
}

/// Client move: the frame it last reconstructed plus its recent commands,
/// delta-chained oldest to newest so one lost packet costs nothing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Move {
    pub last_frame: i32,
    pub cmds: [UserCmd; MOVE_CMDS],
}

impl Move {
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        msg.write_i32(self.last_frame)?;
        let mut base = UserCmd::default();
        for cmd in &self.cmds {
            write_delta_cmd(&base, cmd, msg)?;
            base = *cmd;
        }
        Ok(())
    }

    pub fn decode(msg: &mut MessageBuffer) -> Result<Self, NetError> {
        let last_frame = msg.read_i32()?;
        let mut cmds = [UserCmd::default(); MOVE_CMDS];
        let mut base = UserCmd::default();
        for cmd in &mut cmds {
            *cmd = read_delta_cmd(&base, msg)?;
            base = *cmd;
        }
        Ok(Self { last_frame, cmds })
    }
}

/// Wraps `payload` in a compressed-opcode record when that actually saves
/// bytes. Returns false, writing nothing, when it would not.
pub fn write_compressed(out: &mut MessageBuffer, payload: &[u8]) -> Result<bool, NetError> {
    let packed = zstd::bulk::compress(payload, COMPRESS_LEVEL).map_err(NetError::Compression)?;
    if packed.len() + 3 >= payload.len() {
        return Ok(false);
    }
    out.write_u8(ServerOp::Compressed as u8)?;
    out.write_u16(packed.len() as u16)?;
    out.write_bytes(&packed)?;
    Ok(true)
}

/// Reads the block following a compressed opcode and inflates it. The block
/// must be the last thing in the enclosing message.
pub fn read_compressed(msg: &mut MessageBuffer) -> Result<Vec<u8>, NetError> {
    let len = msg.read_u16()? as usize;
    let block = msg.read_bytes(len)?;
    let inflated = zstd::bulk::decompress(block, MAX_MSG_SIZE).map_err(NetError::Compression)?;
    if msg.remaining() != 0 {
        return Err(NetError::Malformed("data after compressed block"));
    }
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_op_try_from() {
        assert_eq!(ServerOp::try_from(15).unwrap(), ServerOp::Frame);
        assert_eq!(ServerOp::try_from(16).unwrap(), ServerOp::Compressed);
        assert!(matches!(
            ServerOp::try_from(0),
            Err(NetError::UnknownOpcode(0))
        ));
        assert!(matches!(
            ServerOp::try_from(17),
            Err(NetError::UnknownOpcode(17))
        ));
    }

    #[test]
    fn test_client_op_try_from() {
        assert_eq!(ClientOp::try_from(2).unwrap(), ClientOp::Move);
        assert!(matches!(
            ClientOp::try_from(5),
            Err(NetError::UnknownOpcode(5))
        ));
    }

    #[test]
    fn test_server_data_round_trip() {
        let data = ServerData {
            protocol: PROTOCOL_VERSION,
            spawn_count: 7,
            tick_rate: 60,
            gamedir: "default".into(),
            client_entity: 3,
            level_name: "The Edge".into(),
        };
        let mut msg = MessageBuffer::new(256);
        data.encode(&mut msg).unwrap();
        assert_eq!(ServerData::decode(&mut msg).unwrap(), data);
        assert_eq!(msg.remaining(), 0);
    }

    #[test]
    fn test_sound_start_round_trip() {
        let full = SoundStart {
            index: 12,
            attenuation: Some(3),
            origin: Some(Vec3::new(8.0, -16.0, 4.0)),
            entity: Some(99),
        };
        let mut msg = MessageBuffer::new(64);
        full.encode(&mut msg).unwrap();
        let got = SoundStart::decode(&mut msg).unwrap();
        assert_eq!(got.index, 12);
        assert_eq!(got.attenuation, Some(3));
        assert_eq!(got.entity, Some(99));
        assert_eq!(got.origin, Some(Vec3::new(8.0, -16.0, 4.0)));
    }

    #[test]
    fn test_sound_start_minimal_is_two_bytes() {
        let bare = SoundStart {
            index: 5,
            ..Default::default()
        };
        let mut msg = MessageBuffer::new(16);
        bare.encode(&mut msg).unwrap();
        assert_eq!(msg.as_slice(), &[0, 5]);
        assert_eq!(SoundStart::decode(&mut msg).unwrap(), bare);
    }

    #[test]
    fn test_muzzle_flash_round_trip() {
        let flash = MuzzleFlash {
            entity: 300,
            flash: muzzle::RAILGUN,
        };
        let mut msg = MessageBuffer::new(16);
        flash.encode(&mut msg).unwrap();
        assert_eq!(MuzzleFlash::decode(&mut msg).unwrap(), flash);
    }

    #[test]
    fn test_temp_entity_round_trip() {
        let events = [
            TempEntity::Blaster {
                origin: Vec3::new(10.0, 20.0, 30.0),
                dir: Vec3::X,
            },
            TempEntity::Explosion {
                origin: Vec3::new(-64.0, 0.0, 128.0),
            },
            TempEntity::Rail {
                start: Vec3::ZERO,
                end: Vec3::new(512.0, 512.0, 64.0),
            },
        ];
        for event in events {
            let mut msg = MessageBuffer::new(64);
            event.encode(&mut msg).unwrap();
            let got = TempEntity::decode(&mut msg).unwrap();
            match (event, got) {
                (
                    TempEntity::Blaster { origin, dir },
                    TempEntity::Blaster {
                        origin: o2,
                        dir: d2,
                    },
                ) => {
                    assert!((origin - o2).length() <= 0.25);
                    assert!(dir.dot(d2) > 0.99);
                }
                (TempEntity::Explosion { origin }, TempEntity::Explosion { origin: o2 }) => {
                    assert!((origin - o2).length() <= 0.25);
                }
                (TempEntity::Rail { start, end }, TempEntity::Rail { start: s2, end: e2 }) => {
                    assert!((start - s2).length() <= 0.25);
                    assert!((end - e2).length() <= 0.25);
                }
                other => panic!("variant mismatch: {:?}", other),
            }
        }
    }

    #[test]
    fn test_temp_entity_unknown_kind_is_malformed() {
        let mut msg = MessageBuffer::from_slice(&[99]);
        assert!(matches!(
            TempEntity::decode(&mut msg),
            Err(NetError::Malformed(_))
        ));
    }

    #[test]
    fn test_config_string_round_trip_and_bounds() {
        let cs = ConfigString {
            index: 31,
            text: "maps/edge".into(),
        };
        let mut msg = MessageBuffer::new(64);
        cs.encode(&mut msg).unwrap();
        assert_eq!(ConfigString::decode(&mut msg).unwrap(), cs);

        let bad = ConfigString {
            index: MAX_CONFIG_STRINGS as u16,
            text: String::new(),
        };
        let mut msg = MessageBuffer::new(64);
        assert!(matches!(
            bad.encode(&mut msg),
            Err(NetError::Malformed(_))
        ));
    }

    #[test]
    fn test_download_round_trip() {
        let chunk = Download::Chunk {
            percent: 45,
            data: vec![1, 2, 3, 4, 5],
        };
        let mut msg = MessageBuffer::new(64);
        chunk.encode(&mut msg).unwrap();
        assert_eq!(Download::decode(&mut msg).unwrap(), chunk);

        let mut msg = MessageBuffer::new(64);
        Download::Denied.encode(&mut msg).unwrap();
        assert_eq!(Download::decode(&mut msg).unwrap(), Download::Denied);
    }

    #[test]
    fn test_move_round_trip() {
        let mut mv = Move {
            last_frame: 41,
            ..Default::default()
        };
        mv.cmds[0] = UserCmd {
            msec: 16,
            forward: 200,
            ..Default::default()
        };
        mv.cmds[1] = UserCmd {
            msec: 16,
            forward: 200,
            side: -100,
            ..Default::default()
        };
        mv.cmds[2] = UserCmd {
            msec: 17,
            forward: 0,
            side: -100,
            buttons: 1,
            ..Default::default()
        };

        let mut msg = MessageBuffer::new(128);
        mv.encode(&mut msg).unwrap();
        let got = Move::decode(&mut msg).unwrap();
        assert_eq!(got, mv);
        assert_eq!(msg.remaining(), 0);
    }

    #[test]
    fn test_compressed_round_trip() {
        let payload: Vec<u8> = (0..800u32).map(|i| (i % 7) as u8).collect();
        let mut out = MessageBuffer::new(MAX_MSG_SIZE);
        assert!(write_compressed(&mut out, &payload).unwrap());
        assert!(out.len() < payload.len());

        let mut msg = MessageBuffer::from_slice(out.as_slice());
        let op = ServerOp::try_from(msg.read_u8().unwrap()).unwrap();
        assert_eq!(op, ServerOp::Compressed);
        assert_eq!(read_compressed(&mut msg).unwrap(), payload);
    }

    #[test]
    fn test_incompressible_payload_declined() {
        let payload: Vec<u8> = (0..64).map(|_| (rand_u64_byte())).collect();
        let mut out = MessageBuffer::new(MAX_MSG_SIZE);
        assert!(!write_compressed(&mut out, &payload).unwrap());
        assert!(out.is_empty());
    }

    fn rand_u64_byte() -> u8 {
        (super::super::stats::rand_u64() & 0xff) as u8
    }

    #[test]
    fn test_trailing_bytes_after_compressed_block_malformed() {
        let payload = vec![0u8; 700];
        let mut out = MessageBuffer::new(MAX_MSG_SIZE);
        assert!(write_compressed(&mut out, &payload).unwrap());
        out.write_u8(42).unwrap();

        let mut msg = MessageBuffer::from_slice(out.as_slice());
        let _ = msg.read_u8().unwrap();
        assert!(matches!(
            read_compressed(&mut msg),
            Err(NetError::Malformed(_))
        ));
    }
}
