use std::io;

use thiserror::Error;

mod chan;
mod delta;
mod endpoint;
mod loopback;
mod msg;
mod protocol;
mod stats;

pub use chan::{
    connectionless_text, is_connectionless, out_of_band, sequence_greater_than, ChanSource,
    ChanState, Channel, OOB_SEQUENCE,
};
pub use delta::{
    read_delta_cmd, read_delta_entity, read_delta_player, read_entity_bits, write_delta_cmd,
    write_delta_entity, write_delta_player, write_remove_entity, CmdBits, EntityState, PlayerBits,
    PlayerState, SoundBits, UpdateBits, UserCmd,
};
pub use endpoint::{DatagramSocket, UdpTransport};
pub use loopback::LoopbackSocket;
pub use msg::MessageBuffer;
pub use protocol::{
    muzzle, print_level, read_compressed, write_compressed, ClientOp, ConfigString, Download,
    Move, MuzzleFlash, ServerData, ServerOp, SoundStart, TempEntity, CLIENT_RATE, CLIENT_RATE_MAX,
    CLIENT_RATE_MIN, COMPRESS_THRESHOLD, DEFAULT_PORT, DEFAULT_TICK_RATE, MAX_CONFIG_STRINGS,
    MAX_ENTITIES, MAX_MSG_SIZE, MAX_PACKET_ENTITIES, MOVE_CMDS, PROTOCOL_VERSION, UPDATE_BACKUP,
    UPDATE_MASK,
};
pub use stats::{rand_percent, rand_u64, NetworkStats, PacketLossSimulation};

/// Transport-level failure. Everything except `Overflow` is scoped to a
/// single peer; `Overflow` means the local side built an oversized message.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("message buffer overflowed")]
    Overflow,
    #[error("read past end of message")]
    Truncated,
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("connection timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("compression error: {0}")]
    Compression(io::Error),
}

impl NetError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, NetError::Overflow)
    }
}
