pub mod net;

pub use net::{
    connectionless_text, is_connectionless, muzzle, out_of_band, print_level, rand_percent,
    rand_u64, read_compressed, read_delta_cmd, read_delta_entity, read_delta_player,
    read_entity_bits, sequence_greater_than, write_compressed, write_delta_cmd,
    write_delta_entity, write_delta_player, write_remove_entity,
    ChanSource, ChanState, Channel, ClientOp, CmdBits, ConfigString, DatagramSocket, Download,
    EntityState, LoopbackSocket, MessageBuffer, Move, MuzzleFlash, NetError, NetworkStats,
    PacketLossSimulation, PlayerBits, PlayerState, ServerData, ServerOp, SoundBits, SoundStart,
    TempEntity, UdpTransport, UpdateBits, UserCmd, CLIENT_RATE, CLIENT_RATE_MAX, CLIENT_RATE_MIN,
    COMPRESS_THRESHOLD, DEFAULT_PORT, DEFAULT_TICK_RATE, MAX_CONFIG_STRINGS, MAX_ENTITIES,
    MAX_MSG_SIZE, MAX_PACKET_ENTITIES, MOVE_CMDS, OOB_SEQUENCE, PROTOCOL_VERSION, UPDATE_BACKUP,
    UPDATE_MASK,
};
