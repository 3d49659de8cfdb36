//! Drives a real `GameServer` over localhost UDP with a hand-rolled client:
//! handshake, precache, spawn, then frame reconstruction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use strafe::{
    connectionless_text, is_connectionless, out_of_band, read_compressed, read_delta_entity,
    read_delta_player, read_entity_bits, ChanSource, Channel, ClientOp, ConfigString,
    DatagramSocket,
    EntityState, MessageBuffer, Move, PlayerState, ServerData, ServerOp, UdpTransport,
    UpdateBits, MAX_MSG_SIZE, MAX_PACKET_ENTITIES, PROTOCOL_VERSION,
};
use strafe_server::{GameServer, ServerConfig, ServerEvent};

const QPORT: u16 = 2112;

/// Minimal client-side decode state for the scripted peer.
struct ScriptClient {
    socket: UdpTransport,
    chan: Channel,
    server_addr: SocketAddr,
    server_data: Option<ServerData>,
    config_strings: HashMap<u16, String>,
    baselines: HashMap<u16, EntityState>,
    entities: HashMap<u16, EntityState>,
    player: PlayerState,
    stuffed: Vec<String>,
    prints: Vec<String>,
    last_frame: i32,
    /// Delta base of the most recent frame; -1 means a full update.
    last_delta: i32,
    frames_seen: u32,
    full_frames: u32,
}

impl ScriptClient {
    fn new(server_addr: SocketAddr) -> Self {
        let socket = UdpTransport::bind("127.0.0.1:0").unwrap();
        Self {
            socket,
            chan: Channel::new(ChanSource::Client, server_addr, QPORT),
            server_addr,
            server_data: None,
            config_strings: HashMap::new(),
            baselines: HashMap::new(),
            entities: HashMap::new(),
            player: PlayerState::default(),
            stuffed: Vec::new(),
            prints: Vec::new(),
            last_frame: -1,
            last_delta: -2,
            frames_seen: 0,
            full_frames: 0,
        }
    }

    fn oob(&mut self, text: &str) {
        out_of_band(&mut self.socket, self.server_addr, text).unwrap();
    }

    fn recv_oob(&mut self, server: &mut GameServer, timeout_ms: u64) -> Option<String> {
        let mut buf = [0u8; MAX_MSG_SIZE + 64];
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            server.tick_once();
            if let Some((len, _)) = self.socket.recv_from(&mut buf).unwrap() {
                if is_connectionless(&buf[..len]) {
                    return connectionless_text(&buf[..len]);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    fn send_string_cmd(&mut self, cmd: &str) {
        let mut rec = MessageBuffer::new(256);
        rec.write_u8(ClientOp::StringCmd as u8).unwrap();
        rec.write_string(cmd).unwrap();
        self.chan.reliable.write_bytes(rec.as_slice()).unwrap();
    }

    fn send_move(&mut self) {
        let mv = Move {
            last_frame: self.last_frame,
            ..Default::default()
        };
        let mut out = MessageBuffer::new(256);
        out.write_u8(ClientOp::Move as u8).unwrap();
        mv.encode(&mut out).unwrap();
        self.chan
            .transmit(&mut self.socket, out.as_slice(), Instant::now())
            .unwrap();
    }

    /// One exchange: send a move, then decode whatever the server produced.
    fn pump(&mut self, server: &mut GameServer) {
        self.send_move();
        server.tick_once();
        std::thread::sleep(Duration::from_millis(2));
        server.tick_once();

        let mut buf = [0u8; MAX_MSG_SIZE + 64];
        while let Some((len, _)) = self.socket.recv_from(&mut buf).unwrap() {
            if is_connectionless(&buf[..len]) {
                continue;
            }
            let payload = match self.chan.process(&buf[..len], Instant::now()).unwrap() {
                Some(p) => p.to_vec(),
                None => continue,
            };
            self.parse(&payload);
        }
    }

    fn parse(&mut self, payload: &[u8]) {
        let mut msg = MessageBuffer::from_slice(payload);
        while msg.remaining() > 0 {
            let op = ServerOp::try_from(msg.read_u8().unwrap()).unwrap();
            match op {
                ServerOp::Nop => {}
                ServerOp::ServerData => {
                    self.server_data = Some(ServerData::decode(&mut msg).unwrap());
                }
                ServerOp::ConfigString => {
                    let cs = ConfigString::decode(&mut msg).unwrap();
                    self.config_strings.insert(cs.index, cs.text);
                }
                ServerOp::SpawnBaseline => {
                    let (bits, number) = read_entity_bits(&mut msg).unwrap();
                    let base = EntityState::default();
                    let state = read_delta_entity(&base, number, bits, &mut msg).unwrap();
                    self.baselines.insert(number, state);
                }
                ServerOp::StuffText => {
                    self.stuffed.push(msg.read_string().unwrap());
                }
                ServerOp::Print => {
                    let _level = msg.read_u8().unwrap();
                    self.prints.push(msg.read_string().unwrap());
                }
                ServerOp::Frame => self.parse_frame(&mut msg),
                ServerOp::Compressed => {
                    let inner = read_compressed(&mut msg).unwrap();
                    self.parse(&inner);
                    return;
                }
                other => panic!("unexpected opcode {:?}", other),
            }
        }
    }

    fn parse_frame(&mut self, msg: &mut MessageBuffer) {
        let tick = msg.read_u32().unwrap();
        let delta_frame = msg.read_i32().unwrap();
        let _suppressed = msg.read_u8().unwrap();

        if delta_frame < 0 {
            self.entities.clear();
            self.player = PlayerState::default();
            self.full_frames += 1;
        }
        self.player = read_delta_player(&self.player, msg).unwrap();

        loop {
            let (bits, number) = read_entity_bits(msg).unwrap();
            if number == 0 {
                break;
            }
            if bits.contains(UpdateBits::REMOVE) {
                self.entities.remove(&number);
                continue;
            }
            let base = self
                .entities
                .get(&number)
                .or_else(|| self.baselines.get(&number))
                .copied()
                .unwrap_or_default();
            let state = read_delta_entity(&base, number, bits, msg).unwrap();
            self.entities.insert(number, state);
        }

        self.last_frame = tick as i32;
        self.last_delta = delta_frame;
        self.frames_seen += 1;
    }
}

fn start_server() -> GameServer {
    let config = ServerConfig {
        max_clients: 4,
        level_name: "proving_grounds".to_string(),
        ..Default::default()
    };
    GameServer::new("127.0.0.1:0", config).expect("bind failed")
}

fn handshake(client: &mut ScriptClient, server: &mut GameServer) {
    handshake_as(client, server, "\\name\\scripted\\rate\\16384");
}

fn handshake_as(client: &mut ScriptClient, server: &mut GameServer, userinfo: &str) {
    client.oob("get_challenge");
    let reply = client.recv_oob(server, 500).expect("no challenge reply");
    let challenge: u32 = reply
        .strip_prefix("challenge ")
        .expect("not a challenge")
        .parse()
        .unwrap();

    client.oob(&format!(
        "connect {} {} {} \"{}\"",
        PROTOCOL_VERSION, QPORT, challenge, userinfo
    ));
    let reply = client.recv_oob(server, 500).expect("no connect reply");
    assert_eq!(reply, "client_connect");
}

/// Exchanges moves until the precache walk finishes with the stuffed begin.
fn precache(client: &mut ScriptClient, server: &mut GameServer) {
    client.send_string_cmd("new");
    for _ in 0..200 {
        client.pump(server);
        if client.stuffed.iter().any(|s| s.trim() == "begin") {
            return;
        }
    }
    panic!("precache never finished");
}

/// Full connect sequence through `begin` and the first frames.
fn enter_game(client: &mut ScriptClient, server: &mut GameServer) {
    handshake(client, server);
    precache(client, server);
    client.send_string_cmd("begin");
    for _ in 0..200 {
        client.pump(server);
        if client.frames_seen >= 2 {
            return;
        }
    }
    panic!("no frames after begin");
}

#[test]
fn test_full_connect_sequence() {
    let mut server = start_server();
    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);

    handshake(&mut client, &mut server);
    precache(&mut client, &mut server);

    let data = client.server_data.as_ref().expect("no server data");
    assert_eq!(data.protocol, PROTOCOL_VERSION);
    assert_eq!(data.level_name, "proving_grounds");
    assert_eq!(data.client_entity, 1);
    assert_eq!(
        client.config_strings.get(&strafe_server::CS_NAME).map(String::as_str),
        Some("proving_grounds")
    );
    assert!(client.baselines.contains_key(&1), "own baseline missing");

    client.send_string_cmd("begin");
    for _ in 0..200 {
        client.pump(&mut server);
        if client.frames_seen >= 3 {
            break;
        }
    }
    assert!(client.frames_seen >= 3, "no frames after begin");
    assert!(client.entities.contains_key(&1));

    let events: Vec<ServerEvent> = server.drain_events().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientConnected { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientSpawned { .. })));
}

#[test]
fn test_entity_changes_reach_client_by_delta() {
    let mut server = start_server();
    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);

    handshake(&mut client, &mut server);
    precache(&mut client, &mut server);
    client.send_string_cmd("begin");
    for _ in 0..100 {
        client.pump(&mut server);
        if client.frames_seen >= 2 {
            break;
        }
    }

    let number = server
        .spawn_entity(EntityState {
            origin: glam::Vec3::new(64.0, 0.0, 8.0),
            model: 2,
            ..Default::default()
        })
        .unwrap();

    for _ in 0..100 {
        client.pump(&mut server);
        if client.entities.contains_key(&number) {
            break;
        }
    }
    let seen = client.entities.get(&number).expect("entity never arrived");
    assert!((seen.origin.x - 64.0).abs() <= 0.125);
    assert_eq!(seen.model, 2);

    // Move it and watch the delta land.
    server.entity_mut(number).unwrap().origin.x = 96.0;
    let before = client.frames_seen;
    for _ in 0..100 {
        client.pump(&mut server);
        if client.frames_seen > before + 1 {
            break;
        }
    }
    let seen = client.entities.get(&number).expect("entity lost");
    assert!((seen.origin.x - 96.0).abs() <= 0.125);

    // Despawn must evict it through a remove record.
    server.despawn_entity(number);
    for _ in 0..100 {
        client.pump(&mut server);
        if !client.entities.contains_key(&number) {
            break;
        }
    }
    assert!(!client.entities.contains_key(&number), "remove never arrived");
}

#[test]
fn test_denied_on_wrong_protocol() {
    let mut server = start_server();
    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);

    client.oob("get_challenge");
    let reply = client.recv_oob(&mut server, 500).expect("no challenge reply");
    let challenge: u32 = reply.strip_prefix("challenge ").unwrap().parse().unwrap();

    client.oob(&format!(
        "connect {} {} {} \"\"",
        PROTOCOL_VERSION + 1,
        QPORT,
        challenge
    ));
    let reply = client.recv_oob(&mut server, 500).expect("no deny reply");
    assert!(reply.starts_with("print"), "expected deny print, got {:?}", reply);

    let events: Vec<ServerEvent> = server.drain_events().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::ConnectionDenied { .. })));
}

#[test]
fn test_graceful_disconnect_frees_slot() {
    let mut server = start_server();
    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);

    handshake(&mut client, &mut server);
    precache(&mut client, &mut server);
    assert_eq!(server.stats().client_count, 1);

    client.send_string_cmd("disconnect");
    for _ in 0..100 {
        client.send_move();
        server.tick_once();
        std::thread::sleep(Duration::from_millis(1));
        if server.stats().client_count == 0 {
            break;
        }
    }
    assert_eq!(server.stats().client_count, 0);

    let events: Vec<ServerEvent> = server.drain_events().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientDisconnected { .. })));
}

#[test]
fn test_world_larger_than_packet_cap_streams_fully() {
    let mut server = start_server();
    let mut numbers = Vec::new();
    for i in 0..70u16 {
        let number = server
            .spawn_entity(EntityState {
                origin: glam::Vec3::new(i as f32 * 8.0, -16.0, 4.0),
                model: 3,
                ..Default::default()
            })
            .unwrap();
        numbers.push(number);
    }
    assert!(server.entity_count() > MAX_PACKET_ENTITIES);

    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);
    enter_game(&mut client, &mut server);

    // More entities than fit one frame message; the leftovers must arrive
    // over the following acknowledged frames rather than vanish.
    for _ in 0..400 {
        client.pump(&mut server);
        if client.entities.len() == server.entity_count() {
            break;
        }
    }
    assert_eq!(client.entities.len(), server.entity_count());

    let last = *numbers.last().unwrap();
    let seen = client.entities.get(&last).expect("tail entity missing");
    assert!((seen.origin.x - 69.0 * 8.0).abs() <= 0.125);
}

#[test]
fn test_reliable_backlog_is_deferred_not_dropped() {
    let mut server = start_server();
    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);
    enter_game(&mut client, &mut server);

    // Four prints of this size overrun the reliable staging buffer; the
    // overflow must queue behind it and land once earlier chunks are acked.
    let blob = "x".repeat(600);
    for _ in 0..4 {
        server.broadcast_print(strafe::print_level::HIGH, &blob).unwrap();
    }
    server.set_config_string(40, "late-arrival").unwrap();

    for _ in 0..400 {
        client.pump(&mut server);
        let delivered = client.prints.iter().filter(|p| **p == blob).count();
        if delivered == 4
            && client.config_strings.get(&40).map(String::as_str) == Some("late-arrival")
        {
            break;
        }
    }
    assert_eq!(client.prints.iter().filter(|p| **p == blob).count(), 4);
    assert_eq!(
        client.config_strings.get(&40).map(String::as_str),
        Some("late-arrival")
    );
}

#[test]
fn test_stale_ack_forces_full_frame() {
    let mut server = start_server();
    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);
    enter_game(&mut client, &mut server);

    let number = server
        .spawn_entity(EntityState {
            origin: glam::Vec3::new(40.0, 0.0, 8.0),
            model: 2,
            ..Default::default()
        })
        .unwrap();
    for _ in 0..100 {
        client.pump(&mut server);
        if client.entities.contains_key(&number) {
            break;
        }
    }
    assert!(client.entities.contains_key(&number));

    // Acknowledge a tick the frame ring no longer holds; the server must
    // answer with a baseline-based full update instead of a delta.
    let full_before = client.full_frames;
    client.last_frame = 0;
    for _ in 0..100 {
        client.pump(&mut server);
        if client.full_frames > full_before {
            break;
        }
    }
    assert!(client.full_frames > full_before, "no full frame after stale ack");

    // The rebuilt view matches the world.
    assert_eq!(client.entities.len(), server.entity_count());
    let seen = client.entities.get(&number).unwrap();
    assert!((seen.origin.x - 40.0).abs() <= 0.125);

    // With a fresh acknowledgment the server goes back to deltas.
    for _ in 0..100 {
        client.pump(&mut server);
        if client.last_delta >= 0 {
            break;
        }
    }
    assert!(client.last_delta >= 0);
}

#[test]
fn test_rate_limited_client_still_receives_state() {
    let mut server = start_server();
    let mut numbers = Vec::new();
    for i in 0..60u16 {
        numbers.push(
            server
                .spawn_entity(EntityState {
                    origin: glam::Vec3::new(i as f32 * 4.0, 0.0, 4.0),
                    model: 3,
                    ..Default::default()
                })
                .unwrap(),
        );
    }

    let addr = server.local_addr();
    let mut client = ScriptClient::new(addr);
    handshake_as(&mut client, &mut server, "\\name\\throttled\\rate\\1");
    precache(&mut client, &mut server);
    client.send_string_cmd("begin");
    for _ in 0..200 {
        client.pump(&mut server);
        if client.frames_seen >= 2 {
            break;
        }
    }
    assert!(client.frames_seen >= 2);

    // Fat frames against the minimum rate cap: the limiter suppresses most
    // of them, but escalation through the reliable stream keeps the gap
    // between delivered frames bounded.
    let mut last_seen = client.frames_seen;
    let mut last_tick = server.stats().tick;
    let mut max_gap = 0u32;
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(3) {
        for &number in &numbers {
            server.entity_mut(number).unwrap().origin.x += 1.0;
        }
        client.pump(&mut server);
        if client.frames_seen > last_seen {
            let tick = server.stats().tick;
            max_gap = max_gap.max(tick - last_tick);
            last_tick = tick;
            last_seen = client.frames_seen;
        }
    }

    let stats = server.client_stats(0).expect("client gone");
    assert!(stats.suppressed > 10, "rate limiter never engaged");
    assert!(
        max_gap <= 25,
        "client starved for {} ticks while rate limited",
        max_gap
    );
}
