use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use glam::Vec3;
use log::{debug, info, warn};

use strafe::{
    ChanSource, Channel, ClientOp, ConfigString, DatagramSocket, EntityState, MAX_CONFIG_STRINGS,
    MAX_ENTITIES, MAX_MSG_SIZE, MAX_PACKET_ENTITIES, MOVE_CMDS, MessageBuffer, Move, MuzzleFlash,
    NetError, NetworkStats, PROTOCOL_VERSION, PlayerState, ServerData, ServerOp, SoundStart,
    TempEntity, UPDATE_BACKUP, UPDATE_MASK, UdpTransport, COMPRESS_THRESHOLD, connectionless_text,
    is_connectionless, out_of_band, rand_u64, write_compressed, write_delta_entity,
    write_delta_player, write_remove_entity,
};

use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};
use crate::simulation::apply_cmd;

pub const CS_NAME: u16 = 0;
pub const CS_MAXCLIENTS: u16 = 1;
pub const CS_PLAYER_NAMES: u16 = 16;

const MAX_CLIENTS: usize = 64;
const MAX_CHALLENGES: usize = 16;
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Challenge {
    addr: SocketAddr,
    value: u32,
    time: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// Channel up, precache not yet acknowledged with `begin`.
    Connected,
    Spawned,
}

/// Where a client is in the reliable precache walk.
#[derive(Debug, Clone, Copy)]
enum PrecacheStage {
    ServerData,
    ConfigStrings(usize),
    Baselines(usize),
}

/// One frame message as sent to one client, kept for delta encoding
/// against whatever the client acknowledges.
#[derive(Debug, Clone, Default)]
struct SentFrame {
    tick: u32,
    valid: bool,
    ps: PlayerState,
    entities: Vec<EntityState>,
}

struct ServerClient {
    state: ClientState,
    chan: Channel,
    name: String,
    userinfo: String,
    entity: u16,
    ps: PlayerState,
    /// Newest frame the client reports having reconstructed; -1 until then.
    last_frame: i32,
    last_incoming: u32,
    suppress_mark: u64,
    frames: Vec<SentFrame>,
    precache: Option<PrecacheStage>,
    datagram: MessageBuffer,
    /// Reliable records that did not fit the staging buffer; drained in
    /// order each transmit as room opens up.
    pending_reliable: VecDeque<Vec<u8>>,
}

pub struct GameServer {
    socket: UdpTransport,
    local_addr: SocketAddr,
    config: ServerConfig,
    clients: Vec<Option<ServerClient>>,
    challenges: Vec<Challenge>,
    entities: Vec<Option<EntityState>>,
    baselines: Vec<EntityState>,
    config_strings: Vec<String>,
    multicast: MessageBuffer,
    spawn_count: u32,
    tick: u32,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    timeout: Duration,
    running: Arc<AtomicBool>,
    pending_events: VecDeque<ServerEvent>,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let socket = UdpTransport::bind(bind_addr)?;
        let local_addr = socket.local_addr()?;

        let mut config = config;
        config.max_clients = config.max_clients.clamp(1, MAX_CLIENTS);
        config.tick_rate = config.tick_rate.clamp(10, 120);
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate as f64);

        let mut config_strings = vec![String::new(); MAX_CONFIG_STRINGS];
        config_strings[CS_NAME as usize] = config.level_name.clone();
        config_strings[CS_MAXCLIENTS as usize] = config.max_clients.to_string();

        let mut multicast = MessageBuffer::new(MAX_MSG_SIZE);
        multicast.allow_overflow = true;

        Ok(Self {
            socket,
            local_addr,
            clients: (0..config.max_clients).map(|_| None).collect(),
            challenges: Vec::with_capacity(MAX_CHALLENGES),
            entities: vec![None; MAX_ENTITIES],
            baselines: vec![EntityState::default(); MAX_ENTITIES],
            config_strings,
            multicast,
            spawn_count: (rand_u64() & 0xffff_ffff) as u32,
            tick: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            timeout: Duration::from_secs(config.timeout_secs),
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        for slot in 0..self.clients.len() {
            if self.clients[slot].is_some() {
                self.kick_client(slot);
            }
        }
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network(now) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("network error: {}", e),
            });
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let now = Instant::now();

        let timed_out: Vec<usize> = self
            .clients
            .iter()
            .enumerate()
            .filter_map(|(slot, c)| {
                c.as_ref()
                    .filter(|c| c.chan.is_timed_out(now, self.timeout))
                    .map(|_| slot)
            })
            .collect();
        for slot in timed_out {
            self.drop_client(slot, DisconnectReason::Timeout);
        }

        self.send_frames(now);
        self.multicast.clear();
    }

    // Incoming traffic

    fn process_network(&mut self, now: Instant) -> Result<(), NetError> {
        let mut buf = [0u8; MAX_MSG_SIZE + 64];
        while let Some((len, from)) = self.socket.recv_from(&mut buf)? {
            let data = &buf[..len];
            if is_connectionless(data) {
                self.handle_connectionless(data, from, now);
            } else {
                self.handle_client_packet(data, from, now);
            }
        }
        Ok(())
    }

    fn handle_connectionless(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        let Some(text) = connectionless_text(data) else {
            return;
        };
        let command = text.split_whitespace().next().unwrap_or("");
        match command {
            "get_challenge" => {
                let value = self.challenge_for(from, now);
                self.send_oob(from, &format!("challenge {}", value));
            }
            "connect" => self.handle_connect(&text, from, now),
            "ping" => self.send_oob(from, "ack"),
            "status" => {
                let reply = format!(
                    "print\n{} {}/{} clients\n",
                    self.config.level_name,
                    self.clients.iter().flatten().count(),
                    self.config.max_clients
                );
                self.send_oob(from, &reply);
            }
            _ => debug!("unknown connectionless command from {}: {}", from, command),
        }
    }

    fn handle_connect(&mut self, text: &str, from: SocketAddr, now: Instant) {
        self.pending_events
            .push_back(ServerEvent::ClientConnecting { addr: from });

        let Some(req) = parse_connect(text) else {
            self.deny(from, "malformed connect");
            return;
        };
        if req.protocol != PROTOCOL_VERSION {
            self.deny(from, &format!("server runs protocol {}", PROTOCOL_VERSION));
            return;
        }
        if !self.check_challenge(from, req.challenge, now) {
            self.deny(from, "bad challenge");
            return;
        }

        // A connect from a known addr+qport replaces that slot.
        let existing = self.clients.iter().position(|c| {
            c.as_ref()
                .is_some_and(|c| c.chan.remote().ip() == from.ip() && c.chan.qport() == req.qport)
        });
        let slot = match existing {
            Some(slot) => {
                info!("client {} reconnecting from {}", slot, from);
                self.clients[slot] = None;
                slot
            }
            None => match self.clients.iter().position(|c| c.is_none()) {
                Some(slot) => slot,
                None => {
                    self.deny(from, "server is full");
                    return;
                }
            },
        };

        self.create_client(slot, from, req.qport, req.userinfo);
        self.send_oob(from, "client_connect");
    }

    fn create_client(&mut self, slot: usize, addr: SocketAddr, qport: u16, userinfo: String) {
        let mut chan = Channel::new(ChanSource::Server, addr, qport);
        let rate = userinfo_value(&userinfo, "rate")
            .and_then(|r| r.parse().ok())
            .unwrap_or(self.config.client_rate);
        chan.set_rate(rate);

        let name = userinfo_value(&userinfo, "name").unwrap_or_else(|| format!("player{}", slot));

        let mut datagram = MessageBuffer::new(MAX_MSG_SIZE);
        datagram.allow_overflow = true;

        self.clients[slot] = Some(ServerClient {
            state: ClientState::Connected,
            chan,
            name: name.clone(),
            userinfo,
            entity: (slot + 1) as u16,
            ps: PlayerState::default(),
            last_frame: -1,
            last_incoming: 0,
            suppress_mark: 0,
            frames: vec![SentFrame::default(); UPDATE_BACKUP],
            precache: None,
            datagram,
            pending_reliable: VecDeque::new(),
        });
        self.spawn_player(slot);
        let _ = self.set_config_string(CS_PLAYER_NAMES + slot as u16, &name);

        info!("client {} ({}) connected from {}", slot, name, addr);
        self.pending_events
            .push_back(ServerEvent::ClientConnected { slot, addr, name });
    }

    fn spawn_player(&mut self, slot: usize) {
        let number = (slot + 1) as u16;
        let origin = Vec3::new(slot as f32 * 64.0, 0.0, 24.0);
        let state = EntityState {
            number,
            origin,
            model: 1,
            skin: slot as u32,
            solid: 31,
            ..Default::default()
        };
        self.entities[number as usize] = Some(state);
        self.baselines[number as usize] = state;
        if let Some(client) = self.clients[slot].as_mut() {
            client.ps = PlayerState {
                origin,
                ..Default::default()
            };
        }
    }

    fn handle_client_packet(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        let Some(qport) = Channel::read_qport(data) else {
            debug!("runt packet from {}", from);
            return;
        };
        let Some(slot) = self.clients.iter().position(|c| {
            c.as_ref()
                .is_some_and(|c| c.chan.qport() == qport && c.chan.remote().ip() == from.ip())
        }) else {
            debug!("packet from unknown client {}", from);
            return;
        };

        let payload = match self.clients[slot].as_mut() {
            Some(client) => {
                if client.chan.remote() != from {
                    info!("client {}: address changed to {}", slot, from);
                    client.chan.set_remote(from);
                }
                match client.chan.process(data, now) {
                    Ok(Some(payload)) => payload,
                    Ok(None) => return,
                    Err(e) => {
                        self.client_error(slot, e);
                        return;
                    }
                }
            }
            None => return,
        };

        if let Err(e) = self.parse_client_message(slot, payload) {
            self.client_error(slot, e);
        }
    }

    fn parse_client_message(&mut self, slot: usize, payload: &[u8]) -> Result<(), NetError> {
        let mut msg = MessageBuffer::from_slice(payload);
        while msg.remaining() > 0 {
            let op = ClientOp::try_from(msg.read_u8()?)?;
            match op {
                ClientOp::Nop => {}
                ClientOp::Move => {
                    let mv = Move::decode(&mut msg)?;
                    self.handle_move(slot, mv);
                }
                ClientOp::UserInfo => {
                    let info = msg.read_string()?;
                    self.handle_userinfo(slot, info);
                }
                ClientOp::StringCmd => {
                    let cmd = msg.read_string()?;
                    self.handle_string_cmd(slot, &cmd);
                }
            }
        }
        Ok(())
    }

    fn handle_move(&mut self, slot: usize, mv: Move) {
        let Some(client) = self.clients[slot].as_mut() else {
            return;
        };
        client.last_frame = mv.last_frame;

        // Re-run older commands to cover dropped packets, like the move
        // dispatch in id's servers.
        let seq = client.chan.incoming_sequence();
        let net_drop = seq
            .saturating_sub(client.last_incoming)
            .saturating_sub(1)
            .min(2) as usize;
        client.last_incoming = seq;

        if client.state != ClientState::Spawned {
            return;
        }
        let number = client.entity as usize;
        let Some(entity) = self.entities[number].as_mut() else {
            return;
        };
        let start = (MOVE_CMDS - 1) - net_drop;
        for cmd in &mv.cmds[start..] {
            apply_cmd(entity, &mut client.ps, cmd);
        }
    }

    fn handle_userinfo(&mut self, slot: usize, info: String) {
        let Some(client) = self.clients[slot].as_mut() else {
            return;
        };
        if let Some(rate) = userinfo_value(&info, "rate").and_then(|r| r.parse().ok()) {
            client.chan.set_rate(rate);
        }
        let name = userinfo_value(&info, "name").unwrap_or_else(|| client.name.clone());
        let renamed = name != client.name;
        client.name = name.clone();
        client.userinfo = info;
        if renamed {
            info!("client {} is now known as {}", slot, name);
            let _ = self.set_config_string(CS_PLAYER_NAMES + slot as u16, &name);
        }
    }

    fn handle_string_cmd(&mut self, slot: usize, cmd: &str) {
        let line = cmd.trim();
        match line {
            "new" => {
                if let Some(client) = self.clients[slot].as_mut() {
                    debug!("client {} requested precache", slot);
                    client.precache = Some(PrecacheStage::ServerData);
                    client.last_frame = -1;
                    for frame in client.frames.iter_mut() {
                        frame.valid = false;
                    }
                }
            }
            "begin" => {
                if let Some(client) = self.clients[slot].as_mut() {
                    if client.precache.is_some() {
                        debug!("client {} sent begin before precache finished", slot);
                        return;
                    }
                    client.state = ClientState::Spawned;
                    info!("client {} ({}) spawned", slot, client.name);
                    self.pending_events.push_back(ServerEvent::ClientSpawned { slot });
                }
            }
            "disconnect" => self.drop_client(slot, DisconnectReason::Graceful),
            _ => self.pending_events.push_back(ServerEvent::ClientCommand {
                slot,
                command: line.to_string(),
            }),
        }
    }

    fn client_error(&mut self, slot: usize, err: NetError) {
        warn!("client {}: {}", slot, err);
        self.pending_events.push_back(ServerEvent::Error {
            message: format!("client {}: {}", slot, err),
        });
        self.drop_client(slot, DisconnectReason::Errored);
    }

    // Outgoing traffic

    fn send_frames(&mut self, now: Instant) {
        let current: Vec<EntityState> = self.entities.iter().flatten().copied().collect();

        let mut errored = Vec::new();
        for slot in 0..self.clients.len() {
            let Some(mut client) = self.clients[slot].take() else {
                continue;
            };
            let result = self.transmit_client(&mut client, &current, now);
            self.clients[slot] = Some(client);
            if let Err(e) = result {
                errored.push((slot, e));
            }
        }
        for (slot, err) in errored {
            self.client_error(slot, err);
        }
    }

    fn transmit_client(
        &mut self,
        client: &mut ServerClient,
        current: &[EntityState],
        now: Instant,
    ) -> Result<(), NetError> {
        self.run_precache(client)?;
        flush_pending_reliable(client)?;

        let mut payload = MessageBuffer::new(MAX_MSG_SIZE - 64);
        payload.allow_overflow = true;

        if client.state == ClientState::Spawned {
            self.write_frame(client, current, &mut payload)?;

            if !self.multicast.is_empty() {
                if payload.len() + self.multicast.len() <= payload.capacity() {
                    payload.write_bytes(self.multicast.as_slice())?;
                } else {
                    debug!("client {}: no room for multicast this frame", client.name);
                }
            }
            if !client.datagram.is_empty()
                && payload.len() + client.datagram.len() <= payload.capacity()
            {
                payload.write_bytes(client.datagram.as_slice())?;
            }
        }
        client.datagram.clear();

        // An overflowed frame is unusable; send the bare header instead and
        // let the next frame recover.
        if payload.overflowed {
            warn!("client {}: frame message overflowed, dropped", client.name);
            payload.clear();
        }

        // A rate-capped client whose updates keep getting suppressed is
        // going stale; push this datagram through the reliable stream,
        // which the limiter never declines.
        if !payload.is_empty()
            && client.chan.need_reliable()
            && client.chan.can_reliable()
            && client.chan.reliable.is_empty()
        {
            debug!(
                "client {}: escalating suppressed update to reliable",
                client.name
            );
            client.chan.reliable.write_bytes(payload.as_slice())?;
            return client.chan.transmit(&mut self.socket, &[], now);
        }

        if payload.len() > COMPRESS_THRESHOLD {
            let mut packed = MessageBuffer::new(MAX_MSG_SIZE);
            if write_compressed(&mut packed, payload.as_slice())? {
                debug!(
                    "client {}: payload compressed {} -> {}",
                    client.name,
                    payload.len(),
                    packed.len()
                );
                return client.chan.transmit(&mut self.socket, packed.as_slice(), now);
            }
        }
        client.chan.transmit(&mut self.socket, payload.as_slice(), now)
    }

    /// Feeds the reliable stream one chunk of the precache walk at a time;
    /// resumes where the last chunk left off once it is acknowledged.
    fn run_precache(&self, client: &mut ServerClient) -> Result<(), NetError> {
        while let Some(stage) = client.precache {
            if !client.chan.can_reliable() {
                return Ok(());
            }
            match stage {
                PrecacheStage::ServerData => {
                    let data = ServerData {
                        protocol: PROTOCOL_VERSION,
                        spawn_count: self.spawn_count,
                        tick_rate: self.config.tick_rate.min(255) as u8,
                        gamedir: self.config.gamedir.clone(),
                        client_entity: client.entity,
                        level_name: self.config.level_name.clone(),
                    };
                    let mut rec = MessageBuffer::new(MAX_MSG_SIZE);
                    rec.write_u8(ServerOp::ServerData as u8)?;
                    data.encode(&mut rec)?;
                    if !append_reliable(&mut client.chan, &rec) {
                        return Ok(());
                    }
                    client.precache = Some(PrecacheStage::ConfigStrings(0));
                }
                PrecacheStage::ConfigStrings(mut index) => {
                    while index < MAX_CONFIG_STRINGS {
                        let text = &self.config_strings[index];
                        if text.is_empty() {
                            index += 1;
                            continue;
                        }
                        let mut rec = MessageBuffer::new(MAX_MSG_SIZE);
                        rec.write_u8(ServerOp::ConfigString as u8)?;
                        ConfigString {
                            index: index as u16,
                            text: text.clone(),
                        }
                        .encode(&mut rec)?;
                        if !append_reliable(&mut client.chan, &rec) {
                            client.precache = Some(PrecacheStage::ConfigStrings(index));
                            return Ok(());
                        }
                        index += 1;
                    }
                    client.precache = Some(PrecacheStage::Baselines(1));
                }
                PrecacheStage::Baselines(mut index) => {
                    let null_state = EntityState::default();
                    while index < MAX_ENTITIES {
                        let baseline = &self.baselines[index];
                        if *baseline == null_state {
                            index += 1;
                            continue;
                        }
                        let mut rec = MessageBuffer::new(MAX_MSG_SIZE);
                        rec.write_u8(ServerOp::SpawnBaseline as u8)?;
                        write_delta_entity(None, baseline, &mut rec, true, true)?;
                        if !append_reliable(&mut client.chan, &rec) {
                            client.precache = Some(PrecacheStage::Baselines(index));
                            return Ok(());
                        }
                        index += 1;
                    }
                    let mut rec = MessageBuffer::new(64);
                    rec.write_u8(ServerOp::StuffText as u8)?;
                    rec.write_string("begin\n")?;
                    if !append_reliable(&mut client.chan, &rec) {
                        return Ok(());
                    }
                    client.precache = None;
                    debug!("client {}: precache streamed", client.name);
                }
            }
        }
        Ok(())
    }

    fn write_frame(
        &self,
        client: &mut ServerClient,
        current: &[EntityState],
        out: &mut MessageBuffer,
    ) -> Result<(), NetError> {
        let mut delta_frame = -1i32;
        if client.last_frame >= 0 {
            let sent = &client.frames[client.last_frame as usize & UPDATE_MASK];
            if sent.valid
                && sent.tick == client.last_frame as u32
                && self.tick.wrapping_sub(sent.tick) < UPDATE_BACKUP as u32
            {
                delta_frame = client.last_frame;
            } else {
                debug!(
                    "client {}: frame {} out of reach, sending full update",
                    client.name, client.last_frame
                );
            }
        }

        out.write_u8(ServerOp::Frame as u8)?;
        out.write_u32(self.tick)?;
        out.write_i32(delta_frame)?;
        let suppressed = client.chan.stats().suppressed;
        out.write_u8(suppressed.saturating_sub(client.suppress_mark).min(255) as u8)?;
        client.suppress_mark = suppressed;

        let (base_ps, base_list): (PlayerState, &[EntityState]) = if delta_frame >= 0 {
            let sent = &client.frames[delta_frame as usize & UPDATE_MASK];
            (sent.ps, &sent.entities)
        } else {
            (PlayerState::default(), &[])
        };
        write_delta_player(&base_ps, &client.ps, out)?;

        // Merge the base frame and the current set in entity-number order.
        // `recorded` tracks the view the client will hold after applying
        // this message; it is what the next delta must be encoded against.
        let mut recorded: Vec<EntityState> = Vec::with_capacity(current.len());
        let mut written = 0usize;
        let mut old_i = 0usize;
        let mut new_i = 0usize;
        while old_i < base_list.len() || new_i < current.len() {
            if written >= MAX_PACKET_ENTITIES {
                warn!(
                    "client {}: frame exceeds {} entities, truncated",
                    client.name, MAX_PACKET_ENTITIES
                );
                // Everything unsent stays at the client's base view, so the
                // leftovers re-emit against it next frame.
                recorded.extend_from_slice(&base_list[old_i..]);
                break;
            }
            let old_num = base_list.get(old_i).map_or(u32::MAX, |e| e.number as u32);
            let new_num = current.get(new_i).map_or(u32::MAX, |e| e.number as u32);

            if new_num < old_num {
                // Entering the set; delta from its spawn baseline.
                let ent = &current[new_i];
                let base = &self.baselines[ent.number as usize];
                write_delta_entity(Some(base), ent, out, true, true)?;
                recorded.push(*ent);
                written += 1;
                new_i += 1;
            } else if old_num < new_num {
                write_remove_entity(base_list[old_i].number, out)?;
                written += 1;
                old_i += 1;
            } else {
                let before = out.len();
                write_delta_entity(Some(&base_list[old_i]), &current[new_i], out, false, false)?;
                if out.len() != before {
                    written += 1;
                }
                recorded.push(current[new_i]);
                old_i += 1;
                new_i += 1;
            }
        }
        out.write_u8(0)?;
        out.write_u8(0)?;

        let idx = self.tick as usize & UPDATE_MASK;
        client.frames[idx] = SentFrame {
            tick: self.tick,
            valid: true,
            ps: client.ps,
            entities: recorded,
        };
        Ok(())
    }

    // World and broadcast API

    pub fn spawn_entity(&mut self, mut state: EntityState) -> Option<u16> {
        let start = self.config.max_clients + 1;
        for number in start..MAX_ENTITIES {
            if self.entities[number].is_none() {
                state.number = number as u16;
                self.entities[number] = Some(state);
                self.baselines[number] = state;
                return Some(number as u16);
            }
        }
        warn!("entity limit reached");
        None
    }

    pub fn despawn_entity(&mut self, number: u16) {
        if let Some(slot) = self.entities.get_mut(number as usize) {
            *slot = None;
        }
    }

    pub fn entity_mut(&mut self, number: u16) -> Option<&mut EntityState> {
        self.entities.get_mut(number as usize)?.as_mut()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.iter().flatten().count()
    }

    pub fn set_config_string(&mut self, index: u16, text: &str) -> Result<(), NetError> {
        if index as usize >= MAX_CONFIG_STRINGS {
            return Err(NetError::Malformed("config string index out of range"));
        }
        self.config_strings[index as usize] = text.to_string();

        let mut rec = MessageBuffer::new(MAX_MSG_SIZE);
        rec.write_u8(ServerOp::ConfigString as u8)?;
        ConfigString {
            index,
            text: text.to_string(),
        }
        .encode(&mut rec)?;

        for client in self.clients.iter_mut().flatten() {
            // Skip anyone whose precache walk will pick the change up anyway.
            let pending = match client.precache {
                Some(PrecacheStage::ServerData) => true,
                Some(PrecacheStage::ConfigStrings(next)) => next <= index as usize,
                _ => false,
            };
            if pending {
                continue;
            }
            stage_reliable(client, &rec);
        }
        Ok(())
    }

    pub fn sound(&mut self, sound: &SoundStart) -> Result<(), NetError> {
        self.multicast.write_u8(ServerOp::Sound as u8)?;
        sound.encode(&mut self.multicast)
    }

    pub fn muzzle_flash(&mut self, flash: &MuzzleFlash) -> Result<(), NetError> {
        self.multicast.write_u8(ServerOp::MuzzleFlash as u8)?;
        flash.encode(&mut self.multicast)
    }

    pub fn temp_entity(&mut self, event: &TempEntity) -> Result<(), NetError> {
        self.multicast.write_u8(ServerOp::TempEntity as u8)?;
        event.encode(&mut self.multicast)
    }

    pub fn unicast_sound(&mut self, slot: usize, sound: &SoundStart) -> Result<(), NetError> {
        let Some(client) = self.clients.get_mut(slot).and_then(|c| c.as_mut()) else {
            return Ok(());
        };
        client.datagram.write_u8(ServerOp::Sound as u8)?;
        sound.encode(&mut client.datagram)
    }

    pub fn broadcast_print(&mut self, level: u8, text: &str) -> Result<(), NetError> {
        let mut rec = MessageBuffer::new(MAX_MSG_SIZE);
        rec.write_u8(ServerOp::Print as u8)?;
        rec.write_u8(level)?;
        rec.write_string(text)?;
        for client in self.clients.iter_mut().flatten() {
            stage_reliable(client, &rec);
        }
        Ok(())
    }

    pub fn stuff_text(&mut self, slot: usize, text: &str) -> Result<(), NetError> {
        let Some(client) = self.clients.get_mut(slot).and_then(|c| c.as_mut()) else {
            return Ok(());
        };
        let mut rec = MessageBuffer::new(MAX_MSG_SIZE);
        rec.write_u8(ServerOp::StuffText as u8)?;
        rec.write_string(text)?;
        stage_reliable(client, &rec);
        Ok(())
    }

    /// Resets the world for a new level and walks every client back through
    /// the precache handshake.
    pub fn change_level(&mut self, level_name: &str) {
        self.spawn_count = self.spawn_count.wrapping_add(1);
        self.config.level_name = level_name.to_string();
        self.config_strings[CS_NAME as usize] = level_name.to_string();

        for entity in self.entities.iter_mut() {
            *entity = None;
        }
        for baseline in self.baselines.iter_mut() {
            *baseline = EntityState::default();
        }

        for slot in 0..self.clients.len() {
            if self.clients[slot].is_none() {
                continue;
            }
            self.spawn_player(slot);
            let Some(client) = self.clients[slot].as_mut() else {
                continue;
            };
            client.state = ClientState::Connected;
            client.precache = None;
            client.last_frame = -1;
            for frame in client.frames.iter_mut() {
                frame.valid = false;
            }
            // Anything still queued describes the old level.
            client.pending_reliable.clear();
            let mut rec = MessageBuffer::new(8);
            let _ = rec.write_u8(ServerOp::Reconnect as u8);
            stage_reliable(client, &rec);
        }
        info!("level changed to {}", level_name);
    }

    pub fn kick_client(&mut self, slot: usize) {
        let now = Instant::now();
        if let Some(client) = self.clients.get_mut(slot).and_then(|c| c.as_mut()) {
            let farewell = [ServerOp::Disconnect as u8];
            let _ = client.chan.transmit(&mut self.socket, &farewell, now);
        }
        self.drop_client(slot, DisconnectReason::Kicked);
    }

    pub fn drop_client(&mut self, slot: usize, reason: DisconnectReason) {
        let Some(client) = self.clients[slot].take() else {
            return;
        };
        self.entities[client.entity as usize] = None;
        self.baselines[client.entity as usize] = EntityState::default();
        let _ = self.set_config_string(CS_PLAYER_NAMES + slot as u16, "");

        info!("client {} ({}) {}", slot, client.name, reason.as_str());
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected { slot, reason });
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.tick,
            client_count: self.clients.iter().flatten().count(),
            max_clients: self.config.max_clients,
            entity_count: self.entity_count(),
        }
    }

    pub fn client_stats(&self, slot: usize) -> Option<&NetworkStats> {
        self.clients.get(slot)?.as_ref().map(|c| c.chan.stats())
    }

    // Challenges

    fn challenge_for(&mut self, addr: SocketAddr, now: Instant) -> u32 {
        if let Some(c) = self.challenges.iter_mut().find(|c| c.addr.ip() == addr.ip()) {
            if now.duration_since(c.time) > CHALLENGE_TIMEOUT {
                c.value = (rand_u64() & 0x7fff_ffff) as u32;
            }
            c.time = now;
            return c.value;
        }

        let value = (rand_u64() & 0x7fff_ffff) as u32;
        let challenge = Challenge {
            addr,
            value,
            time: now,
        };
        if self.challenges.len() < MAX_CHALLENGES {
            self.challenges.push(challenge);
        } else if let Some(oldest) = self.challenges.iter_mut().min_by_key(|c| c.time) {
            *oldest = challenge;
        }
        value
    }

    fn check_challenge(&self, addr: SocketAddr, value: u32, now: Instant) -> bool {
        self.challenges.iter().any(|c| {
            c.addr.ip() == addr.ip()
                && c.value == value
                && now.duration_since(c.time) <= CHALLENGE_TIMEOUT
        })
    }

    fn deny(&mut self, addr: SocketAddr, reason: &str) {
        info!("denied connection from {}: {}", addr, reason);
        self.send_oob(addr, &format!("print\n{}\n", reason));
        self.pending_events.push_back(ServerEvent::ConnectionDenied {
            addr,
            reason: reason.to_string(),
        });
    }

    fn send_oob(&mut self, addr: SocketAddr, text: &str) {
        if let Err(e) = out_of_band(&mut self.socket, addr, text) {
            warn!("failed to send to {}: {}", addr, e);
        }
    }
}

fn append_reliable(chan: &mut Channel, rec: &MessageBuffer) -> bool {
    if chan.reliable.capacity() - chan.reliable.len() < rec.len() {
        return false;
    }
    chan.reliable.write_bytes(rec.as_slice()).is_ok()
}

/// A backlog this deep means the client stopped acknowledging; treat it as
/// a reliable-stream overflow and drop them.
const MAX_PENDING_RELIABLE: usize = 64;

/// Stages a reliable record, spilling to the client's pending queue when
/// the staging buffer is full. Records already queued keep their order.
fn stage_reliable(client: &mut ServerClient, rec: &MessageBuffer) {
    if client.pending_reliable.is_empty() && append_reliable(&mut client.chan, rec) {
        return;
    }
    client.pending_reliable.push_back(rec.as_slice().to_vec());
}

fn flush_pending_reliable(client: &mut ServerClient) -> Result<(), NetError> {
    while let Some(rec) = client.pending_reliable.front() {
        if client.chan.reliable.capacity() - client.chan.reliable.len() < rec.len() {
            break;
        }
        client.chan.reliable.write_bytes(rec)?;
        client.pending_reliable.pop_front();
    }
    if client.pending_reliable.len() > MAX_PENDING_RELIABLE {
        return Err(NetError::Overflow);
    }
    Ok(())
}

struct ConnectRequest {
    protocol: u32,
    qport: u16,
    challenge: u32,
    userinfo: String,
}

fn parse_connect(text: &str) -> Option<ConnectRequest> {
    let rest = text.strip_prefix("connect")?.trim_start();
    let mut parts = rest.splitn(4, char::is_whitespace);
    let protocol = parts.next()?.parse().ok()?;
    let qport = parts.next()?.parse().ok()?;
    let challenge = parts.next()?.parse().ok()?;
    let userinfo = parts
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('"')
        .to_string();
    Some(ConnectRequest {
        protocol,
        qport,
        challenge,
        userinfo,
    })
}

/// Value for `key` in a backslash-separated info string.
fn userinfo_value(info: &str, key: &str) -> Option<String> {
    let mut parts = info.strip_prefix('\\').unwrap_or(info).split('\\');
    while let (Some(k), Some(v)) = (parts.next(), parts.next()) {
        if k == key {
            return Some(v.to_string());
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u32,
    pub client_count: usize,
    pub max_clients: usize,
    pub entity_count: usize,
}
