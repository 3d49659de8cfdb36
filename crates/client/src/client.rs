use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use strafe::{
    connectionless_text, is_connectionless, out_of_band, rand_u64, read_compressed,
    read_delta_entity, read_delta_player, read_entity_bits, ChanSource, Channel, ClientOp,
    ConfigString, DatagramSocket, Download, EntityState, MessageBuffer, Move, MuzzleFlash,
    NetError,
    NetworkStats, PlayerState, ServerData, ServerOp, SoundStart, TempEntity, UdpTransport,
    UpdateBits, UserCmd, MAX_CONFIG_STRINGS, MAX_ENTITIES, MAX_MSG_SIZE, MOVE_CMDS,
    PROTOCOL_VERSION, UPDATE_BACKUP, UPDATE_MASK,
};

use crate::config::ClientConfig;
use crate::events::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Waiting for a challenge value.
    Challenging,
    /// Challenge in hand, waiting for the connect acknowledgment.
    Connecting,
    /// Channel up, precache streaming in.
    Connected,
    /// Frames flowing.
    Active,
}

/// One reconstructed server frame, kept for delta decoding of later ones.
#[derive(Debug, Clone, Default)]
struct ClientFrame {
    tick: u32,
    valid: bool,
    ps: PlayerState,
    /// Sorted by entity number.
    entities: Vec<EntityState>,
}

/// The game's side of the connection: handshake, dispatcher, frame
/// reconstruction, and user command transmission. The embedding
/// application drives `update` once per tick and drains events.
pub struct NetClient {
    socket: UdpTransport,
    config: ClientConfig,
    state: ClientState,
    server_addr: Option<SocketAddr>,
    qport: u16,
    chan: Option<Channel>,
    challenge: Option<u32>,
    last_attempt: Instant,
    retries: u32,
    timeout: Duration,

    server_data: Option<ServerData>,
    config_strings: Vec<String>,
    baselines: Vec<EntityState>,
    frames: Vec<ClientFrame>,
    /// Newest frame reconstructed against a good base; -1 asks the server
    /// for a full update.
    last_frame: i32,

    cmd_history: [UserCmd; MOVE_CMDS],
    userinfo_dirty: bool,
    pending_cmds: VecDeque<String>,
    events: VecDeque<ClientEvent>,
}

impl NetClient {
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let socket = UdpTransport::bind("0.0.0.0:0")?;
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            socket,
            state: ClientState::Disconnected,
            server_addr: None,
            qport: (rand_u64() & 0xffff) as u16,
            chan: None,
            challenge: None,
            last_attempt: Instant::now(),
            retries: 0,
            timeout,
            server_data: None,
            config_strings: vec![String::new(); MAX_CONFIG_STRINGS],
            baselines: vec![EntityState::default(); MAX_ENTITIES],
            frames: vec![ClientFrame::default(); UPDATE_BACKUP],
            last_frame: -1,
            cmd_history: [UserCmd::default(); MOVE_CMDS],
            userinfo_dirty: false,
            pending_cmds: VecDeque::new(),
            events: VecDeque::new(),
            config,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn server_data(&self) -> Option<&ServerData> {
        self.server_data.as_ref()
    }

    pub fn config_string(&self, index: u16) -> Option<&str> {
        self.config_strings
            .get(index as usize)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn stats(&self) -> Option<&NetworkStats> {
        self.chan.as_ref().map(|c| c.stats())
    }

    /// Entities of the newest reconstructed frame.
    pub fn entities(&self) -> &[EntityState] {
        if self.last_frame < 0 {
            return &[];
        }
        let frame = &self.frames[self.last_frame as usize & UPDATE_MASK];
        if frame.valid { frame.entities.as_slice() } else { &[] }
    }

    pub fn player(&self) -> Option<&PlayerState> {
        if self.last_frame < 0 {
            return None;
        }
        let frame = &self.frames[self.last_frame as usize & UPDATE_MASK];
        frame.valid.then_some(&frame.ps)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.events.drain(..)
    }

    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        info!("connecting to {}", addr);
        self.reset_world();
        self.server_addr = Some(addr);
        self.chan = None;
        self.challenge = None;
        self.retries = 0;
        self.state = ClientState::Challenging;
        self.last_attempt = Instant::now();
        out_of_band(&mut self.socket, addr, "get_challenge").map_err(net_to_io)?;
        Ok(())
    }

    pub fn disconnect(&mut self, reason: &str) {
        if let Some(chan) = self.chan.as_mut() {
            // Best-effort farewell so the server frees the slot promptly.
            let mut out = MessageBuffer::new(64);
            let _ = out.write_u8(ClientOp::StringCmd as u8);
            let _ = out.write_string("disconnect");
            let _ = chan.transmit(&mut self.socket, out.as_slice(), Instant::now());
        }
        if self.state != ClientState::Disconnected {
            info!("disconnected: {}", reason);
            self.events.push_back(ClientEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        self.state = ClientState::Disconnected;
        self.chan = None;
        self.reset_world();
    }

    /// Queues a console command for reliable delivery to the server.
    pub fn send_string_cmd(&mut self, cmd: &str) {
        self.pending_cmds.push_back(cmd.to_string());
    }

    pub fn set_name(&mut self, name: &str) {
        if self.config.name != name {
            self.config.name = name.to_string();
            self.userinfo_dirty = true;
        }
    }

    pub fn set_rate(&mut self, rate: u32) {
        if self.config.rate != rate {
            self.config.rate = rate;
            self.userinfo_dirty = true;
        }
        if let Some(chan) = self.chan.as_mut() {
            chan.set_rate(rate);
        }
    }

    /// One client tick: drain the socket, advance the handshake, and send
    /// this tick's command.
    pub fn update(&mut self, cmd: UserCmd, now: Instant) {
        if let Err(e) = self.process_network(now) {
            self.disconnect(&format!("network error: {}", e));
            return;
        }

        match self.state {
            ClientState::Disconnected => {}
            ClientState::Challenging | ClientState::Connecting => self.retry_handshake(now),
            ClientState::Connected | ClientState::Active => {
                let timed_out = self
                    .chan
                    .as_ref()
                    .is_some_and(|c| c.is_timed_out(now, self.timeout));
                if timed_out {
                    if let Some(chan) = self.chan.as_mut() {
                        chan.mark_timed_out();
                    }
                    self.disconnect("server timed out");
                    return;
                }
                self.queue_reliable();
                if let Err(e) = self.send_move(cmd, now) {
                    self.disconnect(&format!("transmit failed: {}", e));
                }
            }
        }
    }

    fn process_network(&mut self, now: Instant) -> Result<(), NetError> {
        let mut buf = [0u8; MAX_MSG_SIZE + 64];
        while let Some((len, from)) = self.socket.recv_from(&mut buf)? {
            if Some(from) != self.server_addr {
                debug!("packet from unexpected address {}", from);
                continue;
            }
            let data = &buf[..len];
            if is_connectionless(data) {
                self.handle_oob(data);
                continue;
            }
            let Some(chan) = self.chan.as_mut() else {
                continue;
            };
            let payload = match chan.process(data, now) {
                Ok(Some(payload)) => payload.to_vec(),
                Ok(None) => continue,
                Err(e) => {
                    self.disconnect(&format!("bad packet: {}", e));
                    return Ok(());
                }
            };
            if let Err(e) = self.handle_payload(&payload) {
                // A failed opcode poisons the rest of the packet; the
                // connection is torn down rather than guessed at.
                self.disconnect(&format!("protocol error: {}", e));
                return Ok(());
            }
        }
        Ok(())
    }

    fn retry_handshake(&mut self, now: Instant) {
        let interval = Duration::from_secs_f32(self.config.retry_interval_secs);
        if now.duration_since(self.last_attempt) < interval {
            return;
        }
        if self.retries >= self.config.max_retries {
            self.disconnect("no response from server");
            return;
        }
        self.retries += 1;
        self.last_attempt = now;

        let Some(addr) = self.server_addr else {
            return;
        };
        let result = match self.state {
            ClientState::Challenging => {
                debug!("re-requesting challenge ({})", self.retries);
                out_of_band(&mut self.socket, addr, "get_challenge")
            }
            ClientState::Connecting => {
                debug!("re-sending connect ({})", self.retries);
                self.send_connect(addr)
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.disconnect(&format!("send failed: {}", e));
        }
    }

    fn handle_oob(&mut self, data: &[u8]) {
        let Some(text) = connectionless_text(data) else {
            return;
        };
        let mut parts = text.splitn(2, char::is_whitespace);
        match parts.next().unwrap_or("") {
            "challenge" => {
                if self.state != ClientState::Challenging {
                    return;
                }
                let Some(value) = parts.next().and_then(|v| v.trim().parse().ok()) else {
                    warn!("malformed challenge reply");
                    return;
                };
                self.challenge = Some(value);
                self.state = ClientState::Connecting;
                self.retries = 0;
                self.last_attempt = Instant::now();
                if let Some(addr) = self.server_addr {
                    if let Err(e) = self.send_connect(addr) {
                        self.disconnect(&format!("send failed: {}", e));
                    }
                }
            }
            "client_connect" => {
                if self.state != ClientState::Connecting {
                    return;
                }
                let Some(addr) = self.server_addr else {
                    return;
                };
                info!("connection accepted");
                let mut chan = Channel::new(ChanSource::Client, addr, self.qport);
                chan.set_rate(self.config.rate);
                self.chan = Some(chan);
                self.state = ClientState::Connected;
                self.events.push_back(ClientEvent::Connected);
                self.pending_cmds.push_back("new".to_string());
            }
            "print" => {
                let body = parts.next().unwrap_or("").to_string();
                self.events.push_back(ClientEvent::Print {
                    level: strafe::print_level::HIGH,
                    text: body,
                });
            }
            other => debug!("ignored connectionless reply {:?}", other),
        }
    }

    fn send_connect(&mut self, addr: SocketAddr) -> Result<(), NetError> {
        let Some(challenge) = self.challenge else {
            return Ok(());
        };
        let text = format!(
            "connect {} {} {} \"{}\"",
            PROTOCOL_VERSION,
            self.qport,
            challenge,
            self.userinfo()
        );
        out_of_band(&mut self.socket, addr, &text)
    }

    fn userinfo(&self) -> String {
        format!("\\name\\{}\\rate\\{}", self.config.name, self.config.rate)
    }

    /// Moves staged reliable content into the channel, one batch per
    /// acknowledgment window.
    fn queue_reliable(&mut self) {
        let Some(chan) = self.chan.as_mut() else {
            return;
        };
        if !chan.can_reliable() {
            return;
        }

        if self.userinfo_dirty {
            let mut rec = MessageBuffer::new(512);
            let info = format!("\\name\\{}\\rate\\{}", self.config.name, self.config.rate);
            if rec.write_u8(ClientOp::UserInfo as u8).is_ok() && rec.write_string(&info).is_ok() {
                let _ = chan.reliable.write_bytes(rec.as_slice());
            }
            self.userinfo_dirty = false;
        }

        while let Some(cmd) = self.pending_cmds.front() {
            let mut rec = MessageBuffer::new(1024);
            if rec.write_u8(ClientOp::StringCmd as u8).is_err() || rec.write_string(cmd).is_err() {
                warn!("dropping unencodable command {:?}", cmd);
                self.pending_cmds.pop_front();
                continue;
            }
            if chan.reliable.capacity() - chan.reliable.len() < rec.len() {
                break;
            }
            let _ = chan.reliable.write_bytes(rec.as_slice());
            self.pending_cmds.pop_front();
        }
    }

    fn send_move(&mut self, cmd: UserCmd, now: Instant) -> Result<(), NetError> {
        let Some(chan) = self.chan.as_mut() else {
            return Ok(());
        };

        self.cmd_history.rotate_left(1);
        self.cmd_history[MOVE_CMDS - 1] = cmd;

        let mv = Move {
            last_frame: self.last_frame,
            cmds: self.cmd_history,
        };
        let mut out = MessageBuffer::new(256);
        out.write_u8(ClientOp::Move as u8)?;
        mv.encode(&mut out)?;
        chan.transmit(&mut self.socket, out.as_slice(), now)
    }

    // Dispatcher

    fn handle_payload(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let mut msg = MessageBuffer::from_slice(payload);
        while msg.remaining() > 0 {
            let op = ServerOp::try_from(msg.read_u8()?)?;
            match op {
                ServerOp::Nop => {}
                ServerOp::MuzzleFlash => {
                    let flash = MuzzleFlash::decode(&mut msg)?;
                    self.events.push_back(ClientEvent::MuzzleFlash(flash));
                }
                ServerOp::TempEntity => {
                    let event = TempEntity::decode(&mut msg)?;
                    self.events.push_back(ClientEvent::TempEntity(event));
                }
                ServerOp::Layout => {
                    let text = msg.read_string()?;
                    self.events.push_back(ClientEvent::Layout { text });
                }
                ServerOp::Disconnect => {
                    self.disconnect("server disconnected");
                    return Ok(());
                }
                ServerOp::Reconnect => {
                    info!("server is changing level");
                    self.begin_reconnect();
                }
                ServerOp::Sound => {
                    let sound = SoundStart::decode(&mut msg)?;
                    self.events.push_back(ClientEvent::Sound(sound));
                }
                ServerOp::Print => {
                    let level = msg.read_u8()?;
                    let text = msg.read_string()?;
                    self.events.push_back(ClientEvent::Print { level, text });
                }
                ServerOp::StuffText => {
                    let text = msg.read_string()?;
                    self.exec_stuffed(&text);
                }
                ServerOp::ServerData => {
                    let data = ServerData::decode(&mut msg)?;
                    if data.protocol != PROTOCOL_VERSION {
                        return Err(NetError::Malformed("protocol mismatch"));
                    }
                    info!("entering {}", data.level_name);
                    self.server_data = Some(data);
                }
                ServerOp::ConfigString => {
                    let cs = ConfigString::decode(&mut msg)?;
                    self.config_strings[cs.index as usize] = cs.text.clone();
                    self.events.push_back(ClientEvent::ConfigString {
                        index: cs.index,
                        text: cs.text,
                    });
                }
                ServerOp::SpawnBaseline => {
                    let (bits, number) = read_entity_bits(&mut msg)?;
                    let null_state = EntityState::default();
                    let state = read_delta_entity(&null_state, number, bits, &mut msg)?;
                    self.baselines[number as usize] = state;
                }
                ServerOp::CenterPrint => {
                    let text = msg.read_string()?;
                    self.events.push_back(ClientEvent::CenterPrint { text });
                }
                ServerOp::Download => {
                    // Asset transfer is not wired up; acknowledge and move on.
                    let _ = Download::decode(&mut msg)?;
                }
                ServerOp::Frame => self.parse_frame(&mut msg)?,
                ServerOp::Compressed => {
                    let inner = read_compressed(&mut msg)?;
                    return self.handle_payload(&inner);
                }
            }
        }
        Ok(())
    }

    fn exec_stuffed(&mut self, text: &str) {
        for line in text.lines() {
            match line.trim() {
                "" => {}
                "begin" => {
                    debug!("precache complete, entering game");
                    self.pending_cmds.push_back("begin".to_string());
                }
                "reconnect" => self.begin_reconnect(),
                "disconnect" => self.disconnect("server requested disconnect"),
                other => self.events.push_back(ClientEvent::Command {
                    text: other.to_string(),
                }),
            }
        }
    }

    /// Walks the connection back to the precache stage for a level change.
    fn begin_reconnect(&mut self) {
        self.reset_world();
        self.state = ClientState::Connected;
        self.pending_cmds.push_back("new".to_string());
    }

    fn reset_world(&mut self) {
        self.server_data = None;
        for s in self.config_strings.iter_mut() {
            s.clear();
        }
        for b in self.baselines.iter_mut() {
            *b = EntityState::default();
        }
        for f in self.frames.iter_mut() {
            f.valid = false;
        }
        self.last_frame = -1;
        self.pending_cmds.clear();
        self.cmd_history = [UserCmd::default(); MOVE_CMDS];
    }

    fn parse_frame(&mut self, msg: &mut MessageBuffer) -> Result<(), NetError> {
        let tick = msg.read_u32()?;
        let delta_frame = msg.read_i32()?;
        let _suppressed = msg.read_u8()?;

        // Locate the delta base. A base this client no longer holds makes
        // the frame unusable; it is still parsed to keep the stream aligned
        // and the next move asks for a full update.
        let mut valid = true;
        let (base_ps, base_entities): (PlayerState, Vec<EntityState>) = if delta_frame < 0 {
            (PlayerState::default(), Vec::new())
        } else {
            let base = &self.frames[delta_frame as usize & UPDATE_MASK];
            if base.valid && base.tick == delta_frame as u32 {
                (base.ps, base.entities.clone())
            } else {
                warn!("delta base {} unavailable, frame {} unusable", delta_frame, tick);
                valid = false;
                (PlayerState::default(), Vec::new())
            }
        };

        let ps = read_delta_player(&base_ps, msg)?;

        let mut entities = base_entities;
        loop {
            let (bits, number) = read_entity_bits(msg)?;
            if number == 0 {
                break;
            }
            let slot = entities.binary_search_by_key(&number, |e| e.number);
            if bits.contains(UpdateBits::REMOVE) {
                if let Ok(i) = slot {
                    entities.remove(i);
                }
                continue;
            }
            let base = match slot {
                Ok(i) => entities[i],
                Err(_) => self.baselines[number as usize],
            };
            let state = read_delta_entity(&base, number, bits, msg)?;
            match slot {
                Ok(i) => entities[i] = state,
                Err(i) => entities.insert(i, state),
            }
        }

        self.frames[tick as usize & UPDATE_MASK] = ClientFrame {
            tick,
            valid,
            ps,
            entities,
        };

        if valid {
            self.last_frame = tick as i32;
            if self.state == ClientState::Connected {
                self.state = ClientState::Active;
                self.events.push_back(ClientEvent::EnteredGame);
            }
            self.events.push_back(ClientEvent::Frame { tick });
        } else {
            self.last_frame = -1;
        }
        Ok(())
    }
}

fn net_to_io(err: NetError) -> io::Error {
    match err {
        NetError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}
