use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::endpoint::DatagramSocket;
use super::msg::MessageBuffer;
use super::protocol::{CLIENT_RATE, CLIENT_RATE_MAX, CLIENT_RATE_MIN, MAX_MSG_SIZE};
use super::stats::NetworkStats;
use super::NetError;

/// Sequence word marking a connectionless packet.
pub const OOB_SEQUENCE: u32 = u32::MAX;

const RELIABLE_BIT: u32 = 1 << 31;
const SEQUENCE_MASK: u32 = RELIABLE_BIT - 1;

const RTT_WINDOW: usize = 64;

/// Suppressed unreliable volume at which `need_reliable` trips.
const RELIABLE_ESCALATE_BYTES: usize = 4096;

/// Wraparound-safe comparison within the 31-bit sequence space.
pub fn sequence_greater_than(a: u32, b: u32) -> bool {
    const HALF: u32 = 1 << 30;
    ((a > b) && (a - b <= HALF)) || ((a < b) && (b - a > HALF))
}

/// Sends a connectionless text packet outside any channel.
pub fn out_of_band(
    socket: &mut dyn DatagramSocket,
    addr: SocketAddr,
    text: &str,
) -> Result<(), NetError> {
    let mut buf = Vec::with_capacity(4 + text.len());
    buf.extend_from_slice(&OOB_SEQUENCE.to_le_bytes());
    buf.extend_from_slice(text.as_bytes());
    socket.send_to(&buf, addr)?;
    Ok(())
}

pub fn is_connectionless(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == OOB_SEQUENCE.to_le_bytes()
}

/// Text of a connectionless packet, trailing whitespace stripped.
pub fn connectionless_text(data: &[u8]) -> Option<String> {
    if !is_connectionless(data) {
        return None;
    }
    let text = String::from_utf8_lossy(&data[4..]);
    Some(text.trim_matches(char::from(0)).trim_end().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanSource {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanState {
    Unestablished,
    Established,
    TimedOut,
}

/// Sequenced datagram channel with a single reliable chunk in flight.
///
/// Every outgoing packet carries the local sequence, an acknowledgment of
/// the last packet seen from the remote, and (while one is pending) the
/// current reliable chunk tagged with a one-bit alternating sequence. The
/// chunk is re-sent byte-identical with every transmit until the remote's
/// acknowledgment bit flips to match; the receiver uses the same bit to
/// recognize re-sends it has already delivered.
///
/// Client-to-server packets additionally carry the client's `qport`, so a
/// connection survives address rewrites on the client side.
#[derive(Debug)]
pub struct Channel {
    source: ChanSource,
    state: ChanState,
    remote: SocketAddr,
    qport: u16,

    outgoing_sequence: u32,
    incoming_sequence: u32,
    incoming_acknowledged: u32,
    incoming_reliable_sequence: bool,
    incoming_reliable_acknowledged: bool,
    reliable_sequence: bool,

    /// Staging buffer for reliable content awaiting promotion. Owners write
    /// into it directly and watch `overflowed`.
    pub reliable: MessageBuffer,
    unacked: Option<Vec<u8>>,

    last_received: Instant,
    last_sent: Instant,

    rate: u32,
    rate_window_start: Instant,
    rate_window_bytes: u32,
    suppressed_bytes: usize,

    pending_rtt: VecDeque<(u32, Instant)>,
    srtt: f32,
    rtt_var: f32,

    stats: NetworkStats,
    scratch: Vec<u8>,
}

impl Channel {
    pub fn new(source: ChanSource, remote: SocketAddr, qport: u16) -> Self {
        let now = Instant::now();
        let mut reliable = MessageBuffer::new(MAX_MSG_SIZE - 16);
        reliable.allow_overflow = true;

        Self {
            source,
            state: ChanState::Unestablished,
            remote,
            qport,
            outgoing_sequence: 1,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            incoming_reliable_sequence: false,
            incoming_reliable_acknowledged: false,
            reliable_sequence: false,
            reliable,
            unacked: None,
            last_received: now,
            last_sent: now,
            rate: CLIENT_RATE,
            rate_window_start: now,
            rate_window_bytes: 0,
            suppressed_bytes: 0,
            pending_rtt: VecDeque::with_capacity(RTT_WINDOW),
            srtt: 100.0,
            rtt_var: 50.0,
            stats: NetworkStats::default(),
            scratch: Vec::with_capacity(MAX_MSG_SIZE),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn qport(&self) -> u16 {
        self.qport
    }

    pub fn state(&self) -> ChanState {
        self.state
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn rtt(&self) -> f32 {
        self.srtt
    }

    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    pub fn incoming_acknowledged(&self) -> u32 {
        self.incoming_acknowledged
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate.clamp(CLIENT_RATE_MIN, CLIENT_RATE_MAX);
    }

    /// Follows a client whose address was rewritten mid-connection; the
    /// qport is what actually identifies it.
    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = remote;
    }

    /// Whether a fresh reliable chunk could be promoted on the next
    /// transmit; false while one is still unacknowledged.
    pub fn can_reliable(&self) -> bool {
        self.unacked.is_none()
    }

    pub fn has_unacked_reliable(&self) -> bool {
        self.unacked.is_some()
    }

    /// True once the rate limiter has suppressed enough unreliable traffic
    /// that updates are going stale; callers should escalate the next
    /// state-bearing content into the reliable stream.
    pub fn need_reliable(&self) -> bool {
        self.suppressed_bytes >= RELIABLE_ESCALATE_BYTES
    }

    pub fn is_timed_out(&self, now: Instant, limit: Duration) -> bool {
        now.duration_since(self.last_received) > limit
    }

    pub fn mark_timed_out(&mut self) {
        self.state = ChanState::TimedOut;
    }

    /// The qport of a client-to-server packet, for routing before any
    /// channel is consulted.
    pub fn read_qport(data: &[u8]) -> Option<u16> {
        if data.len() < 10 || is_connectionless(data) {
            return None;
        }
        Some(u16::from_le_bytes([data[8], data[9]]))
    }

    fn rate_exceeded(&mut self, now: Instant) -> bool {
        if self.rate == 0 {
            return false;
        }
        if now.duration_since(self.rate_window_start) >= Duration::from_secs(1) {
            self.rate_window_start = now;
            self.rate_window_bytes = 0;
        }
        self.rate_window_bytes > self.rate
    }

    /// Frames and sends one packet: header, the pending reliable chunk if
    /// any, then the unreliable payload. Promotes staged reliable content
    /// first when nothing is in flight. The unreliable part is dropped when
    /// the rate budget is spent or the datagram would exceed the MTU;
    /// reliable content is never dropped, only re-sent.
    pub fn transmit(
        &mut self,
        socket: &mut dyn DatagramSocket,
        unreliable: &[u8],
        now: Instant,
    ) -> Result<(), NetError> {
        if self.state == ChanState::TimedOut {
            return Err(NetError::Timeout);
        }

        if self.unacked.is_none() && !self.reliable.is_empty() {
            self.unacked = Some(self.reliable.as_slice().to_vec());
            self.reliable.clear();
            self.reliable_sequence = !self.reliable_sequence;
            self.suppressed_bytes = 0;
        }

        let mut unreliable = unreliable;
        if !unreliable.is_empty() && self.rate_exceeded(now) {
            debug!(
                "channel to {}: rate limited, suppressing {} unreliable bytes",
                self.remote,
                unreliable.len()
            );
            self.suppressed_bytes += unreliable.len();
            self.stats.suppressed += 1;
            unreliable = &[];
        }

        let reliable_len = self.unacked.as_ref().map_or(0, |c| c.len());
        let header_len = 8 + if self.source == ChanSource::Client { 2 } else { 0 } + 2;

        if header_len + reliable_len + unreliable.len() > MAX_MSG_SIZE {
            if !unreliable.is_empty() {
                warn!(
                    "channel to {}: datagram over MTU, dumping {} unreliable bytes",
                    self.remote,
                    unreliable.len()
                );
                unreliable = &[];
            }
            if header_len + reliable_len > MAX_MSG_SIZE {
                return Err(NetError::Overflow);
            }
        }

        let w0 = (self.outgoing_sequence & SEQUENCE_MASK)
            | if self.unacked.is_some() && self.reliable_sequence {
                RELIABLE_BIT
            } else {
                0
            };
        let w1 = (self.incoming_sequence & SEQUENCE_MASK)
            | if self.incoming_reliable_sequence {
                RELIABLE_BIT
            } else {
                0
            };

        self.scratch.clear();
        self.scratch.extend_from_slice(&w0.to_le_bytes());
        self.scratch.extend_from_slice(&w1.to_le_bytes());
        if self.source == ChanSource::Client {
            self.scratch.extend_from_slice(&self.qport.to_le_bytes());
        }
        self.scratch.extend_from_slice(&(reliable_len as u16).to_le_bytes());
        if let Some(chunk) = &self.unacked {
            self.scratch.extend_from_slice(chunk);
        }
        self.scratch.extend_from_slice(unreliable);

        socket.send_to(&self.scratch, self.remote)?;

        if self.pending_rtt.len() >= RTT_WINDOW {
            self.pending_rtt.pop_front();
        }
        self.pending_rtt.push_back((self.outgoing_sequence, now));

        if !unreliable.is_empty() {
            self.suppressed_bytes = 0;
        }
        self.rate_window_bytes += self.scratch.len() as u32;
        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1) & SEQUENCE_MASK;
        self.last_sent = now;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += self.scratch.len() as u64;

        Ok(())
    }

    /// Validates an incoming packet and returns the opcode stream to parse,
    /// reliable bytes first. Stale or duplicate sequences are absorbed with
    /// `Ok(None)`; a reliable chunk the channel has already delivered is
    /// skipped via its length prefix.
    pub fn process<'a>(
        &mut self,
        data: &'a [u8],
        now: Instant,
    ) -> Result<Option<&'a [u8]>, NetError> {
        let header_len = 8 + if self.source == ChanSource::Server { 2 } else { 0 };
        if data.len() < header_len + 2 {
            return Err(NetError::Malformed("runt packet"));
        }

        let w0 = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if w0 == OOB_SEQUENCE {
            return Err(NetError::Malformed("connectionless packet on channel"));
        }
        let w1 = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        let sequence = w0 & SEQUENCE_MASK;
        let chunk_bit = w0 & RELIABLE_BIT != 0;
        let acknowledged = w1 & SEQUENCE_MASK;
        let ack_bit = w1 & RELIABLE_BIT != 0;

        if !sequence_greater_than(sequence, self.incoming_sequence) {
            debug!(
                "channel from {}: stale sequence {} (at {})",
                self.remote, sequence, self.incoming_sequence
            );
            self.stats.packets_dropped += 1;
            return Ok(None);
        }

        let dropped = sequence.wrapping_sub(self.incoming_sequence).wrapping_sub(1) & SEQUENCE_MASK;
        if dropped > 0 {
            debug!("channel from {}: {} packets dropped", self.remote, dropped);
            self.stats.packets_lost += dropped as u64;
        }

        self.incoming_sequence = sequence;
        self.incoming_acknowledged = acknowledged;
        self.incoming_reliable_acknowledged = ack_bit;

        if self.unacked.is_some() && ack_bit == self.reliable_sequence {
            self.unacked = None;
        }

        self.update_rtt(acknowledged, now);

        let mut off = header_len;
        let reliable_len = u16::from_le_bytes([data[off], data[off + 1]]) as usize;
        off += 2;
        if off + reliable_len > data.len() {
            return Err(NetError::Truncated);
        }

        let payload_start = if reliable_len > 0 {
            if chunk_bit != self.incoming_reliable_sequence {
                self.incoming_reliable_sequence = chunk_bit;
                off
            } else {
                debug!("channel from {}: duplicate reliable chunk", self.remote);
                self.stats.duplicate_chunks += 1;
                off + reliable_len
            }
        } else {
            off
        };

        self.last_received = now;
        if self.state == ChanState::Unestablished {
            self.state = ChanState::Established;
        }
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        Ok(Some(&data[payload_start..]))
    }

    fn update_rtt(&mut self, acknowledged: u32, now: Instant) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let mut sample = None;
        while let Some(&(seq, sent)) = self.pending_rtt.front() {
            if sequence_greater_than(seq, acknowledged) {
                break;
            }
            if seq == acknowledged {
                sample = Some(now.duration_since(sent).as_secs_f32() * 1000.0);
            }
            self.pending_rtt.pop_front();
        }

        if let Some(rtt) = sample {
            let diff = (rtt - self.srtt).abs();
            self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
            self.stats.rtt_ms = self.srtt;
            self.stats.rtt_variance = self.rtt_var;
        }
    }
}
