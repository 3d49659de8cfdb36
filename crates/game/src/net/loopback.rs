use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::endpoint::DatagramSocket;
use super::stats::PacketLossSimulation;

#[derive(Debug)]
struct DelayedPacket {
    release_time: Instant,
    seq: u64,
    data: Vec<u8>,
    from: SocketAddr,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.seq == other.seq
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap; seq keeps same-instant packets FIFO.
        other
            .release_time
            .cmp(&self.release_time)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct LoopbackHub {
    queues: HashMap<SocketAddr, BinaryHeap<DelayedPacket>>,
    next_seq: u64,
}

/// In-memory datagram socket. Sockets created from the same hub exchange
/// packets by address, optionally shaped by per-socket loss and latency
/// settings, so transport behavior under loss is testable without touching
/// the network.
pub struct LoopbackSocket {
    addr: SocketAddr,
    hub: Rc<RefCell<LoopbackHub>>,
    /// Conditions applied to packets this socket sends.
    pub sim: PacketLossSimulation,
    broken: bool,
}

impl LoopbackSocket {
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let hub = Rc::new(RefCell::new(LoopbackHub::default()));
        let first = Self {
            addr: a,
            hub: Rc::clone(&hub),
            sim: PacketLossSimulation::default(),
            broken: false,
        };
        let second = Self {
            addr: b,
            hub,
            sim: PacketLossSimulation::default(),
            broken: false,
        };
        (first, second)
    }

    /// Another socket on the same hub, for multi-peer setups.
    pub fn attach(&self, addr: SocketAddr) -> Self {
        Self {
            addr,
            hub: Rc::clone(&self.hub),
            sim: PacketLossSimulation::default(),
            broken: false,
        }
    }

    /// While set, everything sent from this socket is silently lost.
    pub fn break_link(&mut self, broken: bool) {
        self.broken = broken;
    }

    /// Packets queued for this socket, delivered or not.
    pub fn pending(&self) -> usize {
        self.hub
            .borrow()
            .queues
            .get(&self.addr)
            .map_or(0, |q| q.len())
    }
}

impl DatagramSocket for LoopbackSocket {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.broken || self.sim.should_drop() {
            return Ok(buf.len());
        }

        let delay = Duration::from_millis(self.sim.delay_ms() as u64);
        let mut hub = self.hub.borrow_mut();
        let seq = hub.next_seq;
        hub.next_seq += 1;
        hub.queues.entry(addr).or_default().push(DelayedPacket {
            release_time: Instant::now() + delay,
            seq,
            data: buf.to_vec(),
            from: self.addr,
        });
        Ok(buf.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut hub = self.hub.borrow_mut();
        let Some(queue) = hub.queues.get_mut(&self.addr) else {
            return Ok(None);
        };

        let now = Instant::now();
        match queue.peek() {
            Some(p) if p.release_time <= now => {
                let p = queue.pop().unwrap();
                let n = p.data.len().min(buf.len());
                buf[..n].copy_from_slice(&p.data[..n]);
                Ok(Some((n, p.from)))
            }
            _ => Ok(None),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> SocketAddr {
        format!("10.0.0.{}:1000", n).parse().unwrap()
    }

    #[test]
    fn test_pair_round_trip() {
        let (mut a, mut b) = LoopbackSocket::pair(addr(1), addr(2));

        a.send_to(b"first", addr(2)).unwrap();
        a.send_to(b"second", addr(2)).unwrap();

        let mut buf = [0u8; 32];
        let (n, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"first");
        assert_eq!(from, addr(1));

        let (n, _) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"second");
        assert!(b.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_broken_link_swallows_packets() {
        let (mut a, mut b) = LoopbackSocket::pair(addr(1), addr(2));

        a.break_link(true);
        a.send_to(b"lost", addr(2)).unwrap();
        let mut buf = [0u8; 32];
        assert!(b.recv_from(&mut buf).unwrap().is_none());

        a.break_link(false);
        a.send_to(b"through", addr(2)).unwrap();
        assert!(b.recv_from(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_latency_holds_delivery() {
        let (mut a, mut b) = LoopbackSocket::pair(addr(1), addr(2));
        a.sim = PacketLossSimulation {
            enabled: true,
            min_latency_ms: 20,
            max_latency_ms: 20,
            ..Default::default()
        };

        a.send_to(b"delayed", addr(2)).unwrap();
        let mut buf = [0u8; 32];
        assert!(b.recv_from(&mut buf).unwrap().is_none());
        assert_eq!(b.pending(), 1);

        std::thread::sleep(Duration::from_millis(30));
        let (n, _) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"delayed");
    }

    #[test]
    fn test_attached_socket_joins_hub() {
        let (mut a, mut b) = LoopbackSocket::pair(addr(1), addr(2));
        let mut c = a.attach(addr(3));

        c.send_to(b"from c", addr(2)).unwrap();
        a.send_to(b"from a", addr(3)).unwrap();

        let mut buf = [0u8; 32];
        let (n, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"from c");
        assert_eq!(from, addr(3));

        let (n, from) = c.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"from a");
        assert_eq!(from, addr(1));
    }
}
