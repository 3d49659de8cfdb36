use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use strafe::{
    connectionless_text, is_connectionless, out_of_band, ChanSource, ChanState, Channel,
    DatagramSocket, LoopbackSocket, NetError, UdpTransport,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn wait_for_datagram(socket: &mut UdpTransport, timeout_ms: u64) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = [0u8; 2048];
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if let Some((len, from)) = socket.recv_from(&mut buf).unwrap() {
            return Some((buf[..len].to_vec(), from));
        }
        thread::sleep(Duration::from_millis(1));
    }
    None
}

#[test]
fn test_channel_round_trip_over_udp() {
    let port = next_port();
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let client_addr: SocketAddr = format!("127.0.0.1:{}", port + 1).parse().unwrap();

    let mut server_socket = UdpTransport::bind(server_addr).unwrap();
    let mut client_socket = UdpTransport::bind(client_addr).unwrap();

    let mut client = Channel::new(ChanSource::Client, server_addr, 2112);
    client
        .transmit(&mut client_socket, b"status", Instant::now())
        .unwrap();

    let (data, from) = wait_for_datagram(&mut server_socket, 200).expect("No packet received");
    assert_eq!(from, client_addr);
    assert_eq!(Channel::read_qport(&data), Some(2112));

    let mut server = Channel::new(ChanSource::Server, from, 2112);
    let payload = server
        .process(&data, Instant::now())
        .unwrap()
        .expect("fresh packet");
    assert_eq!(payload, b"status");
    assert_eq!(server.state(), ChanState::Established);

    server
        .transmit(&mut server_socket, b"ok", Instant::now())
        .unwrap();

    let (data, _) = wait_for_datagram(&mut client_socket, 200).expect("No packet received");
    let payload = client
        .process(&data, Instant::now())
        .unwrap()
        .expect("fresh packet");
    assert_eq!(payload, b"ok");
    assert_eq!(client.incoming_acknowledged(), 1);
}

#[test]
fn test_connectionless_exchange_over_udp() {
    let port = next_port();
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let client_addr: SocketAddr = format!("127.0.0.1:{}", port + 1).parse().unwrap();

    let mut server_socket = UdpTransport::bind(server_addr).unwrap();
    let mut client_socket = UdpTransport::bind(client_addr).unwrap();

    out_of_band(&mut client_socket, server_addr, "get_challenge").unwrap();

    let (data, from) = wait_for_datagram(&mut server_socket, 200).expect("No packet received");
    assert!(is_connectionless(&data));
    assert_eq!(Channel::read_qport(&data), None);
    assert_eq!(connectionless_text(&data).unwrap(), "get_challenge");

    out_of_band(&mut server_socket, from, "challenge 12345").unwrap();

    let (data, _) = wait_for_datagram(&mut client_socket, 200).expect("No packet received");
    assert_eq!(connectionless_text(&data).unwrap(), "challenge 12345");
}

#[test]
fn test_reliable_delivery_under_loss() {
    let server_addr: SocketAddr = "10.0.0.1:27015".parse().unwrap();
    let client_addr: SocketAddr = "10.0.0.2:27016".parse().unwrap();
    let (mut server_socket, mut client_socket) = LoopbackSocket::pair(server_addr, client_addr);

    client_socket.sim.enabled = true;
    client_socket.sim.loss_percent = 0.4;

    let mut client = Channel::new(ChanSource::Client, server_addr, 1);
    let mut server = Channel::new(ChanSource::Server, client_addr, 1);

    client
        .reliable
        .write_bytes(b"userinfo \\name\\player\n")
        .unwrap();

    let mut delivered = Vec::new();
    let mut buf = [0u8; 2048];
    for _ in 0..400 {
        let now = Instant::now();
        client.transmit(&mut client_socket, &[], now).unwrap();
        while let Some((len, _)) = server_socket.recv_from(&mut buf).unwrap() {
            if let Some(payload) = server.process(&buf[..len], now).unwrap() {
                delivered.extend_from_slice(payload);
            }
        }
        server.transmit(&mut server_socket, &[], now).unwrap();
        while let Some((len, _)) = client_socket.recv_from(&mut buf).unwrap() {
            let _ = client.process(&buf[..len], now).unwrap();
        }
        if !client.has_unacked_reliable() && !delivered.is_empty() {
            break;
        }
    }

    // Delivered exactly once no matter how many re-sends the loss forced.
    assert_eq!(delivered, b"userinfo \\name\\player\n");
    assert!(client.can_reliable());
}

#[test]
fn test_unreliable_stream_stays_ordered_under_loss() {
    let a_addr: SocketAddr = "10.0.0.1:27015".parse().unwrap();
    let b_addr: SocketAddr = "10.0.0.2:27016".parse().unwrap();
    let (mut b_socket, mut a_socket) = LoopbackSocket::pair(b_addr, a_addr);

    a_socket.sim.enabled = true;
    a_socket.sim.loss_percent = 0.3;

    let mut a = Channel::new(ChanSource::Client, b_addr, 9);
    let mut b = Channel::new(ChanSource::Server, a_addr, 9);

    let mut seen = Vec::new();
    let mut buf = [0u8; 2048];
    for i in 0..100u32 {
        let now = Instant::now();
        a.transmit(&mut a_socket, &i.to_le_bytes(), now).unwrap();
        while let Some((len, _)) = b_socket.recv_from(&mut buf).unwrap() {
            if let Some(payload) = b.process(&buf[..len], now).unwrap() {
                seen.push(u32::from_le_bytes(payload.try_into().unwrap()));
            }
        }
    }

    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    // Gaps up to the last packet that made it through are counted as lost.
    let received = seen.len() as u64;
    assert_eq!(b.stats().packets_lost, b.incoming_sequence() as u64 - received);
}

#[test]
fn test_broken_link_times_out() {
    let a_addr: SocketAddr = "10.0.0.1:27015".parse().unwrap();
    let b_addr: SocketAddr = "10.0.0.2:27016".parse().unwrap();
    let (mut b_socket, mut a_socket) = LoopbackSocket::pair(b_addr, a_addr);

    let mut a = Channel::new(ChanSource::Client, b_addr, 7);
    let mut b = Channel::new(ChanSource::Server, a_addr, 7);

    let now = Instant::now();
    a.transmit(&mut a_socket, b"tick", now).unwrap();

    let mut buf = [0u8; 2048];
    let (len, _) = b_socket.recv_from(&mut buf).unwrap().expect("packet");
    assert!(b.process(&buf[..len], now).unwrap().is_some());

    a_socket.break_link(true);
    a.transmit(&mut a_socket, b"tick", now).unwrap();
    assert_eq!(b_socket.pending(), 0);

    assert!(!b.is_timed_out(now, Duration::from_secs(30)));
    assert!(b.is_timed_out(now + Duration::from_secs(31), Duration::from_secs(30)));

    b.mark_timed_out();
    assert_eq!(b.state(), ChanState::TimedOut);
    assert!(matches!(
        b.transmit(&mut b_socket, b"", Instant::now()),
        Err(NetError::Timeout)
    ));
}
