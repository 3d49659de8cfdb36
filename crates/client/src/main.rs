use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use glam::Vec3;
use log::{info, warn};

use strafe::UserCmd;
use strafe_client::{ClientConfig, ClientEvent, ClientState, NetClient};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Strafe game client")]
struct Args {
    #[arg(short, long, help = "Server address, e.g. 127.0.0.1:27015")]
    server: String,

    #[arg(short, long, default_value = "player")]
    name: String,

    #[arg(long, default_value_t = strafe::CLIENT_RATE, help = "Rate cap in bytes/sec")]
    rate: u32,

    #[arg(long, default_value_t = 30, help = "Connection timeout in seconds")]
    timeout: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let addr: SocketAddr = args.server.parse()?;

    let config = ClientConfig {
        name: args.name,
        rate: args.rate,
        timeout_secs: args.timeout,
        ..Default::default()
    };
    let mut client = NetClient::new(config)?;
    client.connect(addr)?;

    // Headless driver: wander in a slow circle and log what the server says.
    let tick = Duration::from_millis(16);
    let mut yaw = 0.0f32;
    loop {
        let now = Instant::now();
        yaw = (yaw + 0.5) % 360.0;
        let cmd = UserCmd {
            msec: tick.as_millis() as u8,
            angles: Vec3::new(0.0, yaw, 0.0),
            forward: 200,
            ..Default::default()
        };

        client.update(cmd, now);
        for event in client.drain_events() {
            log_event(&event);
        }
        if client.state() == ClientState::Disconnected {
            break;
        }
        std::thread::sleep(tick);
    }
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => info!("connected, precaching"),
        ClientEvent::EnteredGame => info!("entered the game"),
        ClientEvent::Disconnected { reason } => warn!("disconnected: {}", reason),
        ClientEvent::Print { text, .. } => info!("server: {}", text.trim_end()),
        ClientEvent::CenterPrint { text } => info!("*** {} ***", text.trim_end()),
        ClientEvent::Command { text } => info!("server command: {}", text),
        ClientEvent::ConfigString { index, text } => {
            info!("config string {} = {:?}", index, text);
        }
        ClientEvent::Layout { .. }
        | ClientEvent::Sound(_)
        | ClientEvent::MuzzleFlash(_)
        | ClientEvent::TempEntity(_)
        | ClientEvent::Frame { .. } => {}
    }
}
