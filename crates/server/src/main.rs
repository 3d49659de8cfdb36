use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};

use strafe_server::{GameServer, ServerConfig, ServerEvent};

#[derive(Parser)]
#[command(name = "strafe-server")]
#[command(about = "Strafe game server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = strafe::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = strafe::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 16)]
    max_clients: usize,

    #[arg(long, default_value_t = 30, help = "Client timeout in seconds")]
    timeout: u64,

    #[arg(long, default_value_t = strafe::CLIENT_RATE, help = "Default per-client rate cap in bytes/sec")]
    rate: u32,

    #[arg(long, default_value = "arena")]
    level: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        timeout_secs: args.timeout,
        client_rate: args.rate,
        level_name: args.level,
        ..Default::default()
    };

    let mut server = GameServer::new(&bind_addr, config)?;
    info!("server listening on {}", server.local_addr());

    let running = server.running();
    watch_stdin_for_quit(running.clone());

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        server.tick_once();
        for event in server.drain_events() {
            log_event(&event);
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    server.shutdown();
    info!("server shutting down");
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnecting { addr } => {
            info!("connection request from {}", addr);
        }
        ServerEvent::ClientConnected { slot, addr, name } => {
            info!("client {} ({}) connected from {}", slot, name, addr);
        }
        ServerEvent::ClientSpawned { slot } => {
            info!("client {} entered the game", slot);
        }
        ServerEvent::ClientDisconnected { slot, reason } => {
            info!("client {} {}", slot, reason.as_str());
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            warn!("connection denied to {}: {}", addr, reason);
        }
        ServerEvent::ClientCommand { slot, command } => {
            info!("client {} command: {}", slot, command);
        }
        ServerEvent::Error { message } => {
            error!("{}", message);
        }
    }
}

/// Typing `quit` on the server console stops the loop cleanly.
fn watch_stdin_for_quit(running: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    let _ = std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                if std::io::stdin().read_line(&mut line).is_err() {
                    return;
                }
                if line.trim() == "quit" {
                    running.store(false, std::sync::atomic::Ordering::SeqCst);
                    return;
                }
            }
        });
}
