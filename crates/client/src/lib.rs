pub mod client;
pub mod config;
pub mod events;

pub use client::{ClientState, NetClient};
pub use config::ClientConfig;
pub use events::ClientEvent;
