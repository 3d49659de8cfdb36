use strafe::{CLIENT_RATE, DEFAULT_TICK_RATE};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    pub timeout_secs: u64,
    pub client_rate: u32,
    pub gamedir: String,
    pub level_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 16,
            timeout_secs: 30,
            client_rate: CLIENT_RATE,
            gamedir: "default".to_string(),
            level_name: "arena".to_string(),
        }
    }
}
