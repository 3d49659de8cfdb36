use strafe::CLIENT_RATE;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub rate: u32,
    pub timeout_secs: u64,
    pub retry_interval_secs: f32,
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "player".to_string(),
            rate: CLIENT_RATE,
            timeout_secs: 30,
            retry_interval_secs: 3.0,
            max_retries: 10,
        }
    }
}
