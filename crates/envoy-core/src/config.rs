use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub request_timeout: Duration,
    pub request_attempts: u32,
    pub update_interval: Duration,
    pub refresh_check_interval: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            request_attempts: 3,
            update_interval: Duration::from_secs(60),
            refresh_check_interval: Duration::from_secs(3600),
        }
    }
}
