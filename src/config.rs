//! Runtime knobs for the server adapter, client proxies and stream transport.
//!
//! Every struct has sensible defaults; `from_env()` overlays values from
//! `PCSC_BRIDGE_*` environment variables and ignores ones that do not parse.

use std::time::Duration;

const DEFAULT_MAX_WAIT_SECS: u64 = 300;
const DEFAULT_SERVER_EVENT_BUFFER: usize = 64;
const DEFAULT_CLIENT_EVENT_BUFFER: usize = 256;
const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound applied to every `waitForCardPresence`, whatever the client asks for
    pub max_wait: Duration,
    /// Capacity of the platform event buffer used by mock/pcsc backends
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
            event_buffer: DEFAULT_SERVER_EVENT_BUFFER,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("PCSC_BRIDGE_MAX_WAIT_SECS") {
            config.max_wait = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("PCSC_BRIDGE_EVENT_BUFFER") {
            config.event_buffer = size.max(1);
        }

        config
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How many events may queue per subscriber before the oldest are dropped
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_CLIENT_EVENT_BUFFER,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("PCSC_BRIDGE_EVENT_BUFFER") {
            config.event_buffer = size.max(1);
        }

        config
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Longest accepted JSON line; longer frames end the connection
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(len) = env_parse::<usize>("PCSC_BRIDGE_MAX_FRAME_LEN") {
            config.max_frame_len = len;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        assert_eq!(ServerConfig::default().max_wait, Duration::from_secs(300));
        assert_eq!(ClientConfig::default().event_buffer, 256);
        assert_eq!(TransportConfig::default().max_frame_len, 1024 * 1024);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("PCSC_BRIDGE_MAX_WAIT_SECS", "12");
        std::env::set_var("PCSC_BRIDGE_MAX_FRAME_LEN", "4096");
        std::env::set_var("PCSC_BRIDGE_EVENT_BUFFER", "not-a-number");

        let server = ServerConfig::from_env();
        let transport = TransportConfig::from_env();
        let client = ClientConfig::from_env();

        std::env::remove_var("PCSC_BRIDGE_MAX_WAIT_SECS");
        std::env::remove_var("PCSC_BRIDGE_MAX_FRAME_LEN");
        std::env::remove_var("PCSC_BRIDGE_EVENT_BUFFER");

        assert_eq!(server.max_wait, Duration::from_secs(12));
        assert_eq!(server.event_buffer, 64);
        assert_eq!(transport.max_frame_len, 4096);
        assert_eq!(client.event_buffer, 256);
    }
}
