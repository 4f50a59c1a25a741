use serde_derive::Deserialize;
use std::error::Error;

/// Daemon configuration, loadable from a TOML file. Every field has a
/// default so a partial file (or no file at all) is valid; command line
/// flags override whatever the file supplied.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Control port the tunnel server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Regex of channels forwarded to the peer.
    #[serde(default = "default_channels")]
    pub channels_send: String,
    /// Regex of channels the peer is asked to forward to us.
    #[serde(default = "default_channels")]
    pub channels_recv: String,
    /// Request datagram transport instead of the TCP stream.
    #[serde(default)]
    pub udp: bool,
    /// Forward error correction rate; <= 1 disables coding, negative values
    /// request plain duplication.
    #[serde(default)]
    pub fec: f32,
    /// Coalescing window in milliseconds; 0 flushes every message.
    #[serde(default)]
    pub max_delay_ms: u32,
    /// Queued TCP messages older than this are dropped; 0 keeps them forever.
    #[serde(default = "default_tcp_max_age_ms")]
    pub tcp_max_age_ms: u32,
    /// Root logger severity.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    6141
}

fn default_channels() -> String {
    ".*".to_owned()
}

fn default_tcp_max_age_ms() -> u32 {
    10_000
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            port: default_port(),
            channels_send: default_channels(),
            channels_recv: default_channels(),
            udp: false,
            fec: 0.0,
            max_delay_ms: 0,
            tcp_max_age_ms: default_tcp_max_age_ms(),
            log_level: default_log_level(),
        }
    }
}

/// Reads a config file, filling in defaults for absent fields.
pub fn load(path: &str) -> Result<DaemonConfig, Box<dyn Error>> {
    let config = serdeconv::from_toml_file(path)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: DaemonConfig = serdeconv::from_toml_str("").unwrap();

        assert_eq!(config.port, 6141);
        assert_eq!(config.channels_send, ".*");
        assert_eq!(config.channels_recv, ".*");
        assert!(!config.udp);
        assert_eq!(config.fec, 0.0);
        assert_eq!(config.max_delay_ms, 0);
        assert_eq!(config.tcp_max_age_ms, 10_000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_override() {
        let config: DaemonConfig = serdeconv::from_toml_str(
            r#"
port = 7200
udp = true
fec = 2.0
"#,
        )
        .unwrap();

        assert_eq!(config.port, 7200);
        assert!(config.udp);
        assert_eq!(config.fec, 2.0);
        assert_eq!(config.tcp_max_age_ms, 10_000);
    }

    #[test]
    fn test_default_matches_empty_file() {
        let from_str: DaemonConfig = serdeconv::from_toml_str("").unwrap();
        let from_default = DaemonConfig::default();

        assert_eq!(from_str.port, from_default.port);
        assert_eq!(from_str.channels_send, from_default.channels_send);
        assert_eq!(from_str.tcp_max_age_ms, from_default.tcp_max_age_ms);
    }
}
