use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::net::{DEFAULT_SERVER_PORT, MAX_PACKET_SIZE, PACKET_OVERHEAD, SYNC_CONSOLE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Tcp,
    #[default]
    Udp,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Tcp => "tcp",
            ProtocolType::Udp => "udp",
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProtocolType::Tcp),
            "udp" => Ok(ProtocolType::Udp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Startup values for every console variable plus replication tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplayerConfig {
    pub client_port: u16,
    pub server_addr: String,
    pub server_port: u16,
    pub port: u16,
    pub map: String,
    pub protocol: ProtocolType,
    pub dedicated: bool,
    pub server_send_rate_ms: u32,
    pub activation_time_slice_ms: u32,
    pub default_player_spawn_asset: String,

    pub sync_console_capacity: usize,
    pub console_queue_capacity: usize,
    pub max_entity_updates_per_packet: usize,
    pub max_rpcs_per_packet: usize,
    pub max_payload_size: usize,
    pub max_remote_entities_pending_creation: usize,
    pub max_proxy_entity_send_count: usize,
    /// Upper bound on the entities one client sees at a time.
    pub max_window_entities: usize,
    /// Zero replicates every entity to every client.
    pub relevance_radius: f32,
    pub resend_timeout_ms: u64,
    pub orphaned_rpc_timeout_ms: u64,
    pub blend_rate: f32,

    pub connection_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for MultiplayerConfig {
    fn default() -> Self {
        Self {
            client_port: 0,
            server_addr: "127.0.0.1".to_string(),
            server_port: DEFAULT_SERVER_PORT,
            port: DEFAULT_SERVER_PORT,
            map: "nolevel".to_string(),
            protocol: ProtocolType::Udp,
            dedicated: false,
            server_send_rate_ms: 50,
            activation_time_slice_ms: 0,
            default_player_spawn_asset: "prefabs/player.network.spawnable".to_string(),

            sync_console_capacity: SYNC_CONSOLE_CAPACITY,
            console_queue_capacity: 1024,
            max_entity_updates_per_packet: 32,
            max_rpcs_per_packet: 32,
            max_payload_size: MAX_PACKET_SIZE - PACKET_OVERHEAD,
            max_remote_entities_pending_creation: 256,
            max_proxy_entity_send_count: 64,
            max_window_entities: 1024,
            relevance_radius: 0.0,
            resend_timeout_ms: 250,
            orphaned_rpc_timeout_ms: 5000,
            blend_rate: 10.0,

            connection_timeout_ms: 10_000,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl MultiplayerConfig {
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MultiplayerConfig::from_toml(
            r#"
            map = "arena"
            server_send_rate_ms = 33
            protocol = "udp"
            "#,
        )
        .unwrap();

        assert_eq!(config.map, "arena");
        assert_eq!(config.server_send_rate_ms, 33);
        assert_eq!(config.sync_console_capacity, 32);
        assert_eq!(config.port, DEFAULT_SERVER_PORT);
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("TCP".parse::<ProtocolType>(), Ok(ProtocolType::Tcp));
        assert_eq!("udp".parse::<ProtocolType>(), Ok(ProtocolType::Udp));
        assert!("quic".parse::<ProtocolType>().is_err());
    }
}
