use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::{DEFAULT_MAX_BACKLOG, LOBBY_PORT};

pub const DEFAULT_ADVERTISEMENT: &str = "JOIN MY SPROCKET GAME";
pub const MAX_LOBBIES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub bind_ip: IpAddr,
    pub lobby_port: u16,
    pub game_port: u16,
    pub broadcast_ip: IpAddr,
    pub broadcast_interval_ms: u64,
    pub advertisement: String,
    pub validate_advertisement: bool,
    pub max_lobbies: usize,
    pub connect_timeout_ms: u64,
    pub player_name: String,
    pub data_timeout_ms: u64,
    pub max_timeouts: u32,
    pub sync_timeout_ms: u64,
    pub idle_sleep_ms: u64,
    pub check_positions: bool,
    pub max_outbound_backlog: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            lobby_port: LOBBY_PORT,
            game_port: LOBBY_PORT,
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_interval_ms: 1000,
            advertisement: String::from(DEFAULT_ADVERTISEMENT),
            validate_advertisement: false,
            max_lobbies: MAX_LOBBIES,
            connect_timeout_ms: 3000,
            player_name: String::from("PLAYER"),
            data_timeout_ms: 2000,
            max_timeouts: 3,
            sync_timeout_ms: 15_000,
            idle_sleep_ms: 100,
            check_positions: false,
            max_outbound_backlog: DEFAULT_MAX_BACKLOG,
        }
    }
}

impl NetConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.game_port)
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.lobby_port)
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_ip, self.lobby_port)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Everything on the loopback interface, for running several peers on one machine.
    pub fn loopback(lobby_port: u16, game_port: u16) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            lobby_port,
            game_port,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_share_lobby_port() {
        let config = NetConfig::default();
        assert_eq!(config.lobby_port, config.game_port);
        assert_eq!(config.broadcast_addr().port(), LOBBY_PORT);
        assert_eq!(config.max_lobbies, MAX_LOBBIES);
        assert!(!config.validate_advertisement);
    }

    #[test]
    fn test_loopback_addresses() {
        let config = NetConfig::loopback(41000, 41001);
        assert_eq!(config.listen_addr(), "127.0.0.1:41001".parse().unwrap());
        assert_eq!(config.broadcast_addr(), "127.0.0.1:41000".parse().unwrap());
    }
}
