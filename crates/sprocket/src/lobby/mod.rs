use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::config::NetConfig;
use crate::net::socket::{bind_udp_broadcast, is_would_block};
use crate::net::{MAX_MESSAGE_LENGTH, OsErrorCode, SocketError, SocketHandle};
use crate::session::{Session, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery address already in use: {0}")]
    AddressInUse(SocketError),
    #[error(transparent)]
    Socket(SocketError),
    #[error("discovery socket is closed")]
    Closed,
    #[error("receive failed: {0}")]
    Receive(io::Error),
    #[error("advertisement failed: {0}")]
    Send(io::Error),
    #[error("no lobby #{0}")]
    NoSuchLobby(usize),
}

impl From<SocketError> for DiscoveryError {
    fn from(err: SocketError) -> Self {
        if err.is_addr_in_use() {
            DiscoveryError::AddressInUse(err)
        } else {
            DiscoveryError::Socket(err)
        }
    }
}

impl DiscoveryError {
    pub fn os_code(&self) -> Option<OsErrorCode> {
        match self {
            DiscoveryError::AddressInUse(e) | DiscoveryError::Socket(e) => Some(e.os_code()),
            DiscoveryError::Receive(e) | DiscoveryError::Send(e) => Some(OsErrorCode::of(e)),
            DiscoveryError::Closed | DiscoveryError::NoSuchLobby(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LobbyInfo {
    /// Where the advertisement came from.
    pub source: SocketAddr,
    pub found_at: Instant,
}

impl LobbyInfo {
    pub fn host_ip(&self) -> IpAddr {
        self.source.ip()
    }
}

/// Host side: periodically announces the lobby on the discovery port.
#[derive(Debug)]
pub struct Advertiser {
    socket: SocketHandle<UdpSocket>,
    target: SocketAddr,
    payload: Vec<u8>,
    interval: Duration,
    next_send: Option<Instant>,
    sent: u64,
}

impl Advertiser {
    pub fn start(config: &NetConfig) -> Result<Self, DiscoveryError> {
        let socket = bind_udp_broadcast(SocketAddr::new(config.bind_ip, 0))?;
        log::info!(
            "Advertising lobby to {} every {:?}",
            config.broadcast_addr(),
            config.broadcast_interval()
        );
        Ok(Self {
            socket: SocketHandle::new(socket),
            target: config.broadcast_addr(),
            payload: config.advertisement.as_bytes().to_vec(),
            interval: config.broadcast_interval(),
            next_send: None,
            sent: 0,
        })
    }

    pub fn is_active(&self) -> bool {
        self.socket.is_open()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Sends one advertisement if the interval has elapsed. Returns whether one went out.
    pub fn tick(&mut self, now: Instant) -> Result<bool, DiscoveryError> {
        let socket = self.socket.get().ok_or(DiscoveryError::Closed)?;
        if self.next_send.is_some_and(|due| now < due) {
            return Ok(false);
        }

        match socket.send_to(&self.payload, self.target) {
            Ok(_) => {
                self.sent += 1;
                self.next_send = Some(now + self.interval);
                log::debug!("Advertised lobby to {}", self.target);
                Ok(true)
            }
            Err(e) if is_would_block(&e) => Ok(false),
            Err(e) => Err(DiscoveryError::Send(e)),
        }
    }

    pub fn stop(&mut self) -> bool {
        let stopped = self.socket.close();
        if stopped {
            log::info!("Stopped advertising lobby");
        }
        stopped
    }
}

/// Client side: collects distinct advertising hosts.
#[derive(Debug)]
pub struct LobbySearch {
    socket: SocketHandle<UdpSocket>,
    lobbies: Vec<LobbyInfo>,
    max_lobbies: usize,
    advertisement: Vec<u8>,
    validate_advertisement: bool,
    game_port: u16,
    recv_buffer: Box<[u8; MAX_MESSAGE_LENGTH]>,
}

impl LobbySearch {
    pub fn start(config: &NetConfig) -> Result<Self, DiscoveryError> {
        let addr = config.discovery_addr();
        let socket = bind_udp_broadcast(addr)?;
        log::info!("Searching for lobbies on {}", addr);
        Ok(Self {
            socket: SocketHandle::new(socket),
            lobbies: Vec::with_capacity(config.max_lobbies),
            max_lobbies: config.max_lobbies,
            advertisement: config.advertisement.as_bytes().to_vec(),
            validate_advertisement: config.validate_advertisement,
            game_port: config.game_port,
            recv_buffer: Box::new([0u8; MAX_MESSAGE_LENGTH]),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.get().and_then(|s| s.local_addr().ok())
    }

    /// Drains pending advertisements. Returns how many new lobbies were recorded.
    pub fn tick(&mut self) -> Result<usize, DiscoveryError> {
        let mut found = 0;
        loop {
            let socket = self.socket.get().ok_or(DiscoveryError::Closed)?;
            let (size, source) = match socket.recv_from(&mut self.recv_buffer[..]) {
                Ok(received) => received,
                Err(e) if is_would_block(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(DiscoveryError::Receive(e)),
            };

            if &self.recv_buffer[..size] != self.advertisement.as_slice() {
                if self.validate_advertisement {
                    log::debug!("Ignoring foreign datagram from {}", source);
                    continue;
                }
                log::warn!("Unrecognized advertisement from {}, accepting anyway", source);
            }

            if self.record(source) {
                found += 1;
            }
        }
        Ok(found)
    }

    fn record(&mut self, source: SocketAddr) -> bool {
        if self.lobbies.len() >= self.max_lobbies || self.lobbies.iter().any(|l| l.source == source)
        {
            return false;
        }
        log::info!("Found a game at {}", source);
        self.lobbies.push(LobbyInfo {
            source,
            found_at: Instant::now(),
        });
        true
    }

    pub fn num_found(&self) -> usize {
        self.lobbies.len()
    }

    pub fn lobbies(&self) -> &[LobbyInfo] {
        &self.lobbies
    }

    /// TCP address of the nth lobby's host.
    pub fn host_address(&self, n: usize) -> Option<SocketAddr> {
        self.lobbies
            .get(n)
            .map(|lobby| SocketAddr::new(lobby.host_ip(), self.game_port))
    }

    /// Connects to the nth lobby's host and sends the join request.
    pub fn join(&self, n: usize, config: &NetConfig) -> Result<Session, SessionError> {
        let addr = self
            .host_address(n)
            .ok_or(SessionError::Discovery(DiscoveryError::NoSuchLobby(n)))?;
        Session::join(addr, config)
    }

    pub fn dispose(&mut self) -> bool {
        self.lobbies.clear();
        self.socket.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::thread;

    use super::*;

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(46000);

    fn next_port() -> u16 {
        PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
    }

    fn wait_for_lobbies(search: &mut LobbySearch, count: usize) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            search.tick().unwrap();
            if search.num_found() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_advertiser_respects_interval() {
        let config = NetConfig {
            broadcast_interval_ms: 1000,
            ..NetConfig::loopback(next_port(), next_port())
        };
        let mut advertiser = Advertiser::start(&config).unwrap();
        let now = Instant::now();

        assert!(advertiser.tick(now).unwrap());
        assert!(!advertiser.tick(now + Duration::from_millis(500)).unwrap());
        assert!(advertiser.tick(now + Duration::from_millis(1000)).unwrap());
        assert_eq!(advertiser.sent(), 2);

        assert!(advertiser.stop());
        assert!(!advertiser.stop());
        assert!(matches!(
            advertiser.tick(now),
            Err(DiscoveryError::Closed)
        ));
    }

    #[test]
    fn test_search_finds_and_dedupes() {
        let config = NetConfig::loopback(next_port(), next_port());
        let mut search = LobbySearch::start(&config).unwrap();
        let mut advertiser = Advertiser::start(&config).unwrap();

        let now = Instant::now();
        advertiser.tick(now).unwrap();
        assert!(wait_for_lobbies(&mut search, 1));
        let first_seen = search.lobbies()[0].found_at;

        advertiser.tick(now + Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        search.tick().unwrap();

        assert_eq!(search.num_found(), 1);
        assert_eq!(search.lobbies()[0].found_at, first_seen);
        assert_eq!(search.lobbies()[0].host_ip(), config.bind_ip);
        assert_eq!(
            search.host_address(0),
            Some(SocketAddr::new(config.bind_ip, config.game_port))
        );
        assert_eq!(search.host_address(1), None);
    }

    #[test]
    fn test_search_caps_lobbies() {
        let config = NetConfig {
            max_lobbies: 2,
            ..NetConfig::loopback(next_port(), next_port())
        };
        let mut search = LobbySearch::start(&config).unwrap();
        let target = search.local_addr().unwrap();

        let senders: Vec<UdpSocket> = (0..4)
            .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
            .collect();
        for sender in &senders {
            sender
                .send_to(config.advertisement.as_bytes(), target)
                .unwrap();
        }

        assert!(wait_for_lobbies(&mut search, 2));
        thread::sleep(Duration::from_millis(20));
        search.tick().unwrap();
        assert_eq!(search.num_found(), 2);
    }

    #[test]
    fn test_validation_rejects_foreign_payload() {
        let config = NetConfig {
            validate_advertisement: true,
            ..NetConfig::loopback(next_port(), next_port())
        };
        let mut search = LobbySearch::start(&config).unwrap();
        let target = search.local_addr().unwrap();

        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        stranger.send_to(b"HELLO?", target).unwrap();
        thread::sleep(Duration::from_millis(20));
        search.tick().unwrap();
        assert_eq!(search.num_found(), 0);

        stranger
            .send_to(config.advertisement.as_bytes(), target)
            .unwrap();
        assert!(wait_for_lobbies(&mut search, 1));
    }

    #[test]
    fn test_unvalidated_search_trusts_any_sender() {
        let config = NetConfig::loopback(next_port(), next_port());
        let mut search = LobbySearch::start(&config).unwrap();
        let target = search.local_addr().unwrap();

        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        stranger.send_to(b"HELLO?", target).unwrap();
        assert!(wait_for_lobbies(&mut search, 1));
    }

    #[test]
    fn test_port_in_use_is_reported() {
        let config = NetConfig::loopback(next_port(), next_port());
        let _first = LobbySearch::start(&config).unwrap();

        let err = LobbySearch::start(&config).unwrap_err();
        assert!(matches!(err, DiscoveryError::AddressInUse(_)));
        assert!(err.os_code().is_some());
    }

    #[test]
    fn test_join_unknown_lobby() {
        let config = NetConfig::loopback(next_port(), next_port());
        let search = LobbySearch::start(&config).unwrap();
        let err = search.join(0, &config).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Discovery(DiscoveryError::NoSuchLobby(0))
        ));
    }
}
