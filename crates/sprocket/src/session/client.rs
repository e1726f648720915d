use std::net::SocketAddr;

use super::{PlayerState, Session, SessionError, SessionEvent};
use crate::config::NetConfig;
use crate::net::socket::connect_tcp;
use crate::net::{
    Connection, Endpoint, Frame, Message, PLAYER_NAME_LENGTH, PlayerId, PollResult,
    TerminationReason, truncate_name,
};

impl Session {
    /// Connects to a host and asks to join. The id arrives with the approval.
    pub fn join(addr: SocketAddr, config: &NetConfig) -> Result<Self, SessionError> {
        let stream = connect_tcp(addr, config.connect_timeout())?;

        let mut session = Session::alloc(false, config);
        session.upstream = Some(Connection::new(stream, config.max_outbound_backlog));

        let name = truncate_name(&config.player_name, PLAYER_NAME_LENGTH).to_string();
        log::info!("Asking {} to let '{}' join", addr, name);
        session.send_message(Endpoint::HOST, Message::JoinRequest { name })?;

        Ok(session)
    }

    pub fn is_connected(&self) -> bool {
        self.upstream.as_ref().is_some_and(Connection::is_open)
    }

    pub(super) fn client_send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let upstream = self.upstream.as_mut().ok_or(SessionError::Disconnected)?;
        upstream.send(frame).map_err(|source| {
            log::warn!("Could not send '{}' to the host: {}", frame.kind(), source);
            SessionError::Send {
                to: PlayerId::HOST,
                source,
            }
        })
    }

    pub(super) fn client_poll(&mut self) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        let PollResult { frames, closed } = upstream.poll();

        for frame in frames {
            self.mirror_roster(&frame);
            self.inbox.push_back(frame);
        }

        if closed {
            if let Some(mut upstream) = self.upstream.take() {
                upstream.close();
            }
            log::warn!("Lost connection to the host");
            self.pending_events.push_back(SessionEvent::HostLost);

            // Host loss looks the same as being told the game is over.
            let terminated = self.new_frame(
                Endpoint::Unspecified,
                Message::GameTerminated {
                    reason: TerminationReason::NetworkError,
                },
            );
            self.inbox.push_back(terminated);
        }
    }

    fn mirror_roster(&mut self, frame: &Frame) {
        match &frame.message {
            Message::JoinApproved => {
                let Some(id) = frame.header.to.player() else {
                    log::warn!("Join approval without an id: {}", frame.header.to);
                    return;
                };
                self.my_id = Some(id);
                let me = &mut self.players[id.slot()];
                me.state = PlayerState::Me;
                me.name = truncate_name(&self.config.player_name, PLAYER_NAME_LENGTH).to_string();
                log::info!("Joined the game as {}", id);
                self.pending_events.push_back(SessionEvent::PlayerApproved {
                    player: id,
                    name: me.name.clone(),
                });
            }
            Message::PlayerJoined { player, name, .. } => {
                let peer = &mut self.players[player.slot()];
                peer.state = PlayerState::ConnectedPeer;
                peer.name = name.clone();
                log::info!("'{}' is {}", name, player);
            }
            Message::PlayerLeft { player, name, .. } => {
                self.players[player.slot()].reset();
                log::info!("'{}' ({}) left the game", name, player);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::net::socket::configure_stream;
    use crate::net::{MessageCounter, MessageHeader};

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(46700);

    fn config() -> NetConfig {
        let port = PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
        NetConfig {
            player_name: String::from("CLIENTY"),
            ..NetConfig::loopback(port, port + 1)
        }
    }

    fn host_frame(counter: &mut MessageCounter, to: Endpoint, message: Message) -> Frame {
        let mut header = MessageHeader::cleared(counter);
        header.from = Endpoint::HOST;
        header.to = to;
        Frame::stamp(&mut header, &message);
        Frame { header, message }
    }

    fn accept_host_side(listener: &TcpListener, config: &NetConfig) -> Connection {
        let (stream, _) = listener.accept().unwrap();
        configure_stream(&stream).unwrap();
        Connection::new(stream, config.max_outbound_backlog)
    }

    fn wait_for(client: &mut Session) -> Frame {
        for _ in 0..500 {
            if let Some(frame) = client.get() {
                return frame;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("no frame arrived");
    }

    #[test]
    fn test_join_sends_request() {
        let config = config();
        let listener = TcpListener::bind(config.listen_addr()).unwrap();
        let _client = Session::join(config.listen_addr(), &config).unwrap();
        let mut host = accept_host_side(&listener, &config);

        let mut frames = Vec::new();
        for _ in 0..500 {
            frames = host.poll().frames;
            if !frames.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let frame = frames.pop().unwrap();
        assert_eq!(
            frame.message,
            Message::JoinRequest {
                name: String::from("CLIENTY")
            }
        );
        assert_eq!(frame.header.to, Endpoint::HOST);
    }

    #[test]
    fn test_client_mirrors_roster() {
        let config = config();
        let listener = TcpListener::bind(config.listen_addr()).unwrap();
        let mut client = Session::join(config.listen_addr(), &config).unwrap();
        let mut host = accept_host_side(&listener, &config);

        let me = PlayerId::new(2).unwrap();
        let other = PlayerId::new(1).unwrap();
        let mut counter = MessageCounter::default();
        host.send(&host_frame(&mut counter, Endpoint::Player(me), Message::JoinApproved))
            .unwrap();
        host.send(&host_frame(
            &mut counter,
            Endpoint::Player(me),
            Message::PlayerJoined {
                player_count: 3,
                player: other,
                name: String::from("OTHER"),
            },
        ))
        .unwrap();

        assert_eq!(wait_for(&mut client).kind(), Message::JoinApproved.kind());
        assert_eq!(client.my_id(), Some(me));
        assert_eq!(client.player(me).state, PlayerState::Me);

        wait_for(&mut client);
        assert_eq!(client.player(other).state, PlayerState::ConnectedPeer);
        assert_eq!(client.player(other).name, "OTHER");
        assert_eq!(client.num_active_players(), 2);

        host.send(&host_frame(
            &mut counter,
            Endpoint::Player(me),
            Message::PlayerLeft {
                player_count: 2,
                player: other,
                name: String::from("OTHER"),
            },
        ))
        .unwrap();
        wait_for(&mut client);
        assert_eq!(client.player(other).state, PlayerState::Offline);
    }

    #[test]
    fn test_host_loss_becomes_termination() {
        let config = config();
        let listener = TcpListener::bind(config.listen_addr()).unwrap();
        let mut client = Session::join(config.listen_addr(), &config).unwrap();
        drop(accept_host_side(&listener, &config));

        let frame = wait_for(&mut client);
        assert_eq!(
            frame.message,
            Message::GameTerminated {
                reason: TerminationReason::NetworkError
            }
        );
        assert!(!client.is_connected());
        assert!(matches!(
            client.send_message(Endpoint::HOST, Message::Null),
            Err(SessionError::Disconnected)
        ));
    }
}
