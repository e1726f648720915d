use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use bytes::{Buf, BytesMut};

use super::codec::{CodecError, Frame, FrameReader};
use super::socket::{SocketHandle, is_would_block};
use super::stats::{FaultInjection, NetworkStats};

pub const DEFAULT_MAX_BACKLOG: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound backlog of {0} bytes exceeded")]
    Backlog(usize),
    #[error("send failure injected")]
    Injected,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default)]
pub struct PollResult {
    pub frames: Vec<Frame>,
    /// The peer hung up, or the stream failed.
    pub closed: bool,
}

/// One TCP stream carrying framed messages.
#[derive(Debug)]
pub struct Connection {
    socket: SocketHandle<TcpStream>,
    peer_addr: Option<SocketAddr>,
    reader: FrameReader,
    outbound: BytesMut,
    max_backlog: usize,
    stats: NetworkStats,
    faults: FaultInjection,
}

impl Connection {
    pub fn new(stream: TcpStream, max_backlog: usize) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            socket: SocketHandle::new(stream),
            peer_addr,
            reader: FrameReader::new(),
            outbound: BytesMut::new(),
            max_backlog,
            stats: NetworkStats::default(),
            faults: FaultInjection::default(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn set_faults(&mut self, faults: FaultInjection) {
        self.faults = faults;
    }

    pub fn send(&mut self, frame: &Frame) -> Result<(), SendError> {
        if !self.socket.is_open() {
            return Err(SendError::Closed);
        }
        if self.faults.should_fail_send(self.stats.frames_sent) {
            self.stats.send_failures += 1;
            return Err(SendError::Injected);
        }

        let before = self.outbound.len();
        frame.encode(&mut self.outbound)?;
        if self.outbound.len() > self.max_backlog {
            self.outbound.truncate(before);
            self.stats.send_failures += 1;
            return Err(SendError::Backlog(self.max_backlog));
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += (self.outbound.len() - before) as u64;
        log::debug!(
            "Sent '{}' ({} bytes) to {} via {:?}",
            frame.kind(),
            frame.header.message_len,
            frame.header.to,
            self.peer_addr
        );

        self.flush().inspect_err(|_| self.stats.send_failures += 1)
    }

    /// Writes as much of the outbound queue as the socket accepts right now.
    pub fn flush(&mut self) -> Result<(), SendError> {
        let stream = self.socket.get_mut().ok_or(SendError::Closed)?;
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => return Err(SendError::Closed),
                Ok(n) => self.outbound.advance(n),
                Err(e) if is_would_block(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SendError::Io(e)),
            }
        }
        Ok(())
    }

    /// Drains whatever the peer has sent since the last poll.
    pub fn poll(&mut self) -> PollResult {
        let mut result = PollResult::default();

        if !self.outbound.is_empty() {
            if let Err(e) = self.flush() {
                log::warn!("Flush to {:?} failed: {}", self.peer_addr, e);
                result.closed = true;
            }
        }

        let Some(stream) = self.socket.get_mut() else {
            result.closed = true;
            return result;
        };

        match self.reader.fill(stream) {
            Ok(outcome) => {
                self.stats.bytes_received += outcome.bytes as u64;
                if outcome.closed {
                    log::info!("Broken pipe on connection to {:?}", self.peer_addr);
                    result.closed = true;
                }
            }
            Err(e) => {
                log::warn!("Read from {:?} failed: {}", self.peer_addr, e);
                result.closed = true;
            }
        }

        while let Some(decoded) = self.reader.next_frame() {
            match decoded {
                Ok(frame) => {
                    self.stats.frames_received += 1;
                    log::debug!(
                        "Got '{}' ({} bytes) from {} via {:?}",
                        frame.kind(),
                        frame.header.message_len,
                        frame.header.from,
                        self.peer_addr
                    );
                    result.frames.push(frame);
                }
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    log::warn!("Dropped frame from {:?}: {}", self.peer_addr, e);
                }
            }
        }

        result
    }

    /// Flushes what it can, then closes. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        if self.socket.is_open() {
            let _ = self.flush();
        }
        if let Some(stream) = self.socket.get_mut() {
            let _ = stream.shutdown(Shutdown::Write);
            drain_unread(stream);
        }
        let closed = self.socket.close();
        if closed {
            log::info!("Closed connection to {:?}", self.peer_addr);
        }
        self.outbound.clear();
        self.reader.clear();
        closed
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

// Unread input turns the close into a reset, which can drop frames still in flight.
fn drain_unread(stream: &mut TcpStream) {
    let mut scratch = [0u8; 1024];
    for _ in 0..64 {
        match stream.read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::net::message::Message;
    use crate::net::protocol::{Endpoint, MessageCounter, MessageHeader};
    use crate::net::socket::configure_stream;

    fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        configure_stream(&client).unwrap();
        configure_stream(&server).unwrap();
        (
            Connection::new(client, DEFAULT_MAX_BACKLOG),
            Connection::new(server, DEFAULT_MAX_BACKLOG),
        )
    }

    fn null_frame(counter: &mut MessageCounter) -> Frame {
        let mut header = MessageHeader::cleared(counter);
        header.to = Endpoint::HOST;
        Frame::stamp(&mut header, &Message::Null);
        Frame {
            header,
            message: Message::Null,
        }
    }

    fn poll_until(conn: &mut Connection, timeout_ms: u64) -> PollResult {
        let start = Instant::now();
        loop {
            let result = conn.poll();
            if !result.frames.is_empty() || result.closed {
                return result;
            }
            if start.elapsed() > Duration::from_millis(timeout_ms) {
                return result;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_send_and_poll() {
        let (mut a, mut b) = pair();
        let mut counter = MessageCounter::default();

        a.send(&null_frame(&mut counter)).unwrap();
        let result = poll_until(&mut b, 500);

        assert_eq!(result.frames.len(), 1);
        assert!(!result.closed);
        assert_eq!(a.stats().frames_sent, 1);
        assert_eq!(b.stats().frames_received, 1);
    }

    #[test]
    fn test_poll_without_data_is_quiet() {
        let (_a, mut b) = pair();
        let result = b.poll();
        assert!(result.frames.is_empty());
        assert!(!result.closed);
    }

    #[test]
    fn test_peer_close_detected() {
        let (mut a, mut b) = pair();
        assert!(a.close());
        assert!(!a.close());

        let result = poll_until(&mut b, 500);
        assert!(result.closed);
    }

    #[test]
    fn test_injected_failure() {
        let (mut a, _b) = pair();
        let mut counter = MessageCounter::default();
        a.set_faults(FaultInjection::failing_sends());

        let err = a.send(&null_frame(&mut counter)).unwrap_err();
        assert!(matches!(err, SendError::Injected));
        assert_eq!(a.stats().send_failures, 1);
    }
}
