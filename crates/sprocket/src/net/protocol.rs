use std::fmt;

use bytes::{Buf, BufMut};

use super::codec::CodecError;

pub const PROTOCOL_MAGIC: u32 = u32::from_be_bytes(*b"SPK1");
pub const HEADER_SIZE: usize = 24;
pub const MAX_MESSAGE_LENGTH: usize = 1024;
pub const MAX_PLAYERS: usize = 6;
pub const PLAYER_NAME_LENGTH: usize = 32;
pub const DENIED_REASON_LENGTH: usize = 64;
pub const LOBBY_PORT: u16 = 49959;

/// Placeholder length stamped by [`MessageHeader::cleared`]. Encoding refuses it.
pub const MESSAGE_LEN_UNSET: u32 = 0xBADB_ABEE;
/// Placeholder kind stamped by [`MessageHeader::cleared`]. Encoding refuses it.
pub const MESSAGE_KIND_UNSET: u32 = 0;

const ENDPOINT_ALL_PLAYERS: i32 = -1;
const ENDPOINT_UNSPECIFIED: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(u8);

impl PlayerId {
    pub const HOST: PlayerId = PlayerId(0);

    pub fn new(slot: usize) -> Option<Self> {
        (slot < MAX_PLAYERS).then_some(Self(slot as u8))
    }

    pub fn slot(self) -> usize {
        self.0 as usize
    }

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }

    pub fn all() -> impl Iterator<Item = PlayerId> {
        (0..MAX_PLAYERS as u8).map(PlayerId)
    }

    pub(crate) fn from_wire(raw: i32) -> Result<Self, CodecError> {
        usize::try_from(raw)
            .ok()
            .and_then(Self::new)
            .ok_or(CodecError::InvalidEndpoint(raw))
    }

    pub(crate) fn to_wire(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "host")
        } else {
            write!(f, "player {}", self.0)
        }
    }
}

/// Addressing for the `from`/`to` header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Unspecified,
    AllPlayers,
    Player(PlayerId),
}

impl Endpoint {
    pub const HOST: Endpoint = Endpoint::Player(PlayerId::HOST);

    pub fn player(self) -> Option<PlayerId> {
        match self {
            Endpoint::Player(id) => Some(id),
            _ => None,
        }
    }

    fn from_wire(raw: i32) -> Result<Self, CodecError> {
        match raw {
            ENDPOINT_ALL_PLAYERS => Ok(Endpoint::AllPlayers),
            ENDPOINT_UNSPECIFIED => Ok(Endpoint::Unspecified),
            _ => PlayerId::from_wire(raw).map(Endpoint::Player),
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            Endpoint::Unspecified => ENDPOINT_UNSPECIFIED,
            Endpoint::AllPlayers => ENDPOINT_ALL_PLAYERS,
            Endpoint::Player(id) => id.to_wire(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unspecified => write!(f, "unspecified"),
            Endpoint::AllPlayers => write!(f, "all players"),
            Endpoint::Player(id) => id.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinRequest,
    JoinApproved,
    JoinDenied,
    PlayerJoined,
    PlayerLeft,
    GameTerminated,
    Configure,
    PlayerCharType,
    Sync,
    HostControlInfo,
    ClientControlInfo,
    Null,
}

const SYSTEM_MESSAGE_PREFIX: u32 = 0x8000_0000;

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::JoinRequest,
        MessageKind::JoinApproved,
        MessageKind::JoinDenied,
        MessageKind::PlayerJoined,
        MessageKind::PlayerLeft,
        MessageKind::GameTerminated,
        MessageKind::Configure,
        MessageKind::PlayerCharType,
        MessageKind::Sync,
        MessageKind::HostControlInfo,
        MessageKind::ClientControlInfo,
        MessageKind::Null,
    ];

    pub fn tag(self) -> u32 {
        match self {
            MessageKind::JoinRequest => SYSTEM_MESSAGE_PREFIX | 0x01,
            MessageKind::JoinApproved => SYSTEM_MESSAGE_PREFIX | 0x02,
            MessageKind::JoinDenied => SYSTEM_MESSAGE_PREFIX | 0x03,
            MessageKind::PlayerJoined => SYSTEM_MESSAGE_PREFIX | 0x04,
            MessageKind::PlayerLeft => SYSTEM_MESSAGE_PREFIX | 0x05,
            MessageKind::GameTerminated => SYSTEM_MESSAGE_PREFIX | 0x07,
            MessageKind::Configure => u32::from_be_bytes(*b"ncfg"),
            MessageKind::PlayerCharType => u32::from_be_bytes(*b"type"),
            MessageKind::Sync => u32::from_be_bytes(*b"sync"),
            MessageKind::HostControlInfo => u32::from_be_bytes(*b"hctl"),
            MessageKind::ClientControlInfo => u32::from_be_bytes(*b"cctl"),
            MessageKind::Null => u32::from_be_bytes(*b"null"),
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::JoinRequest => "join-request",
            MessageKind::JoinApproved => "join-approved",
            MessageKind::JoinDenied => "join-denied",
            MessageKind::PlayerJoined => "player-joined",
            MessageKind::PlayerLeft => "player-left",
            MessageKind::GameTerminated => "game-terminated",
            MessageKind::Configure => "configure",
            MessageKind::PlayerCharType => "player-char-type",
            MessageKind::Sync => "sync",
            MessageKind::HostControlInfo => "host-control-info",
            MessageKind::ClientControlInfo => "client-control-info",
            MessageKind::Null => "null",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub message_len: u32,
    pub what: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub id: u32,
}

impl MessageHeader {
    /// Fresh header with both `what` and `message_len` left at their unset
    /// sentinels. The caller must stamp both before the frame can be encoded.
    pub fn cleared(counter: &mut MessageCounter) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            message_len: MESSAGE_LEN_UNSET,
            what: MESSAGE_KIND_UNSET,
            from: Endpoint::Unspecified,
            to: Endpoint::Unspecified,
            id: counter.next_id(),
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_tag(self.what)
    }

    pub fn payload_len(&self) -> usize {
        (self.message_len as usize).saturating_sub(HEADER_SIZE)
    }

    pub(crate) fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.magic);
        buf.put_u32(self.message_len);
        buf.put_u32(self.what);
        buf.put_i32(self.from.to_wire());
        buf.put_i32(self.to.to_wire());
        buf.put_u32(self.id);
    }

    /// Caller guarantees at least [`HEADER_SIZE`] bytes remain.
    pub(crate) fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let magic = buf.get_u32();
        let message_len = buf.get_u32();
        let what = buf.get_u32();
        let from = Endpoint::from_wire(buf.get_i32())?;
        let to = Endpoint::from_wire(buf.get_i32())?;
        let id = buf.get_u32();
        Ok(Self {
            magic,
            message_len,
            what,
            from,
            to,
            id,
        })
    }
}

/// Per-session outbound message sequence number.
#[derive(Debug, Clone)]
pub struct MessageCounter {
    next: u32,
}

impl Default for MessageCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl MessageCounter {
    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}
