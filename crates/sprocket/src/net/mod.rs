mod codec;
mod connection;
mod message;
mod protocol;
pub mod socket;
mod stats;
mod tracking;

pub use codec::{CodecError, Frame, FrameReader, ReadOutcome, validate};
pub use connection::{Connection, DEFAULT_MAX_BACKLOG, PollResult, SendError};
pub use message::{
    ClientControlInfo, ControlBits, GameConfiguration, HostControlInfo, Message, PlayerCharType,
    TerminationReason, truncate_name,
};
pub use protocol::{
    DENIED_REASON_LENGTH, Endpoint, HEADER_SIZE, LOBBY_PORT, MAX_MESSAGE_LENGTH, MAX_PLAYERS,
    MESSAGE_KIND_UNSET, MESSAGE_LEN_UNSET, MessageCounter, MessageHeader, MessageKind,
    PLAYER_NAME_LENGTH, PROTOCOL_MAGIC, PlayerId,
};
pub use socket::{OsErrorCode, SocketError, SocketHandle};
pub use stats::{FaultInjection, NetworkStats};
pub use tracking::{FrameCounter, FrameVerdict, SendCounter};
