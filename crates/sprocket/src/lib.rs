pub mod config;
pub mod lobby;
pub mod net;
pub mod sequence;
pub mod session;

pub use config::NetConfig;
pub use lobby::{Advertiser, DiscoveryError, LobbyInfo, LobbySearch};
pub use net::{
    Endpoint, FaultInjection, Frame, FrameReader, MAX_PLAYERS, Message, MessageHeader,
    NetworkStats, PlayerId,
};
pub use sequence::{
    FatalError, GameCollaborator, GameGlobals, LocalGame, NetGame, NetSequence, PlayerInfo,
};
pub use session::{DisconnectReason, PlayerState, Session, SessionError, SessionEvent};
