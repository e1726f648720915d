mod control;
mod game;

use std::fmt;
use std::net::SocketAddr;
use std::thread;
use std::time::Instant;

pub use control::ControlSync;
pub use game::{GameCollaborator, GameGlobals, LocalGame, PlayerInfo};

use crate::config::NetConfig;
use crate::lobby::LobbySearch;
use crate::net::{
    Endpoint, Frame, GameConfiguration, MAX_PLAYERS, Message, OsErrorCode, PlayerCharType,
    PlayerId, TerminationReason,
};
use crate::session::{PlayerState, Session, SessionError};

/// Where the network game currently is, from the menus through the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetSequence {
    #[default]
    Offline,

    HostOffline,
    HostLobbyOpen,
    HostReadyToStartGame,
    HostStartingGame,

    ClientOffline,
    ClientSearchingForGames,
    ClientFoundGames,
    ClientJoiningGame,
    ClientJoinedGame,

    WaitingForPlayerVehicles,
    GotAllPlayerVehicles,

    HostWaitForPlayersToPrepareLevel,
    ClientWaitForSyncFromHost,

    GameLoop,

    Error,
    ClientOfflineBecauseHostBailed,
    ClientOfflineBecauseHostUnreachable,
    ClientOfflineBecauseKicked,
    OfflineEverybodyLeft,
    SeedDesync,
    PositionDesync,
    ErrorSendFailed,
    ErrorLostPacket,
    ErrorNoResponseFromClients,
    ErrorNoResponseFromHost,
}

impl NetSequence {
    /// Terminal until the UI acknowledges it.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            NetSequence::Error
                | NetSequence::ClientOfflineBecauseHostBailed
                | NetSequence::ClientOfflineBecauseHostUnreachable
                | NetSequence::ClientOfflineBecauseKicked
                | NetSequence::OfflineEverybodyLeft
                | NetSequence::SeedDesync
                | NetSequence::PositionDesync
                | NetSequence::ErrorSendFailed
                | NetSequence::ErrorLostPacket
                | NetSequence::ErrorNoResponseFromClients
                | NetSequence::ErrorNoResponseFromHost
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            NetSequence::Offline | NetSequence::HostOffline | NetSequence::ClientOffline => {
                "OFFLINE"
            }
            NetSequence::HostLobbyOpen => "WAITING FOR PLAYERS",
            NetSequence::HostReadyToStartGame | NetSequence::HostStartingGame => {
                "STARTING GAME..."
            }
            NetSequence::ClientSearchingForGames => "LOOKING FOR GAMES...",
            NetSequence::ClientFoundGames => "FOUND A GAME...",
            NetSequence::ClientJoiningGame => "JOINING GAME...",
            NetSequence::ClientJoinedGame => "JOINED GAME",
            NetSequence::WaitingForPlayerVehicles => "WAITING FOR OTHER PLAYERS...",
            NetSequence::GotAllPlayerVehicles => "ALL PLAYERS READY",
            NetSequence::HostWaitForPlayersToPrepareLevel
            | NetSequence::ClientWaitForSyncFromHost => "WAITING FOR OTHER PLAYERS...",
            NetSequence::GameLoop => "IN GAME",
            NetSequence::Error => "NETWORK ERROR",
            NetSequence::ClientOfflineBecauseHostBailed => "THE HOST ENDED THE GAME",
            NetSequence::ClientOfflineBecauseHostUnreachable => "LOST CONTACT WITH THE HOST",
            NetSequence::ClientOfflineBecauseKicked => "YOU WERE KICKED FROM THE GAME",
            NetSequence::OfflineEverybodyLeft => "EVERYBODY ELSE LEFT THE GAME",
            NetSequence::SeedDesync => "GAME OUT OF SYNC (SEED)",
            NetSequence::PositionDesync => "GAME OUT OF SYNC (POSITION)",
            NetSequence::ErrorSendFailed => "COULD NOT SEND TO THE NETWORK",
            NetSequence::ErrorLostPacket => "A NETWORK PACKET WAS LOST",
            NetSequence::ErrorNoResponseFromClients => "NO RESPONSE FROM OTHER PLAYERS",
            NetSequence::ErrorNoResponseFromHost => "NO RESPONSE FROM THE HOST",
        }
    }
}

/// Conditions the game cannot continue from without diverging between machines.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("lost packet: expected frame {expected}, got {received}")]
    LostPacket { expected: u32, received: u32 },
    #[error("random seed mismatch: host {host:#010x}, local {local:#010x}")]
    SeedDesync { host: u32, local: u32 },
    #[error("player {player} is not where the host says")]
    PositionDesync { player: usize },
    #[error("no response from host")]
    NoResponseFromHost,
    #[error("no response from clients")]
    NoResponseFromClients,
    #[error("gave up after {count} receive timeouts")]
    TooManyTimeouts { hosting: bool, count: u32 },
    #[error("send failed: {0}")]
    SendFailed(#[source] SessionError),
    #[error("internal error: {0}")]
    Invariant(#[source] SessionError),
    #[error("player number {0} out of range")]
    BadPlayerNum(usize),
    #[error("no network session")]
    NoSession,
}

impl FatalError {
    pub fn sequence(&self) -> NetSequence {
        match self {
            FatalError::LostPacket { .. } => NetSequence::ErrorLostPacket,
            FatalError::SeedDesync { .. } => NetSequence::SeedDesync,
            FatalError::PositionDesync { .. } => NetSequence::PositionDesync,
            FatalError::NoResponseFromHost => NetSequence::ErrorNoResponseFromHost,
            FatalError::NoResponseFromClients => NetSequence::ErrorNoResponseFromClients,
            FatalError::TooManyTimeouts { hosting: true, .. } => {
                NetSequence::ErrorNoResponseFromClients
            }
            FatalError::TooManyTimeouts { hosting: false, .. } => {
                NetSequence::ErrorNoResponseFromHost
            }
            FatalError::SendFailed(_) => NetSequence::ErrorSendFailed,
            FatalError::Invariant(_) | FatalError::BadPlayerNum(_) | FatalError::NoSession => {
                NetSequence::Error
            }
        }
    }

    pub fn os_code(&self) -> Option<OsErrorCode> {
        match self {
            FatalError::SendFailed(e) | FatalError::Invariant(e) => e.os_code(),
            _ => None,
        }
    }
}

/// The network side of one game: discovery, the session, and the sequence
/// driving both through the menus and into the race.
#[derive(Debug)]
pub struct NetGame {
    sequence: NetSequence,
    config: NetConfig,
    session: Option<Session>,
    search: Option<LobbySearch>,
    is_host: bool,
    is_client: bool,
    /// Set once the game configuration has been exchanged.
    in_progress: bool,
    /// Who has reached the current barrier, by player number.
    checked_in: [bool; MAX_PLAYERS],
    control: ControlSync,
    last_error: Option<String>,
    last_os_code: Option<OsErrorCode>,
}

impl NetGame {
    pub fn new(config: NetConfig) -> Self {
        Self {
            sequence: NetSequence::Offline,
            config,
            session: None,
            search: None,
            is_host: false,
            is_client: false,
            in_progress: false,
            checked_in: [false; MAX_PLAYERS],
            control: ControlSync::default(),
            last_error: None,
            last_os_code: None,
        }
    }

    pub fn sequence(&self) -> NetSequence {
        self.sequence
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn control(&self) -> &ControlSync {
        &self.control
    }

    pub fn num_lobbies_found(&self) -> usize {
        self.search.as_ref().map_or(0, LobbySearch::num_found)
    }

    pub fn lobby_host_address(&self, n: usize) -> Option<SocketAddr> {
        self.search.as_ref().and_then(|search| search.host_address(n))
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn set_sequence(&mut self, sequence: NetSequence) {
        if self.sequence != sequence {
            log::info!("Network sequence {:?} -> {:?}", self.sequence, sequence);
            self.sequence = sequence;
        }
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            let force_terminate = session.is_hosting();
            session.dispose(force_terminate);
        }
        if let Some(mut search) = self.search.take() {
            search.dispose();
        }
        self.is_host = false;
        self.is_client = false;
        self.in_progress = false;
    }

    fn enter_error(&mut self, error: &impl fmt::Display, os_code: Option<OsErrorCode>) {
        log::warn!("Network error: {}", error);
        self.teardown();
        self.set_sequence(NetSequence::Error);
        self.last_error = Some(error.to_string());
        self.last_os_code = os_code;
    }

    /// Tears everything down, moves to the matching error state, and tells the
    /// game. The error is handed back for the caller to propagate.
    fn fatal<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        error: FatalError,
    ) -> FatalError {
        log::error!("Fatal network error: {}", error);
        let sequence = error.sequence();
        let os_code = error.os_code();
        self.teardown();
        self.set_sequence(sequence);
        self.last_error = Some(error.to_string());
        self.last_os_code = os_code;
        game.fatal_alert(&error);
        error
    }

    fn reset_game_state(&mut self) {
        self.checked_in = [false; MAX_PLAYERS];
        self.control.reset();
        self.last_error = None;
        self.last_os_code = None;
    }

    /// Opens the lobby: listener up and advertisements going out.
    pub fn setup_network_hosting(&mut self) -> Result<(), SessionError> {
        self.teardown();
        self.reset_game_state();

        let hosted = Session::host(&self.config).and_then(|mut session| {
            session.start_advertising()?;
            Ok(session)
        });
        match hosted {
            Ok(session) => {
                self.session = Some(session);
                self.is_host = true;
                self.set_sequence(NetSequence::HostLobbyOpen);
                Ok(())
            }
            Err(e) => {
                let os_code = e.os_code();
                self.enter_error(&e, os_code);
                Err(e)
            }
        }
    }

    /// Starts listening for lobby advertisements.
    pub fn setup_network_join(&mut self) -> Result<(), SessionError> {
        self.teardown();
        self.reset_game_state();

        match LobbySearch::start(&self.config) {
            Ok(search) => {
                self.search = Some(search);
                self.set_sequence(NetSequence::ClientSearchingForGames);
                Ok(())
            }
            Err(e) => {
                let e = SessionError::from(e);
                let os_code = e.os_code();
                self.enter_error(&e, os_code);
                Err(e)
            }
        }
    }

    /// Skips discovery and connects straight to a known host.
    pub fn setup_network_join_address(&mut self, addr: SocketAddr) -> Result<(), SessionError> {
        self.teardown();
        self.reset_game_state();

        match Session::join(addr, &self.config) {
            Ok(session) => {
                self.session = Some(session);
                self.is_client = true;
                self.set_sequence(NetSequence::ClientJoiningGame);
                Ok(())
            }
            Err(e) => {
                let os_code = e.os_code();
                self.enter_error(&e, os_code);
                Err(e)
            }
        }
    }

    /// The user confirmed the lobby. Needs at least one client.
    pub fn host_start_game(&mut self) -> bool {
        let active = self.session.as_ref().map_or(0, Session::num_active_players);
        if self.sequence != NetSequence::HostLobbyOpen || active < 2 {
            return false;
        }
        self.set_sequence(NetSequence::HostReadyToStartGame);
        true
    }

    pub fn end_network_game(&mut self) {
        self.teardown();
        self.set_sequence(NetSequence::Offline);
    }

    /// Leaves an error state once the UI has shown it.
    pub fn acknowledge_error(&mut self) -> bool {
        if !self.sequence.is_error() {
            return false;
        }
        self.teardown();
        self.last_error = None;
        self.last_os_code = None;
        self.set_sequence(NetSequence::Offline);
        true
    }

    pub fn status_line(&self) -> String {
        match self.sequence {
            NetSequence::HostLobbyOpen => {
                let clients = self.session.as_ref().map_or(0, Session::num_clients);
                let mut line = String::from("WAITING FOR PLAYERS\nON LOCAL NETWORK...");
                if clients > 0 {
                    line.push_str(&format!("\n{} JOINED", clients));
                }
                line
            }
            NetSequence::ClientFoundGames => match self.num_lobbies_found() {
                1 => String::from("FOUND A GAME..."),
                n => format!("FOUND {} GAMES...", n),
            },
            sequence if sequence.is_error() => {
                let mut line = String::from(sequence.description());
                if let Some(error) = &self.last_error {
                    line.push_str(": ");
                    line.push_str(error);
                }
                if let Some(code) = self.last_os_code {
                    line.push_str(&format!(" [{}]", code));
                }
                line
            }
            NetSequence::GameLoop if self.control.timeouts() > 0 => format!(
                "{}\nWAITING ON NETWORK ({})",
                NetSequence::GameLoop.description(),
                self.control.timeouts()
            ),
            sequence => String::from(sequence.description()),
        }
    }

    /// Runs one bounded unit of work for the current state. Returns whether a
    /// message was consumed, so the caller knows whether to sleep.
    pub fn update<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        match self.sequence {
            NetSequence::HostLobbyOpen => self.host_lobby_tick(game),
            NetSequence::HostReadyToStartGame => self.host_push_configuration(game),
            NetSequence::ClientSearchingForGames | NetSequence::ClientFoundGames => {
                self.client_search_tick(game)
            }
            NetSequence::ClientJoiningGame => self.client_joining_tick(game),
            NetSequence::WaitingForPlayerVehicles => self.vehicle_selection_tick(game),
            NetSequence::HostWaitForPlayersToPrepareLevel => self.host_level_sync_tick(game),
            NetSequence::ClientWaitForSyncFromHost => self.client_level_sync_tick(game),
            _ => Ok(false),
        }
    }

    fn host_lobby_tick<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };

        if let Err(e) = session.advertise_tick() {
            let os_code = e.os_code();
            self.enter_error(&e, os_code);
            return Ok(false);
        }
        if let Err(e) = session.accept_new_client() {
            log::warn!("Could not accept a client: {}", e);
        }

        let Some(frame) = session.get() else {
            return Ok(false);
        };
        match &frame.message {
            Message::JoinRequest { .. } => {
                let awaiting = frame
                    .header
                    .from
                    .player()
                    .is_some_and(|id| session.player(id).state == PlayerState::AwaitingHandshake);
                if !awaiting {
                    log::warn!("Ignoring repeated join request from {}", frame.header.from);
                } else if let Err(e) = session.ack_join_request(&frame) {
                    if e.is_invariant() {
                        return Err(self.fatal(game, FatalError::Invariant(e)));
                    }
                    log::warn!("Could not complete join for {}: {}", frame.header.from, e);
                }
            }
            _ => self.handle_other(game, &frame),
        }
        Ok(true)
    }

    fn host_push_configuration<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        if let Some(session) = self.session.as_mut() {
            session.stop_advertising();
        }
        match self.host_send_game_config_info(game) {
            Ok(()) => {
                self.in_progress = true;
                self.set_sequence(NetSequence::HostStartingGame);
                Ok(true)
            }
            Err(e) if e.is_invariant() => Err(self.fatal(game, FatalError::Invariant(e))),
            Err(e) => {
                let os_code = e.os_code();
                self.enter_error(&e, os_code);
                Ok(false)
            }
        }
    }

    /// Assigns player numbers in slot order and tells each client its own.
    fn host_send_game_config_info<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NotHosting)?;
        if !session.is_hosting() {
            return Err(SessionError::NotHosting);
        }

        let globals = game.globals_mut();
        let num_real = session.num_active_players();
        globals.num_real_players = num_real;
        globals.my_player_num = 0;
        globals.game_over = false;
        for (i, player) in globals.players.iter_mut().enumerate() {
            player.net_id = session.nth_active_player_id(i);
            if player.net_id.is_some() {
                player.is_computer = false;
                player.is_eliminated = false;
            }
        }

        let configuration = GameConfiguration {
            game_mode: globals.game_mode,
            age: globals.age,
            track_num: globals.track_num,
            player_num: 0,
            num_players: num_real as u8,
            difficulty: globals.difficulty,
            tag_duration: globals.tag_duration,
            tracks_completed: globals.tracks_completed,
        };
        for player_num in 1..num_real {
            let Some(id) = session.nth_active_player_id(player_num) else {
                continue;
            };
            log::info!("{} will be player {}", id, player_num);
            session.send_message(
                Endpoint::Player(id),
                Message::Configure(GameConfiguration {
                    player_num: player_num as u8,
                    ..configuration
                }),
            )?;
        }
        Ok(())
    }

    fn client_search_tick<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        let Some(search) = self.search.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        if let Err(e) = search.tick() {
            let os_code = e.os_code();
            self.enter_error(&e, os_code);
            return Ok(false);
        }

        let found = search.num_found();
        match self.sequence {
            _ if found == 0 => {
                self.set_sequence(NetSequence::ClientSearchingForGames);
                Ok(false)
            }
            NetSequence::ClientSearchingForGames => {
                self.set_sequence(NetSequence::ClientFoundGames);
                Ok(true)
            }
            _ => {
                self.join_first_lobby();
                Ok(true)
            }
        }
    }

    fn join_first_lobby(&mut self) {
        let Some(mut search) = self.search.take() else {
            return;
        };
        let joined = search.join(0, &self.config);
        search.dispose();

        match joined {
            Ok(session) => {
                self.session = Some(session);
                self.is_client = true;
                self.set_sequence(NetSequence::ClientJoiningGame);
            }
            Err(e) => {
                let os_code = e.os_code();
                self.enter_error(&e, os_code);
            }
        }
    }

    fn client_joining_tick<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        let Some(frame) = session.get() else {
            return Ok(false);
        };

        match &frame.message {
            Message::Configure(configuration) => {
                if let Err(e) = self.handle_game_config(game, configuration) {
                    return Err(self.fatal(game, e));
                }
                self.set_sequence(NetSequence::ClientJoinedGame);
            }
            Message::JoinApproved | Message::PlayerJoined { .. } | Message::PlayerLeft { .. } => {
                log::debug!("Lobby update while joining: '{}'", frame.kind());
            }
            Message::JoinDenied { reason } => {
                log::warn!("Join denied: {}", reason);
                self.teardown();
                self.set_sequence(NetSequence::Error);
                self.last_error = Some(reason.clone());
                self.last_os_code = None;
            }
            _ => self.handle_other(game, &frame),
        }
        Ok(true)
    }

    fn handle_game_config<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        configuration: &GameConfiguration,
    ) -> Result<(), FatalError> {
        let session = self.session.as_ref().ok_or(FatalError::NoSession)?;
        let num_real = configuration.num_players as usize;
        let my_player_num = configuration.player_num as usize;
        if my_player_num >= num_real {
            return Err(FatalError::BadPlayerNum(my_player_num));
        }

        let globals = game.globals_mut();
        globals.game_mode = configuration.game_mode;
        globals.age = configuration.age;
        globals.track_num = configuration.track_num;
        globals.difficulty = configuration.difficulty;
        globals.tag_duration = configuration.tag_duration;
        globals.tracks_completed = configuration.tracks_completed;
        globals.num_real_players = num_real;
        globals.my_player_num = my_player_num;
        globals.game_over = false;
        for (i, player) in globals.players.iter_mut().enumerate() {
            player.net_id = if i < num_real {
                session.nth_active_player_id(i)
            } else {
                None
            };
            if player.net_id.is_some() {
                player.is_computer = false;
                player.is_eliminated = false;
            }
        }
        if globals.players[my_player_num].net_id != session.my_id() {
            log::warn!(
                "Host made us player {}, but our roster disagrees",
                my_player_num
            );
        }

        log::info!(
            "Configured as player {} of {}, mode {}, track {}",
            my_player_num,
            num_real,
            configuration.game_mode,
            configuration.track_num
        );
        self.in_progress = true;
        Ok(())
    }

    /// Tells everyone which vehicle the local player picked.
    pub fn player_broadcast_vehicle_type<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        let globals = game.globals();
        let me = globals.my_player_num;
        let player = globals
            .players
            .get(me)
            .ok_or(FatalError::BadPlayerNum(me))?;
        let char_type = PlayerCharType {
            player_num: me as u8,
            vehicle_type: player.vehicle_type,
            sex: player.sex,
            skin: player.skin,
        };
        self.broadcast(game, Message::PlayerCharType(char_type))
    }

    /// Waits until every other real player's vehicle choice has arrived.
    pub fn get_vehicle_selection_from_net_players<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        self.open_barrier(game.globals());
        self.set_sequence(NetSequence::WaitingForPlayerVehicles);
        let timeout = if self.is_host {
            FatalError::NoResponseFromClients
        } else {
            FatalError::NoResponseFromHost
        };
        self.wait_while(game, NetSequence::WaitingForPlayerVehicles, timeout)
    }

    fn vehicle_selection_tick<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        if self.barrier_complete(game.globals()) {
            self.set_sequence(NetSequence::GotAllPlayerVehicles);
            return Ok(false);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        let Some(frame) = session.get() else {
            return Ok(false);
        };

        match &frame.message {
            Message::PlayerCharType(char_type) => {
                let player_num = char_type.player_num as usize;
                if !self.check_in(game.globals(), player_num, frame.header.from) {
                    return Ok(true);
                }
                let globals = game.globals_mut();
                let player = &mut globals.players[player_num];
                player.vehicle_type = char_type.vehicle_type;
                player.sex = char_type.sex;
                player.skin = char_type.skin;
                log::info!(
                    "Player {} picked vehicle {}",
                    player_num,
                    char_type.vehicle_type
                );

                if self.barrier_complete(game.globals()) {
                    self.set_sequence(NetSequence::GotAllPlayerVehicles);
                }
            }
            _ => self.handle_other(game, &frame),
        }
        Ok(true)
    }

    /// Host side of the level barrier: one sync per client, then a go to all.
    pub fn host_wait_for_players_to_prepare_level<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        self.open_barrier(game.globals());
        self.control.reset();
        self.set_sequence(NetSequence::HostWaitForPlayersToPrepareLevel);
        self.wait_while(
            game,
            NetSequence::HostWaitForPlayersToPrepareLevel,
            FatalError::NoResponseFromClients,
        )?;
        if self.sequence != NetSequence::GameLoop {
            return Ok(());
        }

        log::info!("Every player has the level ready");
        self.broadcast(game, Message::Sync { player_num: 0 })
    }

    fn host_level_sync_tick<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        if self.barrier_complete(game.globals()) {
            self.set_sequence(NetSequence::GameLoop);
            return Ok(false);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        let Some(frame) = session.get() else {
            return Ok(false);
        };

        match &frame.message {
            Message::Sync { player_num } => {
                let player_num = *player_num as usize;
                if self.check_in(game.globals(), player_num, frame.header.from) {
                    log::debug!("Player {} has the level ready", player_num);
                }
                if self.barrier_complete(game.globals()) {
                    self.set_sequence(NetSequence::GameLoop);
                }
            }
            _ => self.handle_other(game, &frame),
        }
        Ok(true)
    }

    /// Client side of the level barrier.
    pub fn client_tell_host_level_is_prepared<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        self.control.reset();
        let player_num = game.globals().my_player_num as u8;
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        if let Err(e) = session.send_message(Endpoint::HOST, Message::Sync { player_num }) {
            let os_code = e.os_code();
            self.enter_error(&e, os_code);
            return Ok(());
        }

        self.set_sequence(NetSequence::ClientWaitForSyncFromHost);
        self.wait_while(
            game,
            NetSequence::ClientWaitForSyncFromHost,
            FatalError::NoResponseFromHost,
        )
    }

    fn client_level_sync_tick<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<bool, FatalError> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        let Some(frame) = session.get() else {
            return Ok(false);
        };

        match &frame.message {
            Message::Sync { .. } => self.set_sequence(NetSequence::GameLoop),
            Message::PlayerCharType(char_type) => {
                log::warn!(
                    "Late vehicle choice from player {} ignored",
                    char_type.player_num
                );
            }
            _ => self.handle_other(game, &frame),
        }
        Ok(true)
    }

    fn open_barrier(&mut self, globals: &GameGlobals) {
        self.checked_in = [false; MAX_PLAYERS];
        if let Some(me) = self.checked_in.get_mut(globals.my_player_num) {
            *me = true;
        }
    }

    /// Marks `player_num` as arrived if `from` is the connection driving it.
    /// A repeat from the same player changes nothing.
    fn check_in(&mut self, globals: &GameGlobals, player_num: usize, from: Endpoint) -> bool {
        let owner = globals.players.get(player_num).and_then(|p| p.net_id);
        if owner.is_none() || owner != from.player() {
            log::warn!(
                "{} checked in for player {}, which is not theirs",
                from,
                player_num
            );
            return false;
        }
        if self.checked_in[player_num] {
            log::debug!("Player {} checked in twice", player_num);
        }
        self.checked_in[player_num] = true;
        true
    }

    fn barrier_complete(&self, globals: &GameGlobals) -> bool {
        !waiting_on_players(globals, &self.checked_in)
    }

    /// Ticks until the state changes. Past the sync ceiling `timeout` is raised.
    fn wait_while<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        state: NetSequence,
        timeout: FatalError,
    ) -> Result<(), FatalError> {
        let started = Instant::now();
        while self.sequence == state {
            let got_message = self.update(game)?;
            if self.sequence != state {
                break;
            }
            if started.elapsed() > self.config.sync_timeout() {
                return Err(self.fatal(game, timeout));
            }
            if !got_message {
                thread::sleep(self.config.idle_sleep());
            }
        }
        Ok(())
    }

    /// Frames no state handler expected.
    fn handle_other<G: GameCollaborator + ?Sized>(&mut self, game: &mut G, frame: &Frame) {
        match &frame.message {
            Message::PlayerLeft { player, .. } => self.player_unexpectedly_leaves(game, *player),
            Message::GameTerminated { reason } if !self.is_host => {
                log::warn!("Game terminated: {}", reason.as_str());
                self.teardown();
                self.set_sequence(match reason {
                    TerminationReason::Kicked => NetSequence::ClientOfflineBecauseKicked,
                    TerminationReason::NetworkError => {
                        NetSequence::ClientOfflineBecauseHostUnreachable
                    }
                    TerminationReason::HostBailed => NetSequence::ClientOfflineBecauseHostBailed,
                });
                self.last_error = None;
                self.last_os_code = None;
                game.globals_mut().game_over = true;
            }
            Message::Null => {}
            Message::JoinRequest { .. } if self.is_host => {
                let Some(id) = frame.header.from.player() else {
                    return;
                };
                log::warn!("{} asked to join a game already under way", id);
                if let Some(session) = self.session.as_mut()
                    && let Err(e) = session.kick_client(id)
                {
                    log::warn!("Could not kick {}: {}", id, e);
                }
            }
            _ => log::warn!(
                "Unexpected '{}' from {} in {:?}",
                frame.kind(),
                frame.header.from,
                self.sequence
            ),
        }
    }

    /// Hands a departed player's vehicle to the computer.
    fn player_unexpectedly_leaves<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        id: PlayerId,
    ) {
        if !self.in_progress {
            log::info!("{} left before the game started", id);
            return;
        }

        let globals = game.globals_mut();
        let Some(player_num) = globals
            .players
            .iter()
            .position(|p| !p.is_computer && p.net_id == Some(id))
        else {
            log::warn!("{} left, but is not driving anything", id);
            return;
        };

        let player = &mut globals.players[player_num];
        player.is_computer = true;
        player.is_eliminated = true;
        player.net_id = None;
        self.checked_in[player_num] = false;
        globals.num_real_players = globals.num_real_players.saturating_sub(1);
        log::info!(
            "Player {} ({}) left, {} real players remain",
            player_num,
            id,
            globals.num_real_players
        );

        if globals.num_real_players <= 1 {
            globals.game_over = true;
            if self.sequence == NetSequence::GameLoop {
                self.set_sequence(NetSequence::OfflineEverybodyLeft);
            }
        }
        game.player_left(player_num);
    }

    pub fn is_net_game_paused(&self, globals: &GameGlobals) -> bool {
        globals
            .players
            .iter()
            .filter(|p| p.net_id.is_some() && !p.is_computer)
            .any(|p| p.pause_state != 0)
    }

    /// Keeps peers from timing out while the local player sits paused.
    pub fn broadcast_null_packet<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        self.broadcast(game, Message::Null)
    }

    /// Sends to every other player. A host loses only the peers it could not
    /// reach, a client that cannot reach the host is done.
    fn broadcast<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        message: Message,
    ) -> Result<(), FatalError> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        match session.send_message(Endpoint::AllPlayers, message) {
            Ok(()) => Ok(()),
            Err(e) if e.is_invariant() => Err(self.fatal(game, FatalError::Invariant(e))),
            Err(e) if self.is_host => {
                log::warn!("Broadcast incomplete: {}", e);
                Ok(())
            }
            Err(e) => Err(self.fatal(game, FatalError::SendFailed(e))),
        }
    }
}

/// True while a connected human player has not reached the barrier.
fn waiting_on_players(globals: &GameGlobals, arrived: &[bool; MAX_PLAYERS]) -> bool {
    globals
        .players
        .iter()
        .zip(arrived)
        .any(|(player, &done)| !done && player.net_id.is_some() && !player.is_computer)
}

impl Drop for NetGame {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MessageCounter;
    use crate::net::MessageHeader;

    fn frame_from(from: PlayerId, message: Message) -> Frame {
        let mut counter = MessageCounter::default();
        let mut header = MessageHeader::cleared(&mut counter);
        header.from = Endpoint::Player(from);
        header.to = Endpoint::HOST;
        Frame::stamp(&mut header, &message);
        Frame { header, message }
    }

    fn game_in_progress(num_real: usize) -> (NetGame, LocalGame) {
        let mut net = NetGame::new(NetConfig::default());
        net.in_progress = true;
        let mut game = LocalGame::new(3);
        game.globals.num_real_players = num_real;
        for i in 0..num_real {
            game.globals.players[i].net_id = PlayerId::new(i);
        }
        (net, game)
    }

    #[test]
    fn test_error_family() {
        assert!(!NetSequence::Offline.is_error());
        assert!(!NetSequence::GameLoop.is_error());
        assert!(NetSequence::SeedDesync.is_error());
        assert!(NetSequence::ClientOfflineBecauseKicked.is_error());
        assert_eq!(NetSequence::default(), NetSequence::Offline);
    }

    #[test]
    fn test_fatal_errors_pick_their_state() {
        let lost = FatalError::LostPacket {
            expected: 4,
            received: 6,
        };
        assert_eq!(lost.sequence(), NetSequence::ErrorLostPacket);
        assert_eq!(
            FatalError::TooManyTimeouts {
                hosting: true,
                count: 4
            }
            .sequence(),
            NetSequence::ErrorNoResponseFromClients
        );
        assert_eq!(
            FatalError::TooManyTimeouts {
                hosting: false,
                count: 4
            }
            .sequence(),
            NetSequence::ErrorNoResponseFromHost
        );
        assert_eq!(
            FatalError::Invariant(SessionError::HostToHost).sequence(),
            NetSequence::Error
        );
    }

    #[test]
    fn test_fatal_reaches_collaborator() {
        let mut net = NetGame::new(NetConfig::default());
        let mut game = LocalGame::new(1);
        let err = net.fatal(
            &mut game,
            FatalError::SeedDesync {
                host: 1,
                local: 2,
            },
        );
        assert!(matches!(err, FatalError::SeedDesync { .. }));
        assert_eq!(net.sequence(), NetSequence::SeedDesync);
        assert!(game.globals.game_over);
        assert_eq!(game.alerts().len(), 1);
        assert!(net.status_line().starts_with("GAME OUT OF SYNC (SEED): "));

        assert!(net.acknowledge_error());
        assert_eq!(net.sequence(), NetSequence::Offline);
        assert!(net.last_error().is_none());
        assert!(!net.acknowledge_error());
    }

    #[test]
    fn test_departed_player_goes_to_computer() {
        let (mut net, mut game) = game_in_progress(3);
        let leaving = PlayerId::new(2).unwrap();

        net.handle_other(
            &mut game,
            &frame_from(
                PlayerId::HOST,
                Message::PlayerLeft {
                    player_count: 2,
                    player: leaving,
                    name: String::from("GONE"),
                },
            ),
        );

        let player = &game.globals.players[2];
        assert!(player.is_computer);
        assert!(player.is_eliminated);
        assert_eq!(game.globals.num_real_players, 2);
        assert!(!game.globals.game_over);
    }

    #[test]
    fn test_last_opponent_leaving_ends_game() {
        let (mut net, mut game) = game_in_progress(2);
        net.sequence = NetSequence::GameLoop;

        net.player_unexpectedly_leaves(&mut game, PlayerId::new(1).unwrap());
        assert!(game.globals.game_over);
        assert_eq!(game.globals.num_real_players, 1);
        assert_eq!(net.sequence(), NetSequence::OfflineEverybodyLeft);
    }

    #[test]
    fn test_unknown_or_early_departure_is_ignored() {
        let (mut net, mut game) = game_in_progress(2);
        net.player_unexpectedly_leaves(&mut game, PlayerId::new(5).unwrap());
        assert_eq!(game.globals.num_real_players, 2);

        net.in_progress = false;
        net.player_unexpectedly_leaves(&mut game, PlayerId::new(1).unwrap());
        assert_eq!(game.globals.num_real_players, 2);
        assert!(!game.globals.players[1].is_computer);
    }

    #[test]
    fn test_termination_reason_picks_offline_state() {
        let cases = [
            (
                TerminationReason::Kicked,
                NetSequence::ClientOfflineBecauseKicked,
            ),
            (
                TerminationReason::NetworkError,
                NetSequence::ClientOfflineBecauseHostUnreachable,
            ),
            (
                TerminationReason::HostBailed,
                NetSequence::ClientOfflineBecauseHostBailed,
            ),
        ];
        for (reason, expected) in cases {
            let (mut net, mut game) = game_in_progress(2);
            net.is_client = true;
            net.handle_other(
                &mut game,
                &frame_from(PlayerId::HOST, Message::GameTerminated { reason }),
            );
            assert_eq!(net.sequence(), expected);
            assert!(game.globals.game_over);
            assert!(!net.is_in_progress());
        }
    }

    #[test]
    fn test_paused_when_any_real_player_paused() {
        let (net, mut game) = game_in_progress(2);
        let globals = &mut game.globals;
        assert!(!net.is_net_game_paused(globals));

        globals.players[4].pause_state = 1;
        assert!(!net.is_net_game_paused(globals));

        globals.players[1].pause_state = 1;
        assert!(net.is_net_game_paused(globals));
    }

    #[test]
    fn test_pause_follows_roster_after_departure() {
        let (mut net, mut game) = game_in_progress(3);
        net.player_unexpectedly_leaves(&mut game, PlayerId::new(1).unwrap());
        assert_eq!(game.globals.num_real_players, 2);

        game.globals.players[1].pause_state = 1;
        assert!(!net.is_net_game_paused(&game.globals));

        // Still driving, though past the real player count.
        game.globals.players[2].pause_state = 1;
        assert!(net.is_net_game_paused(&game.globals));
    }

    #[test]
    fn test_barrier_counts_each_player_once() {
        let (mut net, mut game) = game_in_progress(3);
        let one = Endpoint::Player(PlayerId::new(1).unwrap());
        let two = Endpoint::Player(PlayerId::new(2).unwrap());
        net.open_barrier(&game.globals);
        assert!(net.checked_in[0]);

        assert!(net.check_in(&game.globals, 1, one));
        assert!(net.check_in(&game.globals, 1, one));
        assert!(!net.barrier_complete(&game.globals));

        assert!(!net.check_in(&game.globals, 2, one));
        assert!(!net.check_in(&game.globals, MAX_PLAYERS, two));
        assert!(!net.barrier_complete(&game.globals));

        net.player_unexpectedly_leaves(&mut game, PlayerId::new(1).unwrap());
        assert!(!net.checked_in[1]);
        assert!(!net.barrier_complete(&game.globals));
        assert!(!net.check_in(&game.globals, 1, one));

        assert!(net.check_in(&game.globals, 2, two));
        assert!(net.barrier_complete(&game.globals));
    }

    #[test]
    fn test_start_needs_a_client() {
        let mut net = NetGame::new(NetConfig::default());
        assert!(!net.host_start_game());
        assert_eq!(net.sequence(), NetSequence::Offline);
        assert_eq!(net.status_line(), "OFFLINE");
    }

    #[test]
    fn test_broadcast_without_session_is_fatal() {
        let mut net = NetGame::new(NetConfig::default());
        let mut game = LocalGame::new(1);
        let err = net.broadcast_null_packet(&mut game).unwrap_err();
        assert!(matches!(err, FatalError::NoSession));
        assert_eq!(net.sequence(), NetSequence::Error);
    }
}
