use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use sprocket::{LobbySearch, LocalGame, NetConfig, NetGame, NetSequence, Session, SessionEvent};

use crate::config::DriverConfig;
use crate::simulation::{autopilot, move_players};

const LOBBY_SLEEP: Duration = Duration::from_millis(10);

/// Plays the menu and game-frame side of the network game without a screen.
pub struct Driver {
    net: NetGame,
    game: LocalGame,
    config: DriverConfig,
}

impl Driver {
    pub fn new(net_config: NetConfig, config: DriverConfig) -> Self {
        Self {
            net: NetGame::new(net_config),
            game: LocalGame::new(config.seed),
            config,
        }
    }

    pub fn host(&mut self) -> Result<()> {
        self.net.setup_network_hosting()?;
        log::info!("{}", self.net.status_line());

        while self.net.session().map_or(0, Session::num_active_players) < self.config.min_players {
            self.check_sequence()?;
            self.pump()?;
        }

        self.game.globals.game_mode = self.config.game_mode;
        self.game.globals.track_num = self.config.track_num;
        if !self.net.host_start_game() {
            bail!("could not start: {}", self.net.status_line());
        }
        while self.net.sequence() == NetSequence::HostReadyToStartGame {
            self.pump()?;
        }
        self.expect_sequence(NetSequence::HostStartingGame)?;

        self.race()
    }

    /// Joins `addr` directly, or the first lobby discovery turns up.
    pub fn join(&mut self, addr: Option<SocketAddr>) -> Result<()> {
        match addr {
            Some(addr) => self.net.setup_network_join_address(addr)?,
            None => self.net.setup_network_join()?,
        }

        let deadline = Instant::now() + self.config.search_time;
        loop {
            match self.net.sequence() {
                NetSequence::ClientSearchingForGames | NetSequence::ClientFoundGames => {
                    if Instant::now() > deadline {
                        bail!("no games found on the local network");
                    }
                }
                NetSequence::ClientJoiningGame => {}
                _ => break,
            }
            self.pump()?;
        }
        self.expect_sequence(NetSequence::ClientJoinedGame)?;

        self.race()
    }

    fn race(&mut self) -> Result<()> {
        let me = self.game.globals.my_player_num;
        self.game.globals.players[me].vehicle_type = self.config.vehicle_type;
        self.net.player_broadcast_vehicle_type(&mut self.game)?;
        self.net.get_vehicle_selection_from_net_players(&mut self.game)?;
        self.expect_sequence(NetSequence::GotAllPlayerVehicles)?;

        self.game.reseed(self.config.seed);
        if self.net.is_host() {
            self.game.globals.fps = self.config.frame_rate as f32;
            self.game.globals.fps_frac = 1.0 / self.config.frame_rate.max(1) as f32;
            self.net.host_wait_for_players_to_prepare_level(&mut self.game)?;
        } else {
            self.net.client_tell_host_level_is_prepared(&mut self.game)?;
        }
        self.expect_sequence(NetSequence::GameLoop)?;
        log::info!(
            "Racing as player {} of {}",
            me,
            self.game.globals.num_real_players
        );

        let frame_duration = self.config.frame_duration();
        let mut frame = 0;
        while self.net.sequence() == NetSequence::GameLoop && !self.game.globals.game_over {
            let started = Instant::now();

            if self.net.is_host() {
                if frame >= self.config.frames {
                    break;
                }
                autopilot(&mut self.game.globals.players[me], frame, me);
                self.net.host_send_control_info_to_clients(&mut self.game)?;
                move_players(&mut self.game.globals);
                self.net.host_receive_control_info_from_clients(&mut self.game)?;
            } else {
                self.net.client_receive_control_info_from_host(&mut self.game)?;
                if self.game.globals.game_over {
                    break;
                }
                move_players(&mut self.game.globals);
                autopilot(&mut self.game.globals.players[me], frame, me);
                self.net.client_send_control_info_to_host(&mut self.game)?;
            }

            self.log_events();
            frame += 1;
            if let Some(rest) = frame_duration.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }

        let position = self.game.globals.players[me].position;
        log::info!(
            "Race over after {} frames at ({:.1}, {:.1}): {}",
            frame,
            position.x,
            position.z,
            self.net.status_line()
        );
        self.net.end_network_game();
        Ok(())
    }

    fn pump(&mut self) -> Result<bool> {
        let got_message = self.net.update(&mut self.game)?;
        self.log_events();
        if !got_message {
            thread::sleep(LOBBY_SLEEP);
        }
        Ok(got_message)
    }

    fn check_sequence(&self) -> Result<()> {
        if self.net.sequence().is_error() {
            bail!("{}", self.net.status_line());
        }
        Ok(())
    }

    fn expect_sequence(&self, sequence: NetSequence) -> Result<()> {
        self.check_sequence()?;
        if self.net.sequence() != sequence {
            bail!(
                "expected {:?}, ended up in {:?}: {}",
                sequence,
                self.net.sequence(),
                self.net.status_line()
            );
        }
        Ok(())
    }

    fn log_events(&mut self) {
        let Some(session) = self.net.session_mut() else {
            return;
        };
        let events: Vec<SessionEvent> = session.drain_events().collect();

        for event in events {
            match event {
                SessionEvent::ClientAccepted { player, addr } => {
                    log::info!("Connection from {:?} is {}", addr, player);
                }
                SessionEvent::JoinDenied { addr, reason } => {
                    log::warn!("Turned away {:?}: {}", addr, reason);
                }
                SessionEvent::PlayerApproved { player, name } => {
                    log::info!("'{}' is in the game as {}", name, player);
                    if session.is_hosting()
                        && !player.is_host()
                        && let Some(faults) = &self.config.faults
                    {
                        log::warn!("Injecting send faults for {}", player);
                        session.inject_faults(player, faults.clone());
                    }
                }
                SessionEvent::PlayerRemoved {
                    player,
                    name,
                    reason,
                } => {
                    log::info!("'{}' ({}) is gone: {}", name, player, reason.as_str());
                }
                SessionEvent::HostLost => log::warn!("The host went away"),
            }
        }
    }
}

/// Lists advertised lobbies without joining any.
pub fn search(net_config: &NetConfig, duration: Duration) -> Result<()> {
    let mut search = LobbySearch::start(net_config)?;
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        search.tick()?;
        thread::sleep(LOBBY_SLEEP);
    }

    if search.num_found() == 0 {
        log::info!("No games found");
    }
    for (n, lobby) in search.lobbies().iter().enumerate() {
        if let Some(addr) = search.host_address(n) {
            println!(
                "{}: {} (heard from {}, {:.1}s ago)",
                n,
                addr,
                lobby.source,
                lobby.found_at.elapsed().as_secs_f32()
            );
        }
    }
    search.dispose();
    Ok(())
}
