use std::thread;
use std::time::{Duration, Instant};

use glam::Vec3;

use super::{FatalError, GameCollaborator, NetGame, waiting_on_players};
use crate::net::{
    ClientControlInfo, Endpoint, Frame, FrameCounter, FrameVerdict, HostControlInfo, MAX_PLAYERS,
    Message, SendCounter,
};

const POLL_SLEEP: Duration = Duration::from_millis(1);
const POSITION_TOLERANCE: f32 = 1.0e-3;

/// Frame counters and the last packet sent in each direction, for resends.
#[derive(Debug, Clone, Default)]
pub struct ControlSync {
    host_send: SendCounter,
    host_recv: FrameCounter,
    client_send: SendCounter,
    client_recv: [FrameCounter; MAX_PLAYERS],
    timeouts: u32,
    last_host_frame: Option<HostControlInfo>,
    last_client_frame: Option<ClientControlInfo>,
}

impl ControlSync {
    /// Back to frame zero in both directions, ready for a new level.
    pub fn reset(&mut self) {
        self.host_send.reset();
        self.host_recv.reset();
        self.client_send.reset();
        for counter in &mut self.client_recv {
            counter.reset();
        }
        self.timeouts = 0;
        self.last_host_frame = None;
        self.last_client_frame = None;
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn frames_sent(&self) -> u32 {
        self.host_send.peek().max(self.client_send.peek())
    }
}

enum Received {
    Applied,
    Skipped,
}

impl NetGame {
    /// Once per frame on the host: everyone's input plus the seed check.
    pub fn host_send_control_info_to_clients<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        let random_seed = game.random_long();
        let globals = game.globals();

        let mut info = HostControlInfo {
            fps: globals.fps,
            fps_frac: globals.fps_frac,
            random_seed,
            ..Default::default()
        };
        for (i, player) in globals.players.iter().enumerate() {
            info.control_bits[i] = player.control_bits;
            info.control_bits_new[i] = player.control_bits_new;
            info.analog_steering[i] = player.analog_steering;
            info.pause_state[i] = player.pause_state;
        }
        if self.config.check_positions {
            info.position_check = Some(std::array::from_fn(|i| globals.players[i].position));
        }
        info.frame_counter = self.control.host_send.next_frame();
        log::debug!("Host frame {} out", info.frame_counter);

        self.control.last_host_frame = Some(info);
        self.broadcast(game, Message::HostControlInfo(info))
    }

    /// Blocks until the host's next frame arrives and applies it.
    pub fn client_receive_control_info_from_host<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        let mut last_heard = Instant::now();
        loop {
            let Some(session) = self.session.as_mut() else {
                return Err(self.fatal(game, FatalError::NoSession));
            };

            match session.get() {
                Some(frame) => {
                    last_heard = Instant::now();
                    if let Message::HostControlInfo(info) = &frame.message {
                        if let Received::Applied = self.apply_host_frame(game, info)? {
                            self.control.timeouts = 0;
                            return Ok(());
                        }
                    } else {
                        self.handle_other(game, &frame);
                        if game.globals().game_over {
                            return Ok(());
                        }
                    }
                }
                None if last_heard.elapsed() > self.config.data_timeout() => {
                    last_heard = Instant::now();
                    self.register_timeout(game, false)?;
                    if let Some(info) = self.control.last_client_frame {
                        log::debug!("Resending client frame {}", info.frame_counter);
                        self.send_client_frame(game, info)?;
                    }
                }
                None => thread::sleep(POLL_SLEEP),
            }
        }
    }

    fn apply_host_frame<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        info: &HostControlInfo,
    ) -> Result<Received, FatalError> {
        match self.control.host_recv.check(info.frame_counter) {
            FrameVerdict::Stale => {
                log::debug!("Dropping stale host frame {}", info.frame_counter);
                return Ok(Received::Skipped);
            }
            FrameVerdict::Lost { expected, received } => {
                return Err(self.fatal(game, FatalError::LostPacket { expected, received }));
            }
            FrameVerdict::Accept => {}
        }

        let local = game.random_long();
        if local != info.random_seed {
            let err = FatalError::SeedDesync {
                host: info.random_seed,
                local,
            };
            return Err(self.fatal(game, err));
        }

        if self.config.check_positions
            && let Some(positions) = &info.position_check
        {
            let local = game.globals().players.iter().map(|p| p.position);
            if let Some(player) = first_position_mismatch(local, positions) {
                return Err(self.fatal(game, FatalError::PositionDesync { player }));
            }
        }

        let globals = game.globals_mut();
        globals.fps = info.fps;
        globals.fps_frac = info.fps_frac;
        for (i, player) in globals.players.iter_mut().enumerate() {
            player.control_bits = info.control_bits[i];
            player.control_bits_new = info.control_bits_new[i];
            player.analog_steering = info.analog_steering[i];
            player.pause_state = info.pause_state[i];
        }
        Ok(Received::Applied)
    }

    /// Once per frame on a client: the local player's input.
    pub fn client_send_control_info_to_host<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        let globals = game.globals();
        let me = globals.my_player_num;
        let Some(player) = globals.players.get(me) else {
            return Err(self.fatal(game, FatalError::BadPlayerNum(me)));
        };

        let info = ClientControlInfo {
            player_num: me as u8,
            control_bits: player.control_bits,
            control_bits_new: player.control_bits_new,
            frame_counter: self.control.client_send.next_frame(),
            analog_steering: player.analog_steering,
            pause_state: player.pause_state,
        };
        self.control.last_client_frame = Some(info);
        self.send_client_frame(game, info)
    }

    /// Only invariant failures are fatal. A lost send surfaces as a receive timeout.
    fn send_client_frame<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        info: ClientControlInfo,
    ) -> Result<(), FatalError> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fatal(game, FatalError::NoSession));
        };
        match session.send_message(Endpoint::HOST, Message::ClientControlInfo(info)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_invariant() => Err(self.fatal(game, FatalError::Invariant(e))),
            Err(e) => {
                log::warn!("Client frame {} not sent: {}", info.frame_counter, e);
                Ok(())
            }
        }
    }

    /// Blocks until every real client has reported this frame.
    pub fn host_receive_control_info_from_clients<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
    ) -> Result<(), FatalError> {
        let mut reported = [false; MAX_PLAYERS];
        reported[game.globals().my_player_num.min(MAX_PLAYERS - 1)] = true;
        let mut last_heard = Instant::now();

        while !game.globals().game_over && waiting_on_players(game.globals(), &reported) {
            let Some(session) = self.session.as_mut() else {
                return Err(self.fatal(game, FatalError::NoSession));
            };

            match session.get() {
                Some(frame) => {
                    last_heard = Instant::now();
                    if let Message::ClientControlInfo(info) = &frame.message {
                        if let Received::Applied = self.apply_client_frame(game, &frame, info)? {
                            reported[info.player_num as usize] = true;
                        }
                    } else {
                        self.handle_other(game, &frame);
                    }
                }
                None if last_heard.elapsed() > self.config.data_timeout() => {
                    last_heard = Instant::now();
                    self.register_timeout(game, true)?;
                    if let Some(info) = self.control.last_host_frame {
                        log::debug!("Resending host frame {}", info.frame_counter);
                        self.broadcast(game, Message::HostControlInfo(info))?;
                    }
                }
                None => thread::sleep(POLL_SLEEP),
            }
        }

        self.control.timeouts = 0;
        Ok(())
    }

    fn apply_client_frame<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        frame: &Frame,
        info: &ClientControlInfo,
    ) -> Result<Received, FatalError> {
        let player_num = info.player_num as usize;
        let sender = frame.header.from.player();
        if sender.is_none() || game.globals().players[player_num].net_id != sender {
            log::warn!(
                "{} sent input for player {}, which is not theirs",
                frame.header.from,
                player_num
            );
            return Ok(Received::Skipped);
        }

        match self.control.client_recv[player_num].check(info.frame_counter) {
            FrameVerdict::Stale => {
                log::debug!(
                    "Dropping stale frame {} from player {}",
                    info.frame_counter,
                    player_num
                );
                return Ok(Received::Skipped);
            }
            FrameVerdict::Lost { expected, received } => {
                return Err(self.fatal(game, FatalError::LostPacket { expected, received }));
            }
            FrameVerdict::Accept => {}
        }

        let player = &mut game.globals_mut().players[player_num];
        player.control_bits = info.control_bits;
        player.control_bits_new = info.control_bits_new;
        player.analog_steering = info.analog_steering;
        player.pause_state = info.pause_state;
        Ok(Received::Applied)
    }

    fn register_timeout<G: GameCollaborator + ?Sized>(
        &mut self,
        game: &mut G,
        hosting: bool,
    ) -> Result<(), FatalError> {
        self.control.timeouts += 1;
        let count = self.control.timeouts;
        log::warn!("Control sync timeout {} of {}", count, self.config.max_timeouts);
        if count > self.config.max_timeouts {
            return Err(self.fatal(game, FatalError::TooManyTimeouts { hosting, count }));
        }
        Ok(())
    }
}

fn first_position_mismatch(
    local: impl Iterator<Item = Vec3>,
    host: &[Vec3; MAX_PLAYERS],
) -> Option<usize> {
    local
        .zip(host)
        .position(|(mine, theirs)| !mine.abs_diff_eq(*theirs, POSITION_TOLERANCE))
}
