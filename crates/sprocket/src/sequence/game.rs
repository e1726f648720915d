use glam::{Vec2, Vec3};
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg32;

use super::FatalError;
use crate::net::{ControlBits, MAX_PLAYERS, PlayerId};

/// Per-player state owned by the game layer, indexed by player number.
#[derive(Debug, Clone, Default)]
pub struct PlayerInfo {
    pub vehicle_type: u16,
    pub sex: u16,
    pub skin: u16,
    pub control_bits: ControlBits,
    pub control_bits_new: ControlBits,
    pub analog_steering: Vec2,
    pub position: Vec3,
    pub pause_state: u8,
    pub is_computer: bool,
    pub is_eliminated: bool,
    /// Session id of the machine driving this player, if it is a real one.
    pub net_id: Option<PlayerId>,
}

#[derive(Debug, Clone, Default)]
pub struct GameGlobals {
    pub game_mode: u8,
    pub age: u8,
    pub track_num: u8,
    pub difficulty: u8,
    pub tag_duration: u8,
    pub tracks_completed: u8,
    pub players: [PlayerInfo; MAX_PLAYERS],
    pub num_real_players: usize,
    pub my_player_num: usize,
    pub fps: f32,
    pub fps_frac: f32,
    pub game_over: bool,
}

/// What the surrounding game provides to the network sequence.
pub trait GameCollaborator {
    fn globals(&self) -> &GameGlobals;

    fn globals_mut(&mut self) -> &mut GameGlobals;

    /// Next value of the deterministic generator every machine advances in step.
    fn random_long(&mut self) -> u32;

    /// Unrecoverable condition. The sequence has already moved to an error state.
    fn fatal_alert(&mut self, error: &FatalError);

    /// Called after a departed player has been handed to the computer.
    fn player_left(&mut self, _player_num: usize) {}
}

/// Headless collaborator: plain globals plus a seeded PCG.
#[derive(Debug)]
pub struct LocalGame {
    pub globals: GameGlobals,
    rng: Pcg32,
    alerts: Vec<String>,
}

impl LocalGame {
    pub fn new(seed: u64) -> Self {
        Self {
            globals: GameGlobals::default(),
            rng: Pcg32::seed_from_u64(seed),
            alerts: Vec::new(),
        }
    }

    /// Every machine restarts from the same seed before a race.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = Pcg32::seed_from_u64(seed);
    }

    pub fn alerts(&self) -> &[String] {
        &self.alerts
    }
}

impl GameCollaborator for LocalGame {
    fn globals(&self) -> &GameGlobals {
        &self.globals
    }

    fn globals_mut(&mut self) -> &mut GameGlobals {
        &mut self.globals
    }

    fn random_long(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn fatal_alert(&mut self, error: &FatalError) {
        self.alerts.push(error.to_string());
        self.globals.game_over = true;
    }
}
