use std::time::Duration;

use sprocket::FaultInjection;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub frame_rate: u32,
    /// Race length in frames. Clients race until the host ends the game.
    pub frames: u32,
    /// Players, host included, before the lobby closes.
    pub min_players: usize,
    pub track_num: u8,
    pub game_mode: u8,
    pub vehicle_type: u16,
    pub seed: u64,
    pub search_time: Duration,
    pub faults: Option<FaultInjection>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            frames: 300,
            min_players: 2,
            track_num: 0,
            game_mode: 0,
            vehicle_type: 0,
            seed: 0x5EED,
            search_time: Duration::from_secs(10),
            faults: None,
        }
    }
}

impl DriverConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}
