use glam::{Vec2, Vec3};

use sprocket::net::ControlBits;
use sprocket::{GameGlobals, PlayerInfo};

const SPEED: f32 = 20.0;
const BRAKE_SPEED: f32 = 5.0;
const STEER_SPEED: f32 = 8.0;
const FRAMES_PER_MANEUVER: u32 = 45;

/// Scripted input standing in for the keyboard.
pub fn autopilot(player: &mut PlayerInfo, frame: u32, player_num: usize) {
    let maneuver = (frame / FRAMES_PER_MANEUVER + player_num as u32) % 4;
    let (bits, steering) = match maneuver {
        0 => (ControlBits::ACCELERATE | ControlBits::STEER_LEFT, -1.0),
        1 => (ControlBits::ACCELERATE, 0.0),
        2 => (ControlBits::ACCELERATE | ControlBits::STEER_RIGHT, 1.0),
        _ => (ControlBits::BRAKE, 0.0),
    };

    player.control_bits_new = bits.difference(player.control_bits);
    player.control_bits = bits;
    player.analog_steering = Vec2::new(steering, 0.0);
}

/// Advances every vehicle by one frame using the host's frame time.
pub fn move_players(globals: &mut GameGlobals) {
    let dt = globals.fps_frac;
    for player in globals.players.iter_mut().filter(|p| !p.is_eliminated) {
        let forward = if player.control_bits.contains(ControlBits::ACCELERATE) {
            SPEED
        } else if player.control_bits.contains(ControlBits::BRAKE) {
            BRAKE_SPEED
        } else {
            0.0
        };
        let velocity = Vec3::new(player.analog_steering.x * STEER_SPEED, 0.0, forward);
        player.position += velocity * dt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autopilot_reports_new_presses() {
        let mut player = PlayerInfo::default();
        autopilot(&mut player, 0, 0);
        assert!(player.control_bits.contains(ControlBits::STEER_LEFT));
        assert_eq!(player.control_bits_new, player.control_bits);

        autopilot(&mut player, FRAMES_PER_MANEUVER, 0);
        assert_eq!(player.control_bits, ControlBits::ACCELERATE);
        assert!(player.control_bits_new.is_empty());
    }

    #[test]
    fn test_same_inputs_same_positions() {
        let mut a = GameGlobals {
            fps_frac: 1.0 / 30.0,
            ..Default::default()
        };
        let mut b = a.clone();
        for frame in 0..200 {
            autopilot(&mut a.players[1], frame, 1);
            autopilot(&mut b.players[1], frame, 1);
            move_players(&mut a);
            move_players(&mut b);
        }
        assert_eq!(a.players[1].position, b.players[1].position);
        assert!(a.players[1].position.z > 0.0);
    }
}
