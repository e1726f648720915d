use bitflags::bitflags;
use bytes::{Buf, BufMut};
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use super::codec::CodecError;
use super::protocol::{
    DENIED_REASON_LENGTH, MAX_PLAYERS, MessageKind, PLAYER_NAME_LENGTH, PlayerId,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlBits: u32 {
        const ACCELERATE = 1 << 0;
        const BRAKE = 1 << 1;
        const STEER_LEFT = 1 << 2;
        const STEER_RIGHT = 1 << 3;
        const THROW_FORWARD = 1 << 4;
        const THROW_BACKWARD = 1 << 5;
        const USE_POWERUP = 1 << 6;
        const LOOK_BACK = 1 << 7;
        const CAMERA_MODE = 1 << 8;
        const PAUSE = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    HostBailed,
    Kicked,
    NetworkError,
}

impl TerminationReason {
    fn to_wire(self) -> u32 {
        match self {
            TerminationReason::HostBailed => 1,
            TerminationReason::Kicked => 2,
            TerminationReason::NetworkError => 3,
        }
    }

    fn from_wire(raw: u32) -> Result<Self, CodecError> {
        match raw {
            1 => Ok(TerminationReason::HostBailed),
            2 => Ok(TerminationReason::Kicked),
            3 => Ok(TerminationReason::NetworkError),
            _ => Err(CodecError::InvalidField {
                field: "termination reason",
                value: raw as i64,
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::HostBailed => "host left the game",
            TerminationReason::Kicked => "kicked by host",
            TerminationReason::NetworkError => "host unreachable",
        }
    }
}

/// Everything a client needs to set up the same match as the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameConfiguration {
    pub game_mode: u8,
    pub age: u8,
    pub track_num: u8,
    pub player_num: u8,
    pub num_players: u8,
    pub difficulty: u8,
    pub tag_duration: u8,
    pub tracks_completed: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerCharType {
    pub player_num: u8,
    pub vehicle_type: u16,
    pub sex: u16,
    pub skin: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostControlInfo {
    pub fps: f32,
    pub fps_frac: f32,
    pub random_seed: u32,
    pub control_bits: [ControlBits; MAX_PLAYERS],
    pub control_bits_new: [ControlBits; MAX_PLAYERS],
    pub analog_steering: [Vec2; MAX_PLAYERS],
    pub frame_counter: u32,
    pub pause_state: [u8; MAX_PLAYERS],
    pub position_check: Option<[Vec3; MAX_PLAYERS]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClientControlInfo {
    pub player_num: u8,
    pub control_bits: ControlBits,
    pub control_bits_new: ControlBits,
    pub frame_counter: u32,
    pub analog_steering: Vec2,
    pub pause_state: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    JoinRequest {
        name: String,
    },
    /// The assigned id travels in the header's `to` field.
    JoinApproved,
    JoinDenied {
        reason: String,
    },
    PlayerJoined {
        player_count: u32,
        player: PlayerId,
        name: String,
    },
    PlayerLeft {
        player_count: u32,
        player: PlayerId,
        name: String,
    },
    GameTerminated {
        reason: TerminationReason,
    },
    Configure(GameConfiguration),
    PlayerCharType(PlayerCharType),
    Sync {
        player_num: u8,
    },
    HostControlInfo(HostControlInfo),
    ClientControlInfo(ClientControlInfo),
    Null,
}

const ROSTER_PAYLOAD_LEN: usize = 4 + 4 + PLAYER_NAME_LENGTH;
const HOST_CONTROL_PAYLOAD_LEN: usize =
    4 + 4 + 4 + 4 * MAX_PLAYERS * 2 + 8 * MAX_PLAYERS + 4 + MAX_PLAYERS + 1 + 12 * MAX_PLAYERS;
const CLIENT_CONTROL_PAYLOAD_LEN: usize = 2 + 4 + 4 + 4 + 8 + 1;

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::JoinRequest { .. } => MessageKind::JoinRequest,
            Message::JoinApproved => MessageKind::JoinApproved,
            Message::JoinDenied { .. } => MessageKind::JoinDenied,
            Message::PlayerJoined { .. } => MessageKind::PlayerJoined,
            Message::PlayerLeft { .. } => MessageKind::PlayerLeft,
            Message::GameTerminated { .. } => MessageKind::GameTerminated,
            Message::Configure(_) => MessageKind::Configure,
            Message::PlayerCharType(_) => MessageKind::PlayerCharType,
            Message::Sync { .. } => MessageKind::Sync,
            Message::HostControlInfo(_) => MessageKind::HostControlInfo,
            Message::ClientControlInfo(_) => MessageKind::ClientControlInfo,
            Message::Null => MessageKind::Null,
        }
    }

    /// Every kind has a fixed payload size.
    pub fn payload_len(kind: MessageKind) -> usize {
        match kind {
            MessageKind::JoinRequest => PLAYER_NAME_LENGTH,
            MessageKind::JoinApproved => 0,
            MessageKind::JoinDenied => DENIED_REASON_LENGTH,
            MessageKind::PlayerJoined | MessageKind::PlayerLeft => ROSTER_PAYLOAD_LEN,
            MessageKind::GameTerminated => 4,
            MessageKind::Configure => 8,
            MessageKind::PlayerCharType => 8,
            MessageKind::Sync => 2,
            MessageKind::HostControlInfo => HOST_CONTROL_PAYLOAD_LEN,
            MessageKind::ClientControlInfo => CLIENT_CONTROL_PAYLOAD_LEN,
            MessageKind::Null => 0,
        }
    }

    pub(crate) fn write_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            Message::JoinRequest { name } => put_fixed_str(buf, name, PLAYER_NAME_LENGTH),
            Message::JoinApproved | Message::Null => {}
            Message::JoinDenied { reason } => put_fixed_str(buf, reason, DENIED_REASON_LENGTH),
            Message::PlayerJoined {
                player_count,
                player,
                name,
            }
            | Message::PlayerLeft {
                player_count,
                player,
                name,
            } => {
                buf.put_u32(*player_count);
                buf.put_i32(player.to_wire());
                put_fixed_str(buf, name, PLAYER_NAME_LENGTH);
            }
            Message::GameTerminated { reason } => buf.put_u32(reason.to_wire()),
            Message::Configure(config) => {
                buf.put_u8(config.game_mode);
                buf.put_u8(config.age);
                buf.put_u8(config.track_num);
                buf.put_u8(config.player_num);
                buf.put_u8(config.num_players);
                buf.put_u8(config.difficulty);
                buf.put_u8(config.tag_duration);
                buf.put_u8(config.tracks_completed);
            }
            Message::PlayerCharType(char_type) => {
                buf.put_u16(char_type.player_num as u16);
                buf.put_u16(char_type.vehicle_type);
                buf.put_u16(char_type.sex);
                buf.put_u16(char_type.skin);
            }
            Message::Sync { player_num } => buf.put_u16(*player_num as u16),
            Message::HostControlInfo(info) => {
                buf.put_f32(info.fps);
                buf.put_f32(info.fps_frac);
                buf.put_u32(info.random_seed);
                for bits in &info.control_bits {
                    buf.put_u32(bits.bits());
                }
                for bits in &info.control_bits_new {
                    buf.put_u32(bits.bits());
                }
                for steering in &info.analog_steering {
                    put_vec2(buf, *steering);
                }
                buf.put_u32(info.frame_counter);
                buf.put_slice(&info.pause_state);
                match &info.position_check {
                    Some(positions) => {
                        buf.put_u8(1);
                        for position in positions {
                            put_vec3(buf, *position);
                        }
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_bytes(0, 12 * MAX_PLAYERS);
                    }
                }
            }
            Message::ClientControlInfo(info) => {
                buf.put_u16(info.player_num as u16);
                buf.put_u32(info.control_bits.bits());
                buf.put_u32(info.control_bits_new.bits());
                buf.put_u32(info.frame_counter);
                put_vec2(buf, info.analog_steering);
                buf.put_u8(info.pause_state);
            }
        }
    }

    pub(crate) fn decode(kind: MessageKind, mut payload: &[u8]) -> Result<Self, CodecError> {
        let expected = Self::payload_len(kind);
        if payload.len() != expected {
            return Err(CodecError::PayloadLength {
                kind,
                expected,
                actual: payload.len(),
            });
        }
        let buf = &mut payload;

        let message = match kind {
            MessageKind::JoinRequest => Message::JoinRequest {
                name: get_fixed_str(buf, PLAYER_NAME_LENGTH),
            },
            MessageKind::JoinApproved => Message::JoinApproved,
            MessageKind::JoinDenied => Message::JoinDenied {
                reason: get_fixed_str(buf, DENIED_REASON_LENGTH),
            },
            MessageKind::PlayerJoined => {
                let (player_count, player, name) = get_roster_entry(buf)?;
                Message::PlayerJoined {
                    player_count,
                    player,
                    name,
                }
            }
            MessageKind::PlayerLeft => {
                let (player_count, player, name) = get_roster_entry(buf)?;
                Message::PlayerLeft {
                    player_count,
                    player,
                    name,
                }
            }
            MessageKind::GameTerminated => Message::GameTerminated {
                reason: TerminationReason::from_wire(buf.get_u32())?,
            },
            MessageKind::Configure => {
                let config = GameConfiguration {
                    game_mode: buf.get_u8(),
                    age: buf.get_u8(),
                    track_num: buf.get_u8(),
                    player_num: buf.get_u8(),
                    num_players: buf.get_u8(),
                    difficulty: buf.get_u8(),
                    tag_duration: buf.get_u8(),
                    tracks_completed: buf.get_u8(),
                };
                check_player_num(config.player_num)?;
                if config.num_players as usize > MAX_PLAYERS {
                    return Err(CodecError::InvalidField {
                        field: "num_players",
                        value: config.num_players as i64,
                    });
                }
                Message::Configure(config)
            }
            MessageKind::PlayerCharType => Message::PlayerCharType(PlayerCharType {
                player_num: get_player_num(buf)?,
                vehicle_type: buf.get_u16(),
                sex: buf.get_u16(),
                skin: buf.get_u16(),
            }),
            MessageKind::Sync => Message::Sync {
                player_num: get_player_num(buf)?,
            },
            MessageKind::HostControlInfo => {
                let mut info = HostControlInfo {
                    fps: buf.get_f32(),
                    fps_frac: buf.get_f32(),
                    random_seed: buf.get_u32(),
                    ..Default::default()
                };
                for bits in &mut info.control_bits {
                    *bits = ControlBits::from_bits_retain(buf.get_u32());
                }
                for bits in &mut info.control_bits_new {
                    *bits = ControlBits::from_bits_retain(buf.get_u32());
                }
                for steering in &mut info.analog_steering {
                    *steering = get_vec2(buf);
                }
                info.frame_counter = buf.get_u32();
                buf.copy_to_slice(&mut info.pause_state);
                let has_positions = buf.get_u8() != 0;
                let mut positions = [Vec3::ZERO; MAX_PLAYERS];
                for position in &mut positions {
                    *position = get_vec3(buf);
                }
                info.position_check = has_positions.then_some(positions);
                Message::HostControlInfo(info)
            }
            MessageKind::ClientControlInfo => Message::ClientControlInfo(ClientControlInfo {
                player_num: get_player_num(buf)?,
                control_bits: ControlBits::from_bits_retain(buf.get_u32()),
                control_bits_new: ControlBits::from_bits_retain(buf.get_u32()),
                frame_counter: buf.get_u32(),
                analog_steering: get_vec2(buf),
                pause_state: buf.get_u8(),
            }),
            MessageKind::Null => Message::Null,
        };
        Ok(message)
    }
}

/// Longest prefix of `s` that fits a fixed-width NUL-terminated field.
pub fn truncate_name(s: &str, field_len: usize) -> &str {
    let max = field_len.saturating_sub(1);
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn put_fixed_str<B: BufMut>(buf: &mut B, s: &str, field_len: usize) {
    let bytes = truncate_name(s, field_len).as_bytes();
    buf.put_slice(bytes);
    buf.put_bytes(0, field_len - bytes.len());
}

fn get_fixed_str<B: Buf>(buf: &mut B, field_len: usize) -> String {
    let mut raw = vec![0u8; field_len];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(field_len);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn get_roster_entry<B: Buf>(buf: &mut B) -> Result<(u32, PlayerId, String), CodecError> {
    let player_count = buf.get_u32();
    let player = PlayerId::from_wire(buf.get_i32())?;
    let name = get_fixed_str(buf, PLAYER_NAME_LENGTH);
    Ok((player_count, player, name))
}

fn check_player_num(player_num: u8) -> Result<u8, CodecError> {
    if (player_num as usize) < MAX_PLAYERS {
        Ok(player_num)
    } else {
        Err(CodecError::InvalidField {
            field: "player_num",
            value: player_num as i64,
        })
    }
}

fn get_player_num<B: Buf>(buf: &mut B) -> Result<u8, CodecError> {
    let raw = buf.get_u16();
    u8::try_from(raw)
        .map_err(|_| CodecError::InvalidField {
            field: "player_num",
            value: raw as i64,
        })
        .and_then(check_player_num)
}

fn put_vec2<B: BufMut>(buf: &mut B, v: Vec2) {
    buf.put_f32(v.x);
    buf.put_f32(v.y);
}

fn put_vec3<B: BufMut>(buf: &mut B, v: Vec3) {
    buf.put_f32(v.x);
    buf.put_f32(v.y);
    buf.put_f32(v.z);
}

fn get_vec2<B: Buf>(buf: &mut B) -> Vec2 {
    Vec2::new(buf.get_f32(), buf.get_f32())
}

fn get_vec3<B: Buf>(buf: &mut B) -> Vec3 {
    Vec3::new(buf.get_f32(), buf.get_f32(), buf.get_f32())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: &Message) -> Vec<u8> {
        let mut buf = Vec::new();
        message.write_payload(&mut buf);
        buf
    }

    #[test]
    fn test_payload_sizes_match_layout() {
        let samples = [
            Message::JoinRequest {
                name: "DRIVER".into(),
            },
            Message::JoinApproved,
            Message::JoinDenied {
                reason: "THE GAME IS FULL.".into(),
            },
            Message::PlayerLeft {
                player_count: 2,
                player: PlayerId::new(3).unwrap(),
                name: "GONE".into(),
            },
            Message::GameTerminated {
                reason: TerminationReason::Kicked,
            },
            Message::Configure(GameConfiguration::default()),
            Message::PlayerCharType(PlayerCharType::default()),
            Message::Sync { player_num: 1 },
            Message::HostControlInfo(HostControlInfo::default()),
            Message::ClientControlInfo(ClientControlInfo::default()),
            Message::Null,
        ];
        for message in &samples {
            assert_eq!(
                encode(message).len(),
                Message::payload_len(message.kind()),
                "{}",
                message.kind()
            );
        }
    }

    #[test]
    fn test_host_control_info_decodes_positions() {
        let mut info = HostControlInfo {
            fps: 60.0,
            fps_frac: 1.0 / 60.0,
            random_seed: 0xDEAD_BEEF,
            frame_counter: 42,
            ..Default::default()
        };
        info.control_bits[2] = ControlBits::ACCELERATE | ControlBits::STEER_LEFT;
        info.analog_steering[4] = Vec2::new(-0.5, 0.25);
        info.pause_state[1] = 1;
        info.position_check = Some([Vec3::new(1.0, 2.0, 3.0); MAX_PLAYERS]);

        let message = Message::HostControlInfo(info);
        let decoded = Message::decode(MessageKind::HostControlInfo, &encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_names_are_truncated_to_field() {
        let long = "X".repeat(80);
        let message = Message::JoinRequest { name: long };
        let decoded = Message::decode(MessageKind::JoinRequest, &encode(&message)).unwrap();
        match decoded {
            Message::JoinRequest { name } => assert_eq!(name.len(), PLAYER_NAME_LENGTH - 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let name = "é".repeat(20);
        let cut = truncate_name(&name, PLAYER_NAME_LENGTH);
        assert!(cut.len() <= PLAYER_NAME_LENGTH - 1);
        assert_eq!(cut.len() % 2, 0);
    }

    #[test]
    fn test_wrong_payload_length_rejected() {
        let err = Message::decode(MessageKind::Sync, &[0, 1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::PayloadLength { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn test_out_of_range_player_num_rejected() {
        let err = Message::decode(MessageKind::Sync, &[0, 9]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { field: "player_num", .. }));

        let err = Message::decode(MessageKind::GameTerminated, &[0, 0, 0, 9]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { .. }));
    }
}
