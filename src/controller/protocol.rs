//! Report framing for the console's HID protocol.
//!
//! Input reports go out on the interrupt channel with the `0xA1` HIDP header.
//! The console talks back with `0xA2` output reports; the only ones we act on
//! are subcommands (`0xA2 0x01`), which are answered with a `0x21` reply.

use super::buttons::{ControllerKind, InputPayload};
use tracing::debug;

pub const INPUT_HEADER: u8 = 0xA1;
pub const OUTPUT_HEADER: u8 = 0xA2;

pub const REPORT_STANDARD: u8 = 0x30;
pub const REPORT_SUBCOMMAND_REPLY: u8 = 0x21;
pub const REPORT_SUBCOMMAND: u8 = 0x01;
pub const REPORT_RUMBLE_ONLY: u8 = 0x10;

pub const SUBCMD_DEVICE_INFO: u8 = 0x02;
pub const SUBCMD_SET_INPUT_MODE: u8 = 0x03;
pub const SUBCMD_TRIGGER_ELAPSED: u8 = 0x04;
pub const SUBCMD_SHIPMENT: u8 = 0x08;
pub const SUBCMD_SPI_READ: u8 = 0x10;
pub const SUBCMD_MCU_CONFIG: u8 = 0x21;
pub const SUBCMD_PLAYER_LIGHTS: u8 = 0x30;
pub const SUBCMD_HOME_LIGHT: u8 = 0x38;
pub const SUBCMD_IMU_ENABLE: u8 = 0x40;
pub const SUBCMD_IMU_SENSITIVITY: u8 = 0x41;
pub const SUBCMD_VIBRATION: u8 = 0x48;

/// Length of every frame we put on the interrupt channel
pub const REPORT_LEN: usize = 50;

const VIBRATOR_BYTE: u8 = 0x0B;

/// Frame received from the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputReport {
    Subcommand { id: u8, data: Vec<u8> },
    RumbleOnly,
    Unknown(Vec<u8>),
}

pub fn parse_output_report(frame: &[u8]) -> OutputReport {
    match frame {
        [OUTPUT_HEADER, REPORT_SUBCOMMAND, rest @ ..] if rest.len() >= 10 => {
            // timer (1) + rumble (8) precede the subcommand id
            OutputReport::Subcommand {
                id: rest[9],
                data: rest[10..].to_vec(),
            }
        }
        [OUTPUT_HEADER, REPORT_RUMBLE_ONLY, ..] => OutputReport::RumbleOnly,
        other => OutputReport::Unknown(other.to_vec()),
    }
}

/// Builds a subcommand frame the way the console sends it. Used by the loopback console.
pub fn subcommand_frame(timer: u8, id: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12 + data.len());
    frame.extend_from_slice(&[OUTPUT_HEADER, REPORT_SUBCOMMAND, timer]);
    frame.extend_from_slice(&[0x00, 0x01, 0x40, 0x40, 0x00, 0x01, 0x40, 0x40]);
    frame.push(id);
    frame.extend_from_slice(data);
    frame
}

fn report_header(report_id: u8, timer: u8, kind: ControllerKind, payload: &InputPayload) -> Vec<u8> {
    let mut report = vec![0u8; REPORT_LEN];
    report[0] = INPUT_HEADER;
    report[1] = report_id;
    report[2] = timer;
    report[3] = kind.battery_byte();
    report[4..7].copy_from_slice(&payload.buttons.to_bytes());
    report[7..10].copy_from_slice(&payload.left_stick.to_bytes());
    report[10..13].copy_from_slice(&payload.right_stick.to_bytes());
    report[13] = VIBRATOR_BYTE;
    report
}

/// Standard full input report (`0x30`). IMU bytes stay zeroed.
pub fn input_report(timer: u8, kind: ControllerKind, payload: &InputPayload) -> Vec<u8> {
    report_header(REPORT_STANDARD, timer, kind, payload)
}

/// Subcommand reply (`0x21`) carrying the current input state
pub fn subcommand_reply(
    timer: u8,
    kind: ControllerKind,
    payload: &InputPayload,
    ack: u8,
    subcommand: u8,
    data: &[u8],
) -> Vec<u8> {
    let mut reply = report_header(REPORT_SUBCOMMAND_REPLY, timer, kind, payload);
    reply[14] = ack;
    reply[15] = subcommand;
    let copy_len = data.len().min(REPORT_LEN - 16);
    reply[16..16 + copy_len].copy_from_slice(&data[..copy_len]);
    reply
}

/// Returns `(ack, data)` for a subcommand
pub fn handle_subcommand(kind: ControllerKind, mac: [u8; 6], id: u8, data: &[u8]) -> (u8, Vec<u8>) {
    match id {
        SUBCMD_DEVICE_INFO => {
            let mut info = vec![0x03, 0x48, kind.device_type(), 0x02];
            info.extend_from_slice(&mac);
            info.extend_from_slice(&[0x01, 0x01]);
            (0x82, info)
        }
        SUBCMD_TRIGGER_ELAPSED => (0x83, Vec::new()),
        SUBCMD_SPI_READ => match data {
            [a0, a1, a2, a3, len, ..] => {
                let address = u32::from_le_bytes([*a0, *a1, *a2, *a3]);
                let mut reply = vec![*a0, *a1, *a2, *a3, *len];
                reply.extend_from_slice(&spi_read(kind, address, *len));
                (0x90, reply)
            }
            _ => (0x80, Vec::new()),
        },
        SUBCMD_MCU_CONFIG => (0xA0, vec![0x01, 0x00, 0xFF, 0x00, 0x03, 0x00, 0x05, 0x01]),
        SUBCMD_SET_INPUT_MODE
        | SUBCMD_SHIPMENT
        | SUBCMD_PLAYER_LIGHTS
        | SUBCMD_HOME_LIGHT
        | SUBCMD_IMU_ENABLE
        | SUBCMD_IMU_SENSITIVITY
        | SUBCMD_VIBRATION => (0x80, Vec::new()),
        other => {
            debug!("Unknown subcommand 0x{:02X}, sending generic ack", other);
            (0x80, Vec::new())
        }
    }
}

/// Emulated SPI flash contents for the reads the console performs while pairing
fn spi_read(kind: ControllerKind, address: u32, len: u8) -> Vec<u8> {
    let mut data = match address {
        // Serial number, blank
        0x6000 => vec![0xFF; 16],
        // Body, buttons, left grip, right grip colors
        0x6050 => match kind {
            ControllerKind::ProController => vec![
                0x32, 0x32, 0x32, 0xFF, 0xFF, 0xFF, 0x32, 0x32, 0x32, 0xFF, 0xFF, 0xFF, 0x03,
            ],
            ControllerKind::JoyConL => vec![
                0x0A, 0xB9, 0xE6, 0x00, 0x1E, 0x1E, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            ],
            ControllerKind::JoyConR => vec![
                0xFF, 0x3C, 0x28, 0x1E, 0x0A, 0x0A, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            ],
        },
        // Factory stick calibration
        0x603D => vec![
            0x00, 0x07, 0x70, 0x00, 0x08, 0x80, 0x00, 0x07, 0x70, 0x00, 0x07, 0x70, 0x00, 0x08,
            0x80, 0x00, 0x07, 0x70,
        ],
        // Stick parameters
        0x6086 => vec![
            0x0F, 0x30, 0x61, 0x96, 0x30, 0xF3, 0xD4, 0x14, 0x54, 0x41, 0x15, 0x54, 0xC7, 0x79,
            0x9C, 0x33, 0x36, 0x63,
        ],
        // IMU factory calibration
        0x6020 => vec![
            0xBE, 0xFF, 0x3E, 0x00, 0xF0, 0x01, 0x00, 0x40, 0x00, 0x40, 0x00, 0x40, 0xFE, 0xFF,
            0xFE, 0xFF, 0x08, 0x00, 0xE7, 0x3B, 0xE7, 0x3B, 0xE7, 0x3B,
        ],
        0x6080 => vec![0x50, 0xFD, 0x00, 0x00, 0xC6, 0x0F],
        // No user calibration stored
        0x8010 | 0x8026 => vec![0xFF; usize::from(len)],
        _ => Vec::new(),
    };
    data.resize(usize::from(len), 0x00);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::buttons::{Button, ButtonMask};

    #[test]
    fn neutral_report_layout() {
        let report = input_report(7, ControllerKind::ProController, &InputPayload::NEUTRAL);
        assert_eq!(report.len(), REPORT_LEN);
        assert_eq!(&report[..4], &[0xA1, 0x30, 7, 0x90]);
        assert_eq!(&report[4..7], &[0, 0, 0]);
        assert_eq!(&report[7..13], &[0x00, 0x08, 0x80, 0x00, 0x08, 0x80]);
    }

    #[test]
    fn pressed_buttons_land_in_report() {
        let payload = InputPayload {
            buttons: ButtonMask::NONE.with(Button::B).with(Button::DpadLeft),
            ..InputPayload::NEUTRAL
        };
        let report = input_report(0, ControllerKind::ProController, &payload);
        assert_eq!(&report[4..7], &[0x04, 0x00, 0x08]);
    }

    #[test]
    fn parses_console_subcommand() {
        let frame = subcommand_frame(3, SUBCMD_SPI_READ, &[0x50, 0x60, 0x00, 0x00, 0x0D]);
        assert_eq!(
            parse_output_report(&frame),
            OutputReport::Subcommand {
                id: SUBCMD_SPI_READ,
                data: vec![0x50, 0x60, 0x00, 0x00, 0x0D],
            }
        );
        assert_eq!(parse_output_report(&[0xA2, 0x10, 0x00]), OutputReport::RumbleOnly);
    }

    #[test]
    fn device_info_carries_kind_and_mac() {
        let mac = [0x7C, 0xBB, 0x8A, 0x01, 0x02, 0x03];
        let (ack, data) = handle_subcommand(ControllerKind::JoyConR, mac, SUBCMD_DEVICE_INFO, &[]);
        assert_eq!(ack, 0x82);
        assert_eq!(data[2], 0x02);
        assert_eq!(&data[4..10], &mac);
    }

    #[test]
    fn spi_read_echoes_address_and_length() {
        let (ack, data) = handle_subcommand(
            ControllerKind::ProController,
            [0; 6],
            SUBCMD_SPI_READ,
            &[0x10, 0x80, 0x00, 0x00, 0x16],
        );
        assert_eq!(ack, 0x90);
        assert_eq!(&data[..5], &[0x10, 0x80, 0x00, 0x00, 0x16]);
        assert_eq!(data.len(), 5 + 0x16);
    }

    #[test]
    fn reply_places_ack_and_subcommand() {
        let reply = subcommand_reply(
            1,
            ControllerKind::ProController,
            &InputPayload::NEUTRAL,
            0x80,
            SUBCMD_PLAYER_LIGHTS,
            &[],
        );
        assert_eq!(reply[1], REPORT_SUBCOMMAND_REPLY);
        assert_eq!(reply[14], 0x80);
        assert_eq!(reply[15], SUBCMD_PLAYER_LIGHTS);
    }
}
