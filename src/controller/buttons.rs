//! Button, stick and payload types shared by the input engine and the report encoder.
//!
//! Buttons are packed the way the console expects them on the wire: three bytes
//! (right, shared, left) held here in the low 24 bits of a `u32`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every button the emulated controllers can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    // Right byte
    Y,
    X,
    B,
    A,
    JcrSr,
    JcrSl,
    R,
    Zr,
    // Shared byte
    Minus,
    Plus,
    RStickPress,
    LStickPress,
    Home,
    Capture,
    // Left byte
    DpadDown,
    DpadUp,
    DpadRight,
    DpadLeft,
    JclSr,
    JclSl,
    L,
    Zl,
}

impl Button {
    pub const ALL: [Button; 22] = [
        Button::Y,
        Button::X,
        Button::B,
        Button::A,
        Button::JcrSr,
        Button::JcrSl,
        Button::R,
        Button::Zr,
        Button::Minus,
        Button::Plus,
        Button::RStickPress,
        Button::LStickPress,
        Button::Home,
        Button::Capture,
        Button::DpadDown,
        Button::DpadUp,
        Button::DpadRight,
        Button::DpadLeft,
        Button::JclSr,
        Button::JclSl,
        Button::L,
        Button::Zl,
    ];

    /// Bit position inside the packed 24-bit button field
    pub fn bit(self) -> u32 {
        match self {
            Button::Y => 1 << 0,
            Button::X => 1 << 1,
            Button::B => 1 << 2,
            Button::A => 1 << 3,
            Button::JcrSr => 1 << 4,
            Button::JcrSl => 1 << 5,
            Button::R => 1 << 6,
            Button::Zr => 1 << 7,
            Button::Minus => 1 << 8,
            Button::Plus => 1 << 9,
            Button::RStickPress => 1 << 10,
            Button::LStickPress => 1 << 11,
            Button::Home => 1 << 12,
            Button::Capture => 1 << 13,
            Button::DpadDown => 1 << 16,
            Button::DpadUp => 1 << 17,
            Button::DpadRight => 1 << 18,
            Button::DpadLeft => 1 << 19,
            Button::JclSr => 1 << 20,
            Button::JclSl => 1 << 21,
            Button::L => 1 << 22,
            Button::Zl => 1 << 23,
        }
    }

    /// Macro/script name of the button
    pub fn name(self) -> &'static str {
        match self {
            Button::Y => "Y",
            Button::X => "X",
            Button::B => "B",
            Button::A => "A",
            Button::JcrSr => "JCR_SR",
            Button::JcrSl => "JCR_SL",
            Button::R => "R",
            Button::Zr => "ZR",
            Button::Minus => "MINUS",
            Button::Plus => "PLUS",
            Button::RStickPress => "R_STICK_PRESS",
            Button::LStickPress => "L_STICK_PRESS",
            Button::Home => "HOME",
            Button::Capture => "CAPTURE",
            Button::DpadDown => "DPAD_DOWN",
            Button::DpadUp => "DPAD_UP",
            Button::DpadRight => "DPAD_RIGHT",
            Button::DpadLeft => "DPAD_LEFT",
            Button::JclSr => "JCL_SR",
            Button::JclSl => "JCL_SL",
            Button::L => "L",
            Button::Zl => "ZL",
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Button {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Button::ALL
            .iter()
            .copied()
            .find(|button| button.name() == upper)
            .ok_or_else(|| s.to_string())
    }
}

/// Set of pressed buttons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ButtonMask(u32);

impl ButtonMask {
    pub const NONE: ButtonMask = ButtonMask(0);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & 0x00FF_FFFF)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn with(self, button: Button) -> Self {
        Self(self.0 | button.bit())
    }

    pub fn contains(self, button: Button) -> bool {
        self.0 & button.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersect(self, other: ButtonMask) -> Self {
        Self(self.0 & other.0)
    }

    /// Wire order: right, shared, left
    pub fn to_bytes(self) -> [u8; 3] {
        [
            (self.0 & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            ((self.0 >> 16) & 0xFF) as u8,
        ]
    }

    pub fn pressed(self) -> impl Iterator<Item = Button> {
        Button::ALL
            .into_iter()
            .filter(move |button| self.contains(*button))
    }
}

impl FromIterator<Button> for ButtonMask {
    fn from_iter<T: IntoIterator<Item = Button>>(iter: T) -> Self {
        iter.into_iter()
            .fold(ButtonMask::NONE, |mask, button| mask.with(button))
    }
}

/// Analog stick deflection as a signed percentage per axis (-100..=100)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickPosition {
    pub x: i8,
    pub y: i8,
}

impl StickPosition {
    pub const CENTER: StickPosition = StickPosition { x: 0, y: 0 };

    pub fn new(x: i8, y: i8) -> Self {
        Self {
            x: x.clamp(-100, 100),
            y: y.clamp(-100, 100),
        }
    }

    pub fn is_centered(self) -> bool {
        self == Self::CENTER
    }

    /// Packs both axes into the controller's 12-bit stick format (center 0x800)
    pub fn to_bytes(self) -> [u8; 3] {
        let horizontal = Self::axis_to_raw(self.x);
        let vertical = Self::axis_to_raw(self.y);
        [
            (horizontal & 0xFF) as u8,
            (((horizontal >> 8) & 0x0F) | ((vertical & 0x0F) << 4)) as u8,
            ((vertical >> 4) & 0xFF) as u8,
        ]
    }

    fn axis_to_raw(percent: i8) -> u16 {
        let raw = 0x800 + (i32::from(percent) * 0x7FF) / 100;
        raw.clamp(0, 0xFFF) as u16
    }
}

/// Button and stick state carried by one input report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputPayload {
    pub buttons: ButtonMask,
    pub left_stick: StickPosition,
    pub right_stick: StickPosition,
}

impl InputPayload {
    pub const NEUTRAL: InputPayload = InputPayload {
        buttons: ButtonMask::NONE,
        left_stick: StickPosition::CENTER,
        right_stick: StickPosition::CENTER,
    };

    pub fn is_neutral(&self) -> bool {
        *self == Self::NEUTRAL
    }

    pub fn masked(mut self, allowed: ButtonMask) -> Self {
        self.buttons = self.buttons.intersect(allowed);
        self
    }
}

/// The controller kinds this crate can emulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    ProController,
    JoyConL,
    JoyConR,
}

impl ControllerKind {
    /// Name advertised as the adapter alias while pairing
    pub fn name(self) -> &'static str {
        match self {
            ControllerKind::ProController => "Pro Controller",
            ControllerKind::JoyConL => "Joy-Con (L)",
            ControllerKind::JoyConR => "Joy-Con (R)",
        }
    }

    /// Bluetooth class of device (peripheral, gamepad)
    pub fn device_class(self) -> &'static str {
        "0x002508"
    }

    /// Device type byte returned in the device info subcommand reply
    pub fn device_type(self) -> u8 {
        match self {
            ControllerKind::JoyConL => 0x01,
            ControllerKind::JoyConR => 0x02,
            ControllerKind::ProController => 0x03,
        }
    }

    /// Battery level and connection info nibbles of the report header
    pub fn battery_byte(self) -> u8 {
        match self {
            ControllerKind::ProController => 0x90,
            ControllerKind::JoyConL | ControllerKind::JoyConR => 0x8E,
        }
    }

    /// Buttons physically present on this kind
    pub fn buttons(self) -> ButtonMask {
        use Button::*;
        let shared = [Minus, Plus, RStickPress, LStickPress, Home, Capture];
        match self {
            ControllerKind::ProController => [
                Y, X, B, A, R, Zr, DpadDown, DpadUp, DpadRight, DpadLeft, L, Zl,
            ]
            .into_iter()
            .chain(shared)
            .collect(),
            ControllerKind::JoyConL => [
                DpadDown, DpadUp, DpadRight, DpadLeft, JclSr, JclSl, L, Zl, Minus, LStickPress,
                Capture,
            ]
            .into_iter()
            .collect(),
            ControllerKind::JoyConR => [
                Y, X, B, A, JcrSr, JcrSl, R, Zr, Plus, RStickPress, Home,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ControllerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pro" | "pro_controller" => Ok(ControllerKind::ProController),
            "joycon_l" | "jcl" => Ok(ControllerKind::JoyConL),
            "joycon_r" | "jcr" => Ok(ControllerKind::JoyConR),
            other => Err(format!("unknown controller kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_bytes_follow_wire_order() {
        let mask: ButtonMask = [Button::A, Button::Home, Button::Zl].into_iter().collect();
        assert_eq!(mask.to_bytes(), [0x08, 0x10, 0x80]);
    }

    #[test]
    fn button_names_parse_case_insensitive() {
        assert_eq!("dpad_up".parse::<Button>(), Ok(Button::DpadUp));
        assert_eq!("L_STICK_PRESS".parse::<Button>(), Ok(Button::LStickPress));
        assert!("TURBO".parse::<Button>().is_err());
    }

    #[test]
    fn centered_stick_encodes_to_midpoint() {
        assert_eq!(StickPosition::CENTER.to_bytes(), [0x00, 0x08, 0x80]);
    }

    #[test]
    fn full_deflection_stays_in_range() {
        let bytes = StickPosition::new(100, -100).to_bytes();
        let horizontal = u16::from(bytes[0]) | (u16::from(bytes[1] & 0x0F) << 8);
        let vertical = u16::from(bytes[1] >> 4) | (u16::from(bytes[2]) << 4);
        assert_eq!(horizontal, 0xFFF);
        assert_eq!(vertical, 0x001);
    }

    #[test]
    fn joycon_masks_out_missing_buttons() {
        let payload = InputPayload {
            buttons: [Button::A, Button::DpadUp].into_iter().collect(),
            ..InputPayload::NEUTRAL
        };
        let masked = payload.masked(ControllerKind::JoyConL.buttons());
        assert!(masked.buttons.contains(Button::DpadUp));
        assert!(!masked.buttons.contains(Button::A));
    }
}
