//! Bluetooth platform capabilities
//!
//! The host's adapter driver, the pairing agent surface and the L2CAP
//! channels are all reached through the traits in this module. The in-memory
//! implementations (`SimulatedAdapter`, `LoopbackFactory`) back the tests and
//! the demo binary.

pub mod adapter;
pub mod loopback;
pub mod pairing;
pub mod transport;

pub use adapter::{AdapterError, BluetoothAdapter, DeviceInfo, SimulatedAdapter};
pub use loopback::{ConsoleEndpoint, LoopbackFactory};
pub use pairing::{AgentError, AgentReply, AgentRequest, AutoAcceptAgent, PairingAgent, PairingAuthority};
pub use transport::{ConnectMode, HidChannel, Transport, TransportError, TransportFactory};

use rand::Rng;

/// Vendor prefix used for generated controller addresses
pub const CONTROLLER_OUI: [u8; 3] = [0x7C, 0xBB, 0x8A];

/// Upper-cases an address so stored and reported forms compare equal
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

pub fn parse_address(address: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = address.trim().split(':');
    for byte in bytes.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}

pub fn format_address(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Random address under the controller vendor prefix
pub fn random_controller_address() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 6];
    bytes[..3].copy_from_slice(&CONTROLLER_OUI);
    rng.fill(&mut bytes[3..]);
    format_address(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let parsed = parse_address("7c:bb:8a:01:ab:ff").unwrap();
        assert_eq!(format_address(&parsed), "7C:BB:8A:01:AB:FF");
        assert!(parse_address("7C:BB:8A:01:AB").is_none());
        assert!(parse_address("7C:BB:8A:01:AB:FF:00").is_none());
        assert!(parse_address("zz:BB:8A:01:AB:FF").is_none());
    }

    #[test]
    fn generated_addresses_use_vendor_prefix() {
        let address = random_controller_address();
        assert!(address.starts_with("7C:BB:8A:"));
        assert!(parse_address(&address).is_some());
    }
}
