/// Board identity for supported hardware.
///
/// The board id is what incoming firmware manifests are checked against,
/// selected at compile time via feature flags.

use crate::manifest::Manifest;
use crate::pairing::PairingRole;
use crate::protocol::VERSION;

#[cfg(feature = "board-heltec-v3")]
mod hw {
    pub const BOARD_ID: &str = "heltec_v3";
    pub const BOARD_NAME: &str = "Heltec LoRa32 V3";
}

#[cfg(feature = "board-wokwi")]
mod hw {
    pub const BOARD_ID: &str = "wokwi_sim";
    pub const BOARD_NAME: &str = "Wokwi simulator";
}

#[cfg(not(any(feature = "board-heltec-v3", feature = "board-wokwi")))]
mod hw {
    pub const BOARD_ID: &str = "host";
    pub const BOARD_NAME: &str = "host build";
}

pub use hw::*;

/// Manifest describing the image that is currently running. The firmware
/// binary embeds `RUNNING_MANIFEST.to_bytes()` near the start of its image
/// so update tooling and other devices can identify it.
pub const RUNNING_MANIFEST: Manifest = Manifest::new(BOARD_ID, VERSION, 0);

/// Which side of the pairing exchange this build plays.
#[cfg(feature = "pc-receiver")]
pub const PAIRING_ROLE: PairingRole = PairingRole::Pc;
#[cfg(not(feature = "pc-receiver"))]
pub const PAIRING_ROLE: PairingRole = PairingRole::Stage;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{extract, is_compatible};

    #[test]
    fn test_running_manifest_is_extractable() {
        let mut image = [0xFFu8; 512];
        image[100..180].copy_from_slice(&RUNNING_MANIFEST.to_bytes());
        let found = extract(&image).unwrap();
        assert_eq!(found.board_id(), BOARD_ID);
        assert_eq!(found.firmware_version(), VERSION);
        assert!(is_compatible(&RUNNING_MANIFEST, &found, false));
    }
}
