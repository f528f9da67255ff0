//! LoRaCue library: firmware update and device pairing core for the
//! LoRaCue presentation clicker.
//!
//! Everything here is `no_std` and platform independent, testable on any
//! host with `cargo test`. The ESP32-S3 firmware binary (`src/main.rs`)
//! is a thin consumer that supplies flash, radio and serial access.
//!
//! - `manifest`: firmware manifest record, image scan and compatibility check
//! - `transfer`: chunked image receiver writing into a `StagingTarget`
//! - `update`: update session phases and the streamed (BLE) update worker
//! - `pairing`: stage/PC key exchange over a `PairingLink`
//! - `registry`: trusted peer records behind a `PeerStorage` backend
//! - `transport`: transport ownership and cancellation shared by workers
//! - `protocol`, `comm`: the text command protocol and its dispatcher
//! - `board`, `defaults`: compiled-in identity and limits

#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod comm;
pub mod defaults;
pub mod manifest;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod transport;
pub mod update;

#[cfg(test)]
mod testing;
