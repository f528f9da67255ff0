/// Text command protocol spoken over USB serial, BLE and the pairing link.
///
/// Every command is one line: a command word, optionally followed by a
/// space and a JSON object (or base64 payload for `FW_UPDATE_DATA`).
/// Replies are one line starting with `OK`, `ERROR`, `PONG`, or a JSON
/// document. Uses `heapless` types for no_std/no-alloc operation.
use core::fmt::Write;

use heapless::String;
use serde::{Deserialize, Serialize};

use crate::registry::{PeerRecord, KEY_LEN, MAC_LEN};

/// Protocol version (semver)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum length of a single-line reply
pub const MAX_RESPONSE_LEN: usize = 512;

/// One reply line
pub type Response = String<MAX_RESPONSE_LEN>;

/// "aa:bb:cc:dd:ee:ff"
pub type MacString = String<18>;

/// Device display name (at most 32 bytes)
pub type NameString = String<32>;

/// 256-bit key as 64 hex characters
pub type KeyHexString = String<64>;

// ── Command words ──────────────────────────────────────────────────────

pub mod words {
    pub const PING: &str = "PING";
    pub const FW_UPDATE_START: &str = "FW_UPDATE_START";
    pub const FW_UPDATE_DATA: &str = "FW_UPDATE_DATA";
    pub const FW_UPDATE_VERIFY: &str = "FW_UPDATE_VERIFY";
    pub const FW_UPDATE_ABORT: &str = "FW_UPDATE_ABORT";
    pub const FW_UPDATE_COMMIT: &str = "FW_UPDATE_COMMIT";
    pub const FW_UPDATE_STREAM: &str = "FW_UPDATE_STREAM";
    pub const PAIR_DEVICE: &str = "PAIR_DEVICE";
    pub const UPDATE_PAIRED_DEVICE: &str = "UPDATE_PAIRED_DEVICE";
    pub const UNPAIR_DEVICE: &str = "UNPAIR_DEVICE";
    pub const GET_PAIRED_DEVICES: &str = "GET_PAIRED_DEVICES";
}

// ── Command arguments ──────────────────────────────────────────────────

/// `FW_UPDATE_START` arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateStartArgs {
    pub size: u32,
    #[serde(default)]
    pub chunk_size: Option<u32>,
    /// CRC32 of the whole image, hex (optionally `0x`-prefixed)
    #[serde(default)]
    pub checksum: Option<String<72>>,
    /// Informational; the manifest decides compatibility
    #[serde(default)]
    pub version: Option<String<32>>,
    #[serde(default)]
    pub force: Option<bool>,
}

impl UpdateStartArgs {
    /// Parsed image CRC. `Err` when a checksum is present but is not a
    /// 32-bit hex value.
    pub fn image_crc(&self) -> Result<Option<u32>, ArgError> {
        let Some(text) = self.checksum.as_deref() else {
            return Ok(None);
        };
        let digits = text.trim_start_matches("0x").trim_start_matches("0X");
        if digits.is_empty() || digits.len() > 8 {
            return Err(ArgError::InvalidChecksum);
        }
        u32::from_str_radix(digits, 16)
            .map(Some)
            .map_err(|_| ArgError::InvalidChecksum)
    }
}

/// `FW_UPDATE_STREAM` arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamArgs {
    pub size: u32,
    #[serde(default)]
    pub force: Option<bool>,
}

/// `PAIR_DEVICE` / `UPDATE_PAIRED_DEVICE` arguments, also the payload the
/// stage sends during USB pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairDeviceArgs {
    pub name: NameString,
    pub mac: MacString,
    pub aes_key: KeyHexString,
}

impl PairDeviceArgs {
    pub fn new(name: &str, mac: &[u8; MAC_LEN], key: &[u8; KEY_LEN]) -> Self {
        let mut args = Self {
            name: NameString::new(),
            mac: MacString::new(),
            aes_key: encode_key(key),
        };
        push_truncated(&mut args.name, name);
        format_mac(mac, &mut args.mac);
        args
    }

    pub fn to_record(&self) -> Result<PeerRecord, ArgError> {
        if self.name.is_empty() {
            return Err(ArgError::MissingName);
        }
        let mac = parse_mac(&self.mac).ok_or(ArgError::InvalidMac)?;
        let key = decode_key(&self.aes_key)?;
        Ok(PeerRecord::new(&self.name, mac, key))
    }
}

/// `UNPAIR_DEVICE` arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnpairArgs {
    pub mac: MacString,
}

/// Commands from the host (desktop app, or the stage during pairing).
/// Produced by `comm::parse_command`.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand<'a> {
    Ping,
    UpdateStart(UpdateStartArgs),
    /// Base64 chunk payload, borrowed from the command line
    UpdateData(&'a [u8]),
    UpdateVerify,
    UpdateAbort,
    UpdateCommit,
    UpdateStream(StreamArgs),
    PairDevice(PairDeviceArgs),
    UpdatePairedDevice(PairDeviceArgs),
    UnpairDevice(UnpairArgs),
    GetPairedDevices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArgError {
    #[error("Missing device name")]
    MissingName,
    #[error("Invalid MAC address")]
    InvalidMac,
    #[error("Invalid key length (expected 64 hex chars for AES-256)")]
    InvalidKeyLength,
    #[error("Invalid key (not hex)")]
    InvalidKey,
    #[error("Invalid checksum (expected CRC32 hex)")]
    InvalidChecksum,
}

// ── Replies ────────────────────────────────────────────────────────────

/// Reply to `FW_UPDATE_START`.
#[derive(Debug, Serialize)]
pub struct StartReply {
    pub status: &'static str,
    pub force_mode: bool,
    pub expected_chunks: u32,
}

/// Structured compatibility failure, sent as `ERROR <json>`.
#[derive(Debug, Serialize)]
#[serde(tag = "error")]
pub enum CompatibilityReply<'a> {
    #[serde(rename = "board_mismatch")]
    BoardMismatch {
        current_board: &'a str,
        new_board: &'a str,
    },
    #[serde(rename = "manifest_missing")]
    ManifestMissing,
}

/// One entry of the `GET_PAIRED_DEVICES` array.
#[derive(Debug, Serialize)]
pub struct PeerEntry<'a> {
    pub id: u16,
    pub name: &'a str,
    pub mac: MacString,
    pub aes_key: KeyHexString,
}

impl<'a> From<&'a PeerRecord> for PeerEntry<'a> {
    fn from(record: &'a PeerRecord) -> Self {
        let mut mac = MacString::new();
        format_mac(&record.mac, &mut mac);
        Self {
            id: record.device_id,
            name: &record.name,
            mac,
            aes_key: encode_key(&record.key),
        }
    }
}

// ── Pairing acknowledgement ────────────────────────────────────────────

/// Identity the receiving side reports back when pairing succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAck {
    pub name: NameString,
    pub device_id: u16,
}

/// Format the pairing acknowledgement: `OK paired with <name> (ID: <hex>)`.
pub fn format_pair_ack(name: &str, device_id: u16) -> Response {
    let mut out = Response::new();
    let _ = write!(out, "OK paired with {} (ID: {:04x})", name, device_id);
    out
}

/// Parse a pairing acknowledgement. Anything that does not follow the
/// `OK ... with <name> (ID: <hex>)` shape yields `None`.
pub fn parse_pair_ack(line: &str) -> Option<PeerAck> {
    let line = line.trim();
    if !line.starts_with("OK") {
        return None;
    }

    let (_, rest) = line.split_once(" with ")?;
    let (name, rest) = rest.rsplit_once(" (ID: ")?;
    let id = rest.strip_suffix(')')?.trim();
    let id = id.strip_prefix("0x").unwrap_or(id);
    let device_id = u16::from_str_radix(id, 16).ok()?;

    if name.is_empty() {
        return None;
    }
    let mut ack = PeerAck {
        name: NameString::new(),
        device_id,
    };
    ack.name.push_str(name).ok()?;
    Some(ack)
}

// ── Field encoding ─────────────────────────────────────────────────────

/// Format a MAC address as a lowercase colon-separated hex string.
pub fn format_mac(mac: &[u8; MAC_LEN], out: &mut MacString) {
    out.clear();
    for (i, b) in mac.iter().enumerate() {
        if i > 0 {
            let _ = out.push(':');
        }
        let _ = write!(out, "{:02x}", b);
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` (either case, `:` or `-` separators).
pub fn parse_mac(text: &str) -> Option<[u8; MAC_LEN]> {
    let mut mac = [0u8; MAC_LEN];
    let mut parts = text.trim().split([':', '-']);
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

pub fn encode_key(key: &[u8; KEY_LEN]) -> KeyHexString {
    let mut buf = [0u8; KEY_LEN * 2];
    let mut out = KeyHexString::new();
    if hex::encode_to_slice(key, &mut buf).is_ok() {
        if let Ok(text) = core::str::from_utf8(&buf) {
            let _ = out.push_str(text);
        }
    }
    out
}

pub fn decode_key(text: &str) -> Result<[u8; KEY_LEN], ArgError> {
    if text.len() != KEY_LEN * 2 {
        return Err(ArgError::InvalidKeyLength);
    }
    let mut key = [0u8; KEY_LEN];
    hex::decode_to_slice(text, &mut key).map_err(|_| ArgError::InvalidKey)?;
    Ok(key)
}

/// Serialize `value` as JSON into a fixed-capacity string. `None` when it
/// does not fit.
pub fn to_json<T: Serialize, const N: usize>(value: &T) -> Option<String<N>> {
    let mut buf = [0u8; N];
    let len = serde_json_core::to_slice(value, &mut buf).ok()?;
    let text = core::str::from_utf8(&buf[..len]).ok()?;
    String::try_from(text).ok()
}

/// Push as much of `text` as fits, cutting on a char boundary.
pub(crate) fn push_truncated<const N: usize>(out: &mut String<N>, text: &str) {
    for c in text.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0xAB; KEY_LEN];

    #[test]
    fn test_parse_pair_ack() {
        let ack = parse_pair_ack("OK paired with Alice (ID: 1a2b)").unwrap();
        assert_eq!(ack.name.as_str(), "Alice");
        assert_eq!(ack.device_id, 0x1a2b);
    }

    #[test]
    fn test_parse_pair_ack_variants() {
        let ack = parse_pair_ack("OK Device paired with Stage Left (ID: 0x00FF)\r\n").unwrap();
        assert_eq!(ack.name.as_str(), "Stage Left");
        assert_eq!(ack.device_id, 0x00ff);

        // Names may themselves contain " with "
        let ack = parse_pair_ack("OK paired with Bob with hat (ID: 1)").unwrap();
        assert_eq!(ack.name.as_str(), "Bob with hat");
    }

    #[test]
    fn test_parse_pair_ack_rejects_other_lines() {
        assert_eq!(parse_pair_ack("ERROR Invalid JSON"), None);
        assert_eq!(parse_pair_ack("OK Device paired successfully"), None);
        assert_eq!(parse_pair_ack("OK paired with Alice (ID: zz)"), None);
        assert_eq!(parse_pair_ack("OK paired with Alice (ID: 1a2b"), None);
        assert_eq!(parse_pair_ack("OK paired with  (ID: 1a2b)"), None);
        assert_eq!(parse_pair_ack("PONG LoRaCue v1.0.0"), None);
    }

    #[test]
    fn test_pair_ack_round_trip() {
        let line = format_pair_ack("PC-Desk", 0x0042);
        assert_eq!(line.as_str(), "OK paired with PC-Desk (ID: 0042)");
        let ack = parse_pair_ack(&line).unwrap();
        assert_eq!(ack.device_id, 0x0042);
    }

    #[test]
    fn test_format_and_parse_mac() {
        let mut s = MacString::new();
        format_mac(&[0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03], &mut s);
        assert_eq!(s.as_str(), "aa:bb:cc:01:02:03");
        assert_eq!(parse_mac("AA-BB-CC-01-02-03"), Some([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]));
        assert_eq!(parse_mac("aa:bb:cc:01:02"), None);
        assert_eq!(parse_mac("aa:bb:cc:01:02:03:04"), None);
        assert_eq!(parse_mac("aa:bb:cc:01:02:3"), None);
        assert_eq!(parse_mac("gg:bb:cc:01:02:03"), None);
    }

    #[test]
    fn test_key_hex() {
        let hex = encode_key(&KEY);
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("abab"));
        assert_eq!(decode_key(&hex), Ok(KEY));
        assert_eq!(decode_key("abcd"), Err(ArgError::InvalidKeyLength));
        let not_hex: std::string::String = "zz".repeat(32);
        assert_eq!(decode_key(&not_hex), Err(ArgError::InvalidKey));
    }

    #[test]
    fn test_pair_args_to_record() {
        let args = PairDeviceArgs::new("Presenter", &[1, 2, 3, 4, 0x1a, 0x2b], &KEY);
        let record = args.to_record().unwrap();
        assert_eq!(record.device_id, 0x1a2b);
        assert_eq!(record.name.as_str(), "Presenter");
        assert_eq!(record.key, KEY);

        let mut bad = args.clone();
        bad.mac = MacString::try_from("not-a-mac").unwrap();
        assert_eq!(bad.to_record(), Err(ArgError::InvalidMac));
    }

    #[test]
    fn test_pair_args_json() {
        let args = PairDeviceArgs::new("Stage", &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], &KEY);
        let json: String<256> = to_json(&args).unwrap();
        assert!(json.starts_with(r#"{"name":"Stage","mac":"aa:bb:cc:dd:ee:ff","aes_key":"abab"#));

        let (parsed, _): (PairDeviceArgs, usize) = serde_json_core::from_str(&json).unwrap();
        assert_eq!(parsed, args);
    }

    #[test]
    fn test_start_args_optional_fields() {
        let (args, _): (UpdateStartArgs, usize) =
            serde_json_core::from_str(r#"{"size":10000}"#).unwrap();
        assert_eq!(args.size, 10_000);
        assert_eq!(args.chunk_size, None);
        assert_eq!(args.force, None);
        assert_eq!(args.image_crc(), Ok(None));

        let (args, _): (UpdateStartArgs, usize) = serde_json_core::from_str(
            r#"{"size":10000,"chunk_size":4096,"checksum":"0xDEADBEEF","version":"1.2.0","force":true}"#,
        )
        .unwrap();
        assert_eq!(args.chunk_size, Some(4096));
        assert_eq!(args.image_crc(), Ok(Some(0xDEAD_BEEF)));
        assert_eq!(args.force, Some(true));
    }

    #[test]
    fn test_start_args_rejects_non_crc_checksum() {
        let (args, _): (UpdateStartArgs, usize) =
            serde_json_core::from_str(r#"{"size":1,"checksum":"e3b0c44298fc1c149afbf4c8996fb924"}"#)
                .unwrap();
        assert_eq!(args.image_crc(), Err(ArgError::InvalidChecksum));
    }

    #[test]
    fn test_start_reply_json() {
        let reply = StartReply {
            status: "ready",
            force_mode: false,
            expected_chunks: 3,
        };
        let json: String<128> = to_json(&reply).unwrap();
        assert_eq!(json.as_str(), r#"{"status":"ready","force_mode":false,"expected_chunks":3}"#);
    }

    #[test]
    fn test_compatibility_reply_json() {
        let reply = CompatibilityReply::BoardMismatch {
            current_board: "heltec_v3",
            new_board: "wokwi_sim",
        };
        let json: String<128> = to_json(&reply).unwrap();
        assert_eq!(
            json.as_str(),
            r#"{"error":"board_mismatch","current_board":"heltec_v3","new_board":"wokwi_sim"}"#
        );

        let json: String<64> = to_json(&CompatibilityReply::ManifestMissing).unwrap();
        assert_eq!(json.as_str(), r#"{"error":"manifest_missing"}"#);
    }
}
