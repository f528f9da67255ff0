//! Compiled-in limits and timeouts.
//!
//! Every tunable here has a matching field on one of the config structs
//! (`TransferLimits`, `UpdateConfig`, `PairingConfig`), which start from
//! these values via `const fn new()`.

// ── Firmware update ────────────────────────────────────────────────────

/// Bytes at the start of an image that are searched for the manifest.
pub const HEADER_WINDOW: usize = 4096;

/// Smallest chunk size a client may negotiate.
pub const MIN_CHUNK_SIZE: u32 = 512;

/// Largest chunk size a client may negotiate. Also sizes the decode buffer.
pub const MAX_CHUNK_SIZE: u32 = 8192;

/// Chunk size used when `FW_UPDATE_START` does not name one.
pub const DEFAULT_CHUNK_SIZE: u32 = 4096;

/// Largest image accepted (size of one OTA app partition on the 8 MB layout).
pub const MAX_IMAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Delay between acknowledging `FW_UPDATE_COMMIT` and restarting, so the
/// reply can drain out of the transport first.
pub const COMMIT_RESTART_DELAY_MS: u64 = 1000;

/// Abort a streamed update when no data arrives for this long.
pub const STREAM_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Discard an update session when no chunk is written for this long.
pub const SESSION_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Size of one buffer on the BLE update stream queue.
pub const STREAM_BUFFER_LEN: usize = 512;

/// Depth of the BLE update stream queue.
pub const STREAM_QUEUE_DEPTH: usize = 4;

// ── Pairing ────────────────────────────────────────────────────────────

/// Overall pairing deadline, measured from session start.
pub const PAIRING_TIMEOUT_MS: u64 = 30_000;

/// Back-off when the pairing link reports an empty read.
pub const PAIRING_IDLE_POLL_MS: u64 = 10;

/// Capacity of the trusted peer registry.
pub const MAX_PAIRED_DEVICES: usize = 32;

// ── Command channel ────────────────────────────────────────────────────

/// Longest accepted command line. Sized for `FW_UPDATE_DATA` with a
/// base64-encoded chunk of `MAX_CHUNK_SIZE` bytes plus the command word.
pub const MAX_LINE_LEN: usize = 11_008;
