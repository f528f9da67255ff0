//! Chunked transfer receiver: streams an incoming firmware image into a
//! staging target, checks the manifest once the header window is full, and
//! finalizes and commits the image on request.
//!
//! One receiver holds at most one open session. Transport and target errors
//! discard the session; protocol violations (oversized or empty chunks) are
//! rejected without touching it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::defaults::{
    DEFAULT_CHUNK_SIZE, HEADER_WINDOW, MAX_CHUNK_SIZE, MAX_IMAGE_SIZE, MIN_CHUNK_SIZE,
    SESSION_IDLE_TIMEOUT_MS,
};
use crate::manifest::{self, BoardId, Compatibility, Manifest};

/// Decoded chunks are staged here; three spare bytes cover the base64
/// length estimate for a maximum-size chunk.
const DECODE_BUF_LEN: usize = MAX_CHUNK_SIZE as usize + 3;

// ── Staging target ─────────────────────────────────────────────────────

/// Destination for an incoming image (an inactive OTA partition on
/// hardware, a byte vector in tests).
pub trait StagingTarget {
    /// Open a destination able to hold `image_size` bytes, discarding any
    /// previous partial image.
    fn begin(&mut self, image_size: u32) -> Result<(), TargetError>;

    /// Append bytes at the current write position.
    fn write(&mut self, data: &[u8]) -> Result<(), TargetError>;

    /// Close the destination and validate what was written.
    fn finalize(&mut self) -> Result<(), TargetError>;

    /// Drop the destination. Must be safe to call at any time.
    fn abort(&mut self);

    /// Mark the finalized image as the one to boot next.
    fn set_boot(&mut self) -> Result<(), TargetError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("no update partition available")]
    NoPartition,
    #[error("image does not fit the update partition")]
    TooLarge,
    #[error("flash write failed")]
    Write,
    #[error("image validation failed")]
    Validation,
    #[error("could not select boot partition")]
    Boot,
}

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub min_chunk_size: u32,
    pub max_chunk_size: u32,
    pub default_chunk_size: u32,
    pub max_image_size: u32,
    /// An open session with no write for this long is discarded on the
    /// next chunk.
    pub idle_timeout: Duration,
}

impl TransferLimits {
    pub const fn new() -> Self {
        Self {
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_image_size: MAX_IMAGE_SIZE,
            idle_timeout: Duration::from_millis(SESSION_IDLE_TIMEOUT_MS),
        }
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::new()
    }
}

// ── Results and errors ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub total_size: u32,
    pub chunk_size: u32,
    pub force: bool,
    pub expected_chunks: u32,
}

/// Acknowledgement for one accepted chunk. `crc32` covers the decoded
/// chunk only, so the sender can check what was actually written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub received: u32,
    pub total: u32,
    pub crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("No active update session")]
    NoSession,
    #[error("Update session timed out")]
    SessionTimeout,
    #[error("Invalid chunk size {0}")]
    InvalidChunkSize(u32),
    #[error("Invalid firmware size {0}")]
    InvalidImageSize(u32),
    #[error("Failed to open update partition: {0}")]
    Begin(TargetError),
    #[error("Base64 decode failed")]
    Decode,
    #[error("Empty chunk")]
    EmptyChunk,
    #[error("Chunk too large ({len} > {allowed} bytes)")]
    ChunkTooLarge { len: usize, allowed: u32 },
    #[error("Write failed: {0}")]
    Write(TargetError),
    #[error("Board ID mismatch: running {current}, image built for {new}")]
    BoardMismatch { current: BoardId, new: BoardId },
    #[error("Invalid or missing firmware manifest")]
    ManifestMissing,
    #[error("Size mismatch ({received}/{total} bytes)")]
    SizeMismatch { received: u32, total: u32 },
    #[error("Image checksum mismatch (expected {expected:08x}, got {actual:08x})")]
    ImageChecksumMismatch { expected: u32, actual: u32 },
    #[error("Verification failed: {0}")]
    VerifyFailed(TargetError),
    #[error("No verified image to commit")]
    NotVerified,
    #[error("Failed to set boot partition: {0}")]
    Boot(TargetError),
}

impl TransferError {
    /// True for errors after which the session no longer exists.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            TransferError::SessionTimeout
                | TransferError::Decode
                | TransferError::Write(_)
                | TransferError::BoardMismatch { .. }
                | TransferError::ManifestMissing
                | TransferError::SizeMismatch { .. }
                | TransferError::ImageChecksumMismatch { .. }
                | TransferError::VerifyFailed(_)
        )
    }
}

/// Coarse view of the receiver for the update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving,
    ManifestChecked,
    Verified,
}

// ── Receiver ───────────────────────────────────────────────────────────

struct Session {
    total: u32,
    received: u32,
    chunk_size: u32,
    force: bool,
    expected_crc: Option<u32>,
    image_crc: crc32fast::Hasher,
    header: Vec<u8, HEADER_WINDOW>,
    manifest_checked: bool,
    finalized: bool,
    next_progress_pct: u32,
    last_write: Instant,
}

impl Session {
    fn new(total: u32, chunk_size: u32, force: bool, expected_crc: Option<u32>) -> Self {
        Self {
            total,
            received: 0,
            chunk_size,
            force,
            expected_crc,
            image_crc: crc32fast::Hasher::new(),
            header: Vec::new(),
            manifest_checked: false,
            finalized: false,
            next_progress_pct: 10,
            last_write: Instant::now(),
        }
    }

    /// The manifest is judged once, when the header window is full or the
    /// whole (smaller) image has arrived.
    fn manifest_due(&self) -> bool {
        !self.manifest_checked
            && (self.received as usize >= HEADER_WINDOW || self.received == self.total)
    }

    fn log_progress(&mut self) {
        let pct = (self.received as u64 * 100 / self.total as u64) as u32;
        if pct >= self.next_progress_pct {
            log::info!("Update progress: {}% ({}/{})", pct, self.received, self.total);
            self.next_progress_pct = (pct / 10 + 1) * 10;
        }
    }
}

pub struct ChunkReceiver<T> {
    target: T,
    running: Manifest,
    limits: TransferLimits,
    session: Option<Session>,
    scratch: [u8; DECODE_BUF_LEN],
}

impl<T: StagingTarget> ChunkReceiver<T> {
    pub fn new(target: T, running: Manifest) -> Self {
        Self::with_limits(target, running, TransferLimits::new())
    }

    pub fn with_limits(target: T, running: Manifest, limits: TransferLimits) -> Self {
        Self {
            target,
            running,
            limits,
            session: None,
            scratch: [0; DECODE_BUF_LEN],
        }
    }

    /// Open a new session. A session that is already open is discarded
    /// once the new request has been validated.
    pub fn begin(
        &mut self,
        total_size: u32,
        chunk_size: Option<u32>,
        force: bool,
        expected_crc: Option<u32>,
    ) -> Result<SessionInfo, TransferError> {
        let chunk_size = chunk_size.unwrap_or(self.limits.default_chunk_size);
        if chunk_size < self.limits.min_chunk_size || chunk_size > self.limits.max_chunk_size {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        if total_size == 0 || total_size > self.limits.max_image_size {
            return Err(TransferError::InvalidImageSize(total_size));
        }

        if self.session.is_some() {
            log::warn!("Superseding unfinished update session");
            self.discard();
        }

        self.target.begin(total_size).map_err(TransferError::Begin)?;
        self.session = Some(Session::new(total_size, chunk_size, force, expected_crc));

        log::info!(
            "Update session started: {} bytes, {} byte chunks{}",
            total_size,
            chunk_size,
            if force { " (force)" } else { "" }
        );
        if force {
            log::warn!("Force mode enabled - compatibility checks will be skipped");
        }

        Ok(SessionInfo {
            total_size,
            chunk_size,
            force,
            expected_chunks: total_size.div_ceil(chunk_size),
        })
    }

    /// Decode one base64 chunk and write it.
    pub fn accept_chunk(&mut self, encoded: &[u8]) -> Result<ChunkAck, TransferError> {
        let Some(session) = self.session.as_ref() else {
            return Err(TransferError::NoSession);
        };
        let allowed = session.chunk_size;

        let encoded = encoded.trim_ascii();
        let len = match STANDARD.decode_slice(encoded, &mut self.scratch) {
            Ok(len) => len,
            Err(base64::DecodeSliceError::OutputSliceTooSmall) => {
                return Err(TransferError::ChunkTooLarge {
                    len: encoded.len() / 4 * 3,
                    allowed,
                });
            }
            Err(base64::DecodeSliceError::DecodeError(e)) => {
                log::error!("Chunk decode failed: {}", e);
                self.discard();
                return Err(TransferError::Decode);
            }
        };

        write_chunk(
            &mut self.target,
            &self.running,
            &self.limits,
            &mut self.session,
            &self.scratch[..len],
        )
    }

    /// Write one raw chunk.
    pub fn accept_bytes(&mut self, data: &[u8]) -> Result<ChunkAck, TransferError> {
        write_chunk(&mut self.target, &self.running, &self.limits, &mut self.session, data)
    }

    /// Confirm the whole image arrived and let the target validate it.
    pub fn verify(&mut self) -> Result<(), TransferError> {
        let session = self.session.as_mut().ok_or(TransferError::NoSession)?;

        if session.received != session.total {
            let err = TransferError::SizeMismatch {
                received: session.received,
                total: session.total,
            };
            log::error!("{}", err);
            self.discard();
            return Err(err);
        }

        if let Some(expected) = session.expected_crc {
            let actual = session.image_crc.clone().finalize();
            if actual != expected {
                log::error!("Image CRC32 {:08x} does not match announced {:08x}", actual, expected);
                self.discard();
                return Err(TransferError::ImageChecksumMismatch { expected, actual });
            }
        }

        if !session.finalized {
            if let Err(e) = self.target.finalize() {
                log::error!("Image validation failed: {}", e);
                self.discard();
                return Err(TransferError::VerifyFailed(e));
            }
            session.finalized = true;
        }

        log::info!("Firmware image verified ({} bytes)", session.total);
        Ok(())
    }

    /// Discard the open session, if any.
    pub fn abort(&mut self) {
        if self.session.is_some() {
            log::warn!("Update session aborted");
            self.discard();
        }
    }

    /// Mark the verified image bootable and close the session. Restarting
    /// is left to the caller.
    pub fn commit(&mut self) -> Result<(), TransferError> {
        match &self.session {
            Some(session) if session.finalized => {}
            _ => return Err(TransferError::NotVerified),
        }

        self.target.set_boot().map_err(TransferError::Boot)?;
        self.session = None;
        log::info!("Update committed, new image will boot next");
        Ok(())
    }

    pub fn state(&self) -> ReceiverState {
        match &self.session {
            None => ReceiverState::Idle,
            Some(s) if s.finalized => ReceiverState::Verified,
            Some(s) if s.manifest_checked => ReceiverState::ManifestChecked,
            Some(_) => ReceiverState::Receiving,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// `(received, total)` of the open session.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.session.as_ref().map(|s| (s.received, s.total))
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    fn discard(&mut self) {
        discard(&mut self.target, &mut self.session);
    }
}

// The helpers below take the receiver's fields separately so a chunk can be
// written straight out of the decode scratch buffer.

fn write_chunk<T: StagingTarget>(
    target: &mut T,
    running: &Manifest,
    limits: &TransferLimits,
    slot: &mut Option<Session>,
    data: &[u8],
) -> Result<ChunkAck, TransferError> {
    let session = slot.as_mut().ok_or(TransferError::NoSession)?;

    if session.last_write.elapsed() > limits.idle_timeout {
        log::error!("No update data for {} ms, session discarded", limits.idle_timeout.as_millis());
        discard(target, slot);
        return Err(TransferError::SessionTimeout);
    }
    if data.is_empty() {
        return Err(TransferError::EmptyChunk);
    }
    let allowed = session.chunk_size.min(session.total - session.received);
    if data.len() > allowed as usize {
        log::warn!(
            "Rejecting {} byte chunk at {}/{} (max {})",
            data.len(),
            session.received,
            session.total,
            allowed
        );
        return Err(TransferError::ChunkTooLarge {
            len: data.len(),
            allowed,
        });
    }

    // Header bytes are captured before the write so the manifest check
    // never depends on reading back from the target.
    if session.header.len() < HEADER_WINDOW {
        let take = (HEADER_WINDOW - session.header.len()).min(data.len());
        let _ = session.header.extend_from_slice(&data[..take]);
    }

    if let Err(e) = target.write(data) {
        log::error!("Write failed at {}/{}: {}", session.received, session.total, e);
        discard(target, slot);
        return Err(TransferError::Write(e));
    }

    session.received += data.len() as u32;
    session.last_write = Instant::now();
    session.image_crc.update(data);
    session.log_progress();

    let ack = ChunkAck {
        received: session.received,
        total: session.total,
        crc32: crc32fast::hash(data),
    };

    if session.manifest_due() {
        session.manifest_checked = true;
        let candidate = manifest::extract(&session.header).ok();
        let outcome = manifest::check_compatibility(running, candidate.as_ref(), session.force);
        if !outcome.is_ok() {
            log::error!("Update rejected: {}", outcome.as_str());
            discard(target, slot);
        }
        match outcome {
            Compatibility::Compatible | Compatibility::Forced => {}
            Compatibility::BoardMismatch { current, new } => {
                return Err(TransferError::BoardMismatch { current, new });
            }
            Compatibility::ManifestMissing => return Err(TransferError::ManifestMissing),
        }
    }

    Ok(ack)
}

fn discard<T: StagingTarget>(target: &mut T, slot: &mut Option<Session>) {
    target.abort();
    *slot = None;
}
