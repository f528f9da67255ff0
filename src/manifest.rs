//! Firmware manifest: the fixed record every LoRaCue image carries near its
//! start, naming the board it was built for.
//!
//! Layout (little-endian, byte-packed, 80 bytes):
//!
//! | offset | width | field |
//! |-------:|------:|-------|
//! | 0  | 4  | magic `0x4C52_4355` |
//! | 4  | 1  | format version (0 is invalid) |
//! | 5  | 3  | reserved |
//! | 8  | 32 | board id, NUL padded |
//! | 40 | 32 | firmware version, NUL padded |
//! | 72 | 4  | build timestamp, unix seconds |
//! | 76 | 4  | CRC32 over bytes 0..76, 0 when absent |
//!
//! Fields are read by offset from byte slices, never by casting memory.

use heapless::String;

use crate::defaults::HEADER_WINDOW;

pub const MANIFEST_MAGIC: u32 = 0x4C52_4355;
pub const MANIFEST_FORMAT_VERSION: u8 = 1;
pub const MANIFEST_SIZE: usize = 80;

/// Width of the board id and firmware version fields.
pub const FIELD_LEN: usize = 32;

const FORMAT_OFFSET: usize = 4;
const BOARD_OFFSET: usize = 8;
const VERSION_OFFSET: usize = BOARD_OFFSET + FIELD_LEN;
const TIMESTAMP_OFFSET: usize = VERSION_OFFSET + FIELD_LEN;
const CHECKSUM_OFFSET: usize = TIMESTAMP_OFFSET + 4;

/// Board id as carried in error replies.
pub type BoardId = String<FIELD_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest record truncated ({0} bytes)")]
    Truncated(usize),
    #[error("bad manifest magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported manifest format version {0}")]
    InvalidFormatVersion(u8),
    #[error("manifest checksum mismatch (stored 0x{stored:08x}, computed 0x{computed:08x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("no firmware manifest in the first {} bytes", HEADER_WINDOW)]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manifest {
    pub format_version: u8,
    board_id: [u8; FIELD_LEN],
    firmware_version: [u8; FIELD_LEN],
    pub build_timestamp: u32,
    pub checksum: u32,
}

impl Manifest {
    /// Build an unsealed manifest (checksum 0). Strings longer than the
    /// field width are truncated.
    pub const fn new(board_id: &str, firmware_version: &str, build_timestamp: u32) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            board_id: fixed_field(board_id),
            firmware_version: fixed_field(firmware_version),
            build_timestamp,
            checksum: 0,
        }
    }

    /// Parse one record. The slice must hold at least `MANIFEST_SIZE` bytes;
    /// anything after the record is ignored.
    pub fn parse(record: &[u8]) -> Result<Self, ManifestError> {
        if record.len() < MANIFEST_SIZE {
            return Err(ManifestError::Truncated(record.len()));
        }

        let magic = read_u32(record, 0);
        if magic != MANIFEST_MAGIC {
            return Err(ManifestError::BadMagic(magic));
        }

        let format_version = record[FORMAT_OFFSET];
        if format_version == 0 {
            return Err(ManifestError::InvalidFormatVersion(format_version));
        }

        let mut board_id = [0u8; FIELD_LEN];
        board_id.copy_from_slice(&record[BOARD_OFFSET..BOARD_OFFSET + FIELD_LEN]);
        let mut firmware_version = [0u8; FIELD_LEN];
        firmware_version.copy_from_slice(&record[VERSION_OFFSET..VERSION_OFFSET + FIELD_LEN]);

        let manifest = Self {
            format_version,
            board_id,
            firmware_version,
            build_timestamp: read_u32(record, TIMESTAMP_OFFSET),
            checksum: read_u32(record, CHECKSUM_OFFSET),
        };

        if manifest.checksum != 0 {
            let computed = manifest.compute_checksum();
            if computed != manifest.checksum {
                return Err(ManifestError::ChecksumMismatch {
                    stored: manifest.checksum,
                    computed,
                });
            }
        }

        Ok(manifest)
    }

    /// Serialize to the on-image layout, checksum included as stored.
    pub const fn to_bytes(&self) -> [u8; MANIFEST_SIZE] {
        let mut out = [0u8; MANIFEST_SIZE];
        out = put_bytes(out, 0, &MANIFEST_MAGIC.to_le_bytes());
        out[FORMAT_OFFSET] = self.format_version;
        out = put_bytes(out, BOARD_OFFSET, &self.board_id);
        out = put_bytes(out, VERSION_OFFSET, &self.firmware_version);
        out = put_bytes(out, TIMESTAMP_OFFSET, &self.build_timestamp.to_le_bytes());
        put_bytes(out, CHECKSUM_OFFSET, &self.checksum.to_le_bytes())
    }

    /// CRC32 over every byte before the checksum field.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.to_bytes()[..CHECKSUM_OFFSET])
    }

    /// Copy with the checksum filled in.
    pub fn sealed(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }

    pub fn board_id(&self) -> &str {
        field_str(&self.board_id)
    }

    pub fn firmware_version(&self) -> &str {
        field_str(&self.firmware_version)
    }

    fn board_id_string(&self) -> BoardId {
        let mut id = BoardId::new();
        // Cannot overflow: the field and the string share FIELD_LEN.
        let _ = id.push_str(self.board_id());
        id
    }
}

/// Scan the header window of an image for a valid manifest.
///
/// The magic may sit at any byte offset, but the whole record must fit
/// inside the window. Candidates that fail to parse (format version 0, bad
/// checksum) are skipped and the scan continues past them.
pub fn extract(image: &[u8]) -> Result<Manifest, ManifestError> {
    let window = &image[..image.len().min(HEADER_WINDOW)];
    if window.len() < MANIFEST_SIZE {
        return Err(ManifestError::NotFound);
    }

    let magic = MANIFEST_MAGIC.to_le_bytes();
    for (offset, candidate) in window.windows(MANIFEST_SIZE).enumerate() {
        if candidate[..4] != magic {
            continue;
        }
        match Manifest::parse(candidate) {
            Ok(manifest) => {
                log::info!(
                    "Manifest at offset {}: board={} version={}",
                    offset,
                    manifest.board_id(),
                    manifest.firmware_version()
                );
                return Ok(manifest);
            }
            Err(e) => log::debug!("Skipping manifest candidate at offset {}: {}", offset, e),
        }
    }

    Err(ManifestError::NotFound)
}

/// True when `candidate` may replace `running`: always with `force`,
/// otherwise only if the board id fields are byte-identical. Firmware
/// versions are informational and never compared.
pub fn is_compatible(running: &Manifest, candidate: &Manifest, force: bool) -> bool {
    force || running.board_id == candidate.board_id
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    /// Accepted only because the client asked to skip checks.
    Forced,
    BoardMismatch { current: BoardId, new: BoardId },
    ManifestMissing,
}

impl Compatibility {
    pub fn is_ok(&self) -> bool {
        matches!(self, Compatibility::Compatible | Compatibility::Forced)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compatibility::Compatible => "Compatible",
            Compatibility::Forced => "Compatibility checks skipped (force mode)",
            Compatibility::BoardMismatch { .. } => "Board ID mismatch - wrong hardware",
            Compatibility::ManifestMissing => "Invalid or missing firmware manifest",
        }
    }
}

/// Full compatibility decision for an incoming image. A missing manifest
/// only passes in force mode.
pub fn check_compatibility(
    running: &Manifest,
    candidate: Option<&Manifest>,
    force: bool,
) -> Compatibility {
    if force {
        log::warn!("Force mode enabled - skipping compatibility checks");
        return Compatibility::Forced;
    }

    let Some(candidate) = candidate else {
        log::error!("Image carries no valid firmware manifest");
        return Compatibility::ManifestMissing;
    };

    if is_compatible(running, candidate, false) {
        log::info!(
            "Firmware compatible: {} -> {} on {}",
            running.firmware_version(),
            candidate.firmware_version(),
            running.board_id()
        );
        Compatibility::Compatible
    } else {
        log::error!(
            "Board mismatch: running on {}, image built for {}",
            running.board_id(),
            candidate.board_id()
        );
        Compatibility::BoardMismatch {
            current: running.board_id_string(),
            new: candidate.board_id_string(),
        }
    }
}

// ── Field helpers ──────────────────────────────────────────────────────

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn field_str(field: &[u8; FIELD_LEN]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(FIELD_LEN);
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

const fn fixed_field(s: &str) -> [u8; FIELD_LEN] {
    let bytes = s.as_bytes();
    let mut out = [0u8; FIELD_LEN];
    let mut i = 0;
    while i < bytes.len() && i < FIELD_LEN {
        out[i] = bytes[i];
        i += 1;
    }
    out
}

const fn put_bytes(mut out: [u8; MANIFEST_SIZE], offset: usize, src: &[u8]) -> [u8; MANIFEST_SIZE] {
    let mut i = 0;
    while i < src.len() {
        out[offset + i] = src[i];
        i += 1;
    }
    out
}
