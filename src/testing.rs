//! In-memory stand-ins for flash, storage, links and the system, shared by
//! the unit tests.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use crate::comm::{ResponseSink, SystemControl};
use crate::defaults::MAX_PAIRED_DEVICES;
use crate::manifest::Manifest;
use crate::registry::{PeerRecord, PeerStorage};
use crate::transfer::{StagingTarget, TargetError};
use crate::transport::PairingLink;

/// Offset of the manifest in generated images, behind a fake image header.
pub const MANIFEST_OFFSET: usize = 32;

/// A `len`-byte image with a manifest for `board` at `MANIFEST_OFFSET`.
pub fn firmware_image(board: &str, len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    image[0] = 0xE9;
    let manifest = Manifest::new(board, "9.9.9", 1_700_000_000).sealed().to_bytes();
    image[MANIFEST_OFFSET..MANIFEST_OFFSET + manifest.len()].copy_from_slice(&manifest);
    image
}

// ── Staging target ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryTarget {
    pub image: Vec<u8>,
    pub open: bool,
    pub finalized: bool,
    pub bootable: bool,
    pub aborts: usize,
    pub fail_begin: bool,
    /// Fail any write that would grow the image past this many bytes.
    pub fail_write_after: Option<usize>,
    pub fail_finalize: bool,
    pub fail_set_boot: bool,
}

impl StagingTarget for MemoryTarget {
    fn begin(&mut self, _image_size: u32) -> Result<(), TargetError> {
        if self.fail_begin {
            return Err(TargetError::NoPartition);
        }
        self.image.clear();
        self.open = true;
        self.finalized = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TargetError> {
        if !self.open {
            return Err(TargetError::Write);
        }
        if let Some(limit) = self.fail_write_after {
            if self.image.len() + data.len() > limit {
                return Err(TargetError::Write);
            }
        }
        self.image.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), TargetError> {
        if self.fail_finalize {
            return Err(TargetError::Validation);
        }
        self.open = false;
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborts += 1;
        self.open = false;
        self.finalized = false;
        self.image.clear();
    }

    fn set_boot(&mut self) -> Result<(), TargetError> {
        if !self.finalized || self.fail_set_boot {
            return Err(TargetError::Boot);
        }
        self.bootable = true;
        Ok(())
    }
}

// ── Peer storage ───────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    pub records: Vec<PeerRecord>,
    pub fail_writes: bool,
}

impl PeerStorage for MemoryStorage {
    type Error = ();

    async fn load_all(
        &mut self,
        out: &mut heapless::Vec<PeerRecord, MAX_PAIRED_DEVICES>,
    ) -> Result<(), ()> {
        for record in &self.records {
            out.push(record.clone()).map_err(|_| ())?;
        }
        Ok(())
    }

    async fn store(&mut self, record: &PeerRecord) -> Result<(), ()> {
        if self.fail_writes {
            return Err(());
        }
        match self.records.iter_mut().find(|r| r.device_id == record.device_id) {
            Some(existing) => *existing = record.clone(),
            None => self.records.push(record.clone()),
        }
        Ok(())
    }

    async fn remove(&mut self, device_id: u16) -> Result<(), ()> {
        if self.fail_writes {
            return Err(());
        }
        self.records.retain(|r| r.device_id != device_id);
        Ok(())
    }
}

// ── Pairing link ───────────────────────────────────────────────────────

/// Scripted link. Reads drain `incoming` and then block forever; a write
/// starting with `reply_trigger` queues `reply` for reading.
#[derive(Debug, Default)]
pub struct MockLink {
    pub peer_present: bool,
    pub in_pairing_mode: bool,
    pub mode_switches: usize,
    pub fail_enter: bool,
    pub incoming: VecDeque<u8>,
    pub written: Vec<u8>,
    pub reply_trigger: Option<&'static str>,
    pub reply: String,
}

impl MockLink {
    pub fn with_peer() -> Self {
        Self {
            peer_present: true,
            ..Self::default()
        }
    }

    pub fn queue(&mut self, text: &str) {
        self.incoming.extend(text.bytes());
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }
}

impl PairingLink for MockLink {
    type Error = ();

    async fn enter_pairing_mode(&mut self) -> Result<(), ()> {
        if self.fail_enter {
            return Err(());
        }
        self.in_pairing_mode = true;
        self.mode_switches += 1;
        Ok(())
    }

    async fn exit_pairing_mode(&mut self) -> Result<(), ()> {
        self.in_pairing_mode = false;
        self.mode_switches += 1;
        Ok(())
    }

    async fn wait_for_peer(&mut self) -> Result<(), ()> {
        if self.peer_present {
            Ok(())
        } else {
            core::future::pending().await
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), ()> {
        self.written.extend_from_slice(data);
        if let Some(trigger) = self.reply_trigger {
            if data.starts_with(trigger.as_bytes()) {
                let reply = core::mem::take(&mut self.reply);
                self.queue(&reply);
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
        if self.incoming.is_empty() {
            return core::future::pending().await;
        }
        let n = buf.len().min(self.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

// ── Command plumbing ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub lines: Vec<String>,
}

impl RecordingSink {
    pub fn last(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }
}

impl ResponseSink for RecordingSink {
    fn send(&mut self, line: &str) {
        self.lines.push(line.into());
    }
}

/// Counts restart requests; clones share the counter.
#[derive(Debug, Default, Clone)]
pub struct RecordingSystem {
    pub restarts: Rc<Cell<usize>>,
}

impl SystemControl for RecordingSystem {
    fn restart(&mut self) {
        self.restarts.set(self.restarts.get() + 1);
    }
}
