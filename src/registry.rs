//! Trusted peer registry: the devices this unit accepts LoRa traffic from.
//!
//! Records live in a RAM cache that mirrors a persistent `PeerStorage`
//! backend. Every mutation is written through to storage before the cache
//! changes, so a failed write leaves both unchanged.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::defaults::MAX_PAIRED_DEVICES;
use crate::protocol::{push_truncated, NameString};

pub const MAC_LEN: usize = 6;
pub const KEY_LEN: usize = 32;

/// Device id: the last two bytes of the hardware address.
pub fn device_id_from_mac(mac: &[u8; MAC_LEN]) -> u16 {
    u16::from_be_bytes([mac[4], mac[5]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub device_id: u16,
    pub name: NameString,
    pub mac: [u8; MAC_LEN],
    pub key: [u8; KEY_LEN],
    /// Highest LoRa sequence number seen from this peer, for replay checks.
    pub last_sequence: u16,
}

impl PeerRecord {
    /// Size of the persisted form:
    /// `[id u16][mac 6][key 32][sequence u16][name_len u8][name 32]`.
    pub const ENCODED_LEN: usize = 2 + MAC_LEN + KEY_LEN + 2 + 1 + 32;

    pub fn new(name: &str, mac: [u8; MAC_LEN], key: [u8; KEY_LEN]) -> Self {
        let mut record = Self {
            device_id: device_id_from_mac(&mac),
            name: NameString::new(),
            mac,
            key,
            last_sequence: 0,
        };
        push_truncated(&mut record.name, name);
        record
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..2].copy_from_slice(&self.device_id.to_le_bytes());
        out[2..8].copy_from_slice(&self.mac);
        out[8..40].copy_from_slice(&self.key);
        out[40..42].copy_from_slice(&self.last_sequence.to_le_bytes());
        let name = self.name.as_bytes();
        out[42] = name.len() as u8;
        out[43..43 + name.len()].copy_from_slice(name);
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::ENCODED_LEN {
            return None;
        }
        let name_len = data[42] as usize;
        if name_len > 32 {
            return None;
        }
        let name = core::str::from_utf8(&data[43..43 + name_len]).ok()?;

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&data[2..8]);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&data[8..40]);

        Some(Self {
            device_id: u16::from_le_bytes([data[0], data[1]]),
            name: NameString::try_from(name).ok()?,
            mac,
            key,
            last_sequence: u16::from_le_bytes([data[40], data[41]]),
        })
    }

    /// Storage key, `dev_XXXX` with the id in upper-case hex.
    pub fn storage_key(device_id: u16) -> String<8> {
        let mut key = String::new();
        let _ = write!(key, "dev_{:04X}", device_id);
        key
    }
}

// ── Persistence ────────────────────────────────────────────────────────

/// Persistent backing store for peer records.
#[allow(async_fn_in_trait)]
pub trait PeerStorage {
    type Error: core::fmt::Debug;

    /// Read every stored record.
    async fn load_all(
        &mut self,
        out: &mut Vec<PeerRecord, MAX_PAIRED_DEVICES>,
    ) -> Result<(), Self::Error>;

    /// Insert or overwrite the record with `record.device_id`.
    async fn store(&mut self, record: &PeerRecord) -> Result<(), Self::Error>;

    async fn remove(&mut self, device_id: u16) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry full ({} devices)", MAX_PAIRED_DEVICES)]
    Full,
    #[error("Device not found")]
    NotFound,
    #[error("Storage error")]
    Storage,
}

// ── Registry ───────────────────────────────────────────────────────────

pub struct PeerRegistry<S> {
    storage: S,
    peers: Vec<PeerRecord, MAX_PAIRED_DEVICES>,
}

impl<S: PeerStorage> PeerRegistry<S> {
    /// Load every stored record. A storage error leaves the registry empty
    /// rather than failing startup.
    pub async fn load(mut storage: S) -> Self {
        let mut peers = Vec::new();
        match storage.load_all(&mut peers).await {
            Ok(()) => log::info!("Loaded {} paired devices", peers.len()),
            Err(e) => {
                log::error!("Failed to load paired devices: {:?}", e);
                peers.clear();
            }
        }
        Self { storage, peers }
    }

    /// Add a peer, overwriting any record with the same device id.
    pub async fn add(&mut self, record: PeerRecord) -> Result<(), RegistryError> {
        let existing = self.position(record.device_id);
        if existing.is_none() && self.peers.is_full() {
            log::warn!("Cannot pair {}: registry full", record.name);
            return Err(RegistryError::Full);
        }

        self.persist(&record).await?;

        match existing {
            Some(i) => {
                log::info!("Device {:04X} already paired, updating", record.device_id);
                self.peers[i] = record;
            }
            None => {
                log::info!("Paired device {:04X} ({})", record.device_id, record.name);
                // Capacity was checked above.
                let _ = self.peers.push(record);
            }
        }
        Ok(())
    }

    /// Overwrite an existing peer; `NotFound` if it was never paired.
    pub async fn update(&mut self, record: PeerRecord) -> Result<(), RegistryError> {
        if self.position(record.device_id).is_none() {
            return Err(RegistryError::NotFound);
        }
        self.add(record).await
    }

    pub async fn remove(&mut self, device_id: u16) -> Result<PeerRecord, RegistryError> {
        let i = self.position(device_id).ok_or(RegistryError::NotFound)?;
        self.storage.remove(device_id).await.map_err(|e| {
            log::error!("Failed to remove {}: {:?}", PeerRecord::storage_key(device_id), e);
            RegistryError::Storage
        })?;
        log::info!("Unpaired device {:04X}", device_id);
        Ok(self.peers.swap_remove(i))
    }

    /// Record the latest sequence number received from a peer.
    pub async fn update_last_seen(&mut self, device_id: u16, sequence: u16) -> Result<(), RegistryError> {
        let i = self.position(device_id).ok_or(RegistryError::NotFound)?;
        let mut record = self.peers[i].clone();
        record.last_sequence = sequence;
        self.persist(&record).await?;
        self.peers[i] = record;
        Ok(())
    }

    pub fn get(&self, device_id: u16) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.device_id == device_id)
    }

    pub fn find_by_mac(&self, mac: &[u8; MAC_LEN]) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| &p.mac == mac)
    }

    pub fn list(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn is_paired(&self, device_id: u16) -> bool {
        self.position(device_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    fn position(&self, device_id: u16) -> Option<usize> {
        self.peers.iter().position(|p| p.device_id == device_id)
    }

    async fn persist(&mut self, record: &PeerRecord) -> Result<(), RegistryError> {
        self.storage.store(record).await.map_err(|e| {
            log::error!("Failed to store {}: {:?}", PeerRecord::storage_key(record.device_id), e);
            RegistryError::Storage
        })
    }
}
