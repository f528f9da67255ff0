//! Flash-backed storage for the firmware: the OTA staging target for image
//! updates and the peer registry store.
//!
//! Both share one `FlashStorage` behind a critical-section mutex. Peer
//! records live in the `nvs` data partition as a `sequential-storage` map:
//!   - key `device_id` (0..=0xFFFF): one encoded `PeerRecord`
//!   - key `INDEX_KEY`: little-endian list of stored device ids
//!   - key `NETWORK_KEY_ITEM`: this unit's LoRa network key

use core::cell::RefCell;
use core::ops::Range;

use embassy_embedded_hal::adapter::BlockingAsync;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};
use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::ota::OtaImageState;
use esp_bootloader_esp_idf::ota_updater::OtaUpdater;
use esp_bootloader_esp_idf::partitions::{
    self, DataPartitionSubType, PartitionType, PARTITION_TABLE_MAX_LEN,
};
use esp_storage::FlashStorage;
use heapless::Vec;
use sequential_storage::cache::NoCache;
use sequential_storage::map;

use crate::defaults::MAX_PAIRED_DEVICES;
use crate::registry::{PeerRecord, PeerStorage, KEY_LEN};
use crate::transfer::{StagingTarget, TargetError};

/// The one flash driver, shared by the OTA target and the peer store.
pub type FlashCell = Mutex<CriticalSectionRawMutex, RefCell<FlashStorage<'static>>>;

/// First byte of every ESP application image.
const ESP_IMAGE_MAGIC: u8 = 0xE9;

const INDEX_KEY: u32 = 0x1_0000;
const NETWORK_KEY_ITEM: u32 = 0x1_0001;

/// Scratch for one map item plus sequential-storage's item header.
const ITEM_BUF_LEN: usize = 256;

// ── OTA staging target ─────────────────────────────────────────────────

/// Writes the incoming image into the next OTA app partition.
pub struct OtaTarget {
    flash: &'static FlashCell,
    table: [u8; PARTITION_TABLE_MAX_LEN],
    size: u32,
    written: u32,
}

impl OtaTarget {
    pub fn new(flash: &'static FlashCell) -> Self {
        Self {
            flash,
            table: [0; PARTITION_TABLE_MAX_LEN],
            size: 0,
            written: 0,
        }
    }

    fn with_updater<R>(
        &mut self,
        f: impl FnOnce(&mut OtaUpdater<'_, FlashStorage<'static>>) -> Result<R, TargetError>,
    ) -> Result<R, TargetError> {
        let flash = self.flash;
        let table = &mut self.table;
        flash.lock(|cell| {
            let mut storage = cell.borrow_mut();
            let mut updater = OtaUpdater::new(&mut *storage, table).map_err(|e| {
                log::error!("Partition table unreadable: {:?}", e);
                TargetError::NoPartition
            })?;
            f(&mut updater)
        })
    }
}

impl StagingTarget for OtaTarget {
    fn begin(&mut self, image_size: u32) -> Result<(), TargetError> {
        self.with_updater(|updater| {
            let (region, subtype) = updater.next_partition().map_err(|e| {
                log::error!("No OTA partition available: {:?}", e);
                TargetError::NoPartition
            })?;
            if image_size as usize > region.partition_size() {
                log::error!(
                    "Image of {} bytes does not fit {:?} ({} bytes)",
                    image_size,
                    subtype,
                    region.partition_size()
                );
                return Err(TargetError::TooLarge);
            }
            log::info!("Staging update in {:?}", subtype);
            Ok(())
        })?;
        self.size = image_size;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TargetError> {
        let offset = self.written;
        self.with_updater(|updater| {
            let (mut region, _) = updater.next_partition().map_err(|_| TargetError::NoPartition)?;
            Storage::write(&mut region, offset, data).map_err(|e| {
                log::error!("Flash write at {:#x} failed: {:?}", offset, e);
                TargetError::Write
            })
        })?;
        self.written += data.len() as u32;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), TargetError> {
        if self.written != self.size {
            return Err(TargetError::Validation);
        }
        let magic = self.with_updater(|updater| {
            let (mut region, _) = updater.next_partition().map_err(|_| TargetError::NoPartition)?;
            let mut magic = [0u8; 1];
            ReadStorage::read(&mut region, 0, &mut magic).map_err(|_| TargetError::Validation)?;
            Ok(magic[0])
        })?;
        if magic != ESP_IMAGE_MAGIC {
            log::error!("Staged image has bad magic {:#04x}", magic);
            return Err(TargetError::Validation);
        }
        Ok(())
    }

    fn abort(&mut self) {
        // The partition is never activated, so its contents are harmless.
        self.size = 0;
        self.written = 0;
    }

    fn set_boot(&mut self) -> Result<(), TargetError> {
        self.with_updater(|updater| {
            updater.activate_next_partition().map_err(|e| {
                log::error!("Failed to activate partition: {:?}", e);
                TargetError::Boot
            })?;
            updater
                .set_current_ota_state(OtaImageState::New)
                .map_err(|_| TargetError::Boot)
        })
    }
}

// ── Peer registry store ────────────────────────────────────────────────

/// `NorFlash` view of the shared flash, locking it per operation.
#[derive(Clone, Copy)]
pub struct SharedFlash(&'static FlashCell);

impl ErrorType for SharedFlash {
    type Error = <FlashStorage<'static> as ErrorType>::Error;
}

impl ReadNorFlash for SharedFlash {
    const READ_SIZE: usize = <FlashStorage<'static> as ReadNorFlash>::READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.0
            .lock(|cell| ReadNorFlash::read(&mut *cell.borrow_mut(), offset, bytes))
    }

    fn capacity(&self) -> usize {
        self.0.lock(|cell| ReadNorFlash::capacity(&*cell.borrow()))
    }
}

impl NorFlash for SharedFlash {
    const WRITE_SIZE: usize = <FlashStorage<'static> as NorFlash>::WRITE_SIZE;
    const ERASE_SIZE: usize = <FlashStorage<'static> as NorFlash>::ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.0.lock(|cell| NorFlash::erase(&mut *cell.borrow_mut(), from, to))
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.0
            .lock(|cell| NorFlash::write(&mut *cell.borrow_mut(), offset, bytes))
    }
}

pub type StoreError = sequential_storage::Error<<FlashStorage<'static> as ErrorType>::Error>;

/// Peer records in the `nvs` partition.
pub struct FlashPeerStorage {
    flash: BlockingAsync<SharedFlash>,
    range: Range<u32>,
    ids: Vec<u16, MAX_PAIRED_DEVICES>,
    buf: [u8; ITEM_BUF_LEN],
}

impl FlashPeerStorage {
    /// Locate the `nvs` partition. `None` if the partition table has none.
    pub fn new(flash: &'static FlashCell) -> Option<Self> {
        let mut table = [0u8; PARTITION_TABLE_MAX_LEN];
        let range = flash.lock(|cell| {
            let mut storage = cell.borrow_mut();
            let pt = partitions::read_partition_table(&mut *storage, &mut table).ok()?;
            let entry = pt
                .find_partition(PartitionType::Data(DataPartitionSubType::Nvs))
                .ok()??;
            Some(entry.offset()..entry.offset() + entry.len())
        })?;
        log::info!("Peer registry in flash {:#x}..{:#x}", range.start, range.end);

        Some(Self {
            flash: BlockingAsync::new(SharedFlash(flash)),
            range,
            ids: Vec::new(),
            buf: [0; ITEM_BUF_LEN],
        })
    }

    /// This unit's network key, created with `generate` on first use.
    pub async fn network_key(&mut self, generate: impl FnOnce() -> [u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let stored = map::fetch_item::<u32, &[u8], _>(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            &NETWORK_KEY_ITEM,
        )
        .await;
        if let Ok(Some(data)) = stored {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(data) {
                return key;
            }
        }

        let key = generate();
        log::info!("Generated new network key");
        if let Err(e) = self.store_bytes(NETWORK_KEY_ITEM, &key).await {
            log::error!("Failed to persist network key: {:?}", e);
        }
        key
    }

    async fn store_bytes(&mut self, key: u32, data: &[u8]) -> Result<(), StoreError> {
        map::store_item::<u32, &[u8], _>(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            &key,
            &data,
        )
        .await
    }

    async fn store_index(&mut self) -> Result<(), StoreError> {
        let mut index: Vec<u8, { MAX_PAIRED_DEVICES * 2 }> = Vec::new();
        for id in &self.ids {
            let _ = index.extend_from_slice(&id.to_le_bytes());
        }
        self.store_bytes(INDEX_KEY, &index).await
    }
}

impl PeerStorage for FlashPeerStorage {
    type Error = StoreError;

    async fn load_all(&mut self, out: &mut Vec<PeerRecord, MAX_PAIRED_DEVICES>) -> Result<(), StoreError> {
        self.ids.clear();
        let index = map::fetch_item::<u32, &[u8], _>(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            &INDEX_KEY,
        )
        .await?;
        if let Some(data) = index {
            for pair in data.chunks_exact(2) {
                let _ = self.ids.push(u16::from_le_bytes([pair[0], pair[1]]));
            }
        }

        for &id in &self.ids {
            let item = map::fetch_item::<u32, &[u8], _>(
                &mut self.flash,
                self.range.clone(),
                &mut NoCache::new(),
                &mut self.buf,
                &u32::from(id),
            )
            .await?;
            match item.and_then(PeerRecord::decode) {
                Some(record) => {
                    let _ = out.push(record);
                }
                None => log::warn!("Skipping unreadable record {}", PeerRecord::storage_key(id)),
            }
        }
        Ok(())
    }

    async fn store(&mut self, record: &PeerRecord) -> Result<(), StoreError> {
        self.store_bytes(u32::from(record.device_id), &record.encode()).await?;
        if !self.ids.contains(&record.device_id) {
            let _ = self.ids.push(record.device_id);
            self.store_index().await?;
        }
        Ok(())
    }

    /// Drops the id from the index; the stale item is overwritten if the
    /// same device pairs again.
    async fn remove(&mut self, device_id: u16) -> Result<(), StoreError> {
        self.ids.retain(|&id| id != device_id);
        self.store_index().await
    }
}
