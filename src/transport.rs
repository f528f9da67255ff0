//! Shared transport plumbing: the exclusive-ownership token that keeps
//! pairing and streamed updates off the same link, the cooperative
//! cancellation flag used by background workers, and the link trait the
//! pairing exchange runs over.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

// ── Exclusive ownership ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportOwner {
    Pairing = 1,
    Update = 2,
}

impl TransportOwner {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(TransportOwner::Pairing),
            2 => Some(TransportOwner::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transport busy (held by {holder:?})")]
pub struct TransportBusy {
    pub holder: Option<TransportOwner>,
}

/// Hands out at most one `TransportLease` at a time.
pub struct TransportArbiter {
    owner: AtomicU8,
}

impl TransportArbiter {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU8::new(0),
        }
    }

    pub fn try_acquire(&self, owner: TransportOwner) -> Result<TransportLease<'_>, TransportBusy> {
        match self
            .owner
            .compare_exchange(0, owner as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                log::debug!("Transport acquired by {:?}", owner);
                Ok(TransportLease { arbiter: self, owner })
            }
            Err(current) => Err(TransportBusy {
                holder: TransportOwner::from_raw(current),
            }),
        }
    }

    pub fn owner(&self) -> Option<TransportOwner> {
        TransportOwner::from_raw(self.owner.load(Ordering::Acquire))
    }
}

impl Default for TransportArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive use of the transport; released on drop.
pub struct TransportLease<'a> {
    arbiter: &'a TransportArbiter,
    owner: TransportOwner,
}

impl TransportLease<'_> {
    pub fn owner(&self) -> TransportOwner {
        self.owner
    }
}

impl Drop for TransportLease<'_> {
    fn drop(&mut self) {
        self.arbiter.owner.store(0, Ordering::Release);
        log::debug!("Transport released by {:?}", self.owner);
    }
}

// ── Cancellation ───────────────────────────────────────────────────────

/// Cooperative cancellation: a sticky flag plus a signal so waiters wake
/// immediately. Workers race `cancelled()` against every wait.
pub struct CancelFlag {
    flag: AtomicBool,
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl CancelFlag {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            signal: Signal::new(),
        }
    }

    /// Request cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.signal.signal(());
    }

    /// Clear a previous request before starting new work.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
        self.signal.reset();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once `cancel()` has been called.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.signal.wait().await;
        }
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ── Pairing link ───────────────────────────────────────────────────────

/// Point-to-point link used for pairing (USB between stage and PC on
/// hardware). Normal operation and pairing mode are mutually exclusive;
/// the pairing worker always switches back before it finishes.
#[allow(async_fn_in_trait)]
pub trait PairingLink {
    type Error: core::fmt::Debug;

    /// Leave normal operation and take the link for pairing.
    async fn enter_pairing_mode(&mut self) -> Result<(), Self::Error>;

    /// Return the link to normal operation.
    async fn exit_pairing_mode(&mut self) -> Result<(), Self::Error>;

    /// Resolves once a peer is attached at the other end.
    async fn wait_for_peer(&mut self) -> Result<(), Self::Error>;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read whatever is available; `Ok(0)` means nothing yet.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}
