//! Update session state machine and the streamed (BLE) update worker.
//!
//! `UpdateSession` wraps a `ChunkReceiver` and tracks which phase the
//! update is in, so command handlers and status reporting agree on it.
//! The stream worker feeds the same session from a bounded byte queue.

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};
use heapless::Vec;

use crate::defaults::{
    COMMIT_RESTART_DELAY_MS, STREAM_BUFFER_LEN, STREAM_IDLE_TIMEOUT_MS, STREAM_QUEUE_DEPTH,
};
use crate::manifest::Manifest;
use crate::transfer::{
    ChunkAck, ChunkReceiver, ReceiverState, SessionInfo, StagingTarget, TransferError,
    TransferLimits,
};
use crate::transport::{CancelFlag, TransportArbiter, TransportLease, TransportOwner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Receiving,
    ManifestChecked,
    Verified,
    Committed,
    Aborted,
}

impl UpdatePhase {
    /// Phases in which a session is open.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            UpdatePhase::Receiving | UpdatePhase::ManifestChecked | UpdatePhase::Verified
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Delay between acknowledging a commit and restarting.
    pub restart_delay: Duration,
    /// A streamed update with no data for this long is aborted.
    pub stream_idle_timeout: Duration,
}

impl UpdateConfig {
    pub const fn new() -> Self {
        Self {
            restart_delay: Duration::from_millis(COMMIT_RESTART_DELAY_MS),
            stream_idle_timeout: Duration::from_millis(STREAM_IDLE_TIMEOUT_MS),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of `start`, already validated at the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartRequest {
    pub size: u32,
    pub chunk_size: Option<u32>,
    pub expected_crc: Option<u32>,
    pub force: bool,
}

pub struct UpdateSession<T> {
    receiver: ChunkReceiver<T>,
    phase: UpdatePhase,
}

impl<T: StagingTarget> UpdateSession<T> {
    pub fn new(target: T, running: Manifest) -> Self {
        Self::with_limits(target, running, TransferLimits::new())
    }

    pub fn with_limits(target: T, running: Manifest, limits: TransferLimits) -> Self {
        Self {
            receiver: ChunkReceiver::with_limits(target, running, limits),
            phase: UpdatePhase::Idle,
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    pub fn progress(&self) -> Option<(u32, u32)> {
        self.receiver.progress()
    }

    pub fn receiver(&self) -> &ChunkReceiver<T> {
        &self.receiver
    }

    /// Open a session; an open one is superseded.
    pub fn start(&mut self, request: &StartRequest) -> Result<SessionInfo, TransferError> {
        let result = self.receiver.begin(
            request.size,
            request.chunk_size,
            request.force,
            request.expected_crc,
        );
        self.settle(result)
    }

    /// Accept one base64-encoded chunk.
    pub fn data(&mut self, encoded: &[u8]) -> Result<ChunkAck, TransferError> {
        let result = self.receiver.accept_chunk(encoded);
        self.settle(result)
    }

    /// Accept one raw chunk.
    pub fn data_raw(&mut self, bytes: &[u8]) -> Result<ChunkAck, TransferError> {
        let result = self.receiver.accept_bytes(bytes);
        self.settle(result)
    }

    pub fn verify(&mut self) -> Result<(), TransferError> {
        let result = self.receiver.verify();
        self.settle(result)
    }

    /// Abort the open session. Idle sessions stay idle.
    pub fn abort(&mut self) {
        if self.receiver.is_active() {
            self.receiver.abort();
            self.phase = UpdatePhase::Aborted;
        }
    }

    /// Mark the verified image bootable. The caller restarts afterwards.
    pub fn commit(&mut self) -> Result<(), TransferError> {
        self.receiver.commit()?;
        self.phase = UpdatePhase::Committed;
        Ok(())
    }

    /// Derive the phase after an operation. A session that disappeared
    /// because of the operation counts as aborted.
    fn settle<R>(&mut self, result: Result<R, TransferError>) -> Result<R, TransferError> {
        self.phase = match self.receiver.state() {
            ReceiverState::Receiving => UpdatePhase::Receiving,
            ReceiverState::ManifestChecked => UpdatePhase::ManifestChecked,
            ReceiverState::Verified => UpdatePhase::Verified,
            ReceiverState::Idle if self.phase.is_active() => UpdatePhase::Aborted,
            ReceiverState::Idle => self.phase,
        };
        result
    }
}

// ── Streamed updates ───────────────────────────────────────────────────

/// Shared handle to the one update session, used by command handlers and
/// the stream worker.
pub type SharedUpdate<T> = Mutex<CriticalSectionRawMutex, UpdateSession<T>>;

/// One piece of a streamed image.
pub type StreamBuffer = Vec<u8, STREAM_BUFFER_LEN>;

/// Bounded FIFO between the transport receiving image bytes and the worker.
pub type StreamQueue = Channel<CriticalSectionRawMutex, StreamBuffer, STREAM_QUEUE_DEPTH>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub size: u32,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("Update cancelled")]
    Cancelled,
    #[error("No data for {0} ms, update aborted")]
    Stalled(u64),
    #[error("Transport busy")]
    TransportBusy,
}

/// Push received bytes onto the stream queue, waiting while it is full.
/// Bytes are never dropped.
pub async fn feed_stream(queue: &StreamQueue, data: &[u8]) {
    for piece in data.chunks(STREAM_BUFFER_LEN) {
        let mut buf = StreamBuffer::new();
        // `piece` is at most STREAM_BUFFER_LEN bytes.
        let _ = buf.extend_from_slice(piece);
        queue.send(buf).await;
    }
}

const STREAM_IDLE: u8 = 0;
const STREAM_PENDING: u8 = 1;
const STREAM_ACTIVE: u8 = 2;

/// Hand-off of a streamed update between the command handler that accepts
/// it, the worker that runs it and the transport relaying image bytes.
///
/// The requester learns whether the worker took the transport and opened
/// the session before it answers the host. The relay holds image bytes
/// while a request is being set up and gives up only once the stream ended.
pub struct StreamHandoff {
    requests: Signal<CriticalSectionRawMutex, StreamRequest>,
    started: Signal<CriticalSectionRawMutex, Result<(), StreamError>>,
    state: AtomicU8,
    changed: Signal<CriticalSectionRawMutex, ()>,
}

impl StreamHandoff {
    pub const fn new() -> Self {
        Self {
            requests: Signal::new(),
            started: Signal::new(),
            state: AtomicU8::new(STREAM_IDLE),
            changed: Signal::new(),
        }
    }

    /// Ask the worker for a streamed update and wait until it is receiving
    /// or has refused.
    pub async fn request(&self, request: StreamRequest) -> Result<(), StreamError> {
        self.started.reset();
        self.set_state(STREAM_PENDING);
        self.requests.signal(request);
        self.started.wait().await
    }

    /// Take back a request the worker never picked up.
    pub fn withdraw(&self) {
        self.requests.reset();
        if self.state.load(Ordering::Acquire) == STREAM_PENDING {
            self.set_state(STREAM_IDLE);
        }
    }

    /// True from a successful start until the stream ends.
    pub fn is_streaming(&self) -> bool {
        self.state.load(Ordering::Acquire) == STREAM_ACTIVE
    }

    /// Forward image bytes to the running stream, waiting while a request
    /// is pending and while the queue is full. Returns `false` when no
    /// stream takes the bytes.
    pub async fn relay(&self, queue: &StreamQueue, data: &[u8]) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                STREAM_PENDING => self.changed.wait().await,
                STREAM_ACTIVE => {
                    return match select(feed_stream(queue, data), self.ended()).await {
                        Either::First(()) => true,
                        Either::Second(()) => false,
                    };
                }
                _ => return false,
            }
        }
    }

    async fn ended(&self) {
        while self.is_streaming() {
            self.changed.wait().await;
        }
    }

    fn report_start(&self, result: Result<(), StreamError>) {
        self.set_state(if result.is_ok() { STREAM_ACTIVE } else { STREAM_IDLE });
        self.started.signal(result);
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
        self.changed.signal(());
    }
}

impl Default for StreamHandoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for the next streamed update request, then receive the whole image
/// from `queue` into the session, in order, and verify it. The session is
/// left verified for a later commit, or aborted on any failure,
/// cancellation or stall.
///
/// Returns `None` when the request was refused before streaming began; the
/// requester already has the reason.
pub async fn stream_firmware<T: StagingTarget>(
    shared: &SharedUpdate<T>,
    handoff: &StreamHandoff,
    queue: &StreamQueue,
    cancel: &CancelFlag,
    arbiter: &TransportArbiter,
    config: &UpdateConfig,
) -> Option<Result<(), StreamError>> {
    let request = handoff.requests.wait().await;
    log::info!("Streamed update of {} bytes requested", request.size);

    let opened = open_stream(shared, request, queue, cancel, arbiter).await;
    handoff.report_start(opened.as_ref().map(|_| ()).map_err(Clone::clone));
    let (lease, mut session) = opened.ok()?;

    let result = receive_stream(&mut session, queue, cancel, config).await;
    if result.is_err() {
        session.abort();
    }
    drop(session);
    drop(lease);

    handoff.set_state(STREAM_IDLE);
    Some(result)
}

type SessionGuard<'a, T> = MutexGuard<'a, CriticalSectionRawMutex, UpdateSession<T>>;

async fn open_stream<'a, T: StagingTarget>(
    shared: &'a SharedUpdate<T>,
    request: StreamRequest,
    queue: &StreamQueue,
    cancel: &CancelFlag,
    arbiter: &'a TransportArbiter,
) -> Result<(TransportLease<'a>, SessionGuard<'a, T>), StreamError> {
    let lease = arbiter.try_acquire(TransportOwner::Update).map_err(|busy| {
        log::warn!("Streamed update refused: {}", busy);
        StreamError::TransportBusy
    })?;

    cancel.reset();
    while queue.try_receive().is_ok() {}

    let mut session = shared.lock().await;
    session.start(&StartRequest {
        size: request.size,
        chunk_size: Some(STREAM_BUFFER_LEN as u32),
        expected_crc: None,
        force: request.force,
    })?;
    Ok((lease, session))
}

async fn receive_stream<T: StagingTarget>(
    session: &mut UpdateSession<T>,
    queue: &StreamQueue,
    cancel: &CancelFlag,
    config: &UpdateConfig,
) -> Result<(), StreamError> {
    loop {
        match session.progress() {
            Some((received, total)) if received == total => break,
            Some(_) => {}
            None => return Err(TransferError::NoSession.into()),
        }

        let next = with_timeout(config.stream_idle_timeout, queue.receive());
        match select(next, cancel.cancelled()).await {
            Either::First(Ok(buf)) => {
                session.data_raw(&buf)?;
            }
            Either::First(Err(_)) => {
                let ms = config.stream_idle_timeout.as_millis();
                log::error!("Streamed update stalled for {} ms", ms);
                return Err(StreamError::Stalled(ms));
            }
            Either::Second(()) => {
                log::warn!("Streamed update cancelled");
                return Err(StreamError::Cancelled);
            }
        }
    }

    session.verify()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{firmware_image, MemoryTarget};
    use embassy_futures::block_on;
    use embassy_futures::join::{join, join3};
    use embassy_time::Timer;

    fn session() -> UpdateSession<MemoryTarget> {
        UpdateSession::new(MemoryTarget::default(), Manifest::new("heltec_v3", "1.0.0", 0))
    }

    fn start(size: u32) -> StartRequest {
        StartRequest {
            size,
            chunk_size: Some(4096),
            ..StartRequest::default()
        }
    }

    fn fast_config() -> UpdateConfig {
        UpdateConfig {
            restart_delay: Duration::from_millis(1),
            stream_idle_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_phases_follow_a_full_update() {
        let image = firmware_image("heltec_v3", 10_000);
        let mut s = session();
        assert_eq!(s.phase(), UpdatePhase::Idle);

        s.start(&start(10_000)).unwrap();
        assert_eq!(s.phase(), UpdatePhase::Receiving);

        s.data_raw(&image[..4096]).unwrap();
        assert_eq!(s.phase(), UpdatePhase::ManifestChecked);
        s.data_raw(&image[4096..8192]).unwrap();
        s.data_raw(&image[8192..]).unwrap();

        s.verify().unwrap();
        assert_eq!(s.phase(), UpdatePhase::Verified);

        s.commit().unwrap();
        assert_eq!(s.phase(), UpdatePhase::Committed);
        assert!(s.receiver().target().bootable);
    }

    #[test]
    fn test_abort_then_data_reports_no_session() {
        let mut s = session();
        s.start(&start(10_000)).unwrap();
        s.abort();
        assert_eq!(s.phase(), UpdatePhase::Aborted);
        assert_eq!(s.data(b"AAAA"), Err(TransferError::NoSession));
        assert_eq!(s.phase(), UpdatePhase::Aborted);
    }

    #[test]
    fn test_abort_when_idle_stays_idle() {
        let mut s = session();
        s.abort();
        assert_eq!(s.phase(), UpdatePhase::Idle);
    }

    #[test]
    fn test_mismatch_moves_to_aborted() {
        let image = firmware_image("wokwi_sim", 8192);
        let mut s = session();
        s.start(&start(8192)).unwrap();
        assert!(matches!(s.data_raw(&image[..4096]), Err(TransferError::BoardMismatch { .. })));
        assert_eq!(s.phase(), UpdatePhase::Aborted);
    }

    #[test]
    fn test_protocol_violation_keeps_phase() {
        let mut s = session();
        s.start(&start(1000)).unwrap();
        assert!(s.data_raw(&[0u8; 1200]).is_err());
        assert_eq!(s.phase(), UpdatePhase::Receiving);
    }

    #[test]
    fn test_start_from_terminal_phases() {
        let mut s = session();
        s.start(&start(1000)).unwrap();
        s.abort();
        s.start(&start(1000)).unwrap();
        assert_eq!(s.phase(), UpdatePhase::Receiving);
        assert_eq!(s.progress(), Some((0, 1000)));
    }

    #[test]
    fn test_stream_receives_in_order_with_backpressure() {
        let image = firmware_image("heltec_v3", 6000);
        let shared = SharedUpdate::new(session());
        let handoff = StreamHandoff::new();
        let queue = StreamQueue::new();
        let cancel = CancelFlag::new();
        let arbiter = TransportArbiter::new();
        let config = fast_config();

        block_on(async {
            let (result, ()) = join(
                stream_firmware(&shared, &handoff, &queue, &cancel, &arbiter, &config),
                async {
                    let request = StreamRequest { size: 6000, force: false };
                    assert_eq!(handoff.request(request).await, Ok(()));
                    assert_eq!(arbiter.owner(), Some(TransportOwner::Update));
                    // Odd-sized writes, more than the queue holds at once.
                    for piece in image.chunks(700) {
                        assert!(handoff.relay(&queue, piece).await);
                    }
                },
            )
            .await;
            assert_eq!(result, Some(Ok(())));
        });

        let session = block_on(shared.lock());
        assert_eq!(session.phase(), UpdatePhase::Verified);
        assert_eq!(session.receiver().target().image, image);
        assert_eq!(arbiter.owner(), None);
        assert!(!handoff.is_streaming());
    }

    #[test]
    fn test_relay_holds_bytes_until_stream_starts() {
        let image = firmware_image("heltec_v3", 3000);
        let shared = SharedUpdate::new(session());
        let handoff = StreamHandoff::new();
        let queue = StreamQueue::new();
        let cancel = CancelFlag::new();
        let arbiter = TransportArbiter::new();
        let config = fast_config();

        block_on(async {
            let (started, relayed, result) = join3(
                handoff.request(StreamRequest { size: 3000, force: false }),
                async {
                    // Issued while the request is still pending.
                    let mut all = true;
                    for piece in image.chunks(1000) {
                        all &= handoff.relay(&queue, piece).await;
                    }
                    all
                },
                stream_firmware(&shared, &handoff, &queue, &cancel, &arbiter, &config),
            )
            .await;
            assert_eq!(started, Ok(()));
            assert!(relayed);
            assert_eq!(result, Some(Ok(())));
        });

        assert_eq!(block_on(shared.lock()).receiver().target().image, image);
    }

    #[test]
    fn test_relay_without_stream_drops_bytes() {
        let handoff = StreamHandoff::new();
        let queue = StreamQueue::new();
        assert!(!block_on(handoff.relay(&queue, &[1, 2, 3])));
        assert!(queue.try_receive().is_err());
    }

    #[test]
    fn test_stream_cancel_aborts_session() {
        let image = firmware_image("heltec_v3", 6000);
        let shared = SharedUpdate::new(session());
        let handoff = StreamHandoff::new();
        let queue = StreamQueue::new();
        let cancel = CancelFlag::new();
        let arbiter = TransportArbiter::new();
        let config = UpdateConfig {
            stream_idle_timeout: Duration::from_secs(5),
            ..fast_config()
        };

        block_on(async {
            let (result, ()) = join(
                stream_firmware(&shared, &handoff, &queue, &cancel, &arbiter, &config),
                async {
                    handoff.request(StreamRequest { size: 6000, force: false }).await.unwrap();
                    assert!(handoff.relay(&queue, &image[..1024]).await);
                    Timer::after_millis(20).await;
                    cancel.cancel();
                    Timer::after_millis(10).await;
                    // Nothing takes bytes once the stream is gone.
                    assert!(!handoff.relay(&queue, &image[1024..2048]).await);
                },
            )
            .await;
            assert_eq!(result, Some(Err(StreamError::Cancelled)));
        });

        let session = block_on(shared.lock());
        assert_eq!(session.phase(), UpdatePhase::Aborted);
        assert!(!session.receiver().target().open);
        assert_eq!(arbiter.owner(), None);
    }

    #[test]
    fn test_stream_stall_aborts_session() {
        let shared = SharedUpdate::new(session());
        let handoff = StreamHandoff::new();
        let queue = StreamQueue::new();
        let cancel = CancelFlag::new();
        let arbiter = TransportArbiter::new();
        let config = fast_config();

        block_on(async {
            let (result, started) = join(
                stream_firmware(&shared, &handoff, &queue, &cancel, &arbiter, &config),
                handoff.request(StreamRequest { size: 6000, force: false }),
            )
            .await;
            assert_eq!(started, Ok(()));
            assert_eq!(result, Some(Err(StreamError::Stalled(50))));
        });
        assert_eq!(block_on(shared.lock()).phase(), UpdatePhase::Aborted);
    }

    #[test]
    fn test_stream_refused_while_transport_held() {
        let shared = SharedUpdate::new(session());
        let handoff = StreamHandoff::new();
        let queue = StreamQueue::new();
        let cancel = CancelFlag::new();
        let arbiter = TransportArbiter::new();
        let _pairing = arbiter.try_acquire(TransportOwner::Pairing).unwrap();
        let config = fast_config();

        block_on(async {
            let (result, started) = join(
                stream_firmware(&shared, &handoff, &queue, &cancel, &arbiter, &config),
                handoff.request(StreamRequest { size: 6000, force: false }),
            )
            .await;
            assert_eq!(started, Err(StreamError::TransportBusy));
            assert_eq!(result, None);
        });
        assert!(!handoff.is_streaming());
        assert_eq!(block_on(shared.lock()).phase(), UpdatePhase::Idle);
        assert!(!block_on(handoff.relay(&queue, &[0u8; 16])));
    }

    #[test]
    fn test_stream_refused_for_bad_size() {
        let shared = SharedUpdate::new(session());
        let handoff = StreamHandoff::new();
        let queue = StreamQueue::new();
        let cancel = CancelFlag::new();
        let arbiter = TransportArbiter::new();

        block_on(async {
            let (result, started) = join(
                stream_firmware(&shared, &handoff, &queue, &cancel, &arbiter, &fast_config()),
                handoff.request(StreamRequest { size: 0, force: false }),
            )
            .await;
            assert_eq!(started, Err(StreamError::Transfer(TransferError::InvalidImageSize(0))));
            assert_eq!(result, None);
        });
        assert_eq!(arbiter.owner(), None);
    }
}
