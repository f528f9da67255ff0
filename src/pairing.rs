//! Pairing: hands the LoRa network key from a stage (presenter) unit to a
//! PC receiver over a point-to-point link, producing a trusted peer record
//! on the PC side.
//!
//! The stage sends `PAIR_DEVICE {"name","mac","aes_key"}` and waits for
//! `OK ... with <name> (ID: <hex>)`. The PC waits for that request, stores
//! the peer and answers with its own name and id. Both sides bound every
//! wait by one deadline measured from session start, observe `stop()` at
//! every suspension point, and always hand the link back to normal
//! operation before reporting exactly one outcome.

use core::fmt::Write;
use core::future::Future;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embassy_futures::select::{select, Either};
use embassy_time::{with_deadline, Duration, Instant, Timer};
use heapless::String;

use crate::comm::{parse_command, LineReader};
use crate::defaults::{PAIRING_IDLE_POLL_MS, PAIRING_TIMEOUT_MS};
use crate::protocol::{
    format_pair_ack, parse_pair_ack, push_truncated, to_json, words, HostCommand, NameString,
    PairDeviceArgs,
};
use crate::registry::{device_id_from_mac, PeerStorage, RegistryError, KEY_LEN, MAC_LEN};
use crate::transport::{CancelFlag, PairingLink, TransportArbiter, TransportLease, TransportOwner};

/// Longest line either side expects during the exchange.
const PAIRING_LINE_LEN: usize = 256;

/// Registry shared between the command task and the pairing worker.
pub type SharedRegistry<S> = embassy_sync::mutex::Mutex<
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    crate::registry::PeerRegistry<S>,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    /// Presenter unit: offers its key.
    Stage,
    /// Receiver plugged into the PC: stores the offered key.
    Pc,
}

/// Progress of one pairing attempt. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PairingPhase {
    Idle = 0,
    Waiting = 1,
    Connected = 2,
    Exchanging = 3,
    Succeeded = 4,
    Failed = 5,
    TimedOut = 6,
}

impl PairingPhase {
    pub fn is_terminal(self) -> bool {
        self >= PairingPhase::Succeeded
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PairingPhase::Waiting,
            2 => PairingPhase::Connected,
            3 => PairingPhase::Exchanging,
            4 => PairingPhase::Succeeded,
            5 => PairingPhase::Failed,
            6 => PairingPhase::TimedOut,
            _ => PairingPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingConfig {
    /// Overall deadline, measured from session start.
    pub timeout: Duration,
}

impl PairingConfig {
    pub const fn new() -> Self {
        Self {
            timeout: Duration::from_millis(PAIRING_TIMEOUT_MS),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What this unit announces about itself during pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: NameString,
    pub mac: [u8; MAC_LEN],
    /// LoRa network key handed to the peer (stage role).
    pub network_key: [u8; KEY_LEN],
}

impl LocalIdentity {
    pub fn new(name: &str, mac: [u8; MAC_LEN], network_key: [u8; KEY_LEN]) -> Self {
        let mut identity = Self {
            name: NameString::new(),
            mac,
            network_key,
        };
        push_truncated(&mut identity.name, name);
        identity
    }

    pub fn device_id(&self) -> u16 {
        device_id_from_mac(&self.mac)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PairingFailure {
    #[error("Pairing cancelled")]
    Cancelled,
    #[error("Could not switch link to pairing mode")]
    ModeSwitch,
    #[error("Link error")]
    Link,
    #[error("Pairing request too large")]
    RequestTooLarge,
    #[error("Failed to store device: {0}")]
    Registry(RegistryError),
}

/// Result of one pairing attempt, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired { device_id: u16, name: NameString },
    Failed(PairingFailure),
    TimedOut,
}

impl PairingOutcome {
    pub fn success(&self) -> bool {
        matches!(self, PairingOutcome::Paired { .. })
    }

    /// Peer device id, 0 when pairing did not succeed.
    pub fn device_id(&self) -> u16 {
        match self {
            PairingOutcome::Paired { device_id, .. } => *device_id,
            _ => 0,
        }
    }

    /// Peer name on success, otherwise a short diagnostic for the UI.
    pub fn label(&self) -> String<64> {
        let mut out = String::new();
        let _ = match self {
            PairingOutcome::Paired { name, .. } => write!(out, "{}", name),
            PairingOutcome::Failed(reason) => write!(out, "{}", reason),
            PairingOutcome::TimedOut => write!(out, "Timeout"),
        };
        out
    }

    fn phase(&self) -> PairingPhase {
        match self {
            PairingOutcome::Paired { .. } => PairingPhase::Succeeded,
            PairingOutcome::Failed(_) => PairingPhase::Failed,
            PairingOutcome::TimedOut => PairingPhase::TimedOut,
        }
    }
}

/// Reasons `run_*` refuses to start at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("Pairing already in progress")]
    AlreadyActive,
    #[error("Transport busy")]
    TransportBusy,
}

// ── Controller ─────────────────────────────────────────────────────────

/// Owns the single pairing slot. Lives in a static on hardware; the
/// pairing task calls `run_*`, anything else may call `stop()`.
pub struct PairingController {
    active: AtomicBool,
    phase: AtomicU8,
    cancel: CancelFlag,
    config: PairingConfig,
}

/// Held for the duration of a run; frees the slot on drop.
struct ActiveRun<'a> {
    controller: &'a PairingController,
    deadline: Instant,
    _lease: TransportLease<'a>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.controller.active.store(false, Ordering::Release);
    }
}

impl PairingController {
    pub const fn new(config: PairingConfig) -> Self {
        Self {
            active: AtomicBool::new(false),
            phase: AtomicU8::new(PairingPhase::Idle as u8),
            cancel: CancelFlag::new(),
            config,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Phase of the current run, or the terminal phase of the last one.
    pub fn phase(&self) -> PairingPhase {
        PairingPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Cancel the running attempt, if any. Always safe, any number of times.
    pub fn stop(&self) {
        if self.is_active() {
            log::info!("Stopping pairing");
            self.cancel.cancel();
        }
    }

    /// Offer this unit's key to the peer on `link`.
    pub async fn run_stage<L: PairingLink>(
        &self,
        identity: &LocalIdentity,
        link: &mut L,
        arbiter: &TransportArbiter,
    ) -> Result<PairingOutcome, PairingError> {
        let run = self.open(PairingRole::Stage, arbiter)?;
        let outcome = match link.enter_pairing_mode().await {
            Ok(()) => {
                let outcome = self.stage_exchange(&run, identity, link).await;
                restore(link).await;
                outcome
            }
            Err(e) => {
                log::error!("Failed to enter pairing mode: {:?}", e);
                PairingOutcome::Failed(PairingFailure::ModeSwitch)
            }
        };
        Ok(self.finish(run, outcome))
    }

    /// Accept a key offered by the peer on `link` and store it.
    pub async fn run_pc<L: PairingLink, S: PeerStorage>(
        &self,
        identity: &LocalIdentity,
        link: &mut L,
        registry: &SharedRegistry<S>,
        arbiter: &TransportArbiter,
    ) -> Result<PairingOutcome, PairingError> {
        let run = self.open(PairingRole::Pc, arbiter)?;
        let outcome = match link.enter_pairing_mode().await {
            Ok(()) => {
                let outcome = self.pc_exchange(&run, identity, link, registry).await;
                restore(link).await;
                outcome
            }
            Err(e) => {
                log::error!("Failed to enter pairing mode: {:?}", e);
                PairingOutcome::Failed(PairingFailure::ModeSwitch)
            }
        };
        Ok(self.finish(run, outcome))
    }

    fn open<'a>(
        &'a self,
        role: PairingRole,
        arbiter: &'a TransportArbiter,
    ) -> Result<ActiveRun<'a>, PairingError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PairingError::AlreadyActive);
        }

        let lease = match arbiter.try_acquire(TransportOwner::Pairing) {
            Ok(lease) => lease,
            Err(busy) => {
                self.active.store(false, Ordering::Release);
                log::warn!("Pairing refused: {}", busy);
                return Err(PairingError::TransportBusy);
            }
        };

        self.cancel.reset();
        self.phase.store(PairingPhase::Waiting as u8, Ordering::Release);
        log::info!("Pairing started as {:?}", role);

        Ok(ActiveRun {
            controller: self,
            deadline: Instant::now() + self.config.timeout,
            _lease: lease,
        })
    }

    fn finish(&self, run: ActiveRun<'_>, outcome: PairingOutcome) -> PairingOutcome {
        self.phase.store(outcome.phase() as u8, Ordering::Release);
        match &outcome {
            PairingOutcome::Paired { device_id, name } => {
                log::info!("Pairing successful with {} (ID: {:04X})", name, device_id)
            }
            PairingOutcome::Failed(reason) => log::warn!("Pairing failed: {}", reason),
            PairingOutcome::TimedOut => log::warn!("Pairing timed out"),
        }
        drop(run);
        outcome
    }

    fn advance(&self, phase: PairingPhase) {
        self.phase.fetch_max(phase as u8, Ordering::AcqRel);
    }

    /// Run `fut` until it completes, the deadline passes or `stop()` is called.
    async fn bounded<F: Future>(&self, run: &ActiveRun<'_>, fut: F) -> Result<F::Output, PairingOutcome> {
        match select(with_deadline(run.deadline, fut), self.cancel.cancelled()).await {
            Either::First(Ok(output)) => Ok(output),
            Either::First(Err(_)) => Err(PairingOutcome::TimedOut),
            Either::Second(()) => Err(PairingOutcome::Failed(PairingFailure::Cancelled)),
        }
    }

    /// Read from the link; an empty read backs off briefly.
    async fn read_some<L: PairingLink>(
        &self,
        run: &ActiveRun<'_>,
        link: &mut L,
        buf: &mut [u8],
    ) -> Result<usize, PairingOutcome> {
        let n = self
            .bounded(run, link.read(buf))
            .await?
            .map_err(|_| PairingOutcome::Failed(PairingFailure::Link))?;
        if n == 0 {
            self.bounded(run, Timer::after_millis(PAIRING_IDLE_POLL_MS)).await?;
        }
        Ok(n)
    }

    async fn stage_exchange<L: PairingLink>(
        &self,
        run: &ActiveRun<'_>,
        identity: &LocalIdentity,
        link: &mut L,
    ) -> PairingOutcome {
        match self.stage_steps(run, identity, link).await {
            Ok(ack) => PairingOutcome::Paired {
                device_id: ack.device_id,
                name: ack.name,
            },
            Err(outcome) => outcome,
        }
    }

    async fn stage_steps<L: PairingLink>(
        &self,
        run: &ActiveRun<'_>,
        identity: &LocalIdentity,
        link: &mut L,
    ) -> Result<crate::protocol::PeerAck, PairingOutcome> {
        self.bounded(run, link.wait_for_peer())
            .await?
            .map_err(|_| PairingOutcome::Failed(PairingFailure::Link))?;
        self.advance(PairingPhase::Connected);
        log::info!("Peer connected, sending pairing request");

        let request = pair_request(identity)
            .ok_or(PairingOutcome::Failed(PairingFailure::RequestTooLarge))?;
        self.advance(PairingPhase::Exchanging);
        self.bounded(run, link.write_all(request.as_bytes()))
            .await?
            .map_err(|_| PairingOutcome::Failed(PairingFailure::Link))?;

        let mut lines: LineReader<PAIRING_LINE_LEN> = LineReader::new();
        let mut buf = [0u8; 64];
        loop {
            let n = self.read_some(run, link, &mut buf).await?;
            for &byte in &buf[..n] {
                let Some(line) = lines.feed(byte) else { continue };
                match core::str::from_utf8(line).ok().and_then(parse_pair_ack) {
                    Some(ack) => return Ok(ack),
                    None => log::debug!("Ignoring reply while pairing ({} bytes)", line.len()),
                }
            }
        }
    }

    async fn pc_exchange<L: PairingLink, S: PeerStorage>(
        &self,
        run: &ActiveRun<'_>,
        identity: &LocalIdentity,
        link: &mut L,
        registry: &SharedRegistry<S>,
    ) -> PairingOutcome {
        match self.pc_steps(run, identity, link, registry).await {
            Ok((device_id, name)) => PairingOutcome::Paired { device_id, name },
            Err(outcome) => outcome,
        }
    }

    async fn pc_steps<L: PairingLink, S: PeerStorage>(
        &self,
        run: &ActiveRun<'_>,
        identity: &LocalIdentity,
        link: &mut L,
        registry: &SharedRegistry<S>,
    ) -> Result<(u16, NameString), PairingOutcome> {
        self.bounded(run, link.wait_for_peer())
            .await?
            .map_err(|_| PairingOutcome::Failed(PairingFailure::Link))?;
        self.advance(PairingPhase::Connected);
        log::info!("Peer connected, waiting for pairing request");

        let mut lines: LineReader<PAIRING_LINE_LEN> = LineReader::new();
        let mut buf = [0u8; 64];
        let record = 'wait: loop {
            let n = self.read_some(run, link, &mut buf).await?;
            let mut rejected = None;
            for &byte in &buf[..n] {
                let Some(line) = lines.feed(byte) else { continue };
                let Ok(HostCommand::PairDevice(args)) = parse_command(line) else {
                    log::debug!("Ignoring line while pairing ({} bytes)", line.len());
                    continue;
                };
                match args.to_record() {
                    Ok(record) => break 'wait record,
                    Err(e) => rejected = Some(e),
                }
            }
            if let Some(e) = rejected {
                log::warn!("Rejected pairing request: {}", e);
                let mut reply: String<96> = String::new();
                let _ = writeln!(reply, "ERROR {}", e);
                self.bounded(run, link.write_all(reply.as_bytes()))
                    .await?
                    .map_err(|_| PairingOutcome::Failed(PairingFailure::Link))?;
            }
        };

        self.advance(PairingPhase::Exchanging);
        let device_id = record.device_id;
        let name = record.name.clone();

        let stored = {
            let mut registry = self.bounded(run, registry.lock()).await?;
            registry.add(record).await
        };
        if let Err(e) = stored {
            let mut reply: String<96> = String::new();
            let _ = writeln!(reply, "ERROR {}", e);
            let _ = self.bounded(run, link.write_all(reply.as_bytes())).await;
            return Err(PairingOutcome::Failed(PairingFailure::Registry(e)));
        }

        let mut ack = format_pair_ack(&identity.name, identity.device_id());
        let _ = ack.push('\n');
        self.bounded(run, link.write_all(ack.as_bytes()))
            .await?
            .map_err(|_| PairingOutcome::Failed(PairingFailure::Link))?;

        Ok((device_id, name))
    }
}

/// Request line the stage sends: `PAIR_DEVICE <json>\n`.
fn pair_request(identity: &LocalIdentity) -> Option<String<PAIRING_LINE_LEN>> {
    let args = PairDeviceArgs::new(&identity.name, &identity.mac, &identity.network_key);
    let json: String<192> = to_json(&args)?;
    let mut line = String::new();
    writeln!(line, "{} {}", words::PAIR_DEVICE, json).ok()?;
    Some(line)
}

async fn restore<L: PairingLink>(link: &mut L) {
    if let Err(e) = link.exit_pairing_mode().await {
        log::error!("Failed to restore link after pairing: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerRegistry;
    use crate::testing::{MemoryStorage, MockLink};
    use embassy_futures::block_on;
    use embassy_futures::join::join;

    const STAGE_MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xAA, 0x1a, 0x2b];
    const PC_MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xBB, 0x00, 0x42];

    fn controller() -> PairingController {
        PairingController::new(PairingConfig {
            timeout: Duration::from_millis(150),
        })
    }

    fn stage() -> LocalIdentity {
        LocalIdentity::new("Stage", STAGE_MAC, [0x5A; KEY_LEN])
    }

    fn pc() -> LocalIdentity {
        LocalIdentity::new("PC-Desk", PC_MAC, [0; KEY_LEN])
    }

    fn registry() -> SharedRegistry<MemoryStorage> {
        SharedRegistry::new(block_on(PeerRegistry::load(MemoryStorage::default())))
    }

    #[test]
    fn test_stage_pairs_on_ack() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let mut link = MockLink::with_peer();
        link.reply_trigger = Some("PAIR_DEVICE");
        link.reply = "OK paired with Alice (ID: 1a2b)\n".into();

        let outcome = block_on(controller.run_stage(&stage(), &mut link, &arbiter)).unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.device_id(), 0x1a2b);
        assert_eq!(outcome.label().as_str(), "Alice");
        assert_eq!(controller.phase(), PairingPhase::Succeeded);
        assert!(!controller.is_active());
        assert!(!link.in_pairing_mode);
        assert_eq!(link.mode_switches, 2);
        assert_eq!(arbiter.owner(), None);

        let sent = link.written_text();
        assert!(sent.starts_with("PAIR_DEVICE {"));
        assert!(sent.contains(r#""name":"Stage""#));
        assert!(sent.contains(r#""mac":"24:6f:28:aa:1a:2b""#));
        assert!(sent.contains(&"5a".repeat(32)));
        assert!(sent.ends_with('\n'));
    }

    #[test]
    fn test_stage_ignores_unrelated_replies() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let mut link = MockLink::with_peer();
        link.reply_trigger = Some("PAIR_DEVICE");
        link.reply = "PONG PC v1.0.0\nERROR Busy\nOK paired with Bob (ID: 0007)\n".into();

        let outcome = block_on(controller.run_stage(&stage(), &mut link, &arbiter)).unwrap();
        assert_eq!(
            outcome,
            PairingOutcome::Paired {
                device_id: 7,
                name: NameString::try_from("Bob").unwrap()
            }
        );
    }

    #[test]
    fn test_no_peer_times_out_and_restores_link() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let mut link = MockLink::default();

        let outcome = block_on(controller.run_stage(&stage(), &mut link, &arbiter)).unwrap();

        assert_eq!(outcome, PairingOutcome::TimedOut);
        assert!(!outcome.success());
        assert_eq!(outcome.label().as_str(), "Timeout");
        assert_eq!(controller.phase(), PairingPhase::TimedOut);
        assert!(!link.in_pairing_mode);
        assert_eq!(link.mode_switches, 2);
    }

    #[test]
    fn test_silent_peer_times_out() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let mut link = MockLink::with_peer();

        let outcome = block_on(controller.run_stage(&stage(), &mut link, &arbiter)).unwrap();
        assert_eq!(outcome, PairingOutcome::TimedOut);
        assert!(!link.in_pairing_mode);
    }

    #[test]
    fn test_stop_cancels_and_restores_link() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let mut link = MockLink::default();

        let (outcome, ()) = block_on(join(
            controller.run_stage(&stage(), &mut link, &arbiter),
            async {
                Timer::after_millis(20).await;
                controller.stop();
                controller.stop();
            },
        ));

        assert_eq!(outcome.unwrap(), PairingOutcome::Failed(PairingFailure::Cancelled));
        assert_eq!(controller.phase(), PairingPhase::Failed);
        assert!(!link.in_pairing_mode);
        controller.stop();
    }

    #[test]
    fn test_second_run_is_rejected_while_active() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let mut first = MockLink::default();
        let mut second = MockLink::with_peer();

        let (a, b) = block_on(join(
            controller.run_stage(&stage(), &mut first, &arbiter),
            async {
                let result = controller.run_stage(&stage(), &mut second, &arbiter).await;
                controller.stop();
                result
            },
        ));

        assert_eq!(b, Err(PairingError::AlreadyActive));
        assert_eq!(second.mode_switches, 0);
        assert_eq!(a.unwrap(), PairingOutcome::Failed(PairingFailure::Cancelled));
    }

    #[test]
    fn test_refused_while_update_holds_transport() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let _update = arbiter.try_acquire(TransportOwner::Update).unwrap();
        let mut link = MockLink::with_peer();

        let result = block_on(controller.run_stage(&stage(), &mut link, &arbiter));
        assert_eq!(result, Err(PairingError::TransportBusy));
        assert!(!controller.is_active());
        assert_eq!(link.mode_switches, 0);
    }

    #[test]
    fn test_mode_switch_failure_reports_failed() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let mut link = MockLink {
            fail_enter: true,
            ..MockLink::with_peer()
        };

        let outcome = block_on(controller.run_stage(&stage(), &mut link, &arbiter)).unwrap();
        assert_eq!(outcome, PairingOutcome::Failed(PairingFailure::ModeSwitch));
        assert!(!link.in_pairing_mode);
    }

    #[test]
    fn test_pc_stores_peer_and_acks() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let registry = registry();
        let mut link = MockLink::with_peer();
        let request = pair_request(&stage()).unwrap();
        link.queue("garbage line\n");
        link.queue(&request);

        let outcome = block_on(controller.run_pc(&pc(), &mut link, &registry, &arbiter)).unwrap();

        assert_eq!(outcome.device_id(), 0x1a2b);
        assert_eq!(outcome.label().as_str(), "Stage");
        assert_eq!(link.written_text(), "OK paired with PC-Desk (ID: 0042)\n");
        assert!(!link.in_pairing_mode);

        let registry = block_on(registry.lock());
        let record = registry.get(0x1a2b).unwrap();
        assert_eq!(record.mac, STAGE_MAC);
        assert_eq!(record.key, [0x5A; KEY_LEN]);
    }

    #[test]
    fn test_pc_rejects_bad_request_and_keeps_waiting() {
        let controller = controller();
        let arbiter = TransportArbiter::new();
        let registry = registry();
        let mut link = MockLink::with_peer();
        link.queue(r#"PAIR_DEVICE {"name":"X","mac":"zz","aes_key":"00"}"#);
        link.queue("\n");

        let outcome = block_on(controller.run_pc(&pc(), &mut link, &registry, &arbiter)).unwrap();

        assert_eq!(outcome, PairingOutcome::TimedOut);
        assert_eq!(link.written_text(), "ERROR Invalid MAC address\n");
        assert!(block_on(registry.lock()).is_empty());
    }

    #[test]
    fn test_stage_and_pc_lines_agree() {
        let request = pair_request(&stage()).unwrap();
        let line = request.trim_end().as_bytes();
        match parse_command(line).unwrap() {
            HostCommand::PairDevice(args) => {
                let record = args.to_record().unwrap();
                assert_eq!(record.device_id, stage().device_id());
                assert_eq!(record.name.as_str(), "Stage");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
