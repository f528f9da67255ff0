/// Communication layer: line framing and command dispatch for the USB
/// serial console and the BLE control characteristic.
///
/// Both transports deliver newline-delimited text commands. Bytes are
/// accumulated with `LineReader`, parsed with `parse_command`, and run by
/// `CommandProcessor`, which writes exactly one reply line per command.
use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{with_timeout, Timer};
use heapless::String;
use serde::Deserialize;

use crate::defaults::{MAX_IMAGE_SIZE, MAX_LINE_LEN, MAX_PAIRED_DEVICES};
use crate::pairing::SharedRegistry;
use crate::protocol::{
    parse_mac, to_json, words, CompatibilityReply, HostCommand, PairDeviceArgs, PeerEntry,
    Response, StartReply, UnpairArgs, UpdateStartArgs, VERSION,
};
use crate::registry::{device_id_from_mac, PeerStorage, RegistryError};
use crate::transfer::{StagingTarget, TransferError};
use crate::transport::CancelFlag;
use crate::update::{SharedUpdate, StartRequest, StreamHandoff, StreamRequest, UpdateConfig};

/// Name reported by `PING` and advertised over BLE.
pub const DEVICE_NAME: &str = "LoRaCue";

/// BLE GATT service UUIDs for LoRaCue.
///
/// These duplicate the string literals in the `#[gatt_service]` and `#[characteristic]`
/// attributes in the firmware binary; proc macros require string literals.
#[allow(dead_code)]
pub mod ble_uuids {
    /// LoRaCue primary service UUID
    pub const SERVICE: &str = "4c520001-7a3e-4c1d-9f21-0b5e8a6c3d10";
    /// TX characteristic: command replies, notify
    pub const TX_CHAR: &str = "4c520002-7a3e-4c1d-9f21-0b5e8a6c3d10";
    /// RX characteristic: command lines, write
    pub const RX_CHAR: &str = "4c520003-7a3e-4c1d-9f21-0b5e8a6c3d10";
    /// OTA characteristic: raw image bytes for `FW_UPDATE_STREAM`, write without response
    pub const OTA_DATA_CHAR: &str = "4c520004-7a3e-4c1d-9f21-0b5e8a6c3d10";
}

/// BLE advertising name
pub const BLE_ADV_NAME: &str = DEVICE_NAME;

/// Serial baud rate
pub const SERIAL_BAUD: u32 = 115200;

/// Maximum BLE notification payload (MTU-3)
pub const BLE_MAX_NOTIFY: usize = 20;

/// Worst-case `GET_PAIRED_DEVICES` reply.
const PEER_LIST_LEN: usize = MAX_PAIRED_DEVICES * 192;

// ── Line reader ────────────────────────────────────────────────────────

/// Accumulates bytes until a newline is found, then yields the line.
/// A line longer than `N` is dropped up to its terminating newline.
pub struct LineReader<const N: usize = MAX_LINE_LEN> {
    buf: [u8; N],
    pos: usize,
    discarding: bool,
}

impl<const N: usize> LineReader<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            pos: 0,
            discarding: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            let pos = core::mem::take(&mut self.pos);
            if core::mem::take(&mut self.discarding) || pos == 0 {
                return None;
            }
            Some(&self.buf[..pos])
        } else if self.discarding {
            None
        } else if self.pos < N {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            log::warn!("Command line longer than {} bytes dropped", N);
            self.pos = 0;
            self.discarding = true;
            None
        }
    }
}

impl<const N: usize> Default for LineReader<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Parsing ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command")]
    UnknownCommand,
    #[error("Invalid JSON")]
    InvalidJson,
}

/// Parse one command line: a command word, then optional arguments after
/// the first space.
pub fn parse_command(line: &[u8]) -> Result<HostCommand<'_>, CommandError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }

    let (word, rest) = match line.iter().position(|&b| b == b' ') {
        Some(i) => (&line[..i], line[i + 1..].trim_ascii()),
        None => (line, &line[line.len()..]),
    };
    let word = core::str::from_utf8(word).map_err(|_| CommandError::UnknownCommand)?;

    let command = match word {
        words::PING => HostCommand::Ping,
        words::FW_UPDATE_START => HostCommand::UpdateStart(json_args(rest)?),
        words::FW_UPDATE_DATA => HostCommand::UpdateData(rest),
        words::FW_UPDATE_VERIFY => HostCommand::UpdateVerify,
        words::FW_UPDATE_ABORT => HostCommand::UpdateAbort,
        words::FW_UPDATE_COMMIT => HostCommand::UpdateCommit,
        words::FW_UPDATE_STREAM => HostCommand::UpdateStream(json_args(rest)?),
        words::PAIR_DEVICE => HostCommand::PairDevice(json_args(rest)?),
        words::UPDATE_PAIRED_DEVICE => HostCommand::UpdatePairedDevice(json_args(rest)?),
        words::UNPAIR_DEVICE => HostCommand::UnpairDevice(json_args(rest)?),
        words::GET_PAIRED_DEVICES => HostCommand::GetPairedDevices,
        _ => return Err(CommandError::UnknownCommand),
    };
    Ok(command)
}

fn json_args<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, CommandError> {
    serde_json_core::from_slice::<T>(data)
        .map(|(args, _)| args)
        .map_err(|_| CommandError::InvalidJson)
}

// ── Dispatch ───────────────────────────────────────────────────────────

/// Where reply lines go. Lines carry no trailing newline.
pub trait ResponseSink {
    fn send(&mut self, line: &str);
}

/// Platform actions commands may trigger.
pub trait SystemControl {
    /// Restart into the committed image. Does not return on hardware.
    fn restart(&mut self);
}

/// Runs host commands against the update session and the peer registry.
pub struct CommandProcessor<'a, T, S, Sys> {
    update: &'a SharedUpdate<T>,
    registry: &'a SharedRegistry<S>,
    stream: &'a StreamHandoff,
    update_cancel: &'a CancelFlag,
    system: Sys,
    config: UpdateConfig,
}

impl<'a, T: StagingTarget, S: PeerStorage, Sys: SystemControl> CommandProcessor<'a, T, S, Sys> {
    pub fn new(
        update: &'a SharedUpdate<T>,
        registry: &'a SharedRegistry<S>,
        stream: &'a StreamHandoff,
        update_cancel: &'a CancelFlag,
        system: Sys,
    ) -> Self {
        Self {
            update,
            registry,
            stream,
            update_cancel,
            system,
            config: UpdateConfig::new(),
        }
    }

    pub fn with_config(mut self, config: UpdateConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one command line and send its reply. Blank lines are ignored.
    pub async fn execute<R: ResponseSink>(&mut self, line: &[u8], sink: &mut R) {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(CommandError::Empty) => return,
            Err(e) => {
                log::warn!("Rejected command: {}", e);
                send_error(sink, &e);
                return;
            }
        };

        match command {
            HostCommand::Ping => {
                let mut out = Response::new();
                let _ = write!(out, "PONG {} v{}", DEVICE_NAME, VERSION);
                sink.send(&out);
            }
            HostCommand::UpdateStart(args) => self.update_start(&args, sink),
            HostCommand::UpdateData(payload) => {
                let Some(mut session) = self.try_session(sink) else { return };
                match session.data(payload) {
                    Ok(ack) => {
                        let mut out = Response::new();
                        let _ = write!(out, "OK {}/{} {:08x}", ack.received, ack.total, ack.crc32);
                        sink.send(&out);
                    }
                    Err(e) => send_transfer_error(sink, &e),
                }
            }
            HostCommand::UpdateVerify => {
                let Some(mut session) = self.try_session(sink) else { return };
                match session.verify() {
                    Ok(()) => sink.send("OK"),
                    Err(e) => send_transfer_error(sink, &e),
                }
            }
            HostCommand::UpdateAbort => {
                // A streamed update holds the session until it notices the cancel.
                self.update_cancel.cancel();
                self.update.lock().await.abort();
                sink.send("OK");
            }
            HostCommand::UpdateCommit => {
                let committed = match self.try_session(sink) {
                    Some(mut session) => session.commit(),
                    None => return,
                };
                match committed {
                    Ok(()) => {
                        sink.send("OK");
                        log::info!("Restarting in {} ms", self.config.restart_delay.as_millis());
                        Timer::after(self.config.restart_delay).await;
                        self.system.restart();
                    }
                    Err(e) => send_transfer_error(sink, &e),
                }
            }
            HostCommand::UpdateStream(args) => {
                if args.size == 0 || args.size > MAX_IMAGE_SIZE {
                    send_error(sink, &TransferError::InvalidImageSize(args.size));
                    return;
                }
                if self.try_session(sink).is_none() {
                    return;
                }
                let request = StreamRequest {
                    size: args.size,
                    force: args.force.unwrap_or(false),
                };
                // Ready only once the worker holds the transport and the session.
                match with_timeout(self.config.stream_idle_timeout, self.stream.request(request)).await {
                    Ok(Ok(())) => sink.send("OK Ready for stream"),
                    Ok(Err(e)) => send_error(sink, &e),
                    Err(_) => {
                        self.stream.withdraw();
                        log::error!("Stream worker did not take the request");
                        sink.send("ERROR Stream worker not responding");
                    }
                }
            }
            HostCommand::PairDevice(args) => self.pair_device(&args, sink).await,
            HostCommand::UpdatePairedDevice(args) => self.update_paired_device(&args, sink).await,
            HostCommand::UnpairDevice(args) => self.unpair_device(&args, sink).await,
            HostCommand::GetPairedDevices => self.list_paired_devices(sink).await,
        }
    }

    fn try_session<R: ResponseSink>(
        &self,
        sink: &mut R,
    ) -> Option<embassy_sync::mutex::MutexGuard<'a, CriticalSectionRawMutex, crate::update::UpdateSession<T>>>
    {
        match self.update.try_lock() {
            Ok(session) => Some(session),
            Err(_) => {
                sink.send("ERROR Streamed update in progress");
                None
            }
        }
    }

    fn update_start<R: ResponseSink>(&self, args: &UpdateStartArgs, sink: &mut R) {
        let expected_crc = match args.image_crc() {
            Ok(crc) => crc,
            Err(e) => {
                send_error(sink, &e);
                return;
            }
        };
        if let Some(version) = &args.version {
            log::info!("Host announces firmware version {}", version);
        }

        let Some(mut session) = self.try_session(sink) else { return };
        let request = StartRequest {
            size: args.size,
            chunk_size: args.chunk_size,
            expected_crc,
            force: args.force.unwrap_or(false),
        };
        match session.start(&request) {
            Ok(info) => {
                let reply = StartReply {
                    status: "ready",
                    force_mode: info.force,
                    expected_chunks: info.expected_chunks,
                };
                match to_json::<_, 128>(&reply) {
                    Some(json) => sink.send(&json),
                    None => sink.send("OK"),
                }
            }
            Err(e) => send_transfer_error(sink, &e),
        }
    }

    async fn pair_device<R: ResponseSink>(&self, args: &PairDeviceArgs, sink: &mut R) {
        let record = match args.to_record() {
            Ok(record) => record,
            Err(e) => return send_error(sink, &e),
        };
        match self.registry.lock().await.add(record).await {
            Ok(()) => sink.send("OK Device paired successfully"),
            Err(e) => send_registry_error(sink, &e),
        }
    }

    async fn update_paired_device<R: ResponseSink>(&self, args: &PairDeviceArgs, sink: &mut R) {
        let record = match args.to_record() {
            Ok(record) => record,
            Err(e) => return send_error(sink, &e),
        };
        match self.registry.lock().await.update(record).await {
            Ok(()) => sink.send("OK Device updated successfully"),
            Err(e) => send_registry_error(sink, &e),
        }
    }

    async fn unpair_device<R: ResponseSink>(&self, args: &UnpairArgs, sink: &mut R) {
        let Some(mac) = parse_mac(&args.mac) else {
            return send_error(sink, &crate::protocol::ArgError::InvalidMac);
        };
        match self.registry.lock().await.remove(device_id_from_mac(&mac)).await {
            Ok(_) => sink.send("OK Device unpaired successfully"),
            Err(e) => send_registry_error(sink, &e),
        }
    }

    async fn list_paired_devices<R: ResponseSink>(&self, sink: &mut R) {
        let registry = self.registry.lock().await;
        let mut out: String<PEER_LIST_LEN> = String::new();
        let _ = out.push('[');
        for (i, record) in registry.list().iter().enumerate() {
            let Some(entry) = to_json::<_, 192>(&PeerEntry::from(record)) else {
                log::warn!("Skipping unlistable device {:04X}", record.device_id);
                continue;
            };
            if i > 0 {
                let _ = out.push(',');
            }
            let _ = out.push_str(&entry);
        }
        let _ = out.push(']');
        sink.send(&out);
    }
}

fn send_error<R: ResponseSink, E: core::fmt::Display>(sink: &mut R, error: &E) {
    let mut out = Response::new();
    let _ = write!(out, "ERROR {}", error);
    sink.send(&out);
}

fn send_registry_error<R: ResponseSink>(sink: &mut R, error: &RegistryError) {
    match error {
        RegistryError::NotFound => send_error(sink, error),
        _ => {
            let mut out = Response::new();
            let _ = write!(out, "ERROR Failed to store device: {}", error);
            sink.send(&out);
        }
    }
}

/// Compatibility failures go out as structured JSON, the rest as text.
fn send_transfer_error<R: ResponseSink>(sink: &mut R, error: &TransferError) {
    let reply = match error {
        TransferError::BoardMismatch { current, new } => CompatibilityReply::BoardMismatch {
            current_board: current.as_str(),
            new_board: new.as_str(),
        },
        TransferError::ManifestMissing => CompatibilityReply::ManifestMissing,
        other => return send_error(sink, other),
    };
    match to_json::<_, 192>(&reply) {
        Some(json) => send_error(sink, &json),
        None => send_error(sink, error),
    }
}
