//! LoRaCue: LoRa presentation clicker firmware.
//!
//! Host commands arrive as text lines over the USB-UART console and the BLE
//! control characteristic and run through the library's command processor.
//! Streamed firmware images arrive as raw bytes on the BLE OTA
//! characteristic. Pairing runs over a dedicated wired UART link and is
//! started (or cancelled) with the PRG button.

#![no_std]
#![no_main]

extern crate alloc;

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

// Hardware-specific modules (binary crate only)
mod flash;
mod link;

// Re-export library modules so binary submodules can use crate::*
pub(crate) use loracue::{board, comm, defaults, manifest, pairing, protocol, registry, transfer, transport, update};

use core::cell::RefCell;
use core::fmt::Write;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use esp_hal::gpio::{Input, InputConfig, Pull};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{Config as UartConfig, Uart, UartRx, UartTx};
use esp_hal::Async;
use esp_storage::FlashStorage;
use heapless::Vec;
use static_cell::StaticCell;

use trouble_host::prelude::*;

use comm::{CommandProcessor, LineReader, ResponseSink, SystemControl};
use defaults::MAX_LINE_LEN;
use flash::{FlashCell, FlashPeerStorage, OtaTarget};
use link::UartLink;
use manifest::MANIFEST_SIZE;
use pairing::{LocalIdentity, PairingConfig, PairingController, PairingRole, SharedRegistry};
use protocol::{Response, MAX_RESPONSE_LEN, VERSION};
use registry::{PeerRegistry, KEY_LEN};
use transport::{CancelFlag, TransportArbiter};
use update::{SharedUpdate, StreamHandoff, StreamQueue, UpdateConfig, UpdateSession};

/// This image's manifest, placed right after the app descriptor so it sits
/// inside the header window update receivers scan.
#[link_section = ".rodata_desc.manifest"]
#[used]
static EMBEDDED_MANIFEST: [u8; MANIFEST_SIZE] = board::RUNNING_MANIFEST.to_bytes();

// ── BLE GATT server definition ──────────────────────────────────────
//
// Proc macros depend on trouble-host which is firmware-only. The UUID
// constants in comm::ble_uuids are the canonical source; proc macros
// require string literals.

#[gatt_service(uuid = "4c520001-7a3e-4c1d-9f21-0b5e8a6c3d10")]
struct LoRaCueGattService {
    /// TX: command replies, notify-only.
    /// Lines are chunked into BLE_MAX_NOTIFY-sized pieces; the host
    /// accumulates until it sees '\n'.
    #[characteristic(uuid = "4c520002-7a3e-4c1d-9f21-0b5e8a6c3d10", notify)]
    tx: [u8; 20],

    /// RX: command lines, accumulated via LineReader.
    #[characteristic(uuid = "4c520003-7a3e-4c1d-9f21-0b5e8a6c3d10", write)]
    rx: [u8; 20],

    /// OTA: raw image bytes after `FW_UPDATE_STREAM`.
    #[characteristic(uuid = "4c520004-7a3e-4c1d-9f21-0b5e8a6c3d10", write_without_response)]
    ota: [u8; 244],
}

/// Top-level LoRaCue GATT server.
#[gatt_server]
struct LoRaCueServer {
    loracue_service: LoRaCueGattService,
}

// ── Channel type aliases ──────────────────────────────────────────────

/// Where a command line came from, so its reply goes back the same way.
#[derive(Debug, Clone, Copy)]
enum Source {
    Serial,
    Ble,
}

struct CommandLine {
    source: Source,
    line: Vec<u8, MAX_LINE_LEN>,
}

type BleReply = Vec<u8, MAX_RESPONSE_LEN>;

type CommandChannel = Channel<CriticalSectionRawMutex, CommandLine, 2>;
type BleReplyChannel = Channel<CriticalSectionRawMutex, BleReply, 4>;

// ── Static channels and shared state ─────────────────────────────────

/// Command lines from the console and BLE
static CMD_CHANNEL: CommandChannel = Channel::new();

/// Reply lines for the connected BLE client
static BLE_REPLY_CHANNEL: BleReplyChannel = Channel::new();

/// Raw image bytes from the BLE OTA characteristic
static STREAM_QUEUE: StreamQueue = Channel::new();

/// `FW_UPDATE_STREAM` hand-off between the command task, the stream worker
/// and the OTA characteristic
static STREAM: StreamHandoff = StreamHandoff::new();

/// Set by `FW_UPDATE_ABORT` to stop a streamed update
static UPDATE_CANCEL: CancelFlag = CancelFlag::new();

/// Keeps pairing and streamed updates from running at the same time
static ARBITER: TransportArbiter = TransportArbiter::new();

static PAIRING: PairingController = PairingController::new(PairingConfig::new());

/// Button press asking the pairing task to start
static PAIRING_REQUEST: Signal<CriticalSectionRawMutex, ()> = Signal::new();

const BUTTON_DEBOUNCE_MS: u64 = 50;

// ── Reply sinks ──────────────────────────────────────────────────────

/// Replies to console commands go straight out of the console UART.
struct SerialSink<'a> {
    tx: &'a mut UartTx<'static, Async>,
}

impl ResponseSink for SerialSink<'_> {
    fn send(&mut self, line: &str) {
        for mut part in [line.as_bytes(), b"\n"] {
            while !part.is_empty() {
                match self.tx.write(part) {
                    Ok(n) => part = &part[n..],
                    Err(e) => {
                        log::error!("Console write error: {:?}", e);
                        return;
                    }
                }
            }
        }
    }
}

/// Replies to BLE commands are queued for notification.
struct BleSink;

impl ResponseSink for BleSink {
    fn send(&mut self, line: &str) {
        queue_ble_reply(line);
    }
}

/// Queue one reply line for BLE, split to fit the reply buffers. Drops the
/// line when no client is draining the queue.
fn queue_ble_reply(line: &str) {
    let pieces = line.as_bytes().chunks(MAX_RESPONSE_LEN - 1);
    let count = pieces.len();
    for (i, piece) in pieces.enumerate() {
        let mut buf = BleReply::new();
        let _ = buf.extend_from_slice(piece);
        if i + 1 == count {
            let _ = buf.push(b'\n');
        }
        if BLE_REPLY_CHANNEL.try_send(buf).is_err() {
            log::warn!("BLE reply dropped (no client?)");
            return;
        }
    }
}

struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        esp_hal::system::software_reset();
    }
}

async fn submit(source: Source, line: &[u8]) {
    match Vec::from_slice(line) {
        Ok(line) => CMD_CHANNEL.send(CommandLine { source, line }).await,
        Err(_) => log::warn!("{:?} command line too long", source),
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // Heap for the BLE stack
    esp_alloc::heap_allocator!(size: 72 * 1024);

    // Start the RTOS: needs timer + software interrupt
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("LoRaCue v{} starting on {}", VERSION, board::BOARD_NAME);
    log::info!("Manifest: board={} ({} bytes embedded)", board::BOARD_ID, EMBEDDED_MANIFEST.len());

    // ── Flash: OTA staging and peer registry ───────────────────────────

    static FLASH: StaticCell<FlashCell> = StaticCell::new();
    let flash: &'static FlashCell =
        FLASH.init(Mutex::new(RefCell::new(FlashStorage::new(peripherals.FLASH))));

    let mut storage = FlashPeerStorage::new(flash).expect("No nvs partition for the peer registry");
    let rng = esp_hal::rng::Rng::new();
    let network_key = storage
        .network_key(|| {
            let mut key = [0u8; KEY_LEN];
            rng.read(&mut key);
            key
        })
        .await;

    static REGISTRY: StaticCell<SharedRegistry<FlashPeerStorage>> = StaticCell::new();
    let registry: &'static SharedRegistry<FlashPeerStorage> =
        REGISTRY.init(SharedRegistry::new(PeerRegistry::load(storage).await));

    static UPDATE: StaticCell<SharedUpdate<OtaTarget>> = StaticCell::new();
    let update: &'static SharedUpdate<OtaTarget> = UPDATE.init(SharedUpdate::new(UpdateSession::new(
        OtaTarget::new(flash),
        board::RUNNING_MANIFEST,
    )));

    // ── Console (USB-UART bridge) and pairing link ─────────────────────

    let console = Uart::new(peripherals.UART0, UartConfig::default().with_baudrate(comm::SERIAL_BAUD))
        .expect("Console UART init failed")
        .with_tx(peripherals.GPIO43)
        .with_rx(peripherals.GPIO44)
        .into_async();
    let (console_rx, console_tx) = console.split();

    let pairing_uart = Uart::new(peripherals.UART1, UartConfig::default().with_baudrate(comm::SERIAL_BAUD))
        .expect("Pairing UART init failed")
        .with_tx(peripherals.GPIO47)
        .with_rx(peripherals.GPIO48)
        .into_async();
    let cable_detect = Input::new(peripherals.GPIO7, InputConfig::default().with_pull(Pull::Down));

    let mac = esp_hal::efuse::Efuse::read_base_mac_address();
    let identity = LocalIdentity::new(comm::DEVICE_NAME, mac, network_key);
    log::info!(
        "Device ID {:04X}, pairing role {:?}, {} paired devices",
        identity.device_id(),
        board::PAIRING_ROLE,
        registry.lock().await.len()
    );

    let button = Input::new(peripherals.GPIO0, InputConfig::default().with_pull(Pull::Up));

    spawner.spawn(serial_rx_task(console_rx)).unwrap();
    spawner.spawn(command_task(update, registry, console_tx)).unwrap();
    spawner.spawn(ota_stream_task(update)).unwrap();
    spawner
        .spawn(pairing_task(identity, UartLink::new(pairing_uart, cable_detect), registry))
        .unwrap();
    spawner.spawn(button_task(button)).unwrap();

    // ── BLE radio initialization ───────────────────────────────────────

    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .expect("BLE connector init failed");
    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES.init(HostResources::new());

    // Static random address derived from the MAC (two top bits set)
    let mut ble_addr = mac;
    ble_addr[5] |= 0xC0;
    let address = Address::random(ble_addr);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        mut runner,
        ..
    } = stack.build();

    let server = LoRaCueServer::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: comm::BLE_ADV_NAME,
        appearance: &appearance::UNKNOWN,
    }))
    .expect("GATT server init failed");

    log::info!("BLE radio initialized");

    // ── BLE orchestration ──────────────────────────────────────────────
    //
    //   1. BLE stack runner (drives HCI)
    //   2. GATT server (advertise, accept connections, relay commands)

    let _ = embassy_futures::join::join(
        async {
            loop {
                if let Err(e) = runner.run().await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        async {
            loop {
                let mut adv_data = [0u8; 31];
                let adv_len = match AdStructure::encode_slice(
                    &[
                        AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                        AdStructure::CompleteLocalName(comm::BLE_ADV_NAME.as_bytes()),
                    ],
                    &mut adv_data[..],
                ) {
                    Ok(len) => len,
                    Err(e) => {
                        log::error!("Ad encode error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let advertiser = match peripheral
                    .advertise(
                        &Default::default(),
                        Advertisement::ConnectableScannableUndirected {
                            adv_data: &adv_data[..adv_len],
                            scan_data: &[],
                        },
                    )
                    .await
                {
                    Ok(adv) => adv,
                    Err(e) => {
                        log::error!("BLE advertise error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                log::info!("BLE advertising as '{}'", comm::BLE_ADV_NAME);

                let conn = match advertiser.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("BLE accept error: {:?}", e);
                        continue;
                    }
                };

                let gatt_conn = match conn.with_attribute_server(&server) {
                    Ok(gc) => gc,
                    Err(e) => {
                        log::error!("GATT setup error: {:?}", e);
                        continue;
                    }
                };

                log::info!("BLE client connected");
                handle_gatt_connection(&gatt_conn, &server).await;

                // A streamed update cannot continue without its client.
                UPDATE_CANCEL.cancel();
                BLE_REPLY_CHANNEL.clear();
                log::info!("BLE client disconnected, re-advertising");
            }
        },
    )
    .await;
}

/// Handle a GATT connection: send queued replies as notifications, relay
/// control writes as command lines and OTA writes into the stream queue.
async fn handle_gatt_connection<'s, P: PacketPool>(
    conn: &GattConnection<'_, 's, P>,
    server: &'s LoRaCueServer<'_>,
) {
    let mut line_reader: LineReader = LineReader::new();

    loop {
        match select(BLE_REPLY_CHANNEL.receive(), conn.next()).await {
            Either::First(reply) => {
                // Pad with newlines so the host sees harmless empty lines
                // instead of null bytes.
                for chunk in reply.chunks(comm::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    if server.loracue_service.tx.notify(conn, &padded).await.is_err() {
                        return;
                    }
                }
            }
            Either::Second(event) => match event {
                GattConnectionEvent::Disconnected { .. } => return,
                GattConnectionEvent::Gatt { event } => {
                    if let GattEvent::Write(ref write_event) = event {
                        let handle = write_event.handle();
                        if handle == server.loracue_service.rx.handle {
                            for &byte in write_event.data() {
                                if let Some(line) = line_reader.feed(byte) {
                                    submit(Source::Ble, line).await;
                                }
                            }
                        } else if handle == server.loracue_service.ota.handle {
                            relay_stream_bytes(write_event.data()).await;
                        }
                    }
                    // Must accept/reply to all GATT events
                    if let Ok(reply) = event.accept() {
                        reply.send().await;
                    }
                }
                _ => {}
            },
        }
    }
}

/// Hand OTA bytes to the stream worker, waiting for it as long as a
/// streamed update is starting or running.
async fn relay_stream_bytes(data: &[u8]) {
    if !STREAM.relay(&STREAM_QUEUE, data).await {
        log::warn!("OTA data without a streamed update, {} bytes dropped", data.len());
    }
}

/// Console reader: frames bytes from the USB-UART into command lines.
#[embassy_executor::task]
async fn serial_rx_task(mut rx: UartRx<'static, Async>) {
    log::info!("Console ready at {} baud", comm::SERIAL_BAUD);

    let mut line_reader: LineReader = LineReader::new();
    let mut buf = [0u8; 64];

    loop {
        match rx.read_async(&mut buf).await {
            Ok(n) => {
                for &byte in &buf[..n] {
                    if let Some(line) = line_reader.feed(byte) {
                        submit(Source::Serial, line).await;
                    }
                }
            }
            Err(e) => log::warn!("Console read error: {:?}", e),
        }
    }
}

/// Command task: runs every command line and routes the reply back to
/// where the line came from.
#[embassy_executor::task]
async fn command_task(
    update: &'static SharedUpdate<OtaTarget>,
    registry: &'static SharedRegistry<FlashPeerStorage>,
    mut console_tx: UartTx<'static, Async>,
) {
    let mut processor =
        CommandProcessor::new(update, registry, &STREAM, &UPDATE_CANCEL, EspSystem);

    loop {
        let CommandLine { source, line } = CMD_CHANNEL.receive().await;
        match source {
            Source::Serial => {
                let mut sink = SerialSink { tx: &mut console_tx };
                processor.execute(&line, &mut sink).await;
            }
            Source::Ble => processor.execute(&line, &mut BleSink).await,
        }
    }
}

/// Stream worker: receives a whole image from the OTA characteristic after
/// each `FW_UPDATE_STREAM`, leaving it verified for `FW_UPDATE_COMMIT`.
#[embassy_executor::task]
async fn ota_stream_task(update: &'static SharedUpdate<OtaTarget>) {
    let config = UpdateConfig::new();

    loop {
        let Some(result) =
            update::stream_firmware(update, &STREAM, &STREAM_QUEUE, &UPDATE_CANCEL, &ARBITER, &config)
                .await
        else {
            // Refused at start; the command reply carried the reason.
            continue;
        };
        let mut out = Response::new();
        let _ = match result {
            Ok(()) => write!(out, "OK Stream verified"),
            Err(e) => write!(out, "ERROR {}", e),
        };
        queue_ble_reply(&out);
    }
}

/// Pairing task: one pairing attempt per button press.
#[embassy_executor::task]
async fn pairing_task(
    identity: LocalIdentity,
    mut link: UartLink,
    registry: &'static SharedRegistry<FlashPeerStorage>,
) {
    loop {
        PAIRING_REQUEST.wait().await;

        let result = match board::PAIRING_ROLE {
            PairingRole::Stage => PAIRING.run_stage(&identity, &mut link, &ARBITER).await,
            PairingRole::Pc => PAIRING.run_pc(&identity, &mut link, registry, &ARBITER).await,
        };
        match result {
            Ok(outcome) if outcome.success() => {
                log::info!("Paired with {} ({:04X})", outcome.label(), outcome.device_id())
            }
            Ok(outcome) => log::warn!("Pairing ended: {}", outcome.label()),
            Err(e) => log::warn!("Pairing not started: {}", e),
        }
    }
}

/// PRG button: a press starts pairing, a press during pairing cancels it.
#[embassy_executor::task]
async fn button_task(mut button: Input<'static>) {
    loop {
        button.wait_for_falling_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        if button.is_high() {
            continue;
        }

        if PAIRING.is_active() {
            PAIRING.stop();
        } else {
            PAIRING_REQUEST.signal(());
        }
    }
}
