//! Outpost agent — main entry point.
//!
//! Brings up the fixed task set and the telemetry/agent rendezvous:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ main supervisor                                              │
//! │   ├─ telemetry task   poll device client (~100 ms), dispatch │
//! │   │                   inbound OTA commands to the engine     │
//! │   ├─ agent task       boot reconciliation, then periodic     │
//! │   │                   tick (~500 ms) + runtime metrics       │
//! │   ├─ bus drain task   react to mirrored OTA milestones       │
//! │   └─ (on demand)      OTA worker, spawned by the engine      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Startup is a four-flag rendezvous: the agent needs the telemetry
//! handle to exist before it is created, must not publish before the
//! channel is connected, and the telemetry task must not dispatch
//! commands before boot reconciliation has run — the reconciler and the
//! OTA engine share the settings store and never run concurrently.

#![deny(unused_must_use)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};

use outpost::adapters::boot::BootCtl;
use outpost::adapters::flash::OtaBank;
use outpost::adapters::http::HttpDownloader;
use outpost::adapters::link::{LogTelemetryLink, NullTelemetryDevice};
use outpost::adapters::nvs::NvsStore;
use outpost::adapters::time::SystemClock;
use outpost::app::events::OtaStatus;
use outpost::app::ota::{OtaEngine, OtaTimings, WorkerPorts};
use outpost::app::ports::{ConfigPort, InboundMessage, TelemetryDevice};
use outpost::config::AgentConfig;
use outpost::diagnostics::RuntimeMetrics;
use outpost::drivers::task_pin::{spawn_on_core, Core};
use outpost::error::OtaError;
use outpost::telemetry::publisher::EventPublisher;
use outpost::telemetry::OTA_REQUEST_INTERFACE;

// ── Startup rendezvous ────────────────────────────────────────

const FLAG_TELEMETRY_CREATED: u32 = 1 << 0;
const FLAG_AGENT_CREATED: u32 = 1 << 1;
const FLAG_TELEMETRY_CONNECTED: u32 = 1 << 2;
const FLAG_AGENT_STARTED: u32 = 1 << 3;

static STARTUP_FLAGS: AtomicU32 = AtomicU32::new(0);

const FLAG_POLL: Duration = Duration::from_millis(100);

fn set_flag(flag: u32) {
    STARTUP_FLAGS.fetch_or(flag, Ordering::SeqCst);
}

fn wait_flag(flag: u32) {
    while STARTUP_FLAGS.load(Ordering::SeqCst) & flag == 0 {
        std::thread::sleep(FLAG_POLL);
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    init_platform();

    info!("Outpost agent v{}", env!("CARGO_PKG_VERSION"));

    // ── Settings + configuration ──────────────────────────────
    // Settings are load-bearing for the OTA contract (crash-safe record);
    // an agent that cannot persist must not pretend otherwise.
    let nvs =
        NvsStore::new().map_err(|e| anyhow::anyhow!("settings store unavailable: {e}"))?;
    let config = match ConfigPort::load(&nvs) {
        Ok(cfg) => {
            info!("Config loaded");
            cfg
        }
        Err(e) => {
            warn!("Config load failed ({}), using defaults", e);
            AgentConfig::default()
        }
    };

    // ── Shared handles ────────────────────────────────────────
    let clock = Arc::new(SystemClock::new());
    let publisher = EventPublisher::new(Arc::new(LogTelemetryLink::new()), clock.clone());
    let engine = Arc::new(OtaEngine::new(OtaTimings::from(&config)));

    // ── Telemetry device task ─────────────────────────────────
    let telemetry_handle = {
        let engine = engine.clone();
        let publisher = publisher.clone();
        let nvs = nvs.clone();
        let poll_interval = Duration::from_millis(config.telemetry_poll_interval_ms as u64);
        spawn_on_core(Core::Pro, 10, 16, "telemetry\0", move || {
            telemetry_task(engine, publisher, nvs, poll_interval)
        })?
    };

    // ── Agent task ────────────────────────────────────────────
    let agent_handle = {
        let engine = engine.clone();
        let publisher = publisher.clone();
        let nvs = nvs.clone();
        let config = config.clone();
        let clock = clock.clone();
        spawn_on_core(Core::App, 10, 16, "agent\0", move || {
            agent_task(engine, publisher, nvs, config, clock)
        })?
    };

    // ── Local bus drain task ──────────────────────────────────
    #[cfg(feature = "local-bus")]
    let _bus_handle = spawn_on_core(Core::App, 5, 8, "ota-bus\0", bus_task)?;

    // The supervisor's work is done; the device tasks run forever.
    let _ = telemetry_handle.join();
    let _ = agent_handle.join();
    Ok(())
}

#[cfg(target_os = "espidf")]
fn init_platform() {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
}

#[cfg(not(target_os = "espidf"))]
fn init_platform() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

// ── Telemetry device task ─────────────────────────────────────

fn telemetry_task(
    engine: Arc<OtaEngine>,
    publisher: EventPublisher,
    nvs: NvsStore,
    poll_interval: Duration,
) {
    let mut device = NullTelemetryDevice;
    set_flag(FLAG_TELEMETRY_CREATED);

    // The agent needs the device handle before we connect.
    wait_flag(FLAG_AGENT_CREATED);

    if let Err(e) = device.connect() {
        error!("Telemetry device connection failure: {}", e);
        return;
    }
    // Connection callback: unblock agent start.
    set_flag(FLAG_TELEMETRY_CONNECTED);

    // Commands must not reach the engine until boot reconciliation is
    // done; the reconciler and the OTA worker share the settings store.
    wait_flag(FLAG_AGENT_STARTED);

    loop {
        match device.poll() {
            Ok(Some(InboundMessage::Object { interface, object })) => {
                if interface == OTA_REQUEST_INTERFACE {
                    dispatch_ota_object(&engine, &publisher, &nvs, &object);
                } else {
                    info!("Ignoring aggregate on unhandled interface {}", interface);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Telemetry device poll failure: {}", e);
                return;
            }
        }
        std::thread::sleep(poll_interval);
    }
}

/// Build a fresh port bundle and hand one inbound object to the engine.
///
/// Callbacks must return quickly: dispatching only parses the object and
/// (for updates) spawns the worker.
fn dispatch_ota_object(
    engine: &OtaEngine,
    publisher: &EventPublisher,
    nvs: &NvsStore,
    object: &outpost::telemetry::object::AggregateObject,
) {
    let bank = match OtaBank::new() {
        Ok(bank) => bank,
        Err(e) => {
            error!("OTA dispatch: no usable image bank: {}", e);
            if let Some(uuid) = object.string_field("uuid") {
                publisher.publish(uuid, OtaStatus::Failure, 0, Some(OtaError::Internal), "");
            }
            return;
        }
    };

    let ports = WorkerPorts {
        settings: nvs.clone(),
        bank,
        boot: BootCtl::new(),
        http: HttpDownloader::new(),
    };

    if let Err(e) = engine.handle_object_event(object, ports, publisher) {
        warn!("OTA dispatch rejected: {}", e);
    }
}

// ── Agent task ────────────────────────────────────────────────

fn agent_task(
    engine: Arc<OtaEngine>,
    publisher: EventPublisher,
    mut nvs: NvsStore,
    config: AgentConfig,
    clock: Arc<SystemClock>,
) {
    wait_flag(FLAG_TELEMETRY_CREATED);
    set_flag(FLAG_AGENT_CREATED);

    // Do not publish before the channel is up.
    wait_flag(FLAG_TELEMETRY_CONNECTED);

    // Decide the fate of any update that was in flight across the last
    // reboot, before the command loop can admit a new one.
    let mut boot = BootCtl::new();
    engine.reconcile_boot(&mut nvs, &mut boot, &publisher);

    // Unblock command dispatch on the telemetry task.
    set_flag(FLAG_AGENT_STARTED);

    info!("Agent started. Entering periodic loop.");

    let tick = Duration::from_millis(config.agent_tick_interval_ms as u64);
    let mut ticks: u32 = 0;
    loop {
        std::thread::sleep(tick);
        ticks = ticks.wrapping_add(1);

        if ticks % config.metrics_log_period_ticks == 0 {
            RuntimeMetrics::collect(clock.uptime_secs()).log_summary();
        }
    }
}

// ── Local bus drain task ──────────────────────────────────────

#[cfg(feature = "local-bus")]
fn bus_task() {
    use outpost::bus::{self, BusEvent};

    loop {
        bus::drain(|event| match event {
            BusEvent::Init => info!("OTA bus: update acknowledged"),
            BusEvent::PendingReboot => {
                info!("OTA bus: reboot pending");
                // No local veto logic yet; acknowledge so subscribers that
                // gate on confirmation proceed.
                bus::publish(BusEvent::ConfirmReboot);
            }
            BusEvent::ConfirmReboot => info!("OTA bus: reboot confirmed"),
            BusEvent::Success => info!("OTA bus: update succeeded"),
            BusEvent::Failed => warn!("OTA bus: update failed"),
        });
        std::thread::sleep(Duration::from_millis(500));
    }
}
