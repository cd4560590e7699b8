//! OTA state machine — the core of the agent.
//!
//! Owns the single run token, the on-demand worker thread, the bounded
//! retry loop, cooperative cancellation, the reboot decision, and the
//! boot-time reconciliation that decides the fate of an update that was in
//! flight across the last reboot.
//!
//! Persistent state lives in the settings namespace `ota`:
//!
//! | key      | bytes | meaning                                    |
//! |----------|-------|--------------------------------------------|
//! | `state`  | 1     | `IDLE=1`, `IN_PROGRESS=2`, `REBOOT=3`      |
//! | `req_id` | 37    | in-flight uuid (36 chars + NUL), iff active|
//!
//! The persisted state only ever moves `IDLE → IN_PROGRESS → REBOOT →
//! IDLE` (reconciliation) or `IDLE → IN_PROGRESS → IDLE` (failure or
//! cancel without reboot), and `state = REBOOT` is flushed before any
//! bootloader-mutating call.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::config::AgentConfig;
use crate::drivers::task_pin::{self, Core};
use crate::error::{OtaError, SettingsError};
use crate::telemetry::publisher::EventPublisher;

use super::commands::{OtaCommand, OtaRequest, UUID_STR_LEN};
use super::events::OtaStatus;
use super::ports::{
    Bootloader, ChunkAction, DownloadChunk, Downloader, ImageBank, SettingsPort, SwapType,
};

/// Settings namespace holding the persistent OTA record.
pub const OTA_NAMESPACE: &str = "ota";
/// 1-byte persisted machine state.
pub const STATE_KEY: &str = "state";
/// 37-byte persisted request uuid (36 chars + NUL).
pub const REQUEST_ID_KEY: &str = "req_id";

/// Progress events are emitted in steps of 10 percent.
const PROGRESS_STEP: i32 = 10;

const WORKER_THREAD_NAME: &str = "ota-worker\0";
const WORKER_STACK_KB: usize = 16;
const WORKER_PRIORITY: u8 = 20;

// ───────────────────────────────────────────────────────────────
// Persisted record
// ───────────────────────────────────────────────────────────────

/// Persisted OTA machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PersistState {
    Idle = 1,
    InProgress = 2,
    Reboot = 3,
}

impl PersistState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Idle),
            2 => Some(Self::InProgress),
            3 => Some(Self::Reboot),
            _ => None,
        }
    }
}

/// The OTA record as loaded from settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OtaRecord {
    /// Persisted state, if a valid byte was stored.
    pub state: Option<PersistState>,
    /// In-flight request uuid, present only when it decodes to exactly
    /// 36 characters.  Anything else reads as "no pending OTA".
    pub uuid: Option<String>,
}

/// Enumerate the `ota` namespace into an [`OtaRecord`].
pub fn load_record<S: SettingsPort + ?Sized>(settings: &mut S) -> Result<OtaRecord, SettingsError> {
    let mut state_raw: Option<u8> = None;
    let mut uuid_raw: Option<Vec<u8>> = None;

    settings.load(OTA_NAMESPACE, &mut |key, value| {
        match key {
            STATE_KEY => state_raw = value.first().copied(),
            REQUEST_ID_KEY => uuid_raw = Some(value.to_vec()),
            _ => {}
        }
        true
    })?;

    let uuid = uuid_raw.and_then(|mut bytes| {
        // Stored with a trailing NUL for layout compatibility.
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        match String::from_utf8(bytes) {
            Ok(s) if s.len() == UUID_STR_LEN => Some(s),
            _ => None,
        }
    });

    Ok(OtaRecord {
        state: state_raw.and_then(PersistState::from_u8),
        uuid,
    })
}

fn save_state<S: SettingsPort + ?Sized>(
    settings: &mut S,
    state: PersistState,
) -> Result<(), SettingsError> {
    settings.save(OTA_NAMESPACE, STATE_KEY, &[state as u8])
}

fn save_request_id<S: SettingsPort + ?Sized>(
    settings: &mut S,
    uuid: &str,
) -> Result<(), SettingsError> {
    let mut buf = Vec::with_capacity(uuid.len() + 1);
    buf.extend_from_slice(uuid.as_bytes());
    buf.push(0);
    settings.save(OTA_NAMESPACE, REQUEST_ID_KEY, &buf)
}

/// Delete `req_id` and persist `state = IDLE`.  Best effort: failures are
/// logged, not propagated, because every caller is already on a terminal
/// path.
fn clear_record<S: SettingsPort + ?Sized>(settings: &mut S) {
    if let Err(e) = settings.delete(OTA_NAMESPACE, REQUEST_ID_KEY) {
        warn!("OTA: unable to delete req_id: {}", e);
    }
    if let Err(e) = save_state(settings, PersistState::Idle) {
        warn!("OTA: unable to persist idle state: {}", e);
    }
}

// ───────────────────────────────────────────────────────────────
// Run token
// ───────────────────────────────────────────────────────────────

/// The run-bit as a typed token.
///
/// Single source of truth for "an update is in progress", and the sole
/// cancellation primitive.  Admission is an atomic test-and-set; `cancel`
/// clears the bit and the worker observes that at every suspension point.
#[derive(Clone, Default)]
pub struct RunToken {
    bit: Arc<AtomicBool>,
}

impl RunToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the token.  Returns `false` if a worker already
    /// holds it.
    pub fn try_start(&self) -> bool {
        self.bit
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Request cancellation (or mark completion).  Returns `true` if the
    /// bit was actually set.
    pub fn clear(&self) -> bool {
        self.bit.swap(false, Ordering::AcqRel)
    }

    pub fn is_running(&self) -> bool {
        self.bit.load(Ordering::Acquire)
    }
}

// ───────────────────────────────────────────────────────────────
// Download progress
// ───────────────────────────────────────────────────────────────

/// Tracks declared image size and the last percent step reported, so the
/// event stream carries at most eleven `Downloading` events per attempt.
#[derive(Debug, Default)]
struct Progress {
    image_size: usize,
    downloaded: usize,
    last_percent: i32,
}

impl Progress {
    /// Record a chunk; returns the new rounded percentage when it crossed
    /// a 10-percent step.
    fn on_chunk(&mut self, total_size: usize, bytes_written: usize) -> Option<i32> {
        self.image_size = total_size;
        self.downloaded = bytes_written;
        if total_size == 0 {
            return None;
        }
        let percent = (100 * bytes_written / total_size) as i32;
        let rounded = percent - percent % PROGRESS_STEP;
        if rounded != self.last_percent {
            self.last_percent = rounded;
            Some(rounded)
        } else {
            None
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Engine
// ───────────────────────────────────────────────────────────────

/// Timing and retry parameters, extracted from [`AgentConfig`] so tests
/// can inject short delays.
#[derive(Debug, Clone)]
pub struct OtaTimings {
    pub request_timeout: Duration,
    pub max_retries: u8,
    pub retry_delay: Duration,
    pub reboot_delay: Duration,
}

impl From<&AgentConfig> for OtaTimings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(cfg.ota_request_timeout_ms as u64),
            max_retries: cfg.ota_max_retries,
            retry_delay: Duration::from_millis(cfg.ota_retry_delay_ms as u64),
            reboot_delay: Duration::from_millis(cfg.ota_reboot_delay_ms as u64),
        }
    }
}

/// Port bundle an update worker takes ownership of.
///
/// Adapters are cheap handles; a fresh bundle is built per dispatched
/// command, which keeps the engine free of platform state.
pub struct WorkerPorts<S, B, L, H> {
    pub settings: S,
    pub bank: B,
    pub boot: L,
    pub http: H,
}

/// The OTA engine.  One per agent; shared across the telemetry task and
/// the boot-time reconciliation by `Arc`.
pub struct OtaEngine {
    timings: OtaTimings,
    run: RunToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Note recorded by a cancel whose uuid differed from the in-flight
    /// one; appended to the terminal event message.
    cancel_note: Arc<Mutex<Option<String>>>,
}

impl OtaEngine {
    pub fn new(timings: OtaTimings) -> Self {
        Self {
            timings,
            run: RunToken::new(),
            worker: Mutex::new(None),
            cancel_note: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether an update worker currently holds the run token.
    pub fn is_busy(&self) -> bool {
        self.run.is_running()
    }

    /// Join the most recent worker thread, if any.  Used by tests and by
    /// orderly shutdown; returns immediately when no worker ran.
    pub fn wait_for_worker(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Dispatch one inbound `OTARequest` aggregate.
    ///
    /// Malformed requests without a usable uuid are rejected silently
    /// (logged only); an unknown operation is echoed back to the backend
    /// as `Failure/InvalidRequest`.
    pub fn handle_object_event<S, B, L, H>(
        &self,
        object: &crate::telemetry::object::AggregateObject,
        ports: WorkerPorts<S, B, L, H>,
        publisher: &EventPublisher,
    ) -> crate::error::Result<()>
    where
        S: SettingsPort + Send + 'static,
        B: ImageBank + Send + 'static,
        L: Bootloader + Send + 'static,
        H: Downloader + Send + 'static,
    {
        match OtaCommand::from_object(object) {
            Ok(OtaCommand::Update(req)) => self.handle_update(req, ports, publisher),
            Ok(OtaCommand::Cancel { uuid }) => {
                let WorkerPorts { mut settings, .. } = ports;
                self.handle_cancel(&uuid, &mut settings, publisher)
            }
            Err(e) => {
                // An unknown operation still carries a usable uuid; echo
                // the rejection so the backend can close its request.
                if let (Some(uuid), Some(op)) = (
                    object.string_field("uuid"),
                    object.string_field("operation"),
                ) {
                    if op != "Update" && op != "Cancel" {
                        publisher.publish(
                            uuid,
                            OtaStatus::Failure,
                            0,
                            Some(OtaError::InvalidRequest),
                            "",
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Admit an update and spawn its worker.
    pub fn handle_update<S, B, L, H>(
        &self,
        req: OtaRequest,
        ports: WorkerPorts<S, B, L, H>,
        publisher: &EventPublisher,
    ) -> crate::error::Result<()>
    where
        S: SettingsPort + Send + 'static,
        B: ImageBank + Send + 'static,
        L: Bootloader + Send + 'static,
        H: Downloader + Send + 'static,
    {
        if !self.run.try_start() {
            publisher.publish(
                &req.uuid,
                OtaStatus::Failure,
                0,
                Some(OtaError::AlreadyInProgress),
                "",
            );
            return Err(OtaError::AlreadyInProgress);
        }

        *self.cancel_note.lock().unwrap() = None;

        // A free token means the previous worker is done — or still
        // unwinding after a cancel.  Join it so its terminal record
        // cleanup cannot interleave with the new worker's writes.
        if let Some(old) = self.worker.lock().unwrap().take() {
            let _ = old.join();
        }

        let worker = OtaWorker {
            req: req.clone(),
            run: self.run.clone(),
            timings: self.timings.clone(),
            settings: ports.settings,
            bank: ports.bank,
            boot: ports.boot,
            http: ports.http,
            publisher: publisher.clone(),
            progress: Progress::default(),
            cancel_note: Arc::clone(&self.cancel_note),
        };

        match task_pin::spawn_on_core(
            Core::Pro,
            WORKER_PRIORITY,
            WORKER_STACK_KB,
            WORKER_THREAD_NAME,
            move || worker.run(),
        ) {
            Ok(handle) => {
                *self.worker.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!("OTA worker thread creation failed: {}", e);
                publisher.publish(
                    &req.uuid,
                    OtaStatus::Failure,
                    0,
                    Some(OtaError::ThreadCreate),
                    "",
                );
                self.run.clear();
                Err(OtaError::ThreadCreate)
            }
        }
    }

    /// Cancel whatever update is currently running.
    ///
    /// The uuid in the command is echoed in the rejection events but is
    /// not required to match the in-flight uuid; a mismatch is surfaced in
    /// the terminal event message instead of being silently redirected.
    pub fn handle_cancel<S: SettingsPort + ?Sized>(
        &self,
        uuid: &str,
        settings: &mut S,
        publisher: &EventPublisher,
    ) -> crate::error::Result<()> {
        if !self.run.is_running() {
            publisher.publish(
                uuid,
                OtaStatus::Failure,
                0,
                Some(OtaError::InvalidRequest),
                "Unable to cancel OTA update request, no OTA update running.",
            );
            return Err(OtaError::InvalidRequest);
        }

        if settings.init().is_err() {
            publisher.publish(
                uuid,
                OtaStatus::Failure,
                0,
                Some(OtaError::Internal),
                "Unable to cancel OTA update request, settings init error.",
            );
            return Err(OtaError::Internal);
        }

        let record = match load_record(settings) {
            Ok(record) => record,
            Err(e) => {
                warn!("OTA cancel: settings load failed: {}", e);
                publisher.publish(
                    uuid,
                    OtaStatus::Failure,
                    0,
                    Some(OtaError::Internal),
                    "Unable to cancel OTA update request, settings load error.",
                );
                return Err(OtaError::Internal);
            }
        };

        let Some(running_uuid) = record.uuid else {
            publisher.publish(
                uuid,
                OtaStatus::Failure,
                0,
                Some(OtaError::Internal),
                "Unable to cancel OTA update request, no request id in settings.",
            );
            return Err(OtaError::Internal);
        };

        if running_uuid != uuid {
            let note = format!(
                "cancel uuid {} does not match in-flight update {}",
                uuid, running_uuid
            );
            warn!("OTA cancel: {}", note);
            *self.cancel_note.lock().unwrap() = Some(note);
        }

        if !self.run.clear() {
            warn!("OTA run token was already cleared");
        }
        info!("OTA cancel requested for {}", running_uuid);
        Ok(())
    }

    /// Boot-time reconciliation.  Runs once at agent start, before the
    /// command loop; decides the fate of an update that rebooted the
    /// device.
    pub fn reconcile_boot<S, L>(&self, settings: &mut S, boot: &mut L, publisher: &EventPublisher)
    where
        S: SettingsPort + ?Sized,
        L: Bootloader + ?Sized,
    {
        if let Err(e) = settings.init() {
            warn!("OTA reconcile: settings init failed: {}", e);
            return;
        }

        let record = match load_record(settings) {
            Ok(record) => record,
            Err(e) => {
                warn!("OTA reconcile: settings load failed: {}", e);
                return;
            }
        };

        let Some(uuid) = record.uuid else {
            info!("No OTA update request uuid found in settings");
            clear_record(settings);
            return;
        };

        if record.state != Some(PersistState::Reboot) {
            // The previous run crashed mid-update.
            warn!("OTA reconcile: persisted state is not REBOOT");
            publisher.publish(&uuid, OtaStatus::Failure, 0, Some(OtaError::Internal), "");
            clear_record(settings);
            return;
        }

        let swap = boot.swap_type();
        if swap != SwapType::None {
            warn!("OTA reconcile: unexpected swap type '{}'", swap.as_str());
            let code = if swap == SwapType::Revert {
                OtaError::SystemRollback
            } else {
                OtaError::SwapFail
            };
            publisher.publish(&uuid, OtaStatus::Failure, 0, Some(code), "");
            clear_record(settings);
            return;
        }

        match boot.is_image_confirmed() {
            Ok(false) => {}
            Ok(true) => {
                // A confirmed image means we are not running the freshly
                // swapped one.
                warn!("OTA reconcile: image already confirmed");
                publisher.publish(&uuid, OtaStatus::Failure, 0, Some(OtaError::SwapFail), "");
                clear_record(settings);
                return;
            }
            Err(e) => {
                warn!("OTA reconcile: confirm query failed: {}", e);
                publisher.publish(&uuid, OtaStatus::Failure, 0, Some(OtaError::Internal), "");
                clear_record(settings);
                return;
            }
        }

        if let Err(e) = boot.confirm_current_image() {
            warn!("OTA reconcile: couldn't confirm this image: {}", e);
            publisher.publish(&uuid, OtaStatus::Failure, 0, Some(OtaError::Internal), "");
            clear_record(settings);
            return;
        }

        info!("Marked image as OK");
        publisher.publish(&uuid, OtaStatus::Success, 0, None, "");
        clear_record(settings);
    }
}

// ───────────────────────────────────────────────────────────────
// Worker
// ───────────────────────────────────────────────────────────────

struct OtaWorker<S, B, L, H> {
    req: OtaRequest,
    run: RunToken,
    timings: OtaTimings,
    settings: S,
    bank: B,
    boot: L,
    http: H,
    publisher: EventPublisher,
    progress: Progress,
    cancel_note: Arc<Mutex<Option<String>>>,
}

impl<S, B, L, H> OtaWorker<S, B, L, H>
where
    S: SettingsPort,
    B: ImageBank,
    L: Bootloader,
    H: Downloader,
{
    fn run(mut self) {
        let uuid = self.req.uuid.clone();

        // Acknowledge the request; download starts next.
        self.publisher
            .publish(&uuid, OtaStatus::Acknowledged, 0, None, "");

        info!("OTA init for {}", uuid);
        if let Err(e) = self.settings.init() {
            warn!("OTA failed: settings init: {}", e);
            self.publisher
                .publish(&uuid, OtaStatus::Failure, 0, Some(e.into()), "");
            self.self_destruct();
            return;
        }

        info!("OTA download and deploy");
        if let Err(e) = save_state(&mut self.settings, PersistState::InProgress) {
            warn!("OTA: unable to persist in-progress state: {}", e);
        }

        match self.perform_ota() {
            Ok(()) => {
                self.publisher
                    .publish(&uuid, OtaStatus::Deploying, 0, None, "");
                info!("OTA prepare reboot");

                // Flushed before any bootloader-mutating call so the
                // reconciler can tell a completed deploy from a crash.
                if let Err(e) = save_state(&mut self.settings, PersistState::Reboot) {
                    warn!("OTA: unable to persist reboot state: {}", e);
                }

                let header = match self.boot.read_secondary_header() {
                    Ok(header) => header,
                    Err(e) => {
                        warn!("Failed to read secondary bank header: {}", e);
                        self.publisher
                            .publish(&uuid, OtaStatus::Failure, 0, Some(e.into()), "");
                        self.self_destruct();
                        return;
                    }
                };
                debug!(
                    "Secondary bank image: {} bytes, version {}",
                    header.image_size, header.version
                );

                if let Err(e) = self.boot.request_upgrade_test() {
                    warn!("Failed to mark secondary image as pending: {}", e);
                    self.publisher
                        .publish(&uuid, OtaStatus::Failure, 0, Some(e.into()), "");
                    self.self_destruct();
                    return;
                }

                self.publisher
                    .publish(&uuid, OtaStatus::Deployed, 0, None, "");
                self.publisher
                    .publish(&uuid, OtaStatus::Rebooting, 0, None, "");
                info!(
                    "Device restart in {} ms",
                    self.timings.reboot_delay.as_millis()
                );
                std::thread::sleep(self.timings.reboot_delay);
                info!("Device restart now");
                self.boot.reboot_warm();
                // Unreachable on hardware.  Host backends return so tests
                // can observe the persisted REBOOT state; no cleanup.
            }
            Err(code) => {
                warn!("OTA failed: {}", code);
                let note = if code == OtaError::Canceled {
                    self.cancel_note.lock().unwrap().take().unwrap_or_default()
                } else {
                    String::new()
                };
                self.publisher
                    .publish(&uuid, OtaStatus::Failure, 0, Some(code), &note);
                self.self_destruct();
            }
        }
    }

    /// Persist the request id, then run the bounded attempt loop.
    fn perform_ota(&mut self) -> Result<(), OtaError> {
        save_request_id(&mut self.settings, &self.req.uuid)?;

        let mut result = Err(OtaError::Network);
        for attempt in 0..self.timings.max_retries {
            if !self.run.is_running() {
                return Err(OtaError::Canceled);
            }

            self.publisher
                .publish(&self.req.uuid, OtaStatus::Downloading, 0, None, "");

            result = self.perform_attempt();
            match result {
                Ok(()) => return Ok(()),
                Err(OtaError::Canceled) => return Err(OtaError::Canceled),
                Err(code) => {
                    // Linear back-off: the total wait across five attempts
                    // stays bounded at ~20 s.
                    std::thread::sleep(self.timings.retry_delay * attempt as u32);
                    if !self.run.is_running() {
                        return Err(OtaError::Canceled);
                    }
                    self.publisher
                        .publish(&self.req.uuid, OtaStatus::Error, 0, Some(code), "");
                    warn!("OTA attempt #{} failed: {}", attempt, code);
                }
            }
        }
        result
    }

    /// One download attempt: erase, stream into the bank, verify size.
    fn perform_attempt(&mut self) -> Result<(), OtaError> {
        self.bank.erase_secondary().map_err(OtaError::from)?;
        // Erase can take seconds; recheck before opening the socket.
        if !self.run.is_running() {
            return Err(OtaError::Canceled);
        }
        self.bank.begin().map_err(OtaError::from)?;

        let Self {
            req,
            run,
            timings,
            bank,
            http,
            publisher,
            progress,
            ..
        } = self;

        let mut sink = |chunk: &DownloadChunk<'_>| -> Result<ChunkAction, OtaError> {
            if !run.is_running() {
                return Ok(ChunkAction::Abort);
            }

            bank.write(chunk.data, chunk.last).map_err(|e| {
                warn!("Flash write error: {}", e);
                OtaError::from(e)
            })?;

            if let Some(percent) =
                progress.on_chunk(chunk.total_size, bank.bytes_written())
            {
                publisher.publish(&req.uuid, OtaStatus::Downloading, percent, None, "");
                debug!(
                    "Downloading {}% ({}/{} bytes)",
                    percent, progress.downloaded, progress.image_size
                );
            }

            Ok(ChunkAction::Continue)
        };

        let download_result = http.download(
            &req.download_url,
            &[],
            timings.request_timeout,
            &mut sink,
        );

        if !run.is_running() {
            debug!("OTA canceled");
            return Err(OtaError::Canceled);
        }
        download_result?;

        let downloaded = bank.bytes_written();
        if downloaded == 0 || downloaded != progress.image_size {
            return Err(OtaError::Network);
        }

        Ok(())
    }

    /// Terminal cleanup for every non-reboot exit: wipe the persistent
    /// record, then release the run token last so a new update can never
    /// race the settings writes.
    fn self_destruct(&mut self) {
        clear_record(&mut self.settings);
        self.run.clear();
    }
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
