//! Mock port implementations for integration tests.
//!
//! Every mock shares its state behind an `Arc`, so the copy moved into
//! the OTA worker and the handle kept by the test observe the same world
//! — the same way the NVS adapter's clones share one store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outpost::app::ports::{
    Bootloader, ChunkAction, DownloadChunk, Downloader, ImageBank, ImageHeader, SettingsPort,
    SwapType, TelemetryLink, TimeSource,
};
use outpost::error::{BootError, FlashError, OtaError, SettingsError, TelemetryError};
use outpost::telemetry::object::{ObjectEntry, ObjectValue};

// ── Clock ─────────────────────────────────────────────────────

pub struct FixedClock(pub i64);

impl TimeSource for FixedClock {
    fn epoch_secs(&self) -> i64 {
        self.0
    }
}

// ── Settings ──────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MockSettings {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_init: Arc<AtomicBool>,
}

impl MockSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }
}

impl SettingsPort for MockSettings {
    fn init(&mut self) -> Result<(), SettingsError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(SettingsError::Init);
        }
        Ok(())
    }

    fn save(&mut self, ns: &str, key: &str, value: &[u8]) -> Result<(), SettingsError> {
        self.store
            .lock()
            .unwrap()
            .insert(format!("{ns}/{key}"), value.to_vec());
        Ok(())
    }

    fn load(
        &mut self,
        ns: &str,
        visitor: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> Result<(), SettingsError> {
        let prefix = format!("{ns}/");
        for (k, v) in self.store.lock().unwrap().iter() {
            if let Some(key) = k.strip_prefix(&prefix) {
                if !visitor(key, v) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, ns: &str, key: &str) -> Result<(), SettingsError> {
        self.store.lock().unwrap().remove(&format!("{ns}/{key}"));
        Ok(())
    }
}

// ── Image bank ────────────────────────────────────────────────

#[derive(Default)]
struct BankState {
    erase_count: u32,
    writer_open: bool,
    data: Vec<u8>,
    fail_erase: bool,
    fail_begin: bool,
    fail_write: bool,
}

#[derive(Clone, Default)]
pub struct MockBank {
    state: Arc<Mutex<BankState>>,
}

impl MockBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn erase_count(&self) -> u32 {
        self.state.lock().unwrap().erase_count
    }

    pub fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }

    pub fn fail_erase(&self, fail: bool) {
        self.state.lock().unwrap().fail_erase = fail;
    }

    #[allow(dead_code)]
    pub fn fail_write(&self, fail: bool) {
        self.state.lock().unwrap().fail_write = fail;
    }
}

impl ImageBank for MockBank {
    fn erase_secondary(&mut self) -> Result<(), FlashError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_erase {
            return Err(FlashError::EraseSecondSlot);
        }
        s.erase_count += 1;
        s.writer_open = false;
        s.data.clear();
        Ok(())
    }

    fn begin(&mut self) -> Result<(), FlashError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_begin {
            return Err(FlashError::Init);
        }
        s.writer_open = true;
        s.data.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8], last: bool) -> Result<(), FlashError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_write || !s.writer_open {
            return Err(FlashError::Write);
        }
        s.data.extend_from_slice(buf);
        if last {
            s.writer_open = false;
        }
        Ok(())
    }

    fn bytes_written(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }
}

// ── Bootloader ────────────────────────────────────────────────

struct BootState {
    swap: SwapType,
    confirmed: bool,
    header: Option<ImageHeader>,
    confirm_calls: u32,
    upgrade_requested: bool,
    reboot_requested: bool,
    fail_upgrade: bool,
}

impl Default for BootState {
    fn default() -> Self {
        Self {
            swap: SwapType::None,
            confirmed: false,
            header: Some(ImageHeader::default()),
            confirm_calls: 0,
            upgrade_requested: false,
            reboot_requested: false,
            fail_upgrade: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct MockBoot {
    state: Arc<Mutex<BootState>>,
}

impl MockBoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_swap_type(&self, swap: SwapType) {
        self.state.lock().unwrap().swap = swap;
    }

    pub fn script_confirmed(&self, confirmed: bool) {
        self.state.lock().unwrap().confirmed = confirmed;
    }

    #[allow(dead_code)]
    pub fn script_header(&self, header: Option<ImageHeader>) {
        self.state.lock().unwrap().header = header;
    }

    #[allow(dead_code)]
    pub fn fail_upgrade(&self, fail: bool) {
        self.state.lock().unwrap().fail_upgrade = fail;
    }

    pub fn confirm_calls(&self) -> u32 {
        self.state.lock().unwrap().confirm_calls
    }

    pub fn upgrade_requested(&self) -> bool {
        self.state.lock().unwrap().upgrade_requested
    }

    pub fn reboot_requested(&self) -> bool {
        self.state.lock().unwrap().reboot_requested
    }
}

impl Bootloader for MockBoot {
    fn swap_type(&mut self) -> SwapType {
        self.state.lock().unwrap().swap
    }

    fn is_image_confirmed(&mut self) -> Result<bool, BootError> {
        Ok(self.state.lock().unwrap().confirmed)
    }

    fn confirm_current_image(&mut self) -> Result<(), BootError> {
        let mut s = self.state.lock().unwrap();
        s.confirm_calls += 1;
        s.confirmed = true;
        Ok(())
    }

    fn read_secondary_header(&mut self) -> Result<ImageHeader, BootError> {
        self.state
            .lock()
            .unwrap()
            .header
            .clone()
            .ok_or(BootError::InvalidImage)
    }

    fn request_upgrade_test(&mut self) -> Result<(), BootError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_upgrade {
            return Err(BootError::Upgrade);
        }
        s.upgrade_requested = true;
        Ok(())
    }

    fn reboot_warm(&mut self) {
        self.state.lock().unwrap().reboot_requested = true;
    }
}

// ── Downloader ────────────────────────────────────────────────

/// Behavior of one download attempt.
pub enum DownloadScript {
    /// Deliver `total` bytes in `chunk`-sized pieces, then succeed.
    Succeed { total: usize, chunk: usize },
    /// Fail immediately (connection refused).
    Refuse,
}

type ChunkHook = Box<dyn FnMut(usize) + Send>;

/// Downloader that plays one script entry per attempt and optionally
/// calls a hook after each delivered chunk (to inject concurrent
/// commands at a precise point in the transfer).
pub struct ScriptedDownloader {
    scripts: VecDeque<DownloadScript>,
    hook: Option<ChunkHook>,
}

impl ScriptedDownloader {
    pub fn new(scripts: Vec<DownloadScript>) -> Self {
        Self {
            scripts: scripts.into(),
            hook: None,
        }
    }

    pub fn with_chunk_hook(mut self, hook: ChunkHook) -> Self {
        self.hook = Some(hook);
        self
    }
}

impl Downloader for ScriptedDownloader {
    fn download(
        &mut self,
        _url: &str,
        _headers: &[(&str, &str)],
        _timeout: Duration,
        sink: &mut dyn FnMut(&DownloadChunk<'_>) -> Result<ChunkAction, OtaError>,
    ) -> Result<(), OtaError> {
        match self.scripts.pop_front() {
            None | Some(DownloadScript::Refuse) => Err(OtaError::Network),
            Some(DownloadScript::Succeed { total, chunk }) => {
                let body = vec![0xA5u8; total];
                let mut offset = 0;
                let mut index = 0;
                while offset < total {
                    let len = chunk.min(total - offset);
                    let last = offset + len == total;
                    let action = sink(&DownloadChunk {
                        data: &body[offset..offset + len],
                        offset,
                        total_size: total,
                        last,
                    })?;
                    offset += len;
                    if let Some(hook) = self.hook.as_mut() {
                        hook(index);
                    }
                    index += 1;
                    if action == ChunkAction::Abort {
                        return Ok(());
                    }
                }
                Ok(())
            }
        }
    }
}

// ── Telemetry link ────────────────────────────────────────────

/// One event as seen on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub uuid: String,
    pub status: String,
    pub progress: i32,
    pub code: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Clone, Default)]
pub struct RecordingLink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(status, progress, code)` triples for one request uuid.
    pub fn trace_for(&self, uuid: &str) -> Vec<(String, i32, String)> {
        self.all()
            .into_iter()
            .filter(|e| e.uuid == uuid)
            .map(|e| (e.status, e.progress, e.code))
            .collect()
    }
}

impl TelemetryLink for RecordingLink {
    fn stream_aggregate(
        &self,
        _interface: &str,
        _path: &str,
        entries: &[ObjectEntry],
        timestamp: i64,
    ) -> Result<(), TelemetryError> {
        let mut event = RecordedEvent {
            uuid: String::new(),
            status: String::new(),
            progress: 0,
            code: String::new(),
            message: String::new(),
            timestamp,
        };
        for entry in entries {
            match (entry.path.as_str(), &entry.value) {
                ("requestUUID", ObjectValue::String(s)) => event.uuid = s.clone(),
                ("status", ObjectValue::String(s)) => event.status = s.clone(),
                ("statusProgress", ObjectValue::Integer(i)) => event.progress = *i,
                ("statusCode", ObjectValue::String(s)) => event.code = s.clone(),
                ("message", ObjectValue::String(s)) => event.message = s.clone(),
                _ => {}
            }
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

// ── Assertion helpers ─────────────────────────────────────────

/// `Downloading` progress within one attempt must be non-decreasing, in
/// steps of 10, within 0..=100.
pub fn assert_progress_invariant(trace: &[(String, i32, String)]) {
    let mut last = -1;
    for (status, progress, _) in trace {
        match status.as_str() {
            "Downloading" => {
                assert!(
                    (0..=100).contains(progress),
                    "progress {progress} out of range"
                );
                assert_eq!(progress % 10, 0, "progress {progress} not a step of 10");
                if *progress == 0 {
                    // A new attempt restarts the scale.
                    last = 0;
                } else {
                    assert!(
                        *progress >= last,
                        "progress went backwards: {last} -> {progress}"
                    );
                    last = *progress;
                }
            }
            "Error" => last = -1,
            _ => {}
        }
    }
}
