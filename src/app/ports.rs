//! Port traits — the hexagonal boundary between the OTA engine and the
//! platform.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ OtaEngine (domain)
//! ```
//!
//! Driven adapters (NVS, flash bank, bootloader, HTTP client, telemetry
//! link) implement these traits.  The engine consumes them via generics at
//! call sites, so the domain core never touches hardware directly and the
//! whole update path runs against mocks on the host.

use core::time::Duration;

use crate::config::AgentConfig;
use crate::error::{BootError, FlashError, OtaError, SettingsError, TelemetryError};
use crate::telemetry::object::{AggregateObject, ObjectEntry};

// ───────────────────────────────────────────────────────────────
// Settings port (driven adapter: domain ↔ NVS)
// ───────────────────────────────────────────────────────────────

/// Crash-safe key/value persistence keyed by `(namespace, key)`.
///
/// `save` MUST be atomic at the key level: after a crash either the old or
/// the new value is visible, never a torn write.  The ESP-IDF NVS commit
/// guarantees this natively; the host backend achieves it trivially.
pub trait SettingsPort {
    /// Initialise the backend.  Idempotent; safe to call from the OTA
    /// worker even when the agent already initialised it at boot.
    fn init(&mut self) -> Result<(), SettingsError>;

    /// Write a value atomically.
    fn save(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), SettingsError>;

    /// Enumerate every key under `namespace` and hand `(key, bytes)` to the
    /// visitor.  A `false` return from the visitor stops iteration.
    fn load(
        &mut self,
        namespace: &str,
        visitor: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> Result<(), SettingsError>;

    /// Delete a key.  Deleting a missing key is not an error.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), SettingsError>;
}

// ───────────────────────────────────────────────────────────────
// Flash image bank (driven adapter: domain → inactive slot)
// ───────────────────────────────────────────────────────────────

/// Streaming writer into the secondary (inactive) image bank.
///
/// Writes are strictly sequential; out-of-order writes are not supported.
/// After a successful `erase_secondary → begin → write*(.., last = true)`
/// sequence the bank contains exactly the streamed image and
/// [`bytes_written`](ImageBank::bytes_written) equals its size.
pub trait ImageBank {
    /// Synchronously erase the inactive bank.  Can take seconds.
    fn erase_secondary(&mut self) -> Result<(), FlashError>;

    /// Prepare a streaming writer at bank start.
    fn begin(&mut self) -> Result<(), FlashError>;

    /// Append `buf`; when `last` is true, flush any buffered tail.
    fn write(&mut self, buf: &[u8], last: bool) -> Result<(), FlashError>;

    /// Cumulative byte count successfully written in this session.
    fn bytes_written(&self) -> usize;
}

// ───────────────────────────────────────────────────────────────
// Bootloader (driven adapter: domain → swap machinery)
// ───────────────────────────────────────────────────────────────

/// Bootloader verdict at boot about the image swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapType {
    /// No swap pending or performed.
    None,
    /// A test swap is pending for the next boot.
    Test,
    /// A permanent swap is pending.
    Perm,
    /// The previous test image failed and was reverted.
    Revert,
    /// The swap machinery itself failed.
    Fail,
}

impl SwapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Test => "test",
            Self::Perm => "perm",
            Self::Revert => "revert",
            Self::Fail => "fail",
        }
    }
}

/// Parsed header of the image sitting in the secondary bank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageHeader {
    pub image_size: u32,
    pub version: heapless::String<16>,
}

/// Thin, synchronous control surface over the bootloader.
///
/// The contract the engine relies on: after a valid image has been written
/// to the secondary bank, [`request_upgrade_test`](Bootloader::request_upgrade_test)
/// makes the bootloader boot it once; unless the new image calls
/// [`confirm_current_image`](Bootloader::confirm_current_image) before the
/// next reboot, the bootloader reverts.  At the boot immediately after a
/// successful OTA, `swap_type()` is `None` and the image is unconfirmed.
pub trait Bootloader {
    fn swap_type(&mut self) -> SwapType;

    fn is_image_confirmed(&mut self) -> Result<bool, BootError>;

    /// Make the currently running image permanent.
    fn confirm_current_image(&mut self) -> Result<(), BootError>;

    /// Read and parse the secondary bank header (sanity check before
    /// requesting the swap).
    fn read_secondary_header(&mut self) -> Result<ImageHeader, BootError>;

    /// Mark the secondary image as test-pending for the next boot.
    fn request_upgrade_test(&mut self) -> Result<(), BootError>;

    /// Warm-reboot the device.  On real hardware this does not return; the
    /// host backend records the request and returns so tests can observe
    /// the state left behind.
    fn reboot_warm(&mut self);
}

// ───────────────────────────────────────────────────────────────
// HTTP chunk downloader (driven adapter: domain ← network)
// ───────────────────────────────────────────────────────────────

/// One piece of the response body handed to the download sink.
#[derive(Debug)]
pub struct DownloadChunk<'a> {
    /// Body bytes of this chunk.
    pub data: &'a [u8],
    /// Byte offset of `data` within the whole body.
    pub offset: usize,
    /// Declared total body size (from Content-Length), identical across
    /// all chunks of one download.
    pub total_size: usize,
    /// True on the final chunk.
    pub last: bool,
}

/// Sink verdict after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAction {
    /// Keep streaming.
    Continue,
    /// Stop cleanly: the downloader unwinds and `download` returns `Ok`.
    /// The caller decides what the early stop means (cancellation).
    Abort,
}

/// Chunked HTTP GET with a sink callback.
///
/// `timeout` bounds the whole operation wall-clock.  Connection, DNS and
/// TLS failures surface as [`OtaError::Network`]; a non-2xx status as
/// [`OtaError::HttpRequest`].  An `Err` from the sink aborts the transfer
/// and is propagated verbatim.
pub trait Downloader {
    fn download(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
        sink: &mut dyn FnMut(&DownloadChunk<'_>) -> Result<ChunkAction, OtaError>,
    ) -> Result<(), OtaError>;
}

// ───────────────────────────────────────────────────────────────
// Telemetry channel (driven adapter: domain ↔ backend)
// ───────────────────────────────────────────────────────────────

/// Outbound half of the telemetry device client: stream one aggregate
/// object.  Shared read-only across tasks after creation; implementations
/// serialise access internally.
pub trait TelemetryLink: Send + Sync {
    fn stream_aggregate(
        &self,
        interface: &str,
        path: &str,
        entries: &[ObjectEntry],
        timestamp: i64,
    ) -> Result<(), TelemetryError>;
}

/// An inbound message delivered by the device client's poll loop.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// An aggregate object arrived on `interface`.
    Object {
        interface: String,
        object: AggregateObject,
    },
}

/// Inbound half of the telemetry device client.
///
/// The agent polls this at a fixed cadence; handlers for returned messages
/// must be quick (the OTA dispatch path only spawns a worker).
pub trait TelemetryDevice {
    fn connect(&mut self) -> Result<(), TelemetryError>;

    fn poll(&mut self) -> Result<Option<InboundMessage>, TelemetryError>;
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Loads and persists the agent configuration.
///
/// Implementations MUST validate before persisting; invalid values are
/// rejected, not clamped (see `config::validate_config`).
pub trait ConfigPort {
    /// Load configuration, falling back to defaults when nothing is stored.
    fn load(&self) -> Result<AgentConfig, SettingsError>;

    /// Validate and persist configuration.
    fn save(&self, config: &AgentConfig) -> Result<(), SettingsError>;
}

// ───────────────────────────────────────────────────────────────
// Time source
// ───────────────────────────────────────────────────────────────

/// Wall-clock source for event timestamps.
pub trait TimeSource: Send + Sync {
    /// Seconds since the Unix epoch.
    fn epoch_secs(&self) -> i64;
}
