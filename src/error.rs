//! Unified error types for the Outpost agent.
//!
//! Every subsystem has a small error enum of its own (settings, flash,
//! bootloader, telemetry) that converts into the crate-wide [`OtaError`],
//! keeping the OTA engine's retry loop and the event publisher's
//! status-code mapping uniform.  All variants are `Copy` so they can be
//! threaded through the worker and the publisher without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level agent error
// ---------------------------------------------------------------------------

/// Every fallible operation on the OTA path funnels into this type.
///
/// The event publisher maps each variant to the external `statusCode`
/// string; see `telemetry::publisher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// Malformed inbound command (missing uuid/operation/url).
    InvalidRequest,
    /// An update worker already holds the run token.
    AlreadyInProgress,
    /// HTTP/DNS/TLS failure, timeout, or download size mismatch.
    Network,
    /// The server answered with a non-2xx status.
    HttpRequest,
    /// Settings subsystem failure.
    Settings(SettingsError),
    /// Flash image bank failure.
    Flash(FlashError),
    /// The secondary bank does not contain a parseable image.
    InvalidImage,
    /// The bootloader refused or failed the image swap.
    SwapFail,
    /// The bootloader reverted to the previous image.
    SystemRollback,
    /// The update was canceled while in flight.
    Canceled,
    /// OTA worker thread could not be spawned.
    ThreadCreate,
    /// Anything else: bootloader query/confirm errors, publish failures.
    Internal,
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "invalid request"),
            Self::AlreadyInProgress => write!(f, "update already in progress"),
            Self::Network => write!(f, "network error"),
            Self::HttpRequest => write!(f, "http request failed"),
            Self::Settings(e) => write!(f, "settings: {e}"),
            Self::Flash(e) => write!(f, "flash: {e}"),
            Self::InvalidImage => write!(f, "invalid image in secondary bank"),
            Self::SwapFail => write!(f, "image swap failed"),
            Self::SystemRollback => write!(f, "bootloader rolled back"),
            Self::Canceled => write!(f, "update canceled"),
            Self::ThreadCreate => write!(f, "worker thread creation failed"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings errors
// ---------------------------------------------------------------------------

/// Failures of the persistent key/value store.
///
/// All four map to the external `IOError` status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    /// Backend initialisation failed unrecoverably.
    Init,
    /// A key could not be written or committed.
    Save,
    /// Subtree enumeration or a key read failed.
    Load,
    /// A key could not be deleted (missing keys are not an error).
    Delete,
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init failed"),
            Self::Save => write!(f, "save failed"),
            Self::Load => write!(f, "load failed"),
            Self::Delete => write!(f, "delete failed"),
        }
    }
}

impl From<SettingsError> for OtaError {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}

// ---------------------------------------------------------------------------
// Flash bank errors
// ---------------------------------------------------------------------------

/// Failures of the secondary image bank writer.
///
/// These are transient from the engine's point of view: the attempt loop
/// re-erases and retries up to its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Erasing the inactive bank failed.
    EraseSecondSlot,
    /// The streaming writer could not be initialised at bank start.
    Init,
    /// A sequential write or the final flush failed.
    Write,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EraseSecondSlot => write!(f, "erase second slot failed"),
            Self::Init => write!(f, "writer init failed"),
            Self::Write => write!(f, "write failed"),
        }
    }
}

impl From<FlashError> for OtaError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

// ---------------------------------------------------------------------------
// Bootloader errors
// ---------------------------------------------------------------------------

/// Failures of the bootloader control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// Swap-state or slot query failed.
    Query,
    /// The secondary bank header could not be read.
    Header,
    /// The secondary bank holds data that is not a bootable image.
    InvalidImage,
    /// Confirming the running image failed.
    Confirm,
    /// Marking the secondary image as test-pending failed.
    Upgrade,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "slot query failed"),
            Self::Header => write!(f, "bank header read failed"),
            Self::InvalidImage => write!(f, "no valid image in bank"),
            Self::Confirm => write!(f, "image confirm failed"),
            Self::Upgrade => write!(f, "upgrade request failed"),
        }
    }
}

impl From<BootError> for OtaError {
    fn from(e: BootError) -> Self {
        match e {
            BootError::InvalidImage => Self::InvalidImage,
            _ => Self::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry errors
// ---------------------------------------------------------------------------

/// Failures of the telemetry channel (outbound stream / inbound poll).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryError {
    /// The channel is not connected.
    NotConnected,
    /// The aggregate could not be serialised or sent.
    Publish,
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "channel not connected"),
            Self::Publish => write!(f, "publish failed"),
        }
    }
}

impl From<TelemetryError> for OtaError {
    fn from(_: TelemetryError) -> Self {
        Self::Internal
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, OtaError>;
