//! Outbound OTA status events.
//!
//! The engine reports progress through the
//! [`EventPublisher`](crate::telemetry::publisher::EventPublisher), which
//! turns these into the external `OTAEvent` aggregate.  The enum mirrors
//! the backend's status vocabulary exactly; the publisher owns the string
//! mapping.

use crate::error::OtaError;

/// Externally visible OTA status.
///
/// For a single request the stream is a prefix of
/// `Acknowledged Downloading* (Error Downloading*)* Deploying Deployed
/// Rebooting Success` or ends in `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    /// The device accepted the update request.
    Acknowledged,
    /// The image download is in progress (carries a percentage).
    Downloading,
    /// The image is being handed to the bootloader.
    Deploying,
    /// The image is staged in the secondary bank.
    Deployed,
    /// The device is about to reboot into the new image.
    Rebooting,
    /// Terminal: the update took effect and was confirmed.
    Success,
    /// A recoverable error happened; another attempt follows.
    Error,
    /// Terminal: the update did not take effect.
    Failure,
}

impl OtaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledged => "Acknowledged",
            Self::Downloading => "Downloading",
            Self::Deploying => "Deploying",
            Self::Deployed => "Deployed",
            Self::Rebooting => "Rebooting",
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Failure => "Failure",
        }
    }

    /// Terminal states close the event stream for a request uuid.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// A point-in-time snapshot of one published OTA event.
///
/// This is what test links record and what the log link prints; the wire
/// aggregate is built from it field by field.
#[derive(Debug, Clone, PartialEq)]
pub struct OtaStatusEvent {
    pub request_uuid: String,
    pub status: OtaStatus,
    /// 0-100; meaningful only while `status` is `Downloading`.
    pub progress: i32,
    /// Status code accompanying `Error`/`Failure`; `None` renders as "".
    pub code: Option<OtaError>,
    pub message: String,
    pub timestamp: i64,
}
