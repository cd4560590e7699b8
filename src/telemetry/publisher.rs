//! OTA event publisher.
//!
//! Maps the engine's internal `(status, code)` pairs onto the external
//! `OTAEvent` aggregate — `{requestUUID, status, statusProgress,
//! statusCode, message, timestamp}` — and streams it through the
//! [`TelemetryLink`].  With the `local-bus` feature, coarse milestones are
//! mirrored on the in-process bus as well.
//!
//! Publishing is fire-and-forget: a failed stream is logged, never
//! propagated, so a flaky channel cannot wedge the update state machine.

use std::sync::Arc;

use log::{debug, error};

use crate::app::events::{OtaStatus, OtaStatusEvent};
use crate::app::ports::{TelemetryLink, TimeSource};
use crate::error::{OtaError, SettingsError};
use crate::telemetry::object::ObjectEntry;
use crate::telemetry::{OTA_EVENT_INTERFACE, OTA_EVENT_PATH};

/// External `statusCode` string for an engine error.
///
/// Intermediate `Error` events and terminal `Failure` events share this
/// single table; `None` renders as the empty string.
pub fn status_code_str(code: Option<OtaError>) -> &'static str {
    match code {
        None => "",
        Some(OtaError::InvalidRequest) => "InvalidRequest",
        Some(OtaError::AlreadyInProgress) => "UpdateAlreadyInProgress",
        Some(OtaError::Network) => "ErrorNetwork",
        Some(OtaError::Settings(
            SettingsError::Init | SettingsError::Save | SettingsError::Load | SettingsError::Delete,
        )) => "IOError",
        Some(OtaError::InvalidImage) => "InvalidBaseImage",
        Some(OtaError::SystemRollback) => "SystemRollback",
        Some(OtaError::Canceled) => "Canceled",
        // HttpRequest, Flash(_), SwapFail, ThreadCreate, Internal
        Some(_) => "InternalError",
    }
}

/// Publishes OTA status events on the telemetry channel.
///
/// Cheap to clone; the worker thread carries its own copy.
#[derive(Clone)]
pub struct EventPublisher {
    link: Arc<dyn TelemetryLink>,
    clock: Arc<dyn TimeSource>,
    #[cfg(feature = "local-bus")]
    mirror_to_bus: bool,
}

impl EventPublisher {
    pub fn new(link: Arc<dyn TelemetryLink>, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            link,
            clock,
            #[cfg(feature = "local-bus")]
            mirror_to_bus: true,
        }
    }

    /// Disable the local-bus mirror (unit tests share one process-global
    /// ring).
    #[cfg(feature = "local-bus")]
    pub fn with_bus_mirror(mut self, enabled: bool) -> Self {
        self.mirror_to_bus = enabled;
        self
    }

    /// Stream one OTA event to the backend.
    pub fn publish(
        &self,
        request_uuid: &str,
        status: OtaStatus,
        progress: i32,
        code: Option<OtaError>,
        message: &str,
    ) {
        let event = OtaStatusEvent {
            request_uuid: request_uuid.to_owned(),
            status,
            progress,
            code,
            message: message.to_owned(),
            timestamp: self.clock.epoch_secs(),
        };

        #[cfg(feature = "local-bus")]
        if self.mirror_to_bus {
            if let Some(bus_event) = bus_mirror(status) {
                crate::bus::publish(bus_event);
            }
        }

        let entries = [
            ObjectEntry::string("requestUUID", event.request_uuid.as_str()),
            ObjectEntry::string("status", status.as_str()),
            ObjectEntry::integer("statusProgress", event.progress),
            ObjectEntry::string("statusCode", status_code_str(code)),
            ObjectEntry::string("message", event.message.as_str()),
        ];

        debug!(
            "OTA event: uuid={} status={} progress={} code={}",
            event.request_uuid,
            status.as_str(),
            event.progress,
            status_code_str(code),
        );

        if let Err(e) = self.link.stream_aggregate(
            OTA_EVENT_INTERFACE,
            OTA_EVENT_PATH,
            &entries,
            event.timestamp,
        ) {
            error!("Unable to send OTA event: {}", e);
        }
    }
}

/// Coarse bus milestone for a status, if one exists.
#[cfg(feature = "local-bus")]
fn bus_mirror(status: OtaStatus) -> Option<crate::bus::BusEvent> {
    use crate::bus::BusEvent;
    match status {
        OtaStatus::Acknowledged => Some(BusEvent::Init),
        OtaStatus::Rebooting => Some(BusEvent::PendingReboot),
        OtaStatus::Success => Some(BusEvent::Success),
        OtaStatus::Error | OtaStatus::Failure => Some(BusEvent::Failed),
        _ => None,
    }
}
