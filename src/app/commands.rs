//! Inbound OTA commands.
//!
//! The backend sends an `OTARequest` aggregate with string fields `uuid`,
//! `operation` and (for updates) `url`.  Parsing is strict: a request
//! missing a required field is rejected before it reaches the engine.

use log::{info, warn};

use crate::error::OtaError;
use crate::telemetry::object::AggregateObject;

/// 36-character RFC-4122 string form, as the backend sends it.
pub const UUID_STR_LEN: usize = 36;

/// One OTA update request, heap-owned for the lifetime of its worker.
#[derive(Debug, Clone, PartialEq)]
pub struct OtaRequest {
    pub uuid: String,
    pub download_url: String,
}

/// Commands the backend can issue on the OTA channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OtaCommand {
    Update(OtaRequest),
    Cancel { uuid: String },
}

impl OtaCommand {
    /// Extract a command from an inbound aggregate object.
    ///
    /// Missing `uuid` or `operation` (or a missing `url` on an update)
    /// makes the request unusable — there is nothing to echo back, so the
    /// caller gets an error and no event is published.  An *unknown*
    /// operation carries a usable uuid; the caller reports that one to the
    /// backend as `Failure/InvalidRequest`.
    pub fn from_object(object: &AggregateObject) -> Result<Self, OtaError> {
        let uuid = object.string_field("uuid");
        let url = object.string_field("url");
        let operation = object.string_field("operation");

        let (Some(uuid), Some(operation)) = (uuid, operation) else {
            warn!("OTA request is missing uuid or operation");
            return Err(OtaError::InvalidRequest);
        };

        info!("OTA command: operation={} uuid={}", operation, uuid);

        match operation {
            "Update" => {
                let Some(url) = url else {
                    warn!("OTA update request is missing url");
                    return Err(OtaError::InvalidRequest);
                };
                Ok(Self::Update(OtaRequest {
                    uuid: uuid.to_owned(),
                    download_url: url.to_owned(),
                }))
            }
            "Cancel" => Ok(Self::Cancel {
                uuid: uuid.to_owned(),
            }),
            other => {
                warn!("Unknown OTA operation '{}' for uuid {}", other, uuid);
                Err(OtaError::InvalidRequest)
            }
        }
    }

    /// The request uuid, when the object carried one.  Used to echo
    /// rejections for unknown operations.
    pub fn uuid_of(object: &AggregateObject) -> Option<&str> {
        object.string_field("uuid")
    }
}
