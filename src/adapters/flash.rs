//! Flash image bank adapter.
//!
//! Implements [`ImageBank`]: a streaming writer into the inactive OTA
//! partition.  Writes are strictly sequential — the downloader produces
//! the body in order and the engine never seeks.
//!
//! On ESP-IDF this drives the `esp_ota_*` partition API directly (begin
//! with deferred erase, buffered writes, end on the last chunk).  The
//! host backend is an in-memory bank that records the erase/begin/write
//! discipline for tests.

use log::{info, warn};

use crate::app::ports::ImageBank;
use crate::error::FlashError;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

/// Firmware larger than this cannot be a valid image for our parts.
const MAX_IMAGE_SIZE: usize = 4 * 1024 * 1024;

/// Streaming writer over the secondary OTA partition.
pub struct OtaBank {
    #[cfg(target_os = "espidf")]
    partition: *const esp_partition_t,
    #[cfg(target_os = "espidf")]
    handle: Option<esp_ota_handle_t>,
    #[cfg(not(target_os = "espidf"))]
    sim: SimBank,
    bytes_written: usize,
}

// SAFETY: the partition pointer references a static partition-table entry
// owned by ESP-IDF for the process lifetime; the handle is only touched by
// the single OTA worker that owns this bank.
#[cfg(target_os = "espidf")]
unsafe impl Send for OtaBank {}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Default)]
struct SimBank {
    erased: bool,
    writer_open: bool,
    data: Vec<u8>,
}

impl OtaBank {
    /// Bind to the next update partition.
    pub fn new() -> Result<Self, FlashError> {
        #[cfg(target_os = "espidf")]
        {
            let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
            if partition.is_null() {
                warn!("OtaBank: no inactive OTA partition");
                return Err(FlashError::Init);
            }
            Ok(Self {
                partition,
                handle: None,
                bytes_written: 0,
            })
        }

        #[cfg(not(target_os = "espidf"))]
        Ok(Self {
            sim: SimBank::default(),
            bytes_written: 0,
        })
    }
}

impl ImageBank for OtaBank {
    fn erase_secondary(&mut self) -> Result<(), FlashError> {
        #[cfg(target_os = "espidf")]
        {
            // Abandon any writer left over from a failed attempt before
            // erasing underneath it.
            if let Some(handle) = self.handle.take() {
                unsafe { esp_ota_abort(handle) };
            }
            let part = unsafe { &*self.partition };
            let ret = unsafe { esp_partition_erase_range(self.partition, 0, part.size as usize) };
            if ret != ESP_OK {
                warn!("OtaBank: erase failed: {}", ret);
                return Err(FlashError::EraseSecondSlot);
            }
            info!("OtaBank: secondary bank erased ({} bytes)", part.size);
            self.bytes_written = 0;
            Ok(())
        }

        #[cfg(not(target_os = "espidf"))]
        {
            self.sim = SimBank {
                erased: true,
                ..SimBank::default()
            };
            self.bytes_written = 0;
            info!("OtaBank: secondary bank erased (sim)");
            Ok(())
        }
    }

    fn begin(&mut self) -> Result<(), FlashError> {
        #[cfg(target_os = "espidf")]
        {
            let mut handle: esp_ota_handle_t = 0;
            // The bank is already erased; sequential-write mode keeps
            // esp_ota_begin from bulk-erasing it again.
            let ret = unsafe {
                esp_ota_begin(
                    self.partition,
                    OTA_WITH_SEQUENTIAL_WRITES as usize,
                    &mut handle,
                )
            };
            if ret != ESP_OK {
                warn!("OtaBank: begin failed: {}", ret);
                return Err(FlashError::Init);
            }
            self.handle = Some(handle);
            self.bytes_written = 0;
            Ok(())
        }

        #[cfg(not(target_os = "espidf"))]
        {
            if !self.sim.erased {
                return Err(FlashError::Init);
            }
            self.sim.writer_open = true;
            self.sim.data.clear();
            self.bytes_written = 0;
            Ok(())
        }
    }

    fn write(&mut self, buf: &[u8], last: bool) -> Result<(), FlashError> {
        if self.bytes_written + buf.len() > MAX_IMAGE_SIZE {
            return Err(FlashError::Write);
        }

        #[cfg(target_os = "espidf")]
        {
            let Some(handle) = self.handle else {
                return Err(FlashError::Write);
            };
            let ret =
                unsafe { esp_ota_write(handle, buf.as_ptr() as *const _, buf.len()) };
            if ret != ESP_OK {
                warn!("OtaBank: write failed: {}", ret);
                unsafe { esp_ota_abort(handle) };
                self.handle = None;
                return Err(FlashError::Write);
            }
            self.bytes_written += buf.len();

            if last {
                let handle = self.handle.take().unwrap_or(handle);
                let ret = unsafe { esp_ota_end(handle) };
                if ret != ESP_OK {
                    warn!("OtaBank: end failed: {}", ret);
                    return Err(FlashError::Write);
                }
            }
            Ok(())
        }

        #[cfg(not(target_os = "espidf"))]
        {
            if !self.sim.writer_open {
                warn!("OtaBank: write without an open writer");
                return Err(FlashError::Write);
            }
            self.sim.data.extend_from_slice(buf);
            self.bytes_written += buf.len();
            if last {
                self.sim.writer_open = false;
            }
            Ok(())
        }
    }

    fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

impl Drop for OtaBank {
    fn drop(&mut self) {
        // Abandon an unfinished writer so the partition handle is released.
        #[cfg(target_os = "espidf")]
        if let Some(handle) = self.handle.take() {
            unsafe { esp_ota_abort(handle) };
        }
    }
}
