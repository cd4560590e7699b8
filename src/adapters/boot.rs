//! Bootloader adapter.
//!
//! Implements [`Bootloader`] over the ESP-IDF application rollback API,
//! translated into the swap-type vocabulary the engine reasons in:
//!
//! - a freshly test-booted image reports `swap_type() == None` with the
//!   image unconfirmed (`ESP_OTA_IMG_PENDING_VERIFY`);
//! - [`confirm_current_image`](Bootloader::confirm_current_image) marks
//!   the running slot valid, cancelling the rollback watchdog;
//! - a previous test image that failed to confirm shows up as an
//!   invalidated update slot → `SwapType::Revert`.
//!
//! The host backend is a scriptable stub: boot verdicts are whatever the
//! test (or simulation) sets, and every mutating call is recorded.

use log::{info, warn};

use crate::app::ports::{Bootloader, ImageHeader, SwapType};
use crate::error::BootError;

#[cfg(target_os = "espidf")]
use esp_idf_svc::ota::{EspOta, SlotState};

/// Bootloader control surface for the agent.
pub struct BootCtl {
    #[cfg(not(target_os = "espidf"))]
    sim: SimBoot,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug)]
struct SimBoot {
    swap: SwapType,
    confirmed: bool,
    header: Option<ImageHeader>,
    confirm_calls: u32,
    upgrade_requested: bool,
    reboot_requested: bool,
}

#[cfg(not(target_os = "espidf"))]
impl Default for SimBoot {
    fn default() -> Self {
        Self {
            // A plain boot: nothing pending, image long since confirmed.
            swap: SwapType::None,
            confirmed: true,
            header: Some(ImageHeader::default()),
            confirm_calls: 0,
            upgrade_requested: false,
            reboot_requested: false,
        }
    }
}

impl BootCtl {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            sim: SimBoot::default(),
        }
    }
}

impl Default for BootCtl {
    fn default() -> Self {
        Self::new()
    }
}

// ── Host scripting surface ───────────────────────────────────
//
// Only the simulation backend exposes these; tests use them to stage a
// post-reboot world for the reconciler.
#[cfg(not(target_os = "espidf"))]
impl BootCtl {
    pub fn script_swap_type(&mut self, swap: SwapType) {
        self.sim.swap = swap;
    }

    pub fn script_confirmed(&mut self, confirmed: bool) {
        self.sim.confirmed = confirmed;
    }

    pub fn script_header(&mut self, header: Option<ImageHeader>) {
        self.sim.header = header;
    }

    pub fn confirm_calls(&self) -> u32 {
        self.sim.confirm_calls
    }

    pub fn upgrade_requested(&self) -> bool {
        self.sim.upgrade_requested
    }

    pub fn reboot_requested(&self) -> bool {
        self.sim.reboot_requested
    }
}

impl Bootloader for BootCtl {
    fn swap_type(&mut self) -> SwapType {
        #[cfg(target_os = "espidf")]
        {
            let Ok(ota) = EspOta::new() else {
                return SwapType::Fail;
            };
            // An invalidated update slot is the trace the rollback leaves
            // behind after reverting a test image.
            match ota.get_update_slot() {
                Ok(slot) if slot.state == SlotState::Invalid => SwapType::Revert,
                Ok(_) => SwapType::None,
                Err(e) => {
                    warn!("BootCtl: update slot query failed: {}", e);
                    SwapType::Fail
                }
            }
        }

        #[cfg(not(target_os = "espidf"))]
        self.sim.swap
    }

    fn is_image_confirmed(&mut self) -> Result<bool, BootError> {
        #[cfg(target_os = "espidf")]
        {
            let ota = EspOta::new().map_err(|_| BootError::Query)?;
            let slot = ota.get_running_slot().map_err(|_| BootError::Query)?;
            Ok(slot.state == SlotState::Valid)
        }

        #[cfg(not(target_os = "espidf"))]
        Ok(self.sim.confirmed)
    }

    fn confirm_current_image(&mut self) -> Result<(), BootError> {
        #[cfg(target_os = "espidf")]
        {
            let mut ota = EspOta::new().map_err(|_| BootError::Confirm)?;
            ota.mark_running_slot_valid().map_err(|e| {
                warn!("BootCtl: mark_running_slot_valid failed: {}", e);
                BootError::Confirm
            })?;
            info!("BootCtl: running image confirmed (rollback cancelled)");
            Ok(())
        }

        #[cfg(not(target_os = "espidf"))]
        {
            self.sim.confirm_calls += 1;
            self.sim.confirmed = true;
            info!("BootCtl: running image confirmed (sim)");
            Ok(())
        }
    }

    fn read_secondary_header(&mut self) -> Result<ImageHeader, BootError> {
        #[cfg(target_os = "espidf")]
        {
            let ota = EspOta::new().map_err(|_| BootError::Header)?;
            let slot = ota.get_update_slot().map_err(|_| BootError::Header)?;
            let Some(firmware) = slot.firmware else {
                // The bank was written but does not describe a firmware.
                return Err(BootError::InvalidImage);
            };
            let mut version = heapless::String::new();
            for c in firmware.version.chars() {
                if version.push(c).is_err() {
                    break;
                }
            }
            Ok(ImageHeader {
                image_size: slot.size as u32,
                version,
            })
        }

        #[cfg(not(target_os = "espidf"))]
        self.sim.header.clone().ok_or(BootError::InvalidImage)
    }

    fn request_upgrade_test(&mut self) -> Result<(), BootError> {
        #[cfg(target_os = "espidf")]
        {
            use esp_idf_svc::sys::*;
            // Booting the freshly written partition once: with rollback
            // enabled it comes up PENDING_VERIFY and reverts unless the
            // new firmware confirms itself.
            let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
            if partition.is_null() {
                return Err(BootError::Upgrade);
            }
            let ret = unsafe { esp_ota_set_boot_partition(partition) };
            if ret != ESP_OK {
                warn!("BootCtl: set_boot_partition failed: {}", ret);
                return Err(BootError::Upgrade);
            }
            Ok(())
        }

        #[cfg(not(target_os = "espidf"))]
        {
            self.sim.upgrade_requested = true;
            Ok(())
        }
    }

    fn reboot_warm(&mut self) {
        #[cfg(target_os = "espidf")]
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }

        #[cfg(not(target_os = "espidf"))]
        {
            self.sim.reboot_requested = true;
            warn!("BootCtl: warm reboot requested (sim, not rebooting)");
        }
    }
}
