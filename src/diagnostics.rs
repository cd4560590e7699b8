//! Runtime diagnostics.
//!
//! A point-in-time snapshot of the resources the OTA path leans on: heap
//! headroom (the HTTP buffer and request duplication allocate) and NVS
//! free entries (the persistent record needs room to commit).  Collected
//! on demand and logged periodically by the agent task.

use log::info;

/// Runtime resource snapshot.
#[derive(Debug, Clone)]
pub struct RuntimeMetrics {
    pub uptime_secs: u64,
    pub heap_free: u32,
    pub heap_min_free: u32,
    pub nvs_free_entries: u32,
}

impl RuntimeMetrics {
    #[cfg(target_os = "espidf")]
    pub fn collect(uptime_secs: u64) -> Self {
        use esp_idf_svc::sys::*;
        let heap_free = unsafe { esp_get_free_heap_size() };
        let heap_min_free = unsafe { esp_get_minimum_free_heap_size() };

        let mut stats: nvs_stats_t = unsafe { core::mem::zeroed() };
        let part_name = b"nvs\0";
        let ret = unsafe { nvs_get_stats(part_name.as_ptr() as *const _, &mut stats) };
        let nvs_free_entries = if ret == ESP_OK {
            stats.free_entries as u32
        } else {
            0
        };

        Self {
            uptime_secs,
            heap_free,
            heap_min_free,
            nvs_free_entries,
        }
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn collect(uptime_secs: u64) -> Self {
        // Synthetic values so the simulation exercises the same branches
        // as hardware; heap "decays" slightly to model fragmentation.
        let base_free: u32 = 307_200; // 300 KB
        let decay = (uptime_secs / 60) as u32 * 512;
        let heap_free = base_free.saturating_sub(decay);

        Self {
            uptime_secs,
            heap_free,
            heap_min_free: (heap_free as f32 * 0.85) as u32,
            nvs_free_entries: 120,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "METRICS | up={}s | heap={}B (min {}B) | nvs_free={}",
            self.uptime_secs, self.heap_free, self.heap_min_free, self.nvs_free_entries
        );
    }
}
