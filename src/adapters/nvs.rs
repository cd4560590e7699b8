//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements [`SettingsPort`] (the OTA record store) and [`ConfigPort`]
//! for the agent.
//!
//! - Key-level atomicity: ESP-IDF NVS commits are atomic per
//!   `nvs_commit()`, so a crash leaves either the old or the new value.
//! - Namespace isolation: each subsystem uses its own namespace.
//! - Config validation: all fields are range-checked before persistence.
//!
//! The host backend is a `HashMap` behind a shared handle, so clones of
//! one adapter observe the same store — the OTA worker and the cancel
//! handler must agree on the persisted record.

use log::{info, warn};

use crate::app::ports::{ConfigPort, SettingsPort};
use crate::config::{validate_config, AgentConfig};
use crate::error::SettingsError;

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;
#[cfg(not(target_os = "espidf"))]
use std::sync::{Arc, Mutex};

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const CONFIG_NAMESPACE: &str = "outpost";
const CONFIG_KEY: &str = "agentcfg";

#[allow(dead_code)]
const MAX_BLOB_SIZE: usize = 4000;

/// NVS-backed settings store.
#[derive(Clone)]
pub struct NvsStore {
    #[cfg(not(target_os = "espidf"))]
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl NvsStore {
    /// Create a store handle and initialise NVS flash.
    ///
    /// Returns `Err(SettingsError::Init)` if flash initialisation fails
    /// unrecoverably. On first boot or after a version mismatch the NVS
    /// partition is erased and re-initialised automatically.
    pub fn new() -> Result<Self, SettingsError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init / nvs_flash_erase are called from the
            // single supervisor context before any concurrent NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("NVS: erasing and re-initialising flash partition");
                let ret2 = unsafe { nvs_flash_erase() };
                if ret2 != ESP_OK {
                    return Err(SettingsError::Init);
                }
                let ret3 = unsafe { nvs_flash_init() };
                if ret3 != ESP_OK {
                    return Err(SettingsError::Init);
                }
            } else if ret != ESP_OK {
                return Err(SettingsError::Init);
            }
            info!("NvsStore: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("NvsStore: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    #[cfg(not(target_os = "espidf"))]
    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }

    /// Open an NVS namespace, execute a closure with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let mut ns_buf = [0u8; 16];
        let ns_bytes = namespace.as_bytes();
        let len = ns_bytes.len().min(15);
        ns_buf[..len].copy_from_slice(&ns_bytes[..len]);

        let mut handle: nvs_handle_t = 0;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }

        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }

    /// NVS keys are limited to 15 characters plus terminator.
    #[cfg(target_os = "espidf")]
    fn key_buf(key: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let kb = key.as_bytes();
        let kl = kb.len().min(15);
        buf[..kl].copy_from_slice(&kb[..kl]);
        buf
    }
}

impl SettingsPort for NvsStore {
    fn init(&mut self) -> Result<(), SettingsError> {
        // Flash is initialised in `new()`; re-initialisation from the OTA
        // worker is a no-op.
        Ok(())
    }

    fn save(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), SettingsError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store
                .lock()
                .map_err(|_| SettingsError::Save)?
                .insert(composite, value.to_vec());
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let key_buf = Self::key_buf(key);
                let ret = unsafe {
                    nvs_set_blob(
                        handle,
                        key_buf.as_ptr() as *const _,
                        value.as_ptr() as *const _,
                        value.len(),
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|e| {
                warn!("NVS: write error {} for {}/{}", e, namespace, key);
                SettingsError::Save
            })
        }
    }

    fn load(
        &mut self,
        namespace: &str,
        visitor: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> Result<(), SettingsError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let prefix = format!("{}::", namespace);
            let store = self.store.lock().map_err(|_| SettingsError::Load)?;
            for (k, v) in store.iter() {
                if let Some(key) = k.strip_prefix(&prefix) {
                    if !visitor(key, v) {
                        break;
                    }
                }
            }
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            // Iterate every blob under the namespace, reading each through
            // a fresh handle.
            let ns_buf = Self::key_buf(namespace);
            let part = b"nvs\0";
            let mut iter: nvs_iterator_t = core::ptr::null_mut();
            let ret = unsafe {
                nvs_entry_find(
                    part.as_ptr() as *const _,
                    ns_buf.as_ptr() as *const _,
                    nvs_type_t_NVS_TYPE_BLOB,
                    &mut iter,
                )
            };
            if ret == ESP_ERR_NVS_NOT_FOUND {
                return Ok(()); // Nothing stored under this namespace.
            }
            if ret != ESP_OK {
                return Err(SettingsError::Load);
            }

            let mut result = Ok(());
            while !iter.is_null() {
                let mut entry: nvs_entry_info_t = unsafe { core::mem::zeroed() };
                let ret = unsafe { nvs_entry_info(iter, &mut entry) };
                if ret != ESP_OK {
                    result = Err(SettingsError::Load);
                    break;
                }

                let key_len = entry
                    .key
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.key.len());
                let key_bytes: Vec<u8> =
                    entry.key[..key_len].iter().map(|&c| c as u8).collect();
                let key = String::from_utf8_lossy(&key_bytes).into_owned();

                let value = Self::with_nvs_handle(namespace, false, |handle| {
                    let key_buf = Self::key_buf(&key);
                    let mut size: usize = 0;
                    let ret = unsafe {
                        nvs_get_blob(
                            handle,
                            key_buf.as_ptr() as *const _,
                            core::ptr::null_mut(),
                            &mut size,
                        )
                    };
                    if ret != ESP_OK || size == 0 || size > MAX_BLOB_SIZE {
                        return Err(ret);
                    }
                    let mut buf = vec![0u8; size];
                    let ret = unsafe {
                        nvs_get_blob(
                            handle,
                            key_buf.as_ptr() as *const _,
                            buf.as_mut_ptr() as *mut _,
                            &mut size,
                        )
                    };
                    if ret != ESP_OK {
                        return Err(ret);
                    }
                    Ok(buf)
                });

                match value {
                    Ok(bytes) => {
                        if !visitor(&key, &bytes) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("NVS: read error {} for {}/{}", e, namespace, key);
                        result = Err(SettingsError::Load);
                        break;
                    }
                }

                let ret = unsafe { nvs_entry_next(&mut iter) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    result = Err(SettingsError::Load);
                    break;
                }
            }
            unsafe { nvs_release_iterator(iter) };
            result
        }
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), SettingsError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store
                .lock()
                .map_err(|_| SettingsError::Delete)?
                .remove(&composite);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let key_buf = Self::key_buf(key);
                let ret = unsafe { nvs_erase_key(handle, key_buf.as_ptr() as *const _) };
                // A missing key is not an error.
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| SettingsError::Delete)
        }
    }
}

impl ConfigPort for NvsStore {
    fn load(&self) -> Result<AgentConfig, SettingsError> {
        let mut this = self.clone();
        let mut blob: Option<Vec<u8>> = None;
        SettingsPort::load(&mut this, CONFIG_NAMESPACE, &mut |key, value| {
            if key == CONFIG_KEY {
                blob = Some(value.to_vec());
                return false;
            }
            true
        })?;

        match blob {
            Some(bytes) => match postcard::from_bytes::<AgentConfig>(&bytes) {
                Ok(cfg) => {
                    info!("NvsStore: loaded config ({} bytes)", bytes.len());
                    Ok(cfg)
                }
                Err(_) => {
                    warn!("NvsStore: stored config corrupted, using defaults");
                    Ok(AgentConfig::default())
                }
            },
            None => {
                info!("NvsStore: no stored config, using defaults");
                Ok(AgentConfig::default())
            }
        }
    }

    fn save(&self, config: &AgentConfig) -> Result<(), SettingsError> {
        if let Err(msg) = validate_config(config) {
            warn!("NvsStore: config rejected: {}", msg);
            return Err(SettingsError::Save);
        }
        let bytes = postcard::to_allocvec(config).map_err(|_| SettingsError::Save)?;
        let mut this = self.clone();
        SettingsPort::save(&mut this, CONFIG_NAMESPACE, CONFIG_KEY, &bytes)?;
        info!("NvsStore: config saved ({} bytes)", bytes.len());
        Ok(())
    }
}
