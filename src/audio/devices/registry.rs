use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use colored::Colorize;

use crate::audio::devices::device::{DeviceHandle, PropertyListener};
use crate::audio::devices::simulated::{SimulatedCapabilities, SimulatedDevice};
use crate::audio::types::{
    DeviceId, DeviceInfo, ListenerId, PropertyAddress, Scope, Selector, DEVICE_UNKNOWN,
    NULL_DEVICE_UID,
};

/// Process-wide device table.
///
/// Owns every device the process knows about, the default-output slot, the
/// hidden Null Device, and the listeners interested in device-list changes.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceId, DeviceHandle>>,
    default_output: Mutex<Option<DeviceHandle>>,
    null_device: DeviceHandle,
    null_device_enabled: AtomicBool,
    list_listeners: Mutex<HashMap<ListenerId, PropertyListener>>,
    next_listener_id: AtomicU64,
    next_device_id: AtomicU64,
}

impl DeviceRegistry {
    /// Reserved ID for the hidden Null Device, right above the "no device"
    /// marker.
    pub const NULL_DEVICE_ID: DeviceId = DEVICE_UNKNOWN + 1;

    pub fn new() -> Self {
        let null_device = DeviceHandle::new(Arc::new(
            SimulatedDevice::new(
                Self::NULL_DEVICE_ID,
                NULL_DEVICE_UID,
                "Null Device",
                SimulatedCapabilities::inert(),
            )
            .hidden(),
        ));

        Self {
            devices: Mutex::new(HashMap::new()),
            default_output: Mutex::new(None),
            null_device,
            null_device_enabled: AtomicBool::new(false),
            list_listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            // 1 is the Null Device; hand out IDs from 2.
            next_device_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh device ID. Concrete devices are built with an ID
    /// from here, then registered.
    pub fn allocate_device_id(&self) -> DeviceId {
        (self.next_device_id.fetch_add(1, Ordering::Relaxed) + 1) as DeviceId
    }

    pub fn register(&self, device: DeviceHandle) {
        let id = device.id();
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(id, device);
        }
        self.notify_device_list_changed();
    }

    pub fn unregister(&self, id: DeviceId) {
        let removed = self
            .devices
            .lock()
            .map(|mut devices| devices.remove(&id).is_some())
            .unwrap_or(false);
        if removed {
            self.notify_device_list_changed();
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<DeviceHandle> {
        if id == Self::NULL_DEVICE_ID {
            return Some(self.null_device.clone());
        }
        self.devices.lock().ok()?.get(&id).cloned()
    }

    pub fn device_for_uid(&self, uid: &str) -> Option<DeviceHandle> {
        if uid == NULL_DEVICE_UID {
            return Some(self.null_device.clone());
        }
        self.devices
            .lock()
            .ok()?
            .values()
            .find(|device| device.uid() == uid)
            .cloned()
    }

    /// Devices suitable for user-facing lists; the hidden Null Device is
    /// excluded.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let Ok(devices) = self.devices.lock() else {
            return Vec::new();
        };
        let mut infos: Vec<DeviceInfo> = devices
            .values()
            .filter(|device| !device.is_hidden())
            .map(|device| DeviceInfo {
                id: device.id(),
                name: device.name().to_string(),
                uid: Some(device.uid().to_string()),
                is_input: device.total_channels(Scope::Input) > 0,
                is_output: device.total_channels(Scope::Output) > 0,
                sample_rate: device.nominal_sample_rate().unwrap_or(0.0),
                channels: device.total_channels(Scope::Output) as u32,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn default_output_device(&self) -> Option<DeviceHandle> {
        self.default_output.lock().ok()?.clone()
    }

    pub fn set_default_output_device(&self, device: DeviceHandle) {
        tracing::info!(
            "{}: Default output device -> '{}' ({})",
            "DEVICE_REGISTRY".bright_cyan(),
            device.name(),
            device.id()
        );
        if let Ok(mut slot) = self.default_output.lock() {
            *slot = Some(device);
        }
    }

    pub fn null_device(&self) -> DeviceHandle {
        self.null_device.clone()
    }

    pub fn null_device_enabled(&self) -> bool {
        self.null_device_enabled.load(Ordering::Acquire)
    }

    /// Publishes or hides the Null Device. Fires the device-list listeners
    /// synchronously on the calling thread when the state changes.
    pub fn set_null_device_enabled(&self, enabled: bool) {
        let was = self.null_device_enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            tracing::debug!(
                "{}: Null device {}",
                "DEVICE_REGISTRY".bright_cyan(),
                if enabled { "enabled" } else { "disabled" }
            );
            self.notify_device_list_changed();
        }
    }

    pub fn add_device_list_listener(&self, listener: PropertyListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut listeners) = self.list_listeners.lock() {
            listeners.insert(id, listener);
        }
        id
    }

    pub fn remove_device_list_listener(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.list_listeners.lock() {
            listeners.remove(&id);
        }
    }

    fn notify_device_list_changed(&self) {
        let snapshot: Vec<PropertyListener> = {
            let Ok(listeners) = self.list_listeners.lock() else {
                return;
            };
            listeners.values().cloned().collect()
        };
        let address = PropertyAddress::global(Selector::DeviceList);
        for listener in snapshot {
            listener(0, address);
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
