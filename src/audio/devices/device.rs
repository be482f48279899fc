use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::audio::types::{
    DeviceId, IoCycle, IoProcId, ListenerId, PropertyAddress, Scope, MASTER_CHANNEL,
    VIRTUAL_DEVICE_UID,
};

/// Errors from device control and IO management operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device is not alive")]
    NotAlive,
    #[error("device does not support the requested property or operation")]
    Unsupported,
    #[error("property exists but is not settable on this device")]
    NotSettable,
    #[error("no IOProc or listener registered with that ID")]
    UnknownId,
    #[error("device reported an internal failure: {0}")]
    HostError(String),
}

/// Which side of a device an IOProc consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Input,
    Output,
}

/// Samples handed to an IO callback for one cycle.
pub enum IoBuffer<'a> {
    /// Captured frames to read (input side).
    Input(&'a [f32]),
    /// Frames to render into, pre-zeroed (output side).
    Output(&'a mut [f32]),
}

/// An IO callback. Runs on the device's IO thread; must not block.
pub type IoProcHandler = Box<dyn FnMut(&IoCycle, IoBuffer<'_>) + Send>;

/// A property-change listener. May be invoked from any thread, including
/// synchronously from the thread that changed the property.
pub type PropertyListener = Arc<dyn Fn(DeviceId, PropertyAddress) + Send + Sync>;

/// The control and IO protocol all audio endpoints implement.
///
/// Control accessors return `Err(Unsupported)` for properties the device
/// doesn't have and `Err(NotSettable)` for read-only ones; callers that can
/// fall back to another mechanism treat those as expected.
pub trait AudioDevice: Send + Sync {
    fn id(&self) -> DeviceId;
    fn uid(&self) -> &str;
    fn name(&self) -> &str;
    fn is_alive(&self) -> bool;
    /// Hidden devices are excluded from user-facing device lists.
    fn is_hidden(&self) -> bool {
        false
    }

    fn nominal_sample_rate(&self) -> Result<f64, DeviceError>;
    fn set_nominal_sample_rate(&self, rate: f64) -> Result<(), DeviceError>;

    fn io_buffer_size(&self) -> Result<usize, DeviceError>;
    fn set_io_buffer_size(&self, frames: usize) -> Result<(), DeviceError>;

    fn total_channels(&self, scope: Scope) -> usize;

    // Volume/mute controls. `channel` 0 is the master element.
    fn has_volume(&self, scope: Scope, channel: u32) -> bool;
    fn volume_is_settable(&self, scope: Scope, channel: u32) -> bool;
    fn volume(&self, scope: Scope, channel: u32) -> Result<f32, DeviceError>;
    fn set_volume(&self, scope: Scope, channel: u32, volume: f32) -> Result<(), DeviceError>;

    fn has_mute(&self, scope: Scope, channel: u32) -> bool;
    fn mute_is_settable(&self, scope: Scope, channel: u32) -> bool;
    fn mute(&self, scope: Scope, channel: u32) -> Result<bool, DeviceError>;
    fn set_mute(&self, scope: Scope, channel: u32, mute: bool) -> Result<(), DeviceError>;

    // Virtual master volume, with the balance that writing it can disturb.
    fn has_virtual_master_volume(&self, scope: Scope) -> bool {
        let _ = scope;
        false
    }
    fn virtual_master_volume(&self, scope: Scope) -> Result<f32, DeviceError> {
        let _ = scope;
        Err(DeviceError::Unsupported)
    }
    fn set_virtual_master_volume(&self, scope: Scope, volume: f32) -> Result<(), DeviceError> {
        let _ = (scope, volume);
        Err(DeviceError::Unsupported)
    }
    fn virtual_master_balance(&self, scope: Scope) -> Result<f32, DeviceError> {
        let _ = scope;
        Err(DeviceError::Unsupported)
    }
    fn set_virtual_master_balance(&self, scope: Scope, balance: f32) -> Result<(), DeviceError> {
        let _ = (scope, balance);
        Err(DeviceError::Unsupported)
    }

    fn create_io_proc(
        &self,
        direction: IoDirection,
        handler: IoProcHandler,
    ) -> Result<IoProcId, DeviceError>;
    fn destroy_io_proc(&self, id: IoProcId) -> Result<(), DeviceError>;
    /// Starts an IOProc, or with `None` starts the device's hardware without
    /// attaching a callback (a keepalive start).
    fn start_io_proc(&self, id: Option<IoProcId>) -> Result<(), DeviceError>;
    fn stop_io_proc(&self, id: Option<IoProcId>) -> Result<(), DeviceError>;

    fn add_property_listener(
        &self,
        address: PropertyAddress,
        listener: PropertyListener,
    ) -> Result<ListenerId, DeviceError>;
    fn remove_property_listener(&self, id: ListenerId) -> Result<(), DeviceError>;

    /// The `[volume, mute]` enabled-controls array. Only the virtual device
    /// implements this.
    fn enabled_output_controls(&self) -> Result<[bool; 2], DeviceError> {
        Err(DeviceError::Unsupported)
    }
    fn set_enabled_output_controls(&self, controls: [bool; 2]) -> Result<(), DeviceError> {
        let _ = controls;
        Err(DeviceError::Unsupported)
    }

    /// Whether a client other than the owning app is doing IO on the device.
    /// Only the virtual device implements this.
    fn running_somewhere_other_than_owner(&self) -> Result<bool, DeviceError> {
        Err(DeviceError::Unsupported)
    }
}

/// Cheap cloneable handle to a device, carrying the derived capability
/// queries and the volume/mute copy algorithms.
#[derive(Clone)]
pub struct DeviceHandle(Arc<dyn AudioDevice>);

impl DeviceHandle {
    pub fn new(device: Arc<dyn AudioDevice>) -> Self {
        Self(device)
    }

    pub fn is_virtual_device(&self) -> bool {
        self.uid() == VIRTUAL_DEVICE_UID
    }

    /// A weak reference for callbacks that must not keep the device alive
    /// (an IOProc handler owned by the device itself, for one).
    pub fn downgrade(&self) -> std::sync::Weak<dyn AudioDevice> {
        Arc::downgrade(&self.0)
    }

    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        self.id() == other.id()
    }

    pub fn has_settable_master_volume(&self, scope: Scope) -> bool {
        self.has_volume(scope, MASTER_CHANNEL) && self.volume_is_settable(scope, MASTER_CHANNEL)
    }

    pub fn has_settable_virtual_master_volume(&self, scope: Scope) -> bool {
        self.has_virtual_master_volume(scope)
    }

    pub fn has_settable_master_mute(&self, scope: Scope) -> bool {
        self.has_mute(scope, MASTER_CHANNEL) && self.mute_is_settable(scope, MASTER_CHANNEL)
    }

    /// Reads a representative volume for `scope`: the master volume if the
    /// device has one, otherwise the average of its per-channel volumes.
    /// `None` if the device has no volume controls at all.
    pub fn read_representative_volume(
        &self,
        scope: Scope,
    ) -> Result<Option<f32>, DeviceError> {
        if self.has_volume(scope, MASTER_CHANNEL) {
            return Ok(Some(self.volume(scope, MASTER_CHANNEL)?));
        }

        let channels = self.total_channels(scope) as u32;
        let mut sum = 0.0f32;
        let mut count = 0u32;
        for channel in 1..=channels {
            if self.has_volume(scope, channel) {
                sum += self.volume(scope, channel)?;
                count += 1;
            }
        }
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(sum / count as f32))
    }

    /// Copies `other`'s volume to this device, trying the master control,
    /// then the virtual master control, then per-channel controls. Returns
    /// true if a volume was written. A device with nothing to read or nowhere
    /// to write is `Ok(false)`, not an error.
    pub fn copy_volume_from(
        &self,
        other: &DeviceHandle,
        scope: Scope,
    ) -> Result<bool, DeviceError> {
        let Some(volume) = other.read_representative_volume(scope)? else {
            return Ok(false);
        };

        if self.has_settable_master_volume(scope) {
            self.set_volume(scope, MASTER_CHANNEL, volume)?;
            return Ok(true);
        }

        if self.has_settable_virtual_master_volume(scope) {
            // Writing the virtual master volume can move the balance, so put
            // the balance back afterwards.
            let balance = self.virtual_master_balance(scope);
            self.set_virtual_master_volume(scope, volume)?;
            if let Ok(balance) = balance {
                let _ = self.set_virtual_master_balance(scope, balance);
            }
            return Ok(true);
        }

        let channels = self.total_channels(scope) as u32;
        let mut wrote = false;
        for channel in 1..=channels {
            if self.has_volume(scope, channel) && self.volume_is_settable(scope, channel) {
                self.set_volume(scope, channel, volume)?;
                wrote = true;
            }
        }
        Ok(wrote)
    }

    /// Copies `other`'s master mute to this device's master mute. Per-channel
    /// mute is not synthesized. Returns true if a mute state was written.
    pub fn copy_mute_from(&self, other: &DeviceHandle, scope: Scope) -> Result<bool, DeviceError> {
        if !other.has_mute(scope, MASTER_CHANNEL) || !self.has_settable_master_mute(scope) {
            return Ok(false);
        }
        let mute = other.mute(scope, MASTER_CHANNEL)?;
        self.set_mute(scope, MASTER_CHANNEL, mute)?;
        Ok(true)
    }
}

impl std::ops::Deref for DeviceHandle {
    type Target = dyn AudioDevice;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id())
            .field("uid", &self.uid())
            .finish()
    }
}

pub(crate) struct IoProcSlot {
    pub direction: IoDirection,
    pub started: Arc<AtomicBool>,
    pub handler: Arc<Mutex<IoProcHandler>>,
}

/// IOProc bookkeeping shared by the concrete device types.
///
/// Run cycles snapshot the started slots before invoking handlers, so a
/// handler can stop or destroy IOProcs (including its own) without
/// deadlocking on the table lock.
#[derive(Default)]
pub(crate) struct IoProcTable {
    procs: Mutex<HashMap<IoProcId, IoProcSlot>>,
    next_id: AtomicU64,
    // Device-level hardware running state, incremented by keepalive starts
    // and every started proc.
    start_count: AtomicU64,
}

impl IoProcTable {
    pub fn create(
        &self,
        direction: IoDirection,
        handler: IoProcHandler,
    ) -> Result<IoProcId, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = IoProcSlot {
            direction,
            started: Arc::new(AtomicBool::new(false)),
            handler: Arc::new(Mutex::new(handler)),
        };
        self.procs
            .lock()
            .map_err(|_| DeviceError::HostError("IOProc table poisoned".to_string()))?
            .insert(id, slot);
        Ok(id)
    }

    pub fn destroy(&self, id: IoProcId) -> Result<(), DeviceError> {
        let mut procs = self
            .procs
            .lock()
            .map_err(|_| DeviceError::HostError("IOProc table poisoned".to_string()))?;
        let slot = procs.remove(&id).ok_or(DeviceError::UnknownId)?;
        if slot.started.swap(false, Ordering::AcqRel) {
            self.start_count.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn start(&self, id: Option<IoProcId>) -> Result<(), DeviceError> {
        match id {
            Some(id) => {
                let procs = self
                    .procs
                    .lock()
                    .map_err(|_| DeviceError::HostError("IOProc table poisoned".to_string()))?;
                let slot = procs.get(&id).ok_or(DeviceError::UnknownId)?;
                if !slot.started.swap(true, Ordering::AcqRel) {
                    self.start_count.fetch_add(1, Ordering::AcqRel);
                }
                Ok(())
            }
            None => {
                self.start_count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    pub fn stop(&self, id: Option<IoProcId>) -> Result<(), DeviceError> {
        match id {
            Some(id) => {
                let procs = self
                    .procs
                    .lock()
                    .map_err(|_| DeviceError::HostError("IOProc table poisoned".to_string()))?;
                let slot = procs.get(&id).ok_or(DeviceError::UnknownId)?;
                if slot.started.swap(false, Ordering::AcqRel) {
                    self.start_count.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(())
            }
            None => {
                // Keepalive stop. Saturate rather than underflow if callers
                // unbalance their starts and stops.
                let _ = self.start_count.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |count| count.checked_sub(1),
                );
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.start_count.load(Ordering::Acquire) > 0
    }

    /// Started handlers for `direction`, snapshotted without holding the
    /// table lock during invocation.
    pub fn started_handlers(
        &self,
        direction: IoDirection,
    ) -> Vec<(Arc<AtomicBool>, Arc<Mutex<IoProcHandler>>)> {
        let Ok(procs) = self.procs.lock() else {
            return Vec::new();
        };
        procs
            .values()
            .filter(|slot| slot.direction == direction && slot.started.load(Ordering::Acquire))
            .map(|slot| (Arc::clone(&slot.started), Arc::clone(&slot.handler)))
            .collect()
    }
}

/// Property-listener bookkeeping shared by the concrete device types.
///
/// Notification snapshots the matching listeners before calling them, so a
/// listener can add or remove listeners (including itself).
#[derive(Default)]
pub(crate) struct ListenerTable {
    listeners: Mutex<HashMap<ListenerId, (PropertyAddress, PropertyListener)>>,
    next_id: AtomicU64,
}

impl ListenerTable {
    pub fn add(
        &self,
        address: PropertyAddress,
        listener: PropertyListener,
    ) -> Result<ListenerId, DeviceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .lock()
            .map_err(|_| DeviceError::HostError("listener table poisoned".to_string()))?
            .insert(id, (address, listener));
        Ok(id)
    }

    pub fn remove(&self, id: ListenerId) -> Result<(), DeviceError> {
        self.listeners
            .lock()
            .map_err(|_| DeviceError::HostError("listener table poisoned".to_string()))?
            .remove(&id)
            .map(|_| ())
            .ok_or(DeviceError::UnknownId)
    }

    pub fn notify(&self, device: DeviceId, changed: PropertyAddress) {
        let matching: Vec<PropertyListener> = {
            let Ok(listeners) = self.listeners.lock() else {
                return;
            };
            listeners
                .values()
                .filter(|(address, _)| address.matches(&changed))
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in matching {
            listener(device, changed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::Selector;

    #[test]
    fn test_io_proc_table_start_stop_counts() {
        let table = IoProcTable::default();
        let id = table
            .create(IoDirection::Output, Box::new(|_, _| {}))
            .unwrap();

        assert!(!table.is_running());
        table.start(Some(id)).unwrap();
        assert!(table.is_running());
        // Starting an already-started proc is a no-op.
        table.start(Some(id)).unwrap();
        table.stop(Some(id)).unwrap();
        assert!(!table.is_running());
    }

    #[test]
    fn test_keepalive_start_counts_independently() {
        let table = IoProcTable::default();
        table.start(None).unwrap();
        assert!(table.is_running());
        table.stop(None).unwrap();
        assert!(!table.is_running());
        // An unbalanced keepalive stop must not underflow.
        table.stop(None).unwrap();
        assert!(!table.is_running());
    }

    #[test]
    fn test_destroy_started_proc_stops_it() {
        let table = IoProcTable::default();
        let id = table
            .create(IoDirection::Input, Box::new(|_, _| {}))
            .unwrap();
        table.start(Some(id)).unwrap();
        table.destroy(id).unwrap();
        assert!(!table.is_running());
        assert_eq!(table.start(Some(id)), Err(DeviceError::UnknownId));
    }

    #[test]
    fn test_listener_table_notify_filters_by_address() {
        let table = ListenerTable::default();
        let hits = Arc::new(AtomicU64::new(0));

        let hits_clone = Arc::clone(&hits);
        table
            .add(
                PropertyAddress::output_master(Selector::VolumeScalar),
                Arc::new(move |_, _| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        table.notify(1, PropertyAddress::output_master(Selector::VolumeScalar));
        table.notify(1, PropertyAddress::output_master(Selector::Mute));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_remove_itself() {
        let table = Arc::new(ListenerTable::default());
        let hits = Arc::new(AtomicU64::new(0));

        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let (t, h, s) = (Arc::clone(&table), Arc::clone(&hits), Arc::clone(&slot));
        let id = table
            .add(
                PropertyAddress::global(Selector::Mute),
                Arc::new(move |_, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                    if let Some(id) = *s.lock().unwrap() {
                        let _ = t.remove(id);
                    }
                }),
            )
            .unwrap();
        *slot.lock().unwrap() = Some(id);

        table.notify(1, PropertyAddress::global(Selector::Mute));
        table.notify(1, PropertyAddress::global(Selector::Mute));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
