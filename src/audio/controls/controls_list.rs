use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use colored::Colorize;

use crate::audio::devices::device::{DeviceError, DeviceHandle};
use crate::audio::devices::registry::DeviceRegistry;
use crate::audio::scheduler::{DeferredTask, TaskScheduler};
use crate::audio::types::Scope;

/// Delay before the first toggle phase, so a burst of control changes folds
/// into one toggle.
const TOGGLE_BEGIN_DELAY: Duration = Duration::from_millis(50);
/// Delay between the remaining toggle phases, giving clients time to follow
/// the default-device change.
const TOGGLE_PHASE_DELAY: Duration = Duration::from_millis(500);
/// How long `drop` waits for an in-flight toggle to finish.
const TOGGLE_DROP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToggleState {
    NotToggling,
    SettingNullDeviceAsDefault,
    SettingVirtualDeviceAsDefault,
    DisablingNullDevice,
}

struct Inner {
    virtual_device: DeviceHandle,
    toggle_state: ToggleState,
    begin_task: DeferredTask,
    restore_task: DeferredTask,
    disable_task: DeferredTask,
}

struct ListShared {
    registry: Arc<DeviceRegistry>,
    scheduler: Arc<TaskScheduler>,
    can_toggle: bool,
    inner: Mutex<Inner>,
}

/// Keeps the virtual device's published controls matched to the real output
/// device's, and forces clients to re-read them when the set changes.
///
/// Clients cache a device's control list when they first see the device, so
/// changing the virtual device's enabled controls in place isn't enough.
/// After a change, the default output device is briefly toggled to the hidden
/// Null Device and back, which makes every client drop and re-read the
/// virtual device. The toggle runs in three deferred phases (50ms, then 500ms
/// between phases) so clients can follow each default-device change.
pub struct DeviceControlsList {
    shared: Arc<ListShared>,
}

impl DeviceControlsList {
    /// `can_toggle` is decided once here; systems where the toggle protocol
    /// cannot work pass false and control-list changes then apply silently.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        scheduler: Arc<TaskScheduler>,
        virtual_device: DeviceHandle,
        can_toggle: bool,
    ) -> Self {
        Self {
            shared: Arc::new(ListShared {
                registry,
                scheduler,
                can_toggle,
                inner: Mutex::new(Inner {
                    virtual_device,
                    toggle_state: ToggleState::NotToggling,
                    begin_task: DeferredTask::completed(),
                    restore_task: DeferredTask::completed(),
                    disable_task: DeferredTask::completed(),
                }),
            }),
        }
    }

    /// Converges the virtual device's `[volume, mute]` enabled-controls array
    /// to `output`'s capabilities. Returns whether anything changed; the
    /// caller decides whether to propagate.
    pub fn match_controls_list_of(&self, output: &DeviceHandle) -> Result<bool, DeviceError> {
        let desired = [
            output.has_settable_master_volume(Scope::Output)
                || output.has_settable_virtual_master_volume(Scope::Output),
            output.has_settable_master_mute(Scope::Output),
        ];

        let inner = self.shared.lock_inner()?;
        let current = inner.virtual_device.enabled_output_controls()?;
        if current == desired {
            return Ok(false);
        }

        tracing::info!(
            "{}: Matching controls to '{}', volume: {}, mute: {}",
            "CTRL_LIST".bright_cyan(),
            output.name(),
            desired[0],
            desired[1]
        );
        inner.virtual_device.set_enabled_output_controls(desired)?;
        Ok(true)
    }

    /// Begins the Null Device toggle so clients pick up the changed control
    /// list. A toggle already in flight absorbs the new change; nothing is
    /// queued behind it.
    pub fn propagate_control_list_change(&self) -> Result<(), DeviceError> {
        if !self.shared.can_toggle {
            tracing::debug!(
                "{}: Default-device toggling unavailable, clients will pick the change up lazily",
                "CTRL_LIST".bright_cyan()
            );
            return Ok(());
        }

        let mut inner = self.shared.lock_inner()?;

        // Only toggle when the virtual device is the default output. If the
        // user picked another device, forcing the virtual device back would
        // hijack their choice; those clients re-read the controls lazily.
        let default_is_virtual = self
            .shared
            .registry
            .default_output_device()
            .map(|device| device.id() == inner.virtual_device.id())
            .unwrap_or(false);
        if !default_is_virtual {
            tracing::debug!(
                "{}: Virtual device is not the default output, skipping the toggle",
                "CTRL_LIST".bright_cyan()
            );
            return Ok(());
        }

        if inner.toggle_state != ToggleState::NotToggling {
            tracing::debug!(
                "{}: Toggle already in flight, absorbing the change",
                "CTRL_LIST".bright_cyan()
            );
            return Ok(());
        }

        inner.toggle_state = ToggleState::SettingNullDeviceAsDefault;
        let shared = Arc::clone(&self.shared);
        inner.begin_task.cancel();
        inner.begin_task = self.shared.scheduler.defer(TOGGLE_BEGIN_DELAY, move || {
            shared.phase_set_null_device_as_default();
        });
        Ok(())
    }
}

impl ListShared {
    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>, DeviceError> {
        self.inner
            .lock()
            .map_err(|_| DeviceError::HostError("controls-list state poisoned".to_string()))
    }

    // Phase 1: publish the Null Device and make it the default, pushing
    // clients off the virtual device.
    fn phase_set_null_device_as_default(self: &Arc<Self>) {
        // Enabling the Null Device fires device-list listeners on this
        // thread, so it happens before the state lock is taken.
        self.registry.set_null_device_enabled(true);

        let Ok(mut inner) = self.lock_inner() else {
            return;
        };
        if inner.toggle_state != ToggleState::SettingNullDeviceAsDefault {
            return;
        }
        tracing::debug!(
            "{}: Setting the null device as the default device",
            "CTRL_LIST".bright_cyan()
        );
        self.registry
            .set_default_output_device(self.registry.null_device());

        inner.toggle_state = ToggleState::SettingVirtualDeviceAsDefault;
        let shared = Arc::clone(self);
        inner.restore_task.cancel();
        inner.restore_task = self.scheduler.defer(TOGGLE_PHASE_DELAY, move || {
            shared.phase_set_virtual_device_as_default();
        });
    }

    // Phase 2: make the virtual device the default again; clients re-read
    // its control list as they move back.
    fn phase_set_virtual_device_as_default(self: &Arc<Self>) {
        let Ok(mut inner) = self.lock_inner() else {
            return;
        };
        if inner.toggle_state != ToggleState::SettingVirtualDeviceAsDefault {
            return;
        }
        tracing::debug!(
            "{}: Setting the virtual device back as the default device",
            "CTRL_LIST".bright_cyan()
        );
        self.registry
            .set_default_output_device(inner.virtual_device.clone());

        inner.toggle_state = ToggleState::DisablingNullDevice;
        let shared = Arc::clone(self);
        inner.disable_task.cancel();
        inner.disable_task = self.scheduler.defer(TOGGLE_PHASE_DELAY, move || {
            shared.phase_disable_null_device();
        });
    }

    // Phase 3: hide the Null Device again.
    fn phase_disable_null_device(self: &Arc<Self>) {
        {
            let Ok(mut inner) = self.lock_inner() else {
                return;
            };
            if inner.toggle_state != ToggleState::DisablingNullDevice {
                return;
            }
            inner.toggle_state = ToggleState::NotToggling;
            // The guard drops here: disabling the Null Device fires
            // device-list listeners synchronously, and one of them may call
            // back into this list.
        }
        self.registry.set_null_device_enabled(false);
        tracing::debug!("{}: Toggle finished", "CTRL_LIST".bright_cyan());
    }

    fn toggle_in_flight(&self) -> bool {
        self.lock_inner()
            .map(|inner| inner.toggle_state != ToggleState::NotToggling)
            .unwrap_or(false)
    }
}

impl Drop for DeviceControlsList {
    fn drop(&mut self) {
        // Leaving the Null Device as the default would strand clients on a
        // device that is about to disappear, so wait for an in-flight toggle.
        let deadline = Instant::now() + TOGGLE_DROP_TIMEOUT;
        while self.shared.toggle_in_flight() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "{}: Dropped with a default-device toggle still in flight",
                    "CTRL_LIST".bright_cyan()
                );
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::simulated::{SimulatedCapabilities, SimulatedDevice};
    use crate::audio::devices::virtual_device::VirtualDevice;
    use crate::audio::types::NULL_DEVICE_UID;

    fn setup() -> (Arc<DeviceRegistry>, DeviceControlsList, DeviceHandle) {
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = Arc::new(TaskScheduler::new());
        let virtual_device = DeviceHandle::new(VirtualDevice::new(
            registry.allocate_device_id(),
            Arc::clone(&scheduler),
        ));
        registry.register(virtual_device.clone());
        registry.set_default_output_device(virtual_device.clone());
        let list = DeviceControlsList::new(
            Arc::clone(&registry),
            scheduler,
            virtual_device.clone(),
            true,
        );
        (registry, list, virtual_device)
    }

    #[test]
    fn test_match_reports_changes_only() {
        let (registry, list, virtual_device) = setup();

        let full = DeviceHandle::new(Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            "full",
            "Full Controls",
            Default::default(),
        )));
        // The virtual device starts with both controls enabled.
        assert!(!list.match_controls_list_of(&full).unwrap());

        let bare = DeviceHandle::new(Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            "bare",
            "No Controls",
            SimulatedCapabilities::inert(),
        )));
        assert!(list.match_controls_list_of(&bare).unwrap());
        assert_eq!(
            virtual_device.enabled_output_controls().unwrap(),
            [false, false]
        );
        assert!(!list.match_controls_list_of(&bare).unwrap());

        assert!(list.match_controls_list_of(&full).unwrap());
        assert_eq!(
            virtual_device.enabled_output_controls().unwrap(),
            [true, true]
        );
    }

    #[test]
    fn test_toggle_visits_null_device_and_returns() {
        let (registry, list, virtual_device) = setup();

        list.propagate_control_list_change().unwrap();

        // Null device becomes the default during the toggle.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "null device never became default");
            let default = registry.default_output_device().unwrap();
            if default.uid() == NULL_DEVICE_UID {
                assert!(registry.null_device_enabled());
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        // And the virtual device comes back, with the null device hidden.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "toggle never finished");
            let default = registry.default_output_device().unwrap();
            if default.id() == virtual_device.id() && !registry.null_device_enabled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_in_flight_toggle_absorbs_new_changes() {
        let (registry, list, _virtual_device) = setup();

        list.propagate_control_list_change().unwrap();
        // A second request during the toggle is absorbed, not queued; the
        // toggle still completes exactly once.
        list.propagate_control_list_change().unwrap();
        list.propagate_control_list_change().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_null = false;
        loop {
            if registry.null_device_enabled() {
                saw_null = true;
            }
            if saw_null && !registry.null_device_enabled() {
                break;
            }
            assert!(Instant::now() < deadline, "toggle never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
        // Settled: nothing re-enables the null device afterwards.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!registry.null_device_enabled());
    }

    #[test]
    fn test_toggle_skipped_when_user_chose_another_default() {
        let (registry, list, _virtual_device) = setup();

        let speakers = DeviceHandle::new(Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            "speakers",
            "Speakers",
            Default::default(),
        )));
        registry.register(speakers.clone());
        registry.set_default_output_device(speakers.clone());

        list.propagate_control_list_change().unwrap();
        std::thread::sleep(Duration::from_millis(200));

        // The user's choice stands and the null device was never published.
        assert_eq!(
            registry.default_output_device().unwrap().id(),
            speakers.id()
        );
        assert!(!registry.null_device_enabled());
    }

    #[test]
    fn test_cannot_toggle_applies_silently() {
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = Arc::new(TaskScheduler::new());
        let virtual_device = DeviceHandle::new(VirtualDevice::new(
            registry.allocate_device_id(),
            Arc::clone(&scheduler),
        ));
        let list = DeviceControlsList::new(
            Arc::clone(&registry),
            scheduler,
            virtual_device,
            false,
        );

        list.propagate_control_list_change().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(!registry.null_device_enabled());
    }
}
