use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use colored::Colorize;

use crate::audio::controls::controls_list::DeviceControlsList;
use crate::audio::devices::device::{DeviceHandle, PropertyListener};
use crate::audio::types::{
    ListenerId, PropertyAddress, Scope, Selector, MASTER_CHANNEL,
};

struct SyncInner {
    virtual_device: Option<DeviceHandle>,
    output_device: Option<DeviceHandle>,
    active: bool,
    volume_listener: Option<ListenerId>,
    mute_listener: Option<ListenerId>,
}

struct SyncShared {
    inner: Mutex<SyncInner>,
}

/// Mirrors the virtual device's volume and mute controls onto the real
/// output device.
///
/// While active, a change to the virtual device's volume or mute (the
/// controls users actually see) is copied straight to the output device.
/// Activation is all-or-nothing: if the mute listener cannot be registered,
/// the volume listener is rolled back so the two controls never drift apart.
pub struct DeviceControlSync {
    controls_list: Arc<DeviceControlsList>,
    shared: Arc<SyncShared>,
}

impl DeviceControlSync {
    pub fn new(controls_list: Arc<DeviceControlsList>) -> Self {
        Self {
            controls_list,
            shared: Arc::new(SyncShared {
                inner: Mutex::new(SyncInner {
                    virtual_device: None,
                    output_device: None,
                    active: false,
                    volume_listener: None,
                    mute_listener: None,
                }),
            }),
        }
    }

    /// Points the sync at a new device pair, restarting it if it was active.
    pub fn set_devices(
        &self,
        virtual_device: DeviceHandle,
        output_device: DeviceHandle,
    ) -> Result<()> {
        let was_active = {
            let mut inner = self.shared.lock_inner()?;
            let was_active = inner.active;
            if was_active {
                self.shared.deactivate_locked(&mut inner);
            }
            inner.virtual_device = Some(virtual_device);
            inner.output_device = Some(output_device);
            was_active
        };
        if was_active {
            self.activate()?;
        }
        Ok(())
    }

    /// Starts mirroring. Matches the virtual device's control list to the
    /// output device, copies the output device's current volume and mute to
    /// the virtual device, then registers the change listeners.
    pub fn activate(&self) -> Result<()> {
        let mut inner = self.shared.lock_inner()?;
        if inner.active {
            return Ok(());
        }
        let virtual_device = inner
            .virtual_device
            .clone()
            .context("no virtual device set")?;
        let output_device = inner
            .output_device
            .clone()
            .context("no output device set")?;

        tracing::info!(
            "{}: Activating control sync to '{}'",
            "CTRL_SYNC".bright_cyan(),
            output_device.name()
        );

        // A failure to match or propagate the control list degrades the UI
        // but not the sync itself, so it is tolerated.
        match self.controls_list.match_controls_list_of(&output_device) {
            Ok(true) => {
                if let Err(err) = self.controls_list.propagate_control_list_change() {
                    tracing::warn!(
                        "{}: Failed to propagate the control-list change: {}",
                        "CTRL_SYNC".bright_cyan(),
                        err
                    );
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    "{}: Failed to match the control list: {}",
                    "CTRL_SYNC".bright_cyan(),
                    err
                );
            }
        }

        // Seed the virtual device's controls from the hardware so the user
        // sees the real state. Volume first, then mute, matching the order
        // the listeners mirror them back.
        if let Err(err) = virtual_device.copy_volume_from(&output_device, Scope::Output) {
            tracing::warn!(
                "{}: Failed to copy the output device's volume: {}",
                "CTRL_SYNC".bright_cyan(),
                err
            );
        }
        if let Err(err) = virtual_device.copy_mute_from(&output_device, Scope::Output) {
            tracing::warn!(
                "{}: Failed to copy the output device's mute state: {}",
                "CTRL_SYNC".bright_cyan(),
                err
            );
        }

        let volume_listener = virtual_device
            .add_property_listener(
                PropertyAddress::output_master(Selector::VolumeScalar),
                self.shared.make_mirror_listener(),
            )
            .context("failed to register the volume listener")?;

        let mute_listener = match virtual_device.add_property_listener(
            PropertyAddress::output_master(Selector::Mute),
            self.shared.make_mirror_listener(),
        ) {
            Ok(id) => id,
            Err(err) => {
                // All-or-nothing: a half-registered sync would mirror volume
                // but silently drop mute changes.
                let _ = virtual_device.remove_property_listener(volume_listener);
                return Err(err).context("failed to register the mute listener");
            }
        };

        inner.volume_listener = Some(volume_listener);
        inner.mute_listener = Some(mute_listener);
        inner.active = true;
        Ok(())
    }

    pub fn deactivate(&self) -> Result<()> {
        let mut inner = self.shared.lock_inner()?;
        self.shared.deactivate_locked(&mut inner);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .lock_inner()
            .map(|inner| inner.active)
            .unwrap_or(false)
    }
}

impl SyncShared {
    fn lock_inner(&self) -> Result<MutexGuard<'_, SyncInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("control-sync state poisoned"))
    }

    fn deactivate_locked(&self, inner: &mut SyncInner) {
        if !inner.active {
            return;
        }
        if let Some(virtual_device) = &inner.virtual_device {
            if let Some(id) = inner.volume_listener.take() {
                let _ = virtual_device.remove_property_listener(id);
            }
            if let Some(id) = inner.mute_listener.take() {
                let _ = virtual_device.remove_property_listener(id);
            }
        }
        inner.active = false;
    }

    fn make_mirror_listener(self: &Arc<Self>) -> PropertyListener {
        let weak: Weak<SyncShared> = Arc::downgrade(self);
        Arc::new(move |device_id, address| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Ok(inner) = shared.inner.lock() else {
                return;
            };
            if !inner.active {
                return;
            }
            let (Some(virtual_device), Some(output_device)) =
                (inner.virtual_device.clone(), inner.output_device.clone())
            else {
                return;
            };
            // Notifications from anything but the known virtual device are
            // stale registrations; ignore them.
            if device_id != virtual_device.id() {
                return;
            }
            drop(inner);

            match address.selector {
                Selector::VolumeScalar => {
                    if let Err(err) = output_device.copy_volume_from(&virtual_device, Scope::Output)
                    {
                        tracing::warn!(
                            "{}: Failed to mirror volume to '{}': {}",
                            "CTRL_SYNC_ERROR".bright_red(),
                            output_device.name(),
                            err
                        );
                    }
                }
                Selector::Mute => {
                    // Some devices send mute notifications they don't mean;
                    // copy_mute_from reads the actual state, so a spurious
                    // notification just rewrites the same value.
                    if !virtual_device.has_mute(Scope::Output, MASTER_CHANNEL) {
                        return;
                    }
                    if let Err(err) = output_device.copy_mute_from(&virtual_device, Scope::Output) {
                        tracing::warn!(
                            "{}: Failed to mirror mute to '{}': {}",
                            "CTRL_SYNC_ERROR".bright_red(),
                            output_device.name(),
                            err
                        );
                    }
                }
                _ => {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::registry::DeviceRegistry;
    use crate::audio::devices::simulated::SimulatedDevice;
    use crate::audio::devices::AudioDevice;
    use crate::audio::devices::virtual_device::VirtualDevice;
    use crate::audio::scheduler::TaskScheduler;

    fn setup() -> (DeviceControlSync, DeviceHandle, Arc<SimulatedDevice>) {
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = Arc::new(TaskScheduler::new());
        let virtual_device = DeviceHandle::new(VirtualDevice::new(
            registry.allocate_device_id(),
            Arc::clone(&scheduler),
        ));
        let output = Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            "speakers",
            "Speakers",
            Default::default(),
        ));
        let controls_list = Arc::new(DeviceControlsList::new(
            Arc::clone(&registry),
            scheduler,
            virtual_device.clone(),
            // No toggling in these tests; the list still matches controls.
            false,
        ));
        let sync = DeviceControlSync::new(controls_list);
        sync.set_devices(
            virtual_device.clone(),
            DeviceHandle::new(Arc::clone(&output) as Arc<dyn crate::audio::devices::AudioDevice>),
        )
        .unwrap();
        (sync, virtual_device, output)
    }

    #[test]
    fn test_activation_seeds_virtual_controls_from_hardware() {
        let (sync, virtual_device, output) = setup();
        output.set_volume(Scope::Output, MASTER_CHANNEL, 0.25).unwrap();
        output.set_mute(Scope::Output, MASTER_CHANNEL, true).unwrap();

        sync.activate().unwrap();
        assert_eq!(
            virtual_device.volume(Scope::Output, MASTER_CHANNEL).unwrap(),
            0.25
        );
        assert!(virtual_device.mute(Scope::Output, MASTER_CHANNEL).unwrap());
    }

    #[test]
    fn test_virtual_changes_mirror_to_output() {
        let (sync, virtual_device, output) = setup();
        sync.activate().unwrap();

        virtual_device
            .set_volume(Scope::Output, MASTER_CHANNEL, 0.6)
            .unwrap();
        assert_eq!(output.volume(Scope::Output, MASTER_CHANNEL).unwrap(), 0.6);

        virtual_device
            .set_mute(Scope::Output, MASTER_CHANNEL, true)
            .unwrap();
        assert!(output.mute(Scope::Output, MASTER_CHANNEL).unwrap());
    }

    #[test]
    fn test_deactivated_sync_stops_mirroring() {
        let (sync, virtual_device, output) = setup();
        sync.activate().unwrap();
        sync.deactivate().unwrap();

        virtual_device
            .set_volume(Scope::Output, MASTER_CHANNEL, 0.9)
            .unwrap();
        assert_ne!(output.volume(Scope::Output, MASTER_CHANNEL).unwrap(), 0.9);
    }

    #[test]
    fn test_activate_is_idempotent() {
        let (sync, _virtual_device, _output) = setup();
        sync.activate().unwrap();
        sync.activate().unwrap();
        assert!(sync.is_active());
    }

    #[test]
    fn test_failed_mute_listener_rolls_back_volume_listener() {
        // Stand a simulated device in for the virtual side so listener
        // registration can be made to fail partway through.
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = Arc::new(TaskScheduler::new());
        let fake_virtual = Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            "fake-virtual",
            "Fake Virtual",
            Default::default(),
        ));
        let output = Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            "speakers",
            "Speakers",
            Default::default(),
        ));
        let controls_list = Arc::new(DeviceControlsList::new(
            Arc::clone(&registry),
            scheduler,
            DeviceHandle::new(Arc::clone(&fake_virtual) as Arc<dyn crate::audio::devices::AudioDevice>),
            false,
        ));
        let sync = DeviceControlSync::new(controls_list);
        sync.set_devices(
            DeviceHandle::new(Arc::clone(&fake_virtual) as Arc<dyn crate::audio::devices::AudioDevice>),
            DeviceHandle::new(Arc::clone(&output) as Arc<dyn crate::audio::devices::AudioDevice>),
        )
        .unwrap();

        // Volume listener registers, mute listener is refused.
        fake_virtual.fail_listener_registration_after(1);
        assert!(sync.activate().is_err());
        assert!(!sync.is_active());

        // The volume listener must have been rolled back with it.
        output.set_volume(Scope::Output, MASTER_CHANNEL, 0.5).unwrap();
        fake_virtual
            .set_volume(Scope::Output, MASTER_CHANNEL, 0.9)
            .unwrap();
        assert_eq!(output.volume(Scope::Output, MASTER_CHANNEL).unwrap(), 0.5);
    }
}
