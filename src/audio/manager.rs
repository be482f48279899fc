use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::audio::controls::{DeviceControlSync, DeviceControlsList};
use crate::audio::devices::device::DeviceHandle;
use crate::audio::devices::registry::DeviceRegistry;
use crate::audio::devices::virtual_device::VirtualDevice;
use crate::audio::playthrough::Playthrough;
use crate::audio::rt_logger::RtLogger;
use crate::audio::scheduler::TaskScheduler;
use crate::audio::types::DeviceInfo;

/// How long a synchronous playthrough start waits for the output device.
const START_PLAYTHROUGH_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of a synchronous playthrough start. Serializable so callers on
/// the far side of an IPC boundary get a status, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaythroughStatus {
    /// The output device's callback reported it is running.
    Started,
    /// The output device refused to start IO.
    OutputDeviceNotStarting,
    /// The output device never reported in before the timeout.
    TimedOut,
}

/// Owns the audio subsystem: the device registry, the virtual capture
/// device, the playthrough engine, and the control sync, wired together.
pub struct DeviceManager {
    registry: Arc<DeviceRegistry>,
    scheduler: Arc<TaskScheduler>,
    rt_logger: Arc<RtLogger>,
    virtual_device: Arc<VirtualDevice>,
    playthrough: Playthrough,
    controls_list: Arc<DeviceControlsList>,
    control_sync: DeviceControlSync,
    output_device: Mutex<Option<DeviceHandle>>,
}

impl DeviceManager {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let scheduler = Arc::new(TaskScheduler::new());
        let rt_logger = Arc::new(RtLogger::new());

        let virtual_device =
            VirtualDevice::new(registry.allocate_device_id(), Arc::clone(&scheduler));
        let virtual_handle =
            DeviceHandle::new(Arc::clone(&virtual_device) as Arc<dyn crate::audio::devices::AudioDevice>);
        registry.register(virtual_handle.clone());
        registry.set_default_output_device(virtual_handle.clone());

        let controls_list = Arc::new(DeviceControlsList::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            virtual_handle,
            true,
        ));
        let control_sync = DeviceControlSync::new(Arc::clone(&controls_list));
        let playthrough = Playthrough::new(Arc::clone(&scheduler), Arc::clone(&rt_logger));

        Self {
            registry,
            scheduler,
            rt_logger,
            virtual_device,
            playthrough,
            controls_list,
            control_sync,
            output_device: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn rt_logger(&self) -> &Arc<RtLogger> {
        &self.rt_logger
    }

    pub fn virtual_device(&self) -> &Arc<VirtualDevice> {
        &self.virtual_device
    }

    pub fn playthrough(&self) -> &Playthrough {
        &self.playthrough
    }

    pub fn controls_list(&self) -> &Arc<DeviceControlsList> {
        &self.controls_list
    }

    pub fn output_device(&self) -> Option<DeviceHandle> {
        self.output_device.lock().ok()?.clone()
    }

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.registry.list_devices()
    }

    fn virtual_handle(&self) -> DeviceHandle {
        DeviceHandle::new(
            Arc::clone(&self.virtual_device) as Arc<dyn crate::audio::devices::AudioDevice>
        )
    }

    /// Routes playthrough and control sync to `device`. With
    /// `revert_on_failure`, a failed switch puts the previous output device
    /// back before reporting the error.
    pub fn set_output_device(&self, device: DeviceHandle, revert_on_failure: bool) -> Result<()> {
        let previous = self.output_device();

        tracing::info!(
            "{}: Switching output device to '{}'",
            "DEVICE_MANAGER".bright_cyan(),
            device.name()
        );

        match self.wire_output_device(&device) {
            Ok(()) => {
                if let Ok(mut slot) = self.output_device.lock() {
                    *slot = Some(device);
                }
                Ok(())
            }
            Err(err) => {
                if revert_on_failure {
                    if let Some(previous) = previous {
                        tracing::warn!(
                            "{}: Switch to '{}' failed, reverting to '{}'",
                            "DEVICE_MANAGER".bright_cyan(),
                            device.name(),
                            previous.name()
                        );
                        if let Err(revert_err) = self.set_output_device(previous, false) {
                            tracing::error!(
                                "{}: Revert failed too: {:#}",
                                "DEVICE_MANAGER_ERROR".bright_red(),
                                revert_err
                            );
                        }
                    }
                }
                Err(err).with_context(|| {
                    format!("failed to switch the output device to '{}'", device.name())
                })
            }
        }
    }

    fn wire_output_device(&self, device: &DeviceHandle) -> Result<()> {
        if !device.is_alive() {
            anyhow::bail!("device '{}' is not alive", device.name());
        }

        let virtual_handle = self.virtual_handle();
        self.playthrough
            .set_devices(Some(virtual_handle.clone()), Some(device.clone()))
            .context("failed to rewire playthrough")?;
        if !self.playthrough.is_active() {
            self.playthrough
                .activate()
                .context("failed to activate playthrough")?;
        }

        self.control_sync
            .set_devices(virtual_handle, device.clone())
            .context("failed to rewire control sync")?;
        if !self.control_sync.is_active() {
            self.control_sync
                .activate()
                .context("failed to activate control sync")?;
        }
        Ok(())
    }

    /// Starts playthrough and waits for the output device to report in.
    /// Shaped for an IPC boundary: always returns a status, never panics.
    pub fn start_playthrough_sync(&self) -> PlaythroughStatus {
        let result = catch_unwind(AssertUnwindSafe(|| {
            if let Err(err) = self.playthrough.start() {
                tracing::error!(
                    "{}: Output device refused to start: {:#}",
                    "DEVICE_MANAGER_ERROR".bright_red(),
                    err
                );
                return PlaythroughStatus::OutputDeviceNotStarting;
            }
            if self
                .playthrough
                .wait_for_output_to_start(START_PLAYTHROUGH_TIMEOUT)
            {
                PlaythroughStatus::Started
            } else {
                tracing::warn!(
                    "{}: Timed out waiting for the output device to start",
                    "DEVICE_MANAGER".bright_cyan()
                );
                PlaythroughStatus::TimedOut
            }
        }));

        result.unwrap_or_else(|_| {
            tracing::error!(
                "{}: Playthrough start panicked",
                "DEVICE_MANAGER_ERROR".bright_red()
            );
            PlaythroughStatus::OutputDeviceNotStarting
        })
    }

    /// Stops playthrough. Always succeeds; IO is stopped when this returns.
    pub fn stop_playthrough(&self) -> Result<()> {
        self.playthrough.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::simulated::SimulatedDevice;

    fn sim_output(registry: &DeviceRegistry, uid: &str) -> DeviceHandle {
        DeviceHandle::new(Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            uid,
            uid,
            Default::default(),
        )))
    }

    #[test]
    fn test_set_output_device_activates_everything() {
        let registry = Arc::new(DeviceRegistry::new());
        let manager = DeviceManager::new(Arc::clone(&registry));
        let speakers = sim_output(&registry, "speakers");
        registry.register(speakers.clone());

        manager.set_output_device(speakers.clone(), false).unwrap();
        assert!(manager.playthrough().is_active());
        assert_eq!(manager.output_device().unwrap().id(), speakers.id());
    }

    #[test]
    fn test_failed_switch_reverts_to_previous_device() {
        let registry = Arc::new(DeviceRegistry::new());
        let manager = DeviceManager::new(Arc::clone(&registry));
        let speakers = sim_output(&registry, "speakers");
        registry.register(speakers.clone());
        manager.set_output_device(speakers.clone(), false).unwrap();

        // Kill the device before switching to it.
        let dead_sim = Arc::new(SimulatedDevice::new(
            registry.allocate_device_id(),
            "dead",
            "Dead",
            Default::default(),
        ));
        dead_sim.set_alive(false);
        let dead = DeviceHandle::new(dead_sim as Arc<dyn crate::audio::devices::AudioDevice>);

        assert!(manager.set_output_device(dead, true).is_err());
        assert_eq!(manager.output_device().unwrap().id(), speakers.id());
        assert!(manager.playthrough().is_active());
    }

    #[test]
    fn test_start_playthrough_sync_never_panics() {
        let registry = Arc::new(DeviceRegistry::new());
        let manager = DeviceManager::new(registry);
        // No output device wired; the start must fail as a status.
        assert_eq!(
            manager.start_playthrough_sync(),
            PlaythroughStatus::OutputDeviceNotStarting
        );
    }
}
