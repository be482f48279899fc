use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::audio::devices::device::{
    AudioDevice, DeviceError, IoBuffer, IoDirection, IoProcHandler, IoProcTable, ListenerTable,
    PropertyListener,
};
use crate::audio::types::{
    DeviceId, IoCycle, IoProcId, ListenerId, PropertyAddress, Scope, Selector, MASTER_CHANNEL,
};

/// What controls a [`SimulatedDevice`] exposes and which of them can be set.
#[derive(Debug, Clone)]
pub struct SimulatedCapabilities {
    pub input_channels: u32,
    pub output_channels: u32,
    pub has_master_volume: bool,
    pub master_volume_settable: bool,
    pub has_per_channel_volume: bool,
    pub per_channel_volume_settable: bool,
    pub has_virtual_master_volume: bool,
    pub has_master_mute: bool,
    pub master_mute_settable: bool,
    pub sample_rate_settable: bool,
    pub io_buffer_size_settable: bool,
}

impl Default for SimulatedCapabilities {
    fn default() -> Self {
        Self {
            input_channels: 0,
            output_channels: 2,
            has_master_volume: true,
            master_volume_settable: true,
            has_per_channel_volume: false,
            per_channel_volume_settable: false,
            has_virtual_master_volume: false,
            has_master_mute: true,
            master_mute_settable: true,
            sample_rate_settable: true,
            io_buffer_size_settable: true,
        }
    }
}

impl SimulatedCapabilities {
    /// No controls at all, like the hidden Null Device.
    pub fn inert() -> Self {
        Self {
            input_channels: 0,
            output_channels: 2,
            has_master_volume: false,
            master_volume_settable: false,
            has_per_channel_volume: false,
            per_channel_volume_settable: false,
            has_virtual_master_volume: false,
            has_master_mute: false,
            master_mute_settable: false,
            sample_rate_settable: true,
            io_buffer_size_settable: true,
        }
    }

    /// Per-channel volume only, no master controls.
    pub fn per_channel_only() -> Self {
        Self {
            has_master_volume: false,
            master_volume_settable: false,
            has_per_channel_volume: true,
            per_channel_volume_settable: true,
            ..Self::default()
        }
    }
}

struct ControlState {
    master_volume: f32,
    channel_volumes: Vec<f32>,
    virtual_master_volume: f32,
    virtual_master_balance: f32,
    master_mute: bool,
    sample_rate: f64,
    io_buffer_size: usize,
}

/// An in-process audio endpoint driven by a manual clock.
///
/// Tests and the hidden Null Device use this in place of hardware: callers
/// advance time themselves with [`run_input_cycle`]/[`run_output_cycle`],
/// which invoke the started IOProcs with an explicit sample time.
///
/// [`run_input_cycle`]: SimulatedDevice::run_input_cycle
/// [`run_output_cycle`]: SimulatedDevice::run_output_cycle
pub struct SimulatedDevice {
    id: DeviceId,
    uid: String,
    name: String,
    hidden: bool,
    capabilities: SimulatedCapabilities,
    alive: AtomicBool,
    controls: Mutex<ControlState>,
    procs: IoProcTable,
    listeners: ListenerTable,
    // Test knobs.
    notify_mute_on_volume_change: AtomicBool,
    // Registrations allowed before add_property_listener starts failing;
    // negative means never fail.
    listener_registrations_before_failure: AtomicI64,
}

impl SimulatedDevice {
    pub fn new(
        id: DeviceId,
        uid: impl Into<String>,
        name: impl Into<String>,
        capabilities: SimulatedCapabilities,
    ) -> Self {
        let channel_count =
            capabilities.input_channels.max(capabilities.output_channels) as usize;
        Self {
            id,
            uid: uid.into(),
            name: name.into(),
            hidden: false,
            alive: AtomicBool::new(true),
            controls: Mutex::new(ControlState {
                master_volume: 0.75,
                channel_volumes: vec![0.75; channel_count],
                virtual_master_volume: 0.75,
                virtual_master_balance: 0.5,
                master_mute: false,
                sample_rate: 44100.0,
                io_buffer_size: 512,
            }),
            capabilities,
            procs: IoProcTable::default(),
            listeners: ListenerTable::default(),
            notify_mute_on_volume_change: AtomicBool::new(false),
            listener_registrations_before_failure: AtomicI64::new(-1),
        }
    }

    /// Like [`new`](Self::new), with a generated UID for callers that only
    /// need it to be unique.
    pub fn with_generated_uid(
        id: DeviceId,
        name: impl Into<String>,
        capabilities: SimulatedCapabilities,
    ) -> Self {
        let uid = format!("playthru-sim-{}", uuid::Uuid::new_v4());
        Self::new(id, uid, name, capabilities)
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Some hardware sends a spurious mute notification when only the volume
    /// changed. This knob reproduces that.
    pub fn set_notify_mute_on_volume_change(&self, enabled: bool) {
        self.notify_mute_on_volume_change
            .store(enabled, Ordering::Release);
    }

    /// Allows `successes` more listener registrations, then makes
    /// `add_property_listener` fail, for exercising registration-rollback
    /// paths.
    pub fn fail_listener_registration_after(&self, successes: i64) {
        self.listener_registrations_before_failure
            .store(successes, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.procs.is_running()
    }

    fn controls(&self) -> Result<std::sync::MutexGuard<'_, ControlState>, DeviceError> {
        self.controls
            .lock()
            .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))
    }

    fn check_alive(&self) -> Result<(), DeviceError> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DeviceError::NotAlive)
        }
    }

    fn run_cycle(&self, direction: IoDirection, cycle: IoCycle, frames: &mut [f32]) {
        for (started, handler) in self.procs.started_handlers(direction) {
            // A handler may have stopped this proc earlier in the same cycle.
            if !started.load(Ordering::Acquire) {
                continue;
            }
            let Ok(mut handler) = handler.lock() else {
                continue;
            };
            match direction {
                IoDirection::Input => handler(&cycle, IoBuffer::Input(frames)),
                IoDirection::Output => handler(&cycle, IoBuffer::Output(frames)),
            }
        }
    }

    /// Delivers one cycle of captured frames to the started input IOProcs.
    pub fn run_input_cycle(&self, sample_time: f64, host_time: u64, frames: &[f32]) {
        let channels = self.capabilities.input_channels.max(1) as usize;
        let cycle = IoCycle {
            sample_time,
            host_time,
            frames: frames.len() / channels,
        };
        let mut data = frames.to_vec();
        self.run_cycle(IoDirection::Input, cycle, &mut data);
    }

    /// Asks the started output IOProcs to render one cycle. Returns the
    /// rendered (initially silent) frames.
    pub fn run_output_cycle(&self, sample_time: f64, host_time: u64, frame_count: usize) -> Vec<f32> {
        let channels = self.capabilities.output_channels.max(1) as usize;
        let cycle = IoCycle {
            sample_time,
            host_time,
            frames: frame_count,
        };
        let mut data = vec![0.0f32; frame_count * channels];
        self.run_cycle(IoDirection::Output, cycle, &mut data);
        data
    }

    fn has_volume_control(&self, scope: Scope, channel: u32) -> bool {
        if scope == Scope::Input && self.capabilities.input_channels == 0 {
            return false;
        }
        if channel == MASTER_CHANNEL {
            self.capabilities.has_master_volume
        } else {
            self.capabilities.has_per_channel_volume
                && channel <= self.total_channels(scope) as u32
        }
    }
}

impl AudioDevice for SimulatedDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn uid(&self) -> &str {
        &self.uid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn is_hidden(&self) -> bool {
        self.hidden
    }

    fn nominal_sample_rate(&self) -> Result<f64, DeviceError> {
        Ok(self.controls()?.sample_rate)
    }

    fn set_nominal_sample_rate(&self, rate: f64) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.capabilities.sample_rate_settable {
            return Err(DeviceError::NotSettable);
        }
        let changed = {
            let mut controls = self.controls()?;
            let changed = controls.sample_rate != rate;
            controls.sample_rate = rate;
            changed
        };
        if changed {
            self.listeners
                .notify(self.id, PropertyAddress::global(Selector::NominalSampleRate));
        }
        Ok(())
    }

    fn io_buffer_size(&self) -> Result<usize, DeviceError> {
        Ok(self.controls()?.io_buffer_size)
    }

    fn set_io_buffer_size(&self, frames: usize) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.capabilities.io_buffer_size_settable {
            return Err(DeviceError::NotSettable);
        }
        self.controls()?.io_buffer_size = frames;
        Ok(())
    }

    fn total_channels(&self, scope: Scope) -> usize {
        match scope {
            Scope::Input => self.capabilities.input_channels as usize,
            Scope::Output => self.capabilities.output_channels as usize,
            Scope::Global => {
                (self.capabilities.input_channels + self.capabilities.output_channels) as usize
            }
        }
    }

    fn has_volume(&self, scope: Scope, channel: u32) -> bool {
        self.has_volume_control(scope, channel)
    }

    fn volume_is_settable(&self, scope: Scope, channel: u32) -> bool {
        if !self.has_volume_control(scope, channel) {
            return false;
        }
        if channel == MASTER_CHANNEL {
            self.capabilities.master_volume_settable
        } else {
            self.capabilities.per_channel_volume_settable
        }
    }

    fn volume(&self, scope: Scope, channel: u32) -> Result<f32, DeviceError> {
        if !self.has_volume_control(scope, channel) {
            return Err(DeviceError::Unsupported);
        }
        let controls = self.controls()?;
        if channel == MASTER_CHANNEL {
            Ok(controls.master_volume)
        } else {
            Ok(controls.channel_volumes[(channel - 1) as usize])
        }
    }

    fn set_volume(&self, scope: Scope, channel: u32, volume: f32) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.volume_is_settable(scope, channel) {
            if self.has_volume_control(scope, channel) {
                return Err(DeviceError::NotSettable);
            }
            return Err(DeviceError::Unsupported);
        }
        {
            let mut controls = self.controls()?;
            if channel == MASTER_CHANNEL {
                controls.master_volume = volume.clamp(0.0, 1.0);
            } else {
                controls.channel_volumes[(channel - 1) as usize] = volume.clamp(0.0, 1.0);
            }
        }
        self.listeners.notify(
            self.id,
            PropertyAddress {
                selector: Selector::VolumeScalar,
                scope,
                element: channel,
            },
        );
        if self.notify_mute_on_volume_change.load(Ordering::Acquire) {
            self.listeners.notify(
                self.id,
                PropertyAddress {
                    selector: Selector::Mute,
                    scope,
                    element: MASTER_CHANNEL,
                },
            );
        }
        Ok(())
    }

    fn has_mute(&self, scope: Scope, channel: u32) -> bool {
        if scope == Scope::Input && self.capabilities.input_channels == 0 {
            return false;
        }
        channel == MASTER_CHANNEL && self.capabilities.has_master_mute
    }

    fn mute_is_settable(&self, scope: Scope, channel: u32) -> bool {
        self.has_mute(scope, channel) && self.capabilities.master_mute_settable
    }

    fn mute(&self, scope: Scope, channel: u32) -> Result<bool, DeviceError> {
        if !self.has_mute(scope, channel) {
            return Err(DeviceError::Unsupported);
        }
        Ok(self.controls()?.master_mute)
    }

    fn set_mute(&self, scope: Scope, channel: u32, mute: bool) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.mute_is_settable(scope, channel) {
            if self.has_mute(scope, channel) {
                return Err(DeviceError::NotSettable);
            }
            return Err(DeviceError::Unsupported);
        }
        let changed = {
            let mut controls = self.controls()?;
            let changed = controls.master_mute != mute;
            controls.master_mute = mute;
            changed
        };
        if changed {
            self.listeners.notify(
                self.id,
                PropertyAddress {
                    selector: Selector::Mute,
                    scope,
                    element: MASTER_CHANNEL,
                },
            );
        }
        Ok(())
    }

    fn has_virtual_master_volume(&self, scope: Scope) -> bool {
        scope == Scope::Output && self.capabilities.has_virtual_master_volume
    }

    fn virtual_master_volume(&self, scope: Scope) -> Result<f32, DeviceError> {
        if !self.has_virtual_master_volume(scope) {
            return Err(DeviceError::Unsupported);
        }
        Ok(self.controls()?.virtual_master_volume)
    }

    fn set_virtual_master_volume(&self, scope: Scope, volume: f32) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.has_virtual_master_volume(scope) {
            return Err(DeviceError::Unsupported);
        }
        let mut controls = self.controls()?;
        controls.virtual_master_volume = volume.clamp(0.0, 1.0);
        // Writing the virtual master volume recentres the balance, like the
        // hardware this stands in for.
        controls.virtual_master_balance = 0.5;
        Ok(())
    }

    fn virtual_master_balance(&self, scope: Scope) -> Result<f32, DeviceError> {
        if !self.has_virtual_master_volume(scope) {
            return Err(DeviceError::Unsupported);
        }
        Ok(self.controls()?.virtual_master_balance)
    }

    fn set_virtual_master_balance(&self, scope: Scope, balance: f32) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.has_virtual_master_volume(scope) {
            return Err(DeviceError::Unsupported);
        }
        self.controls()?.virtual_master_balance = balance.clamp(0.0, 1.0);
        Ok(())
    }

    fn create_io_proc(
        &self,
        direction: IoDirection,
        handler: IoProcHandler,
    ) -> Result<IoProcId, DeviceError> {
        self.check_alive()?;
        self.procs.create(direction, handler)
    }

    fn destroy_io_proc(&self, id: IoProcId) -> Result<(), DeviceError> {
        self.procs.destroy(id)
    }

    fn start_io_proc(&self, id: Option<IoProcId>) -> Result<(), DeviceError> {
        self.check_alive()?;
        self.procs.start(id)
    }

    fn stop_io_proc(&self, id: Option<IoProcId>) -> Result<(), DeviceError> {
        self.procs.stop(id)
    }

    fn add_property_listener(
        &self,
        address: PropertyAddress,
        listener: PropertyListener,
    ) -> Result<ListenerId, DeviceError> {
        let refused = self
            .listener_registrations_before_failure
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                if remaining > 0 {
                    Some(remaining - 1)
                } else {
                    // Negative means unlimited; zero means refuse.
                    None
                }
            })
            .is_err()
            && self
                .listener_registrations_before_failure
                .load(Ordering::Acquire)
                == 0;
        if refused {
            return Err(DeviceError::HostError(
                "listener registration refused".to_string(),
            ));
        }
        self.listeners.add(address, listener)
    }

    fn remove_property_listener(&self, id: ListenerId) -> Result<(), DeviceError> {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::devices::device::DeviceHandle;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn output_device() -> SimulatedDevice {
        SimulatedDevice::new(10, "sim-out", "Simulated Output", Default::default())
    }

    #[test]
    fn test_output_cycle_invokes_started_procs_only() {
        let device = output_device();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let id = device
            .create_io_proc(
                IoDirection::Output,
                Box::new(move |_, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        device.run_output_cycle(0.0, 0, 64);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        device.start_io_proc(Some(id)).unwrap();
        device.run_output_cycle(64.0, 0, 64);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        device.stop_io_proc(Some(id)).unwrap();
        device.run_output_cycle(128.0, 0, 64);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_proc_can_stop_itself_from_callback() {
        let device = Arc::new(output_device());
        let calls = Arc::new(AtomicUsize::new(0));

        let id_cell: Arc<Mutex<Option<IoProcId>>> = Arc::new(Mutex::new(None));
        let (d, c, cell) = (
            Arc::clone(&device),
            Arc::clone(&calls),
            Arc::clone(&id_cell),
        );
        let id = device
            .create_io_proc(
                IoDirection::Output,
                Box::new(move |_, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                    let id = id_cell.lock().unwrap().unwrap();
                    d.stop_io_proc(Some(id)).unwrap();
                }),
            )
            .unwrap();
        *cell.lock().unwrap() = Some(id);

        device.start_io_proc(Some(id)).unwrap();
        device.run_output_cycle(0.0, 0, 64);
        device.run_output_cycle(64.0, 0, 64);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!device.is_running());
    }

    #[test]
    fn test_volume_change_notifies_listener() {
        let device = output_device();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        device
            .add_property_listener(
                PropertyAddress::output_master(Selector::VolumeScalar),
                Arc::new(move |_, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        device.set_volume(Scope::Output, MASTER_CHANNEL, 0.4).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spurious_mute_notification_knob() {
        let device = output_device();
        device.set_notify_mute_on_volume_change(true);
        let mute_hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&mute_hits);
        device
            .add_property_listener(
                PropertyAddress::output_master(Selector::Mute),
                Arc::new(move |_, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        device.set_volume(Scope::Output, MASTER_CHANNEL, 0.9).unwrap();
        assert_eq!(mute_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_device_rejects_control_writes() {
        let device = output_device();
        device.set_alive(false);
        assert_eq!(
            device.set_volume(Scope::Output, MASTER_CHANNEL, 0.5),
            Err(DeviceError::NotAlive)
        );
        assert_eq!(device.start_io_proc(None), Err(DeviceError::NotAlive));
    }

    #[test]
    fn test_inert_capabilities_expose_no_controls() {
        let device =
            SimulatedDevice::new(11, "sim-null", "Null", SimulatedCapabilities::inert());
        assert!(!device.has_volume(Scope::Output, MASTER_CHANNEL));
        assert!(!device.has_mute(Scope::Output, MASTER_CHANNEL));
        assert_eq!(
            device.volume(Scope::Output, MASTER_CHANNEL),
            Err(DeviceError::Unsupported)
        );
    }

    #[test]
    fn test_copy_volume_falls_back_to_per_channel() {
        let source = DeviceHandle::new(Arc::new(output_device()));
        source.set_volume(Scope::Output, MASTER_CHANNEL, 0.3).unwrap();

        let dest = DeviceHandle::new(Arc::new(SimulatedDevice::new(
            12,
            "sim-pc",
            "Per Channel",
            SimulatedCapabilities::per_channel_only(),
        )));

        assert!(dest.copy_volume_from(&source, Scope::Output).unwrap());
        assert_eq!(dest.volume(Scope::Output, 1).unwrap(), 0.3);
        assert_eq!(dest.volume(Scope::Output, 2).unwrap(), 0.3);
    }

    #[test]
    fn test_copy_volume_prefers_virtual_master_and_restores_balance() {
        let source = DeviceHandle::new(Arc::new(output_device()));
        source.set_volume(Scope::Output, MASTER_CHANNEL, 0.6).unwrap();

        let caps = SimulatedCapabilities {
            has_master_volume: false,
            master_volume_settable: false,
            has_virtual_master_volume: true,
            ..Default::default()
        };
        let dest_device = Arc::new(SimulatedDevice::new(13, "sim-vm", "Virtual Master", caps));
        dest_device
            .set_virtual_master_balance(Scope::Output, 0.2)
            .unwrap();
        let dest = DeviceHandle::new(dest_device);

        assert!(dest.copy_volume_from(&source, Scope::Output).unwrap());
        assert_eq!(dest.virtual_master_volume(Scope::Output).unwrap(), 0.6);
        // The write recentred the balance; the copy must have put it back.
        assert_eq!(dest.virtual_master_balance(Scope::Output).unwrap(), 0.2);
    }

    #[test]
    fn test_copy_mute_requires_master_controls_on_both_sides() {
        let source = DeviceHandle::new(Arc::new(output_device()));
        source.set_mute(Scope::Output, MASTER_CHANNEL, true).unwrap();

        let inert = DeviceHandle::new(Arc::new(SimulatedDevice::new(
            14,
            "sim-inert",
            "Inert",
            SimulatedCapabilities::inert(),
        )));
        assert!(!inert.copy_mute_from(&source, Scope::Output).unwrap());

        let dest = DeviceHandle::new(Arc::new(output_device()));
        assert!(dest.copy_mute_from(&source, Scope::Output).unwrap());
        assert!(dest.mute(Scope::Output, MASTER_CHANNEL).unwrap());
    }
}
