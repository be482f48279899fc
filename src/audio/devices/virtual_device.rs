use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use colored::Colorize;

use crate::audio::devices::device::{
    AudioDevice, DeviceError, IoBuffer, IoDirection, IoProcHandler, IoProcTable, ListenerTable,
    PropertyListener,
};
use crate::audio::scheduler::TaskScheduler;
use crate::audio::types::{
    DeviceId, IoCycle, IoProcId, ListenerId, PropertyAddress, Scope, Selector,
    AUDIBLE_STATE_MIN_CHANGED_FRAMES, ENABLED_CONTROLS_INDEX_MUTE, ENABLED_CONTROLS_INDEX_VOLUME,
    MASTER_CHANNEL, VIRTUAL_DEVICE_UID,
};

/// Identifies a client doing IO on the virtual device.
pub type ClientId = u32;

/// Frames in the loopback ring. Also the period of the zero time stamp.
pub const LOOPBACK_RING_FRAMES: usize = 16384;

const CHANNELS: usize = 2;

const MIN_RAW_VOLUME: f32 = 0.0;
const MAX_RAW_VOLUME: f32 = 96.0;
const MIN_DB_VOLUME: f32 = -96.0;
const MAX_DB_VOLUME: f32 = 0.0;

struct Client {
    name: String,
    is_owner: bool,
    is_music_player: bool,
    doing_io: bool,
    relative_volume: f32,
    // -1.0 full left, 1.0 full right.
    pan: f32,
}

#[derive(Default)]
struct ClientMap {
    clients: HashMap<ClientId, Client>,
    next_id: ClientId,
    total_doing_io: u32,
    doing_io_excluding_owner: u32,
    music_player: Option<ClientId>,
}

struct ControlState {
    volume_scalar: f32,
    mute: bool,
    volume_enabled: bool,
    mute_enabled: bool,
}

struct LoopbackRing {
    data: Vec<f32>,
}

impl LoopbackRing {
    fn new() -> Self {
        Self {
            data: vec![0.0; LOOPBACK_RING_FRAMES * CHANNELS],
        }
    }

    fn mix_frame(&mut self, sample_time: i64, left: f32, right: f32) {
        let frame = (sample_time.rem_euclid(LOOPBACK_RING_FRAMES as i64)) as usize;
        self.data[frame * CHANNELS] += left;
        self.data[frame * CHANNELS + 1] += right;
    }

    /// Reads `frames` frames starting at `sample_time` into `out`, zeroing
    /// each frame behind the read so the next lap starts silent.
    fn read_and_clear(&mut self, sample_time: i64, out: &mut [f32], frames: usize) {
        for i in 0..frames {
            let frame = ((sample_time + i as i64).rem_euclid(LOOPBACK_RING_FRAMES as i64)) as usize;
            out[i * CHANNELS] = self.data[frame * CHANNELS];
            out[i * CHANNELS + 1] = self.data[frame * CHANNELS + 1];
            self.data[frame * CHANNELS] = 0.0;
            self.data[frame * CHANNELS + 1] = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudibleState {
    Silent,
    Audible,
}

struct AudibleTracker {
    state: AudibleState,
    // Sample time up to which the observed content has disagreed with the
    // current state.
    disagreement_since: Option<i64>,
}

impl AudibleTracker {
    fn new() -> Self {
        Self {
            state: AudibleState::Silent,
            disagreement_since: None,
        }
    }

    // Returns the new state if it changed. The state only flips after the
    // content has disagreed with it for a minimum window of frames, so brief
    // silence between songs doesn't flap it.
    fn observe(&mut self, sample_time: i64, audible: bool) -> Option<AudibleState> {
        let agrees = matches!(
            (self.state, audible),
            (AudibleState::Audible, true) | (AudibleState::Silent, false)
        );
        if agrees {
            self.disagreement_since = None;
            return None;
        }
        let since = *self.disagreement_since.get_or_insert(sample_time);
        if sample_time - since >= AUDIBLE_STATE_MIN_CHANGED_FRAMES as i64 {
            self.state = if audible {
                AudibleState::Audible
            } else {
                AudibleState::Silent
            };
            self.disagreement_since = None;
            return Some(self.state);
        }
        None
    }
}

/// The zero time stamp: the sample/host time pair marking the start of the
/// current ring lap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroTimeStamp {
    pub sample_time: f64,
    pub host_time: u64,
}

/// The loopback device that captures system audio.
///
/// Clients render into a fixed stereo ring via [`process_client_output`]; the
/// capture side reads the ring back out through input IOProcs. IO start/stop
/// is accounted per client so listeners hear exactly the 0-to-1 and 1-to-0
/// transitions, both overall and excluding the owning app.
///
/// [`process_client_output`]: VirtualDevice::process_client_output
pub struct VirtualDevice {
    id: DeviceId,
    name: String,
    scheduler: Arc<TaskScheduler>,
    clients: Mutex<ClientMap>,
    controls: Mutex<ControlState>,
    sample_rate_bits: AtomicU64,
    pending_sample_rate: Mutex<Option<f64>>,
    io_buffer_size: Mutex<usize>,
    loopback: Mutex<LoopbackRing>,
    audible: Mutex<AudibleTracker>,
    // Host time of sample time zero, in nanoseconds. 0 until the first IO
    // start anchors the clock.
    anchor_host_time: AtomicU64,
    procs: IoProcTable,
    listeners: ListenerTable,
    // Back-reference so trait methods can hop onto the task queue.
    weak_self: Weak<VirtualDevice>,
}

impl VirtualDevice {
    pub fn new(id: DeviceId, scheduler: Arc<TaskScheduler>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            id,
            name: "System Audio Capture".to_string(),
            scheduler,
            clients: Mutex::new(ClientMap::default()),
            controls: Mutex::new(ControlState {
                volume_scalar: 1.0,
                mute: false,
                volume_enabled: true,
                mute_enabled: true,
            }),
            sample_rate_bits: AtomicU64::new(44100.0f64.to_bits()),
            pending_sample_rate: Mutex::new(None),
            io_buffer_size: Mutex::new(512),
            loopback: Mutex::new(LoopbackRing::new()),
            audible: Mutex::new(AudibleTracker::new()),
            anchor_host_time: AtomicU64::new(0),
            procs: IoProcTable::default(),
            listeners: ListenerTable::default(),
        })
    }

    fn clients_guard(&self) -> Result<std::sync::MutexGuard<'_, ClientMap>, DeviceError> {
        self.clients
            .lock()
            .map_err(|_| DeviceError::HostError("client map poisoned".to_string()))
    }

    /// Adds a client to the device's client table. `is_owner` marks the app
    /// that owns the device; its IO is excluded from the
    /// running-somewhere-other-than-owner count.
    pub fn register_client(
        &self,
        name: impl Into<String>,
        is_owner: bool,
    ) -> Result<ClientId, DeviceError> {
        let mut clients = self.clients_guard()?;
        clients.next_id += 1;
        let id = clients.next_id;
        clients.clients.insert(
            id,
            Client {
                name: name.into(),
                is_owner,
                is_music_player: false,
                doing_io: false,
                relative_volume: 1.0,
                pan: 0.0,
            },
        );
        Ok(id)
    }

    pub fn unregister_client(&self, client: ClientId) -> Result<(), DeviceError> {
        let notifications = {
            let mut clients = self.clients_guard()?;
            let Some(entry) = clients.clients.remove(&client) else {
                return Err(DeviceError::UnknownId);
            };
            if clients.music_player == Some(client) {
                clients.music_player = None;
            }
            if entry.doing_io {
                Self::account_io_stop(&mut clients, entry.is_owner)
            } else {
                (false, false)
            }
        };
        self.emit_io_notifications(notifications);
        Ok(())
    }

    /// Marks `client` as the music player, clearing any previous one. The
    /// audible-state tracking ignores the music player's output so pausing it
    /// reads as the system going silent.
    pub fn set_music_player(&self, client: ClientId) -> Result<(), DeviceError> {
        let mut clients = self.clients_guard()?;
        if !clients.clients.contains_key(&client) {
            return Err(DeviceError::UnknownId);
        }
        if let Some(previous) = clients.music_player.take() {
            if let Some(entry) = clients.clients.get_mut(&previous) {
                entry.is_music_player = false;
            }
        }
        clients.music_player = Some(client);
        if let Some(entry) = clients.clients.get_mut(&client) {
            entry.is_music_player = true;
        }
        Ok(())
    }

    pub fn set_client_relative_volume(
        &self,
        client: ClientId,
        volume: f32,
    ) -> Result<(), DeviceError> {
        let mut clients = self.clients_guard()?;
        let entry = clients
            .clients
            .get_mut(&client)
            .ok_or(DeviceError::UnknownId)?;
        entry.relative_volume = volume.clamp(0.0, 4.0);
        Ok(())
    }

    pub fn set_client_pan(&self, client: ClientId, pan: f32) -> Result<(), DeviceError> {
        let mut clients = self.clients_guard()?;
        let entry = clients
            .clients
            .get_mut(&client)
            .ok_or(DeviceError::UnknownId)?;
        entry.pan = pan.clamp(-1.0, 1.0);
        Ok(())
    }

    // Returns (running_changed, running_elsewhere_changed).
    fn account_io_start(clients: &mut ClientMap, is_owner: bool) -> (bool, bool) {
        clients.total_doing_io += 1;
        let running_changed = clients.total_doing_io == 1;
        let mut elsewhere_changed = false;
        if !is_owner {
            clients.doing_io_excluding_owner += 1;
            elsewhere_changed = clients.doing_io_excluding_owner == 1;
        }
        (running_changed, elsewhere_changed)
    }

    fn account_io_stop(clients: &mut ClientMap, is_owner: bool) -> (bool, bool) {
        clients.total_doing_io = clients.total_doing_io.saturating_sub(1);
        let running_changed = clients.total_doing_io == 0;
        let mut elsewhere_changed = false;
        if !is_owner {
            clients.doing_io_excluding_owner = clients.doing_io_excluding_owner.saturating_sub(1);
            elsewhere_changed = clients.doing_io_excluding_owner == 0;
        }
        (running_changed, elsewhere_changed)
    }

    // Notifications go out after the client-map lock is released, so a
    // listener can call back into the device.
    fn emit_io_notifications(&self, (running, elsewhere): (bool, bool)) {
        if running {
            self.listeners
                .notify(self.id, PropertyAddress::global(Selector::DeviceIsRunning));
        }
        if elsewhere {
            self.listeners.notify(
                self.id,
                PropertyAddress::global(Selector::RunningSomewhereOtherThanOwner),
            );
        }
    }

    /// Records that `client` started doing IO. The first overall start
    /// anchors the device clock.
    pub fn start_io(&self, client: ClientId) -> Result<(), DeviceError> {
        let notifications = {
            let mut clients = self.clients_guard()?;
            let entry = clients
                .clients
                .get_mut(&client)
                .ok_or(DeviceError::UnknownId)?;
            if entry.doing_io {
                debug_assert!(false, "client {} started IO twice", client);
                tracing::error!(
                    "{}: Client '{}' started IO twice, ignoring",
                    "VIRTUAL_DEVICE_ERROR".bright_red(),
                    entry.name
                );
                return Ok(());
            }
            entry.doing_io = true;
            let is_owner = entry.is_owner;
            let notifications = Self::account_io_start(&mut clients, is_owner);
            if clients.total_doing_io == 1 {
                self.anchor_host_time
                    .store(host_time_now(), Ordering::Release);
            }
            notifications
        };
        self.emit_io_notifications(notifications);
        Ok(())
    }

    pub fn stop_io(&self, client: ClientId) -> Result<(), DeviceError> {
        let notifications = {
            let mut clients = self.clients_guard()?;
            let entry = clients
                .clients
                .get_mut(&client)
                .ok_or(DeviceError::UnknownId)?;
            if !entry.doing_io {
                debug_assert!(false, "client {} stopped IO it never started", client);
                tracing::error!(
                    "{}: Client '{}' stopped IO it never started, ignoring",
                    "VIRTUAL_DEVICE_ERROR".bright_red(),
                    entry.name
                );
                return Ok(());
            }
            entry.doing_io = false;
            let is_owner = entry.is_owner;
            Self::account_io_stop(&mut clients, is_owner)
        };
        self.emit_io_notifications(notifications);
        Ok(())
    }

    pub fn client_count_doing_io(&self) -> u32 {
        self.clients_guard()
            .map(|clients| clients.total_doing_io)
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.client_count_doing_io() > 0
    }

    pub fn audible_state(&self) -> AudibleState {
        self.audible
            .lock()
            .map(|tracker| tracker.state)
            .unwrap_or(AudibleState::Silent)
    }

    /// The sample/host time pair for the start of the current ring lap.
    pub fn zero_time_stamp(&self) -> ZeroTimeStamp {
        let anchor = self.anchor_host_time.load(Ordering::Acquire);
        let rate = self.nominal_sample_rate_value();
        let ns_per_frame = 1_000_000_000.0 / rate;
        let period_ns = (LOOPBACK_RING_FRAMES as f64 * ns_per_frame) as u64;
        if anchor == 0 || period_ns == 0 {
            return ZeroTimeStamp {
                sample_time: 0.0,
                host_time: anchor,
            };
        }
        let now = host_time_now();
        let laps = now.saturating_sub(anchor) / period_ns;
        ZeroTimeStamp {
            sample_time: (laps * LOOPBACK_RING_FRAMES as u64) as f64,
            host_time: anchor + laps * period_ns,
        }
    }

    fn nominal_sample_rate_value(&self) -> f64 {
        f64::from_bits(self.sample_rate_bits.load(Ordering::Acquire))
    }

    /// Mixes one cycle of a client's output into the loopback ring, applying
    /// the client's relative volume and pan and the device's own controls.
    /// `frames` is interleaved stereo.
    pub fn process_client_output(
        &self,
        client: ClientId,
        start_sample_time: i64,
        frames: &[f32],
    ) -> Result<(), DeviceError> {
        let (gain_l, gain_r, count_toward_audible) = {
            let clients = self.clients_guard()?;
            let entry = clients
                .clients
                .get(&client)
                .ok_or(DeviceError::UnknownId)?;
            let (device_gain, muted) = {
                let controls = self
                    .controls
                    .lock()
                    .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))?;
                (
                    if controls.volume_enabled {
                        controls.volume_scalar
                    } else {
                        1.0
                    },
                    controls.mute_enabled && controls.mute,
                )
            };
            if muted {
                (0.0, 0.0, false)
            } else {
                let gain = entry.relative_volume * device_gain;
                let pan = entry.pan;
                // Constant-sum pan.
                let gain_l = gain * (1.0 - pan.max(0.0));
                let gain_r = gain * (1.0 + pan.min(0.0));
                (gain_l, gain_r, !entry.is_music_player)
            }
        };

        let frame_count = frames.len() / CHANNELS;
        let mut any_audible = false;
        {
            let mut ring = self
                .loopback
                .lock()
                .map_err(|_| DeviceError::HostError("loopback ring poisoned".to_string()))?;
            for i in 0..frame_count {
                let left = frames[i * CHANNELS] * gain_l;
                let right = frames[i * CHANNELS + 1] * gain_r;
                if left != 0.0 || right != 0.0 {
                    any_audible = true;
                }
                ring.mix_frame(start_sample_time + i as i64, left, right);
            }
        }

        if count_toward_audible {
            let changed = self
                .audible
                .lock()
                .ok()
                .and_then(|mut tracker| {
                    tracker.observe(start_sample_time + frame_count as i64, any_audible)
                });
            if let Some(state) = changed {
                tracing::debug!(
                    "{}: Audible state -> {:?}",
                    "VIRTUAL_DEVICE".bright_cyan(),
                    state
                );
            }
        }
        Ok(())
    }

    /// Drives one capture cycle: reads the loopback ring and hands the frames
    /// to the started input IOProcs.
    pub fn run_capture_cycle(&self, sample_time: f64, host_time: u64, frame_count: usize) {
        let mut data = vec![0.0f32; frame_count * CHANNELS];
        {
            let Ok(mut ring) = self.loopback.lock() else {
                return;
            };
            ring.read_and_clear(sample_time as i64, &mut data, frame_count);
        }

        let cycle = IoCycle {
            sample_time,
            host_time,
            frames: frame_count,
        };
        for (started, handler) in self.procs.started_handlers(IoDirection::Input) {
            if !started.load(Ordering::Acquire) {
                continue;
            }
            let Ok(mut handler) = handler.lock() else {
                continue;
            };
            handler(&cycle, IoBuffer::Input(&data));
        }
    }

    /// Applies the pending sample rate. Runs on the task queue after
    /// [`set_nominal_sample_rate`] requests the change; exposed so tests can
    /// drive the handshake directly.
    ///
    /// [`set_nominal_sample_rate`]: AudioDevice::set_nominal_sample_rate
    pub fn perform_config_change(&self) {
        let pending = self
            .pending_sample_rate
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        let Some(rate) = pending else {
            return;
        };
        let old = self.nominal_sample_rate_value();
        self.sample_rate_bits.store(rate.to_bits(), Ordering::Release);
        if old != rate {
            tracing::info!(
                "{}: Sample rate {} -> {}",
                "VIRTUAL_DEVICE".bright_cyan(),
                old,
                rate
            );
            self.listeners
                .notify(self.id, PropertyAddress::global(Selector::NominalSampleRate));
        }
    }

    fn request_config_change(&self) {
        let Some(device) = self.weak_self.upgrade() else {
            return;
        };
        self.scheduler.dispatch(move || {
            device.perform_config_change();
        });
    }
}

fn host_time_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl AudioDevice for VirtualDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn uid(&self) -> &str {
        VIRTUAL_DEVICE_UID
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn nominal_sample_rate(&self) -> Result<f64, DeviceError> {
        Ok(self.nominal_sample_rate_value())
    }

    /// Records the rate as pending and requests the configuration-change
    /// handshake. The change completes asynchronously on the task queue, so a
    /// read immediately after this may still see the old rate.
    fn set_nominal_sample_rate(&self, rate: f64) -> Result<(), DeviceError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DeviceError::NotSettable);
        }
        {
            let mut pending = self
                .pending_sample_rate
                .lock()
                .map_err(|_| DeviceError::HostError("pending rate poisoned".to_string()))?;
            *pending = Some(rate);
        }
        self.request_config_change();
        Ok(())
    }

    fn io_buffer_size(&self) -> Result<usize, DeviceError> {
        self.io_buffer_size
            .lock()
            .map(|size| *size)
            .map_err(|_| DeviceError::HostError("buffer size poisoned".to_string()))
    }

    fn set_io_buffer_size(&self, frames: usize) -> Result<(), DeviceError> {
        let mut size = self
            .io_buffer_size
            .lock()
            .map_err(|_| DeviceError::HostError("buffer size poisoned".to_string()))?;
        *size = frames;
        Ok(())
    }

    fn total_channels(&self, scope: Scope) -> usize {
        match scope {
            Scope::Global => CHANNELS * 2,
            _ => CHANNELS,
        }
    }

    fn has_volume(&self, scope: Scope, channel: u32) -> bool {
        scope == Scope::Output
            && channel == MASTER_CHANNEL
            && self
                .controls
                .lock()
                .map(|controls| controls.volume_enabled)
                .unwrap_or(false)
    }

    fn volume_is_settable(&self, scope: Scope, channel: u32) -> bool {
        self.has_volume(scope, channel)
    }

    fn volume(&self, scope: Scope, channel: u32) -> Result<f32, DeviceError> {
        if !self.has_volume(scope, channel) {
            return Err(DeviceError::Unsupported);
        }
        self.controls
            .lock()
            .map(|controls| controls.volume_scalar)
            .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))
    }

    fn set_volume(&self, scope: Scope, channel: u32, volume: f32) -> Result<(), DeviceError> {
        if !self.has_volume(scope, channel) {
            return Err(DeviceError::Unsupported);
        }
        let clamped = volume.clamp(0.0, 1.0);
        let changed = {
            let mut controls = self
                .controls
                .lock()
                .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))?;
            let changed = controls.volume_scalar != clamped;
            controls.volume_scalar = clamped;
            changed
        };
        if changed {
            tracing::debug!(
                "{}: Volume -> {:.2} ({:.1} dB)",
                "VIRTUAL_DEVICE".bright_cyan(),
                clamped,
                volume_scalar_to_db(clamped)
            );
            self.listeners.notify(
                self.id,
                PropertyAddress::output_master(Selector::VolumeScalar),
            );
        }
        Ok(())
    }

    fn has_mute(&self, scope: Scope, channel: u32) -> bool {
        scope == Scope::Output
            && channel == MASTER_CHANNEL
            && self
                .controls
                .lock()
                .map(|controls| controls.mute_enabled)
                .unwrap_or(false)
    }

    fn mute_is_settable(&self, scope: Scope, channel: u32) -> bool {
        self.has_mute(scope, channel)
    }

    fn mute(&self, scope: Scope, channel: u32) -> Result<bool, DeviceError> {
        if !self.has_mute(scope, channel) {
            return Err(DeviceError::Unsupported);
        }
        self.controls
            .lock()
            .map(|controls| controls.mute)
            .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))
    }

    fn set_mute(&self, scope: Scope, channel: u32, mute: bool) -> Result<(), DeviceError> {
        if !self.has_mute(scope, channel) {
            return Err(DeviceError::Unsupported);
        }
        let changed = {
            let mut controls = self
                .controls
                .lock()
                .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))?;
            let changed = controls.mute != mute;
            controls.mute = mute;
            changed
        };
        if changed {
            self.listeners
                .notify(self.id, PropertyAddress::output_master(Selector::Mute));
        }
        Ok(())
    }

    fn create_io_proc(
        &self,
        direction: IoDirection,
        handler: IoProcHandler,
    ) -> Result<IoProcId, DeviceError> {
        self.procs.create(direction, handler)
    }

    fn destroy_io_proc(&self, id: IoProcId) -> Result<(), DeviceError> {
        self.procs.destroy(id)
    }

    fn start_io_proc(&self, id: Option<IoProcId>) -> Result<(), DeviceError> {
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
        self.listeners.add(address, listener)
    }

    fn remove_property_listener(&self, id: ListenerId) -> Result<(), DeviceError> {
        self.listeners.remove(id)
    }

    fn enabled_output_controls(&self) -> Result<[bool; 2], DeviceError> {
        self.controls
            .lock()
            .map(|controls| {
                let mut enabled = [false; 2];
                enabled[ENABLED_CONTROLS_INDEX_VOLUME] = controls.volume_enabled;
                enabled[ENABLED_CONTROLS_INDEX_MUTE] = controls.mute_enabled;
                enabled
            })
            .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))
    }

    fn set_enabled_output_controls(&self, enabled: [bool; 2]) -> Result<(), DeviceError> {
        let volume_enabled = enabled[ENABLED_CONTROLS_INDEX_VOLUME];
        let mute_enabled = enabled[ENABLED_CONTROLS_INDEX_MUTE];
        let changed = {
            let mut controls = self
                .controls
                .lock()
                .map_err(|_| DeviceError::HostError("control state poisoned".to_string()))?;
            let changed = controls.volume_enabled != volume_enabled
                || controls.mute_enabled != mute_enabled;
            controls.volume_enabled = volume_enabled;
            controls.mute_enabled = mute_enabled;
            changed
        };
        if changed {
            tracing::debug!(
                "{}: Enabled controls -> volume: {}, mute: {}",
                "VIRTUAL_DEVICE".bright_cyan(),
                volume_enabled,
                mute_enabled
            );
            self.listeners.notify(
                self.id,
                PropertyAddress::output_master(Selector::EnabledOutputControls),
            );
        }
        Ok(())
    }

    fn running_somewhere_other_than_owner(&self) -> Result<bool, DeviceError> {
        Ok(self
            .clients_guard()?
            .doing_io_excluding_owner
            > 0)
    }
}

/// Converts the device's scalar volume to decibels.
///
/// The scalar is first mapped onto the raw control range, then squared before
/// the dB conversion so low slider positions change faster.
// TODO: verify this curve against a hardware volume ramp; the square remap is
// suspect at the bottom of the range.
pub fn volume_scalar_to_db(scalar: f32) -> f32 {
    let scalar = scalar.clamp(0.0, 1.0);
    let raw = MIN_RAW_VOLUME + scalar * (MAX_RAW_VOLUME - MIN_RAW_VOLUME);
    let curved = (raw / MAX_RAW_VOLUME).powi(2);
    MIN_DB_VOLUME + curved * (MAX_DB_VOLUME - MIN_DB_VOLUME)
}
