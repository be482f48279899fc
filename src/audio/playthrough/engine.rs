use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::audio::devices::device::{
    AudioDevice, DeviceHandle, IoBuffer, IoDirection, PropertyListener,
};
use crate::audio::playthrough::io_state::{AtomicIoState, IoState};
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::rt_logger::{IoCallbackKind, RingBufferOp, RtLogger};
use crate::audio::scheduler::{DeferredTask, TaskScheduler};
use crate::audio::types::{
    IoCycle, ListenerId, PropertyAddress, Selector, AUDIBLE_STATE_MIN_CHANGED_FRAMES,
};
use crate::rt_debug;

const CHANNELS: usize = 2;

/// Ring-buffer capacity as a multiple of the output device's IO buffer size.
const RING_BUFFER_SIZE_MULTIPLIER: usize = 20;

/// How many IO-cycle-lengths `stop` waits for the callbacks to wind down
/// before forcing the IOProcs off.
const MAX_STOP_WAIT_CYCLES: u32 = 600;

/// How often the output-start wait re-checks the IO state.
const OUTPUT_START_POLL: Duration = Duration::from_millis(200);

/// How many idle audible-state windows to wait before stopping IO.
const IDLE_STOP_WINDOWS: u64 = 20;

const SAMPLE_TIME_NONE: f64 = -1.0;

// The ring buffer is reallocated only while both buffer mutexes are held, and
// each IO side accesses it with its own mutex held.
struct BufferCell(UnsafeCell<Option<RingBuffer>>);

unsafe impl Send for BufferCell {}
unsafe impl Sync for BufferCell {}

impl BufferCell {
    // The guard proves the caller holds one of the two buffer locks.
    fn get<'a>(&'a self, _proof: &'a MutexGuard<'_, ()>) -> Option<&'a RingBuffer> {
        unsafe { (*self.0.get()).as_ref() }
    }

    fn replace(
        &self,
        _input_proof: &MutexGuard<'_, ()>,
        _output_proof: &MutexGuard<'_, ()>,
        buffer: Option<RingBuffer>,
    ) {
        unsafe {
            *self.0.get() = buffer;
        }
    }
}

struct AtomicSampleTime(AtomicU64);

impl AtomicSampleTime {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

struct StartGate {
    released: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            released: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn arm(&self) {
        self.released.store(false, Ordering::Release);
    }

    // Called from the output IO thread; must not take the mutex.
    fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    // Waits until released or the deadline passes. The wait is chunked into
    // short sleeps because release() can fire between the flag check and the
    // condvar wait, and an IO thread never holds the mutex to close that
    // window.
    fn wait(&self, deadline: Instant) -> bool {
        loop {
            if self.released.load(Ordering::Acquire) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let Ok(guard) = self.lock.lock() else {
                return false;
            };
            if self.released.load(Ordering::Acquire) {
                return true;
            }
            let wait = OUTPUT_START_POLL.min(deadline - now);
            let _ = self.cond.wait_timeout(guard, wait);
        }
    }
}

struct EngineState {
    active: bool,
    playing_through: bool,
    input_device: Option<DeviceHandle>,
    output_device: Option<DeviceHandle>,
    input_proc: Option<u64>,
    output_proc: Option<u64>,
    input_listeners: Vec<ListenerId>,
    idle_task: DeferredTask,
}

struct Shared {
    // Mutex order: state, then input buffer, then output buffer.
    state: Mutex<EngineState>,
    input_buffer_lock: Mutex<()>,
    output_buffer_lock: Mutex<()>,
    buffer: BufferCell,

    input_state: AtomicIoState,
    output_state: AtomicIoState,
    start_gate: StartGate,

    // IOProc IDs mirrored into atomics so the callbacks can stop their own
    // procs without touching the state mutex. 0 means none.
    input_proc_id: AtomicU64,
    output_proc_id: AtomicU64,

    // Sample time of the start of the newest input cycle, not its end; the
    // output read head anchors to it so each output cycle fetches the most
    // recently captured period.
    first_input_sample_time: AtomicSampleTime,
    last_input_sample_time: AtomicSampleTime,
    last_output_sample_time: AtomicSampleTime,
    in_to_out_offset: AtomicSampleTime,

    // Monotonic nanoseconds of the most recent idle notification; the
    // deferred idle stop checks it as a generation counter.
    last_notified_not_running: AtomicU64,

    scheduler: Arc<TaskScheduler>,
    rt_logger: Arc<RtLogger>,
}

/// Forwards audio captured by the input device to the output device through a
/// time-addressed ring buffer.
///
/// The control plane (start, stop, device swaps) runs under the state mutex;
/// the IO callbacks run on the devices' real-time threads and talk to the
/// control plane only through atomics, try-locks, and the RT logger.
pub struct Playthrough {
    shared: Arc<Shared>,
}

impl Playthrough {
    pub fn new(scheduler: Arc<TaskScheduler>, rt_logger: Arc<RtLogger>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    active: false,
                    playing_through: false,
                    input_device: None,
                    output_device: None,
                    input_proc: None,
                    output_proc: None,
                    input_listeners: Vec::new(),
                    idle_task: DeferredTask::completed(),
                }),
                input_buffer_lock: Mutex::new(()),
                output_buffer_lock: Mutex::new(()),
                buffer: BufferCell(UnsafeCell::new(None)),
                input_state: AtomicIoState::new(IoState::Stopped),
                output_state: AtomicIoState::new(IoState::Stopped),
                start_gate: StartGate::new(),
                input_proc_id: AtomicU64::new(0),
                output_proc_id: AtomicU64::new(0),
                first_input_sample_time: AtomicSampleTime::new(SAMPLE_TIME_NONE),
                last_input_sample_time: AtomicSampleTime::new(SAMPLE_TIME_NONE),
                last_output_sample_time: AtomicSampleTime::new(SAMPLE_TIME_NONE),
                in_to_out_offset: AtomicSampleTime::new(0.0),
                last_notified_not_running: AtomicU64::new(0),
                scheduler,
                rt_logger,
            }),
        }
    }

    /// Sets the devices to play audio between. Reactivates in place if the
    /// engine was active, stopping IO on the old devices first.
    pub fn set_devices(
        &self,
        input: Option<DeviceHandle>,
        output: Option<DeviceHandle>,
    ) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        let was_active = state.active;
        if was_active {
            self.shared.deactivate_locked(&mut state);
        }
        state.input_device = input;
        state.output_device = output;
        if was_active {
            self.shared
                .activate_locked(&mut state)
                .context("failed to reactivate playthrough on the new devices")?;
        }
        Ok(())
    }

    /// Wires the engine to its devices: creates the IOProcs, starts the
    /// output hardware, matches the input device's format to the output's,
    /// allocates the ring buffer, and registers the input-device listeners.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        self.shared.activate_locked(&mut state)
    }

    /// Tears down everything `activate` set up, stopping playthrough first
    /// if it is running.
    pub fn deactivate(&self) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        self.shared.deactivate_locked(&mut state);
        Ok(())
    }

    /// Starts the IOProcs on both devices. The callbacks complete the
    /// transitions to `Running` from the IO threads. Idempotent while
    /// playing.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        self.shared.start_locked(&mut state)
    }

    /// Blocks until the output device's callback reports it is running, or
    /// `timeout` passes. Does not take the state mutex, so IO and property
    /// listeners are never blocked behind a waiting caller.
    pub fn wait_for_output_to_start(&self, timeout: Duration) -> bool {
        if self.shared.output_state.load() == IoState::Running {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.start_gate.wait(deadline) {
                // A stop releases the gate too; only a Running output counts
                // as started.
                return self.shared.output_state.load() == IoState::Running;
            }
            if self.shared.output_state.load() == IoState::Running {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Stops playthrough. Waits a bounded number of IO cycles for the
    /// callbacks to wind themselves down, then forces the IOProcs off.
    /// Always reports success; by the time this returns, IO is stopped
    /// either way.
    pub fn stop(&self) -> Result<()> {
        // Release anyone blocked on the output start before taking the state
        // mutex, so they never wait out their full timeout against a stop.
        self.shared.start_gate.release();
        let mut state = self.shared.lock_state()?;
        self.shared.stop_locked(&mut state);
        Ok(())
    }

    /// Stops playthrough soon if the input device stays idle. The stop is
    /// deferred by several audible-state windows and re-checked when it
    /// fires, so audio restarting in the meantime supersedes it.
    pub fn stop_if_idle(&self) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        self.shared.stop_if_idle_locked(&mut state);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .lock_state()
            .map(|state| state.active)
            .unwrap_or(false)
    }

    pub fn is_playing_through(&self) -> bool {
        self.shared
            .lock_state()
            .map(|state| state.playing_through)
            .unwrap_or(false)
    }
}

impl Drop for Playthrough {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock_state() {
            self.shared.deactivate_locked(&mut state);
        }
    }
}

impl Shared {
    fn lock_state(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("playthrough state mutex poisoned"))
    }

    fn reset_sample_times(&self) {
        self.first_input_sample_time.store(SAMPLE_TIME_NONE);
        self.last_input_sample_time.store(SAMPLE_TIME_NONE);
        self.last_output_sample_time.store(SAMPLE_TIME_NONE);
        self.in_to_out_offset.store(0.0);
    }

    fn activate_locked(self: &Arc<Self>, state: &mut EngineState) -> Result<()> {
        if state.active {
            return Ok(());
        }
        let input = state.input_device.clone().context("no input device set")?;
        let output = state
            .output_device
            .clone()
            .context("no output device set")?;

        tracing::info!(
            "{}: Activating playthrough, input: '{}', output: '{}'",
            "PLAYTHROUGH".bright_cyan(),
            input.name(),
            output.name()
        );

        match self.wire_devices(state, &input, &output) {
            Ok(()) => {
                state.input_listeners = self.register_input_listeners(&input);
                state.active = true;
                Ok(())
            }
            Err(err) => {
                self.unwire_devices(state, &input, &output);
                Err(err)
            }
        }
    }

    fn wire_devices(
        self: &Arc<Self>,
        state: &mut EngineState,
        input: &DeviceHandle,
        output: &DeviceHandle,
    ) -> Result<()> {
        let input_proc = input
            .create_io_proc(IoDirection::Input, self.make_input_handler(input))
            .context("failed to create the input IOProc")?;
        state.input_proc = Some(input_proc);
        self.input_proc_id.store(input_proc, Ordering::Release);

        let output_proc = output
            .create_io_proc(IoDirection::Output, self.make_output_handler(output))
            .context("failed to create the output IOProc")?;
        state.output_proc = Some(output_proc);
        self.output_proc_id.store(output_proc, Ordering::Release);

        // Keep the output hardware running even while playthrough is
        // stopped, so starting playthrough later doesn't wait on hardware
        // spin-up.
        output
            .start_io_proc(None)
            .context("failed to start the output device")?;

        // Match the input side to the output device's format so the ring
        // buffer never has to rate-convert.
        let output_rate = output
            .nominal_sample_rate()
            .context("failed to read the output device's sample rate")?;
        input
            .set_nominal_sample_rate(output_rate)
            .context("failed to match the input device's sample rate")?;
        let output_buffer_frames = output
            .io_buffer_size()
            .context("failed to read the output device's IO buffer size")?;
        input
            .set_io_buffer_size(output_buffer_frames)
            .context("failed to match the input device's IO buffer size")?;

        let input_guard = self
            .input_buffer_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("input buffer mutex poisoned"))?;
        let output_guard = self
            .output_buffer_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("output buffer mutex poisoned"))?;
        self.buffer.replace(
            &input_guard,
            &output_guard,
            Some(RingBuffer::new(
                CHANNELS,
                output_buffer_frames * RING_BUFFER_SIZE_MULTIPLIER,
            )),
        );
        Ok(())
    }

    fn unwire_devices(&self, state: &mut EngineState, input: &DeviceHandle, output: &DeviceHandle) {
        if let Some(proc) = state.input_proc.take() {
            let _ = input.destroy_io_proc(proc);
        }
        self.input_proc_id.store(0, Ordering::Release);
        if let Some(proc) = state.output_proc.take() {
            let _ = output.destroy_io_proc(proc);
            let _ = output.stop_io_proc(None);
        }
        self.output_proc_id.store(0, Ordering::Release);

        if let (Ok(input_guard), Ok(output_guard)) =
            (self.input_buffer_lock.lock(), self.output_buffer_lock.lock())
        {
            self.buffer.replace(&input_guard, &output_guard, None);
        }
    }

    fn deactivate_locked(self: &Arc<Self>, state: &mut EngineState) {
        if !state.active {
            return;
        }
        tracing::info!("{}: Deactivating playthrough", "PLAYTHROUGH".bright_cyan());

        self.stop_locked(state);
        state.idle_task.cancel();

        let input = state.input_device.clone();
        let output = state.output_device.clone();

        if let Some(input) = &input {
            for id in state.input_listeners.drain(..) {
                let _ = input.remove_property_listener(id);
            }
        }
        if let (Some(input), Some(output)) = (&input, &output) {
            self.unwire_devices(state, input, output);
        }

        state.active = false;
    }

    fn start_locked(self: &Arc<Self>, state: &mut EngineState) -> Result<()> {
        if !state.active {
            bail!("playthrough is not active");
        }
        if state.playing_through {
            return Ok(());
        }
        let input = state.input_device.clone().context("no input device set")?;
        let output = state
            .output_device
            .clone()
            .context("no output device set")?;
        if !output.is_alive() {
            bail!("output device '{}' is not alive", output.name());
        }

        tracing::info!("{}: Starting playthrough", "PLAYTHROUGH".bright_cyan());

        self.reset_sample_times();
        self.start_gate.arm();
        self.input_state.store(IoState::Starting);
        self.output_state.store(IoState::Starting);

        input
            .start_io_proc(state.input_proc)
            .context("failed to start the input IOProc")?;
        if let Err(err) = output.start_io_proc(state.output_proc) {
            let _ = input.stop_io_proc(state.input_proc);
            self.input_state.store(IoState::Stopped);
            self.output_state.store(IoState::Stopped);
            return Err(err).context("failed to start the output IOProc");
        }

        state.playing_through = true;
        Ok(())
    }

    fn stop_locked(self: &Arc<Self>, state: &mut EngineState) {
        if !state.active || !state.playing_through {
            return;
        }
        tracing::info!("{}: Stopping playthrough", "PLAYTHROUGH".bright_cyan());

        // Never leave a thread blocked on the start gate across a stop.
        self.start_gate.release();

        let input = state.input_device.clone();
        let output = state.output_device.clone();

        let input_alive = input.as_ref().map(|d| d.is_alive()).unwrap_or(false);
        let output_alive = output.as_ref().map(|d| d.is_alive()).unwrap_or(false);

        // Ask the callbacks to stop themselves; a dead device's callback will
        // never run again, so its side goes straight to Stopped.
        self.input_state.store(if input_alive {
            IoState::Stopping
        } else {
            IoState::Stopped
        });
        self.output_state.store(if output_alive {
            IoState::Stopping
        } else {
            IoState::Stopped
        });

        // Wait in units of the devices' expected IO cycle, so a device with a
        // large buffer gets a proportionally longer wind-down.
        let cycle = input
            .as_ref()
            .and_then(expected_io_cycle)
            .into_iter()
            .chain(output.as_ref().and_then(expected_io_cycle))
            .max()
            .unwrap_or(Duration::from_millis(1));

        let mut waited = 0u32;
        while (self.input_state.load() == IoState::Stopping
            || self.output_state.load() == IoState::Stopping)
            && waited < MAX_STOP_WAIT_CYCLES
        {
            std::thread::sleep(cycle);
            waited += 1;
        }

        if self.input_state.load() == IoState::Stopping {
            tracing::warn!(
                "{}: Input callback never wound down, forcing its IOProc off",
                "PLAYTHROUGH".bright_cyan()
            );
            if let Some(input) = &input {
                let _ = input.stop_io_proc(state.input_proc);
            }
            self.input_state.store(IoState::Stopped);
        }
        if self.output_state.load() == IoState::Stopping {
            tracing::warn!(
                "{}: Output callback never wound down, forcing its IOProc off",
                "PLAYTHROUGH".bright_cyan()
            );
            if let Some(output) = &output {
                let _ = output.stop_io_proc(state.output_proc);
            }
            self.output_state.store(IoState::Stopped);
        }

        state.playing_through = false;
        self.reset_sample_times();
    }

    fn stop_if_idle_locked(self: &Arc<Self>, state: &mut EngineState) {
        if !state.active || !state.playing_through {
            return;
        }
        let Some(input) = state.input_device.clone() else {
            return;
        };
        if input.running_somewhere_other_than_owner().unwrap_or(true) {
            return;
        }

        let queued_at = monotonic_ns();
        self.last_notified_not_running
            .store(queued_at, Ordering::Release);

        let rate = input.nominal_sample_rate().unwrap_or(44100.0).max(1.0);
        let window_ns = (AUDIBLE_STATE_MIN_CHANGED_FRAMES as f64 * 1_000_000_000.0 / rate) as u64;
        let delay = Duration::from_nanos(IDLE_STOP_WINDOWS * window_ns);

        rt_debug!(
            "{}: Input device idle, deferring stop by {:?}",
            "PLAYTHROUGH".bright_cyan(),
            delay
        );

        let weak = Arc::downgrade(self);
        let task = self.scheduler.defer(delay, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Ok(mut state) = shared.lock_state() else {
                return;
            };
            if !state.active || !state.playing_through {
                return;
            }
            // A newer idle notification supersedes this one; audio starting
            // again makes the running check fail.
            if shared.last_notified_not_running.load(Ordering::Acquire) != queued_at {
                return;
            }
            let still_idle = state
                .input_device
                .as_ref()
                .map(|input| !input.running_somewhere_other_than_owner().unwrap_or(true))
                .unwrap_or(false);
            if still_idle {
                tracing::info!(
                    "{}: Input device stayed idle, stopping playthrough",
                    "PLAYTHROUGH".bright_cyan()
                );
                shared.stop_locked(&mut state);
            }
        });

        state.idle_task.cancel();
        state.idle_task = task;
    }

    fn register_input_listeners(self: &Arc<Self>, input: &DeviceHandle) -> Vec<ListenerId> {
        let mut ids = Vec::new();

        let weak = Arc::downgrade(self);
        let on_running_change: PropertyListener = Arc::new(move |_, _| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.handle_input_running_changed();
        });

        for selector in [
            Selector::DeviceIsRunning,
            Selector::RunningSomewhereOtherThanOwner,
        ] {
            match input
                .add_property_listener(PropertyAddress::global(selector), on_running_change.clone())
            {
                Ok(id) => ids.push(id),
                Err(err) => {
                    tracing::error!(
                        "{}: Failed to register input-device listener: {}",
                        "PLAYTHROUGH_ERROR".bright_red(),
                        err
                    );
                }
            }
        }

        let overload_listener: PropertyListener = Arc::new(|device, _| {
            tracing::warn!(
                "{}: Input device {} reported a processor overload",
                "PLAYTHROUGH".bright_cyan(),
                device
            );
        });
        match input.add_property_listener(
            PropertyAddress::global(Selector::ProcessorOverload),
            overload_listener,
        ) {
            Ok(id) => ids.push(id),
            Err(err) => {
                tracing::error!(
                    "{}: Failed to register overload listener: {}",
                    "PLAYTHROUGH_ERROR".bright_red(),
                    err
                );
            }
        }

        ids
    }

    // Runs on whatever thread delivered the notification. Hops onto the task
    // queue so the work never runs on a notification thread the device may
    // be holding locks on.
    fn handle_input_running_changed(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.dispatch(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Ok(mut state) = shared.lock_state() else {
                return;
            };
            if !state.active {
                return;
            }
            let running_elsewhere = state
                .input_device
                .as_ref()
                .and_then(|input| input.running_somewhere_other_than_owner().ok());

            match running_elsewhere {
                Some(true) => {
                    if let Err(err) = shared.start_locked(&mut state) {
                        tracing::error!(
                            "{}: Failed to start playthrough on demand: {:#}",
                            "PLAYTHROUGH_ERROR".bright_red(),
                            err
                        );
                    }
                }
                Some(false) => {
                    shared.stop_if_idle_locked(&mut state);
                }
                None => {}
            }
        });
    }

    fn make_input_handler(
        self: &Arc<Self>,
        input: &DeviceHandle,
    ) -> Box<dyn FnMut(&IoCycle, IoBuffer<'_>) + Send> {
        let weak = Arc::downgrade(self);
        let device: Weak<dyn AudioDevice> = input.downgrade();

        Box::new(move |cycle, buffer| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let IoBuffer::Input(samples) = buffer else {
                return;
            };

            match shared.input_state.load() {
                IoState::Starting => {
                    shared
                        .input_state
                        .transition(IoState::Starting, IoState::Running);
                }
                IoState::Running => {}
                IoState::Stopping => {
                    stop_own_proc(&device, &shared.input_proc_id, &shared.rt_logger, true);
                    if !shared
                        .input_state
                        .transition(IoState::Stopping, IoState::Stopped)
                    {
                        shared.rt_logger.log_unexpected_io_state(
                            IoCallbackKind::Input,
                            shared.input_state.load(),
                        );
                    }
                    return;
                }
                unexpected @ IoState::Stopped => {
                    shared
                        .rt_logger
                        .log_unexpected_io_state(IoCallbackKind::Input, unexpected);
                    return;
                }
            }

            if shared.first_input_sample_time.load() == SAMPLE_TIME_NONE {
                shared.first_input_sample_time.store(cycle.sample_time);
            }

            match shared.input_buffer_lock.try_lock() {
                Ok(guard) => {
                    if let Some(ring) = shared.buffer.get(&guard) {
                        if let Err(err) =
                            ring.store(samples, cycle.frames, cycle.sample_time as i64)
                        {
                            shared
                                .rt_logger
                                .log_ring_buffer_error(RingBufferOp::Store, err);
                        }
                    }
                }
                Err(_) => {
                    // The control plane is reallocating; drop this cycle.
                    shared.rt_logger.log_ring_buffer_unavailable(true);
                    return;
                }
            }

            // The start of this cycle, not its end: the output side anchors
            // its read head here and fetches the whole cycle from it.
            shared.last_input_sample_time.store(cycle.sample_time);
        })
    }

    fn make_output_handler(
        self: &Arc<Self>,
        output: &DeviceHandle,
    ) -> Box<dyn FnMut(&IoCycle, IoBuffer<'_>) + Send> {
        let weak = Arc::downgrade(self);
        let device: Weak<dyn AudioDevice> = output.downgrade();

        Box::new(move |cycle, buffer| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let IoBuffer::Output(out) = buffer else {
                return;
            };

            match shared.output_state.load() {
                IoState::Starting => {
                    if shared
                        .output_state
                        .transition(IoState::Starting, IoState::Running)
                    {
                        shared.rt_logger.log_releasing_waiting_threads();
                        shared.start_gate.release();
                    }
                }
                IoState::Running => {}
                IoState::Stopping => {
                    stop_own_proc(&device, &shared.output_proc_id, &shared.rt_logger, false);
                    if !shared
                        .output_state
                        .transition(IoState::Stopping, IoState::Stopped)
                    {
                        shared.rt_logger.log_unexpected_io_state(
                            IoCallbackKind::Output,
                            shared.output_state.load(),
                        );
                    }
                    return;
                }
                unexpected @ IoState::Stopped => {
                    shared
                        .rt_logger
                        .log_unexpected_io_state(IoCallbackKind::Output, unexpected);
                    return;
                }
            }

            let last_input = shared.last_input_sample_time.load();
            if last_input == SAMPLE_TIME_NONE {
                // Nothing captured yet; leave the cycle silent.
                return;
            }

            let mut offset = shared.in_to_out_offset.load();
            if shared.last_output_sample_time.load() == SAMPLE_TIME_NONE {
                // First output cycle since starting: anchor the output clock
                // to the freshest input. Anything captured before the output
                // device spun up is dropped.
                offset = cycle.sample_time - last_input;
                shared.in_to_out_offset.store(offset);
                let first_input = shared.first_input_sample_time.load();
                if first_input != SAMPLE_TIME_NONE && first_input != last_input {
                    shared
                        .rt_logger
                        .log_dropped_frames((last_input - first_input) as i64);
                }
            }
            shared.last_output_sample_time.store(cycle.sample_time);

            match shared.output_buffer_lock.try_lock() {
                Ok(guard) => {
                    let Some(ring) = shared.buffer.get(&guard) else {
                        return;
                    };

                    let mut read_head = cycle.sample_time - offset;
                    let (start, end) = ring.time_bounds().unwrap_or((i64::MIN, i64::MAX));
                    let out_of_bounds = (read_head as i64) < start
                        || read_head as i64 - cycle.frames as i64 > end;
                    if last_input < read_head || out_of_bounds {
                        // The input fell behind or the clocks drifted out of
                        // the buffer; re-anchor on the freshest input.
                        shared.rt_logger.log_no_samples_ready(
                            cycle.frames as u32,
                            end.saturating_sub(read_head as i64),
                        );
                        offset = cycle.sample_time - last_input;
                        shared.in_to_out_offset.store(offset);
                        read_head = last_input;
                    }

                    if let Err(err) = ring.fetch(out, cycle.frames, read_head as i64) {
                        shared
                            .rt_logger
                            .log_ring_buffer_error(RingBufferOp::Fetch, err);
                        out.fill(0.0);
                    }
                }
                Err(_) => {
                    shared.rt_logger.log_ring_buffer_unavailable(false);
                    out.fill(0.0);
                }
            };
        })
    }
}

// The duration of one IO cycle at the device's current buffer size and
// nominal rate. None when the device reports nothing usable.
fn expected_io_cycle(device: &DeviceHandle) -> Option<Duration> {
    let frames = device.io_buffer_size().ok()?;
    let rate = device.nominal_sample_rate().ok()?;
    if frames == 0 || !(rate.is_finite() && rate > 0.0) {
        return None;
    }
    Some(Duration::from_nanos(
        (frames as f64 * 1_000_000_000.0 / rate) as u64,
    ))
}

fn stop_own_proc(
    device: &Weak<dyn AudioDevice>,
    proc_id: &AtomicU64,
    rt_logger: &RtLogger,
    input_side: bool,
) {
    let Some(device) = device.upgrade() else {
        return;
    };
    let id = proc_id.load(Ordering::Acquire);
    if id == 0 {
        return;
    }
    if device.stop_io_proc(Some(id)).is_err() {
        rt_logger.log_error_stopping_io_proc(input_side);
    }
}

fn monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_nanos() as u64
}
