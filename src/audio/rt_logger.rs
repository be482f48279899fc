use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use colored::Colorize;

use crate::audio::playthrough::io_state::IoState;
use crate::audio::ring_buffer::RingBufferError;
use crate::rt_debug;

/// Where an unexpected IO-state observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCallbackKind {
    Input,
    Output,
}

/// Which ring-buffer operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferOp {
    Store,
    Fetch,
}

// Each event kind is a plain-old-data record guarded by one AtomicBool. The
// real-time producer writes the fields, then sets the flag with release
// ordering. If the flag is already set the occurrence is dropped; losing a
// diagnostic beats blocking an IO thread.
#[derive(Default)]
struct Events {
    releasing_waiting_threads: AtomicBool,

    dropped_frames: AtomicBool,
    dropped_frames_count: AtomicI64,

    no_samples_ready: AtomicBool,
    no_samples_requested: AtomicU32,
    no_samples_available: AtomicI64,

    ring_buffer_unavailable: AtomicBool,
    ring_buffer_unavailable_input: AtomicBool,

    ring_buffer_error: AtomicBool,
    // 0 = TooMuch, 1 = CpuOverload
    ring_buffer_error_kind: AtomicU32,
    // 0 = store, 1 = fetch
    ring_buffer_error_op: AtomicU32,

    exception_stopping_io_proc: AtomicBool,
    exception_stopping_input: AtomicBool,

    unexpected_io_state: AtomicBool,
    // 0 = input, 1 = output
    unexpected_io_state_callback: AtomicU32,
    unexpected_io_state_value: AtomicU32,
}

impl Events {
    fn any_set(&self) -> bool {
        self.releasing_waiting_threads.load(Ordering::Acquire)
            || self.dropped_frames.load(Ordering::Acquire)
            || self.no_samples_ready.load(Ordering::Acquire)
            || self.ring_buffer_unavailable.load(Ordering::Acquire)
            || self.ring_buffer_error.load(Ordering::Acquire)
            || self.exception_stopping_io_proc.load(Ordering::Acquire)
            || self.unexpected_io_state.load(Ordering::Acquire)
    }
}

struct Shared {
    events: Events,
    // Counting semaphore: producers bump the count and notify without taking
    // the mutex, so signalling is safe from the IO threads.
    pending: AtomicU64,
    wake_lock: Mutex<()>,
    wake: Condvar,
    shutting_down: AtomicBool,
}

/// Logger that real-time audio callbacks can use without blocking.
///
/// Producers record events into fixed atomic slots and signal a drainer
/// thread, which formats and emits them through `tracing`. An occurrence is
/// dropped if its slot is still busy from the previous one.
pub struct RtLogger {
    shared: Arc<Shared>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl RtLogger {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            events: Events::default(),
            pending: AtomicU64::new(0),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        });

        let drainer_shared = Arc::clone(&shared);
        let drainer = std::thread::Builder::new()
            .name("rt-log-drainer".to_string())
            .spawn(move || drain_loop(drainer_shared));

        let drainer = match drainer {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(
                    "{}: Failed to spawn drainer thread, real-time diagnostics will be lost: {}",
                    "RT_LOG_ERROR".bright_red(),
                    err
                );
                None
            }
        };

        Self {
            shared,
            drainer: Mutex::new(drainer),
        }
    }

    fn signal(&self) {
        self.shared.pending.fetch_add(1, Ordering::Release);
        // Deliberately no mutex here. notify_one on its own cannot block, and
        // the drainer re-checks the count under the lock before sleeping.
        self.shared.wake.notify_one();
    }

    /// Called by the output callback on the Starting -> Running transition.
    pub fn log_releasing_waiting_threads(&self) {
        if !self
            .shared
            .events
            .releasing_waiting_threads
            .swap(true, Ordering::AcqRel)
        {
            self.signal();
        }
    }

    /// Called by the output callback when its first fetch starts later than
    /// the earliest stored input frames.
    pub fn log_dropped_frames(&self, frames: i64) {
        let ev = &self.shared.events;
        if ev.dropped_frames.load(Ordering::Acquire) {
            return;
        }
        ev.dropped_frames_count.store(frames, Ordering::Relaxed);
        ev.dropped_frames.store(true, Ordering::Release);
        self.signal();
    }

    pub fn log_no_samples_ready(&self, requested: u32, available: i64) {
        let ev = &self.shared.events;
        if ev.no_samples_ready.load(Ordering::Acquire) {
            return;
        }
        ev.no_samples_requested.store(requested, Ordering::Relaxed);
        ev.no_samples_available.store(available, Ordering::Relaxed);
        ev.no_samples_ready.store(true, Ordering::Release);
        self.signal();
    }

    /// A callback could not take its buffer lock and dropped the cycle.
    pub fn log_ring_buffer_unavailable(&self, input_side: bool) {
        let ev = &self.shared.events;
        if ev.ring_buffer_unavailable.load(Ordering::Acquire) {
            return;
        }
        ev.ring_buffer_unavailable_input
            .store(input_side, Ordering::Relaxed);
        ev.ring_buffer_unavailable.store(true, Ordering::Release);
        self.signal();
    }

    pub fn log_ring_buffer_error(&self, op: RingBufferOp, err: RingBufferError) {
        let ev = &self.shared.events;
        if ev.ring_buffer_error.load(Ordering::Acquire) {
            return;
        }
        ev.ring_buffer_error_kind.store(
            match err {
                RingBufferError::TooMuch => 0,
                RingBufferError::CpuOverload => 1,
            },
            Ordering::Relaxed,
        );
        ev.ring_buffer_error_op.store(
            match op {
                RingBufferOp::Store => 0,
                RingBufferOp::Fetch => 1,
            },
            Ordering::Relaxed,
        );
        ev.ring_buffer_error.store(true, Ordering::Release);
        self.signal();
    }

    /// A callback failed while stopping its own IOProc.
    pub fn log_error_stopping_io_proc(&self, input_side: bool) {
        let ev = &self.shared.events;
        if ev.exception_stopping_io_proc.load(Ordering::Acquire) {
            return;
        }
        ev.exception_stopping_input
            .store(input_side, Ordering::Relaxed);
        ev.exception_stopping_io_proc.store(true, Ordering::Release);
        self.signal();
    }

    /// A callback observed an IO state it has no transition for.
    pub fn log_unexpected_io_state(&self, callback: IoCallbackKind, state: IoState) {
        let ev = &self.shared.events;
        if ev.unexpected_io_state.load(Ordering::Acquire) {
            return;
        }
        ev.unexpected_io_state_callback.store(
            match callback {
                IoCallbackKind::Input => 0,
                IoCallbackKind::Output => 1,
            },
            Ordering::Relaxed,
        );
        ev.unexpected_io_state_value
            .store(state as u32, Ordering::Relaxed);
        ev.unexpected_io_state.store(true, Ordering::Release);
        self.signal();
    }

    /// Blocks until every pending event has been drained. Test helper;
    /// bounded at 5 seconds.
    #[doc(hidden)]
    pub fn wait_until_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.shared.pending.load(Ordering::Acquire) > 0
            || self.shared.events.any_set()
        {
            if Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Default for RtLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RtLogger {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.pending.fetch_add(1, Ordering::Release);
        self.shared.wake.notify_one();
        if let Ok(mut guard) = self.drainer.lock() {
            if let Some(handle) = guard.take() {
                // Joining can only hang if the drainer itself is stuck, and
                // it never blocks outside the condvar wait.
                let _ = handle.join();
            }
        }
    }
}

fn drain_loop(shared: Arc<Shared>) {
    loop {
        {
            let mut guard = match shared.wake_lock.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            while shared.pending.load(Ordering::Acquire) == 0 {
                guard = match shared.wake.wait(guard) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
        }

        if shared.shutting_down.load(Ordering::Acquire) {
            // Drain once more so nothing recorded before shutdown is lost.
            drain_events(&shared.events);
            return;
        }

        let pending = shared.pending.swap(0, Ordering::AcqRel);
        if pending > 0 {
            drain_events(&shared.events);
        }
    }
}

fn drain_events(ev: &Events) {
    if ev.releasing_waiting_threads.load(Ordering::Acquire) {
        rt_debug!(
            "{}: Output device started, releasing threads waiting for playthrough",
            "PLAYTHROUGH".bright_cyan()
        );
        ev.releasing_waiting_threads.store(false, Ordering::Release);
    }

    if ev.dropped_frames.load(Ordering::Acquire) {
        let frames = ev.dropped_frames_count.load(Ordering::Relaxed);
        tracing::warn!(
            "{}: Dropped {} frames of input captured before the output device started",
            "PLAYTHROUGH".bright_cyan(),
            frames
        );
        ev.dropped_frames.store(false, Ordering::Release);
    }

    if ev.no_samples_ready.load(Ordering::Acquire) {
        let requested = ev.no_samples_requested.load(Ordering::Relaxed);
        let available = ev.no_samples_available.load(Ordering::Relaxed);
        rt_debug!(
            "{}: No samples ready for the output cycle, requested {} with {} available",
            "PLAYTHROUGH".bright_cyan(),
            requested,
            available
        );
        ev.no_samples_ready.store(false, Ordering::Release);
    }

    if ev.ring_buffer_unavailable.load(Ordering::Acquire) {
        let side = if ev.ring_buffer_unavailable_input.load(Ordering::Relaxed) {
            "input"
        } else {
            "output"
        };
        rt_debug!(
            "{}: Ring buffer unavailable to the {} callback, dropping the cycle",
            "PLAYTHROUGH".bright_cyan(),
            side
        );
        ev.ring_buffer_unavailable.store(false, Ordering::Release);
    }

    if ev.ring_buffer_error.load(Ordering::Acquire) {
        let op = if ev.ring_buffer_error_op.load(Ordering::Relaxed) == 0 {
            "store"
        } else {
            "fetch"
        };
        let kind = if ev.ring_buffer_error_kind.load(Ordering::Relaxed) == 0 {
            "requested range outside buffered bounds"
        } else {
            "could not read a consistent time-bounds snapshot"
        };
        tracing::warn!(
            "{}: Ring buffer {} failed: {}",
            "PLAYTHROUGH_ERROR".bright_red(),
            op,
            kind
        );
        ev.ring_buffer_error.store(false, Ordering::Release);
    }

    if ev.exception_stopping_io_proc.load(Ordering::Acquire) {
        let side = if ev.exception_stopping_input.load(Ordering::Relaxed) {
            "input"
        } else {
            "output"
        };
        tracing::error!(
            "{}: Failed to stop the {} IOProc from its own callback",
            "PLAYTHROUGH_ERROR".bright_red(),
            side
        );
        ev.exception_stopping_io_proc.store(false, Ordering::Release);
    }

    if ev.unexpected_io_state.load(Ordering::Acquire) {
        let callback = if ev.unexpected_io_state_callback.load(Ordering::Relaxed) == 0 {
            "input"
        } else {
            "output"
        };
        let state = ev.unexpected_io_state_value.load(Ordering::Relaxed);
        tracing::error!(
            "{}: {} callback observed unexpected IO state {}",
            "PLAYTHROUGH_ERROR".bright_red(),
            callback,
            state
        );
        ev.unexpected_io_state.store(false, Ordering::Release);
    }
}
