use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle of one side of the playthrough IO path.
///
/// The control plane moves a side to `Starting` or `Stopping`; the IO
/// callbacks complete the transitions to `Running` and `Stopped` from the
/// real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl IoState {
    fn from_u32(value: u32) -> IoState {
        match value {
            0 => IoState::Stopped,
            1 => IoState::Starting,
            2 => IoState::Running,
            _ => IoState::Stopping,
        }
    }
}

/// An [`IoState`] cell shared between the control plane and an IO callback.
pub struct AtomicIoState(AtomicU32);

impl AtomicIoState {
    pub const fn new(state: IoState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub fn load(&self) -> IoState {
        IoState::from_u32(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: IoState) {
        self.0.store(state as u32, Ordering::Release);
    }

    /// Moves `from` to `to` if and only if the current state is `from`.
    /// Returns whether this call made the transition, so exactly one caller
    /// wins a contended transition.
    pub fn transition(&self, from: IoState, to: IoState) -> bool {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_transition_only_from_expected_state() {
        let state = AtomicIoState::new(IoState::Stopped);
        assert!(!state.transition(IoState::Starting, IoState::Running));
        assert_eq!(state.load(), IoState::Stopped);

        state.store(IoState::Starting);
        assert!(state.transition(IoState::Starting, IoState::Running));
        assert_eq!(state.load(), IoState::Running);
    }

    #[test]
    fn test_exactly_one_winner_under_contention() {
        for _ in 0..100 {
            let state = Arc::new(AtomicIoState::new(IoState::Starting));
            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let state = Arc::clone(&state);
                    std::thread::spawn(move || {
                        state.transition(IoState::Starting, IoState::Running)
                    })
                })
                .collect();

            let winners = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|&won| won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(state.load(), IoState::Running);
        }
    }
}
