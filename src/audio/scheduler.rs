use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use colored::Colorize;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    NotRun,
    Running,
    Finished,
    Cancelled,
}

struct TaskShared {
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    done: Condvar,
}

/// Handle to a task scheduled with [`TaskScheduler::defer`].
///
/// Cancellation is checked when the deadline fires; a task that has already
/// started running cannot be cancelled.
#[derive(Clone)]
pub struct DeferredTask {
    shared: Arc<TaskShared>,
}

impl DeferredTask {
    fn new() -> Self {
        Self {
            shared: Arc::new(TaskShared {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TaskState::NotRun),
                done: Condvar::new(),
            }),
        }
    }

    /// A handle that is already finished. Used as an initial placeholder so
    /// task slots never need to be `Option`al.
    pub fn completed() -> Self {
        let task = Self::new();
        if let Ok(mut state) = task.shared.state.lock() {
            *state = TaskState::Finished;
        }
        task
    }

    /// Requests cancellation. Returns true if the task will not run; false if
    /// it is already running or has finished.
    pub fn cancel(&self) -> bool {
        let Ok(mut state) = self.shared.state.lock() else {
            return false;
        };
        if *state == TaskState::NotRun {
            self.shared.cancelled.store(true, Ordering::Release);
            *state = TaskState::Cancelled;
            self.shared.done.notify_all();
            true
        } else {
            *state == TaskState::Cancelled
        }
    }

    /// True once the task's closure has run to completion.
    pub fn has_run(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| *state == TaskState::Finished)
            .unwrap_or(false)
    }

    /// Waits until the task has finished or been cancelled. Returns false on
    /// timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let Ok(mut state) = self.shared.state.lock() else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        while !matches!(*state, TaskState::Finished | TaskState::Cancelled) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.shared.done.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => state = guard,
                Err(_) => return false,
            }
        }
        true
    }

    // Returns true if the closure should run. Transitions NotRun -> Running.
    fn begin_run(&self) -> bool {
        let Ok(mut state) = self.shared.state.lock() else {
            return false;
        };
        if *state != TaskState::NotRun || self.shared.cancelled.load(Ordering::Acquire) {
            return false;
        }
        *state = TaskState::Running;
        true
    }

    fn finish_run(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            *state = TaskState::Finished;
        }
        self.shared.done.notify_all();
    }
}

struct ScheduledTask {
    deadline: Instant,
    handle: DeferredTask,
    run: Box<dyn FnOnce() + Send>,
}

// BinaryHeap is a max-heap; invert the deadline comparison so the earliest
// deadline pops first.
impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for ScheduledTask {}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

enum Message {
    Schedule(ScheduledTask),
    Shutdown,
}

/// Runs closures after a delay on a single worker thread.
///
/// Tasks with earlier deadlines run first. The worker checks each task's
/// cancellation token at fire time, so a cancelled task is skipped even if it
/// was already queued.
pub struct TaskScheduler {
    sender: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("task-scheduler".to_string())
            .spawn(move || worker_loop(receiver));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(
                    "{}: Failed to spawn scheduler thread, deferred tasks will never run: {}",
                    "SCHEDULER_ERROR".bright_red(),
                    err
                );
                None
            }
        };

        Self {
            sender,
            worker: Mutex::new(worker),
        }
    }

    /// Schedules `run` to execute after `delay`.
    pub fn defer<F>(&self, delay: Duration, run: F) -> DeferredTask
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = DeferredTask::new();
        let task = ScheduledTask {
            deadline: Instant::now() + delay,
            handle: handle.clone(),
            run: Box::new(run),
        };
        if self.sender.send(Message::Schedule(task)).is_err() {
            // Worker is gone; surface the task as cancelled rather than
            // leaving waiters hanging.
            handle.cancel();
        }
        handle
    }

    /// Schedules `run` to execute as soon as the worker is free.
    pub fn dispatch<F>(&self, run: F) -> DeferredTask
    where
        F: FnOnce() + Send + 'static,
    {
        self.defer(Duration::ZERO, run)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(receiver: Receiver<Message>) {
    let mut queue: BinaryHeap<ScheduledTask> = BinaryHeap::new();

    loop {
        let message = match queue.peek() {
            Some(next) => {
                let now = Instant::now();
                if next.deadline <= now {
                    if let Some(task) = queue.pop() {
                        if task.handle.begin_run() {
                            (task.run)();
                            task.handle.finish_run();
                        }
                    }
                    continue;
                }
                match receiver.recv_timeout(next.deadline - now) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match receiver.recv() {
                Ok(message) => message,
                Err(_) => return,
            },
        };

        match message {
            Message::Schedule(task) => queue.push(task),
            Message::Shutdown => {
                // Cancel anything still queued so waiters are released.
                for task in queue.drain() {
                    task.handle.cancel();
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_deferred_task_runs_after_delay() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let task = scheduler.defer(Duration::from_millis(10), move || {
            ran_clone.store(true, Ordering::SeqCst);
        });

        assert!(task.wait(Duration::from_secs(5)));
        assert!(task.has_run());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelled_task_never_runs() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let task = scheduler.defer(Duration::from_millis(200), move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        assert!(task.cancel());
        assert!(task.wait(Duration::from_secs(1)));
        assert!(!task.has_run());

        std::thread::sleep(Duration::from_millis(300));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_after_finish_reports_false() {
        let scheduler = TaskScheduler::new();
        let task = scheduler.dispatch(|| {});
        assert!(task.wait(Duration::from_secs(5)));
        assert!(!task.cancel());
        assert!(task.has_run());
    }

    #[test]
    fn test_earlier_deadline_runs_first() {
        let scheduler = TaskScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let late = scheduler.defer(Duration::from_millis(60), move || {
            o1.lock().unwrap().push("late");
        });
        let o2 = Arc::clone(&order);
        let early = scheduler.defer(Duration::from_millis(10), move || {
            o2.lock().unwrap().push("early");
        });

        assert!(late.wait(Duration::from_secs(5)));
        assert!(early.wait(Duration::from_secs(5)));
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn test_wait_times_out_on_unfired_task() {
        let scheduler = TaskScheduler::new();
        let task = scheduler.defer(Duration::from_secs(60), || {});
        assert!(!task.wait(Duration::from_millis(20)));
        task.cancel();
    }

    #[test]
    fn test_completed_placeholder() {
        let task = DeferredTask::completed();
        assert!(task.has_run());
        assert!(task.wait(Duration::ZERO));
        assert!(!task.cancel());
    }

    #[test]
    fn test_running_task_cannot_be_cancelled() {
        let scheduler = TaskScheduler::new();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));

        let (e, r, c) = (
            Arc::clone(&entered),
            Arc::clone(&release),
            Arc::clone(&counter),
        );
        let task = scheduler.dispatch(move || {
            e.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            c.fetch_add(1, Ordering::SeqCst);
        });

        while !entered.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!task.cancel());
        release.store(true, Ordering::SeqCst);
        assert!(task.wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
