//! One-shot and periodic timers driving a single callback
//!
//! Every `start` arms a new generation and spawns a sleeper task on the
//! runtime; `stop` and restarts invalidate older generations, so a sleeper
//! that wakes after being superseded never runs the callback. Callbacks
//! receive a [`TimerExpiry`] that owners can re-check under their own lock
//! with [`Timer::is_current`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Token passed to the callback identifying the armed generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerMode {
    OneShot,
    Periodic,
}

struct TimerState {
    period: Duration,
    mode: TimerMode,
    generation: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
}

type Callback = Arc<dyn Fn(TimerExpiry) + Send + Sync>;

/// Timer bound to one callback
pub struct Timer {
    name: &'static str,
    runtime: Handle,
    state: Arc<Mutex<TimerState>>,
    callback: Callback,
}

impl Timer {
    /// Create a stopped one-shot timer with zero period
    pub fn new(
        name: &'static str,
        runtime: Handle,
        callback: impl Fn(TimerExpiry) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            runtime,
            state: Arc::new(Mutex::new(TimerState {
                period: Duration::ZERO,
                mode: TimerMode::OneShot,
                generation: 0,
                armed: false,
                task: None,
            })),
            callback: Arc::new(callback),
        }
    }

    /// Fire once, `period` after the next `start`
    pub fn set_one_shot(&self, period: Duration) {
        let mut state = self.state.lock();
        state.period = period;
        state.mode = TimerMode::OneShot;
    }

    /// Fire every `period` after the next `start` until stopped
    pub fn set_periodic(&self, period: Duration) {
        let mut state = self.state.lock();
        state.period = period;
        state.mode = TimerMode::Periodic;
    }

    /// Arm the timer; restarts it when already running
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.armed = true;
        if let Some(task) = state.task.take() {
            task.abort();
        }

        let generation = state.generation;
        let period = state.period;
        let mode = state.mode;
        let weak_state = Arc::downgrade(&self.state);
        let callback = Arc::clone(&self.callback);
        let name = self.name;
        trace!(timer = name, generation, period_ms = period.as_millis() as u64, "Timer started");

        state.task = Some(self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !Self::expire(&weak_state, generation, mode) {
                    return;
                }
                trace!(timer = name, generation, "Timer elapsed");
                callback(TimerExpiry { generation });
                if mode == TimerMode::OneShot {
                    return;
                }
            }
        }));
    }

    /// Disarm the timer; a pending expiry is discarded
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.armed = false;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().armed
    }

    /// Whether `expiry` belongs to the generation currently armed
    pub fn is_current(&self, expiry: TimerExpiry) -> bool {
        self.state.lock().generation == expiry.generation
    }

    fn expire(state: &Weak<Mutex<TimerState>>, generation: u64, mode: TimerMode) -> bool {
        let Some(state) = state.upgrade() else {
            return false;
        };
        let mut state = state.lock();
        if state.generation != generation {
            return false;
        }
        if mode == TimerMode::OneShot {
            state.armed = false;
        }
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().task.take() {
            task.abort();
        }
    }
}
