//! Pool-wide cooldown gate.
//!
//! The scheduler trips the gate every M completions; each worker calls
//! [`PoolCooldown::wait`] before its next provider call and blocks until the
//! window has elapsed. Calls already in flight are not interrupted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// State of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Workers may call the provider.
    Open,
    /// Workers wait until `until` before calling the provider.
    Paused { until: Instant },
}

/// Shared pause shared by every worker of one pool.
#[derive(Debug)]
pub struct PoolCooldown {
    state: Mutex<GateState>,
    trips: AtomicU64,
}

impl Default for PoolCooldown {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolCooldown {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Open),
            trips: AtomicU64::new(0),
        }
    }

    /// Pause the pool for `duration` from now. An already-running pause is
    /// only ever extended, never shortened.
    pub fn trip(&self, duration: Duration) {
        self.trips.fetch_add(1, Ordering::Relaxed);
        let until = Instant::now() + duration;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = match *state {
            GateState::Paused { until: current } if current > until => GateState::Paused { until: current },
            _ => GateState::Paused { until },
        };
    }

    /// Time left in the current pause (zero if open).
    pub fn remaining(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            GateState::Open => Duration::ZERO,
            GateState::Paused { until } => {
                let left = until.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    *state = GateState::Open;
                }
                left
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        !self.remaining().is_zero()
    }

    /// Block until the gate is open. The lock is released while sleeping, so
    /// a trip that extends the pause is picked up on the next loop.
    pub fn wait(&self) {
        loop {
            let left = self.remaining();
            if left.is_zero() {
                return;
            }
            std::thread::sleep(left);
        }
    }

    /// How many times the gate has been tripped.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}
