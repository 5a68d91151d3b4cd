//! φ-accrual failure detection over heartbeat arrivals.
//!
//! The detector keeps a sliding window of inter-arrival intervals and turns
//! "how late is the current heartbeat" into a continuous suspicion level φ,
//! the negative log of the probability that a heartbeat this late would
//! still arrive given the observed mean and variance. Suspicion must persist
//! past `failure_interval` before availability flips, so one late probe does
//! not bounce an endpoint out of rotation.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Inter-arrival samples kept for the estimate.
const SAMPLE_WINDOW: usize = 100;

/// Samples needed before the estimate is trusted at all.
const MIN_SAMPLES: usize = 3;

/// Floor on the standard deviation so a perfectly regular probe schedule
/// does not make the estimator hair-triggered.
const MIN_STD_DEVIATION_MILLIS: f64 = 100.0;

#[derive(Debug)]
pub(crate) struct PhiAccrualFailureDetector {
    phi_threshold: f64,
    failure_interval: Duration,
    state: Mutex<DetectorState>,
}

#[derive(Debug, Default)]
struct DetectorState {
    intervals: VecDeque<f64>,
    last_arrival: Option<Instant>,
    last_failure: Option<Instant>,
    suspicious_since: Option<Instant>,
}

impl PhiAccrualFailureDetector {
    pub fn new(phi_threshold: f64, failure_interval: Duration) -> Self {
        PhiAccrualFailureDetector {
            phi_threshold,
            failure_interval,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Records a heartbeat arrival. Clears standing suspicion and any
    /// explicit failure mark.
    pub fn heartbeat(&self) {
        self.heartbeat_at(Instant::now());
    }

    fn heartbeat_at(&self, now: Instant) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(prev) = state.last_arrival {
            let interval = now.saturating_duration_since(prev).as_secs_f64() * 1000.0;
            if state.intervals.len() == SAMPLE_WINDOW {
                state.intervals.pop_front();
            }
            state.intervals.push_back(interval);
        }
        state.last_arrival = Some(now);
        state.last_failure = None;
        state.suspicious_since = None;
    }

    /// Records an explicit failure observed by the owning sender.
    pub fn on_failure(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.last_failure = Some(Instant::now());
    }

    pub fn is_available(&self) -> bool {
        self.is_available_at(Instant::now())
    }

    fn is_available_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");

        if let Some(failed_at) = state.last_failure {
            if now.saturating_duration_since(failed_at) < self.failure_interval {
                return false;
            }
        }

        let phi = phi_of(&state, now);
        if phi <= self.phi_threshold {
            state.suspicious_since = None;
            return true;
        }
        match state.suspicious_since {
            None => {
                state.suspicious_since = Some(now);
                true
            }
            Some(since) => now.saturating_duration_since(since) < self.failure_interval,
        }
    }

    #[cfg(test)]
    fn phi_at(&self, now: Instant) -> f64 {
        let state = self.state.lock().expect("lock poisoned");
        phi_of(&state, now)
    }
}

/// φ for the elapsed time since the last arrival, using the logistic
/// approximation of the normal CDF.
fn phi_of(state: &DetectorState, now: Instant) -> f64 {
    let (Some(last), true) = (state.last_arrival, state.intervals.len() >= MIN_SAMPLES) else {
        return 0.0;
    };
    let elapsed = now.saturating_duration_since(last).as_secs_f64() * 1000.0;

    let n = state.intervals.len() as f64;
    let mean = state.intervals.iter().sum::<f64>() / n;
    let variance = state
        .intervals
        .iter()
        .map(|x| (x - mean) * (x - mean))
        .sum::<f64>()
        / n;
    let std_dev = variance.sqrt().max(MIN_STD_DEVIATION_MILLIS);

    let y = (elapsed - mean) / std_dev;
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    if elapsed > mean {
        -(e / (1.0 + e)).log10()
    } else {
        -(1.0 - 1.0 / (1.0 + e)).log10()
    }
}
