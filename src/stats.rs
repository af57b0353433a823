//! Success/failure aggregation and round-over-round change detection.
//!
//! Every mutation happens under one lock so that the global totals and the
//! per-key counts always agree at the instant of a call.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCounts {
    pub success: u64,
    pub fail: u64,
}

impl KeyCounts {
    fn record(&mut self, success: bool) {
        if success {
            self.success += 1;
        } else {
            self.fail += 1;
        }
    }

    fn is_success_only(&self) -> bool {
        self.success > 0 && self.fail == 0
    }

    fn is_fail_only(&self) -> bool {
        self.fail > 0 && self.success == 0
    }
}

/// Read-only copy of the tracker handed to the display layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub success: u64,
    pub fail: u64,
    pub from_success_to_fail: BTreeSet<String>,
    pub from_fail_to_success: BTreeSet<String>,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }

    pub fn fail_percent(&self) -> f64 {
        fail_percent(self.success, self.fail)
    }

    /// Union of both change sets, sorted.
    pub fn changed(&self) -> BTreeSet<String> {
        self.from_success_to_fail
            .union(&self.from_fail_to_success)
            .cloned()
            .collect()
    }
}

pub fn fail_percent(success: u64, fail: u64) -> f64 {
    let total = success + fail;
    if total == 0 {
        0.0
    } else {
        fail as f64 * 100.0 / total as f64
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    success: u64,
    fail: u64,
    current: HashMap<String, KeyCounts>,
    last: HashMap<String, KeyCounts>,
    from_success_to_fail: BTreeSet<String>,
    from_fail_to_success: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct FailRateTracker {
    state: Mutex<TrackerState>,
}

impl FailRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits one outcome to `key` and returns the global
    /// `(success, fail)` totals right after the increment.
    pub fn increment(&self, key: &str, success: bool) -> (u64, u64) {
        let mut state = self.state.lock();
        if success {
            state.success += 1;
        } else {
            state.fail += 1;
        }
        let totals = (state.success, state.fail);

        match state.current.get_mut(key) {
            Some(counts) => counts.record(success),
            None => {
                let mut counts = KeyCounts::default();
                counts.record(success);
                state.current.insert(key.to_string(), counts);
            }
        }
        totals
    }

    /// Recomputes the change sets from the current and previous round.
    ///
    /// A flip needs a clean classification in both rounds: fail-only now
    /// and success-only before, or the reverse. Keys with both successes
    /// and failures in either round, and keys new this round, are never
    /// flips. Without a previous round nothing is reported.
    pub fn statistic(&self) {
        let mut state = self.state.lock();
        if state.last.is_empty() {
            return;
        }

        let (last_success, last_fail) = classify(&state.last);
        let (now_success, now_fail) = classify(&state.current);

        let to_fail: BTreeSet<String> = now_fail.intersection(&last_success).cloned().collect();
        let to_success: BTreeSet<String> = now_success.intersection(&last_fail).cloned().collect();

        if !to_fail.is_empty() {
            warn!(keys = ?to_fail, "targets went from success to fail");
        }
        if !to_success.is_empty() {
            warn!(keys = ?to_success, "targets went from fail to success");
        }
        state.from_success_to_fail = to_fail;
        state.from_fail_to_success = to_success;
    }

    /// Rolls the current round into the previous-round snapshot and zeroes
    /// every current counter.
    pub fn clean(&self) {
        let mut state = self.state.lock();
        let TrackerState {
            success,
            fail,
            current,
            last,
            ..
        } = &mut *state;

        *success = 0;
        *fail = 0;
        for counts in last.values_mut() {
            *counts = KeyCounts::default();
        }
        for (key, counts) in current.iter_mut() {
            last.insert(key.clone(), *counts);
            *counts = KeyCounts::default();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.state.lock();
        StatsSnapshot {
            success: state.success,
            fail: state.fail,
            from_success_to_fail: state.from_success_to_fail.clone(),
            from_fail_to_success: state.from_fail_to_success.clone(),
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.success, state.fail)
    }

    pub fn key_counts(&self, key: &str) -> Option<KeyCounts> {
        self.state.lock().current.get(key).copied()
    }
}

fn classify(round: &HashMap<String, KeyCounts>) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut success_only = BTreeSet::new();
    let mut fail_only = BTreeSet::new();
    for (key, counts) in round {
        if counts.is_success_only() {
            success_only.insert(key.clone());
        } else if counts.is_fail_only() {
            fail_only.insert(key.clone());
        }
    }
    (success_only, fail_only)
}
