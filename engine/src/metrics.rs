//! Prometheus metrics for the action dispatcher and lock manager.

use metrics::{counter, gauge, histogram};

/// Record an action claimed by a worker.
pub fn action_claimed(verb: &str) {
    counter!("drover_actions_claimed_total", "verb" => verb.to_string()).increment(1);
}

/// Record an action finishing in a terminal state.
pub fn action_finished(verb: &str, outcome: &'static str) {
    counter!("drover_actions_finished_total", "verb" => verb.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record wall-clock time spent executing a handler.
pub fn action_duration(verb: &str, duration_secs: f64) {
    histogram!("drover_action_duration_seconds", "verb" => verb.to_string())
        .record(duration_secs);
}

/// Record a claim attempt that lost the target lock to another engine.
pub fn lock_contended(target_type: &str) {
    counter!("drover_lock_contention_total", "target_type" => target_type.to_string())
        .increment(1);
}

/// Record a steal attempt against a stale lock.
pub fn lock_steal_attempted(target_type: &str) {
    counter!("drover_lock_steals_attempted_total", "target_type" => target_type.to_string())
        .increment(1);
}

/// Record a completed steal.
pub fn lock_stolen(target_type: &str) {
    counter!("drover_lock_steals_total", "target_type" => target_type.to_string()).increment(1);
}

/// Set the number of workers currently executing a handler.
pub fn workers_busy(count: usize) {
    gauge!("drover_workers_busy").set(count as f64);
}
