//! Unit tests for restart cooldown tracking.
//!
//! Runs on a paused tokio clock so windows can be crossed instantly.

use std::time::Duration;

use worker_dispatch::orchestrator::registry::CooldownTracker;

const COOLDOWN: Duration = Duration::from_secs(300);

#[tokio::test(start_paused = true)]
async fn unknown_session_is_never_cooling_down() {
    let tracker = CooldownTracker::new(COOLDOWN);
    assert!(!tracker.is_within_cooldown("dispatch_x", None));
    assert_eq!(tracker.cooldown_remaining("dispatch_x", None), Duration::ZERO);
    assert!(tracker.last_attempt("dispatch_x").is_none());
}

/// Once recorded, a session stays in cooldown for the whole window and is
/// free the instant it elapses.
#[tokio::test(start_paused = true)]
async fn cooldown_holds_for_full_window() {
    let mut tracker = CooldownTracker::new(COOLDOWN);
    tracker.record_restart_attempt("dispatch_x");

    for _ in 0..29 {
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tracker.is_within_cooldown("dispatch_x", None));
    }

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(!tracker.is_within_cooldown("dispatch_x", None));
}

/// Recording again restarts the window from now.
#[tokio::test(start_paused = true)]
async fn re_recording_extends_the_window() {
    let mut tracker = CooldownTracker::new(COOLDOWN);
    tracker.record_restart_attempt("dispatch_x");
    tokio::time::advance(Duration::from_secs(200)).await;

    tracker.record_restart_attempt("dispatch_x");
    tokio::time::advance(Duration::from_secs(200)).await;

    assert_eq!(
        tracker.cooldown_remaining("dispatch_x", None),
        Duration::from_secs(100)
    );
}

#[tokio::test(start_paused = true)]
async fn sessions_cool_down_independently() {
    let mut tracker = CooldownTracker::new(COOLDOWN);
    tracker.record_restart_attempt("dispatch_a");

    assert!(tracker.is_within_cooldown("dispatch_a", None));
    assert!(!tracker.is_within_cooldown("dispatch_b", None));
}
