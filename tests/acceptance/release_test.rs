//! Release-count acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Over a run of N ticks a service with divisor d is released
//!   floor((N-1)/d)+1 times, plus one forced release at termination
//! - An abort ends the run at the next tick, with the same release rule
//! - Every posted token is consumed once all services have been joined
//! - Event sequence numbers are contiguous per service and time-ordered

use super::common::{config_for, fire_until_stopped, reference_config, run_manual};
use seq_common::state::SequencerPhase;
use seq_runtime::TerminationCause;

#[test]
fn test_reference_hyperperiod_release_counts() {
    let (report, sink) = run_manual(reference_config(), |trigger, _| {
        fire_until_stopped(trigger);
    });

    assert_eq!(report.total_cycles, 30);
    assert_eq!(report.cycles, 30);
    assert_eq!(report.cause, TerminationCause::Completed);
    assert_eq!(report.phase, SequencerPhase::Stopped);
    assert_eq!(report.scheduled(), vec![15, 3, 2]);
    assert!(report.services.iter().all(|s| s.forced == 1));
    assert!(report.tokens_balanced());

    for s in &report.services {
        assert_eq!(s.posted, s.scheduled + s.forced);
        assert_eq!(s.events + s.drained, s.consumed);
        assert_eq!(sink.events_for(s.index).len() as u64, s.events);
    }
}

#[test]
fn test_explicit_run_length() {
    let (report, _) = run_manual(config_for(&[1, 4], Some(12)), |trigger, _| {
        fire_until_stopped(trigger);
    });

    assert_eq!(report.cycles, 12);
    assert_eq!(report.cause, TerminationCause::Completed);
    // Ticks 0..=11: every tick, and ticks 0, 4, 8.
    assert_eq!(report.scheduled(), vec![12, 3]);
}

#[test]
fn test_abort_after_five_ticks() {
    let (report, _) = run_manual(reference_config(), |trigger, abort| {
        assert_eq!(trigger.fire_n(5), 5);
        abort.abort();
        // The next tick is still dispatched and then ends the run.
        assert!(!trigger.fire());
    });

    assert_eq!(report.cause, TerminationCause::Aborted);
    assert_eq!(report.cycles, 6);
    assert_eq!(report.scheduled(), vec![3, 1, 1]);
    assert!(report.services.iter().all(|s| s.forced == 1));
    assert!(report.tokens_balanced());
}

#[test]
fn test_abort_before_first_tick() {
    let (report, _) = run_manual(reference_config(), |trigger, abort| {
        abort.abort();
        assert!(!trigger.fire());
    });

    assert_eq!(report.cause, TerminationCause::Aborted);
    assert_eq!(report.cycles, 1);
    // Tick 0 releases every service.
    assert_eq!(report.scheduled(), vec![1, 1, 1]);
    assert!(report.tokens_balanced());
}

#[test]
fn test_source_exhaustion_releases_services() {
    let (report, _) = run_manual(config_for(&[1, 2], Some(100)), |trigger, _| {
        assert_eq!(trigger.fire_n(3), 3);
        // Dropping the trigger ends the tick source.
    });

    assert_eq!(report.cycles, 3);
    assert_eq!(report.cause, TerminationCause::Aborted);
    assert_eq!(report.scheduled(), vec![3, 2]);
    assert!(report.services.iter().all(|s| s.forced == 1));
    assert!(report.tokens_balanced());
}

#[test]
fn test_event_sequences_are_contiguous() {
    let (report, sink) = run_manual(config_for(&[1, 3], Some(12)), |trigger, _| {
        fire_until_stopped(trigger);
    });

    for s in &report.services {
        let events = sink.events_for(s.index);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (1..=s.events).collect();
        assert_eq!(sequences, expected);
        assert!(events.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
        if let Some(first) = events.first() {
            let prefix = format!("Thread {} start 1 @ sec=", s.index + 1);
            assert!(first.to_string().starts_with(&prefix));
        }
    }
}
