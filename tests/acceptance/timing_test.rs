//! Timing acceptance tests against the real interval timer.
//!
//! # Acceptance Criteria
//!
//! - The reference session completes one hyperperiod in about 30 ticks
//! - The sequencer dispatch step never exceeds the tick interval
//! - With SCHED_FIFO placement the rate-monotonic priorities are applied

use super::common::{check_rt_prerequisites, reference_config};
use seq_common::config::AffinityRule;
use seq_runtime::{CollectingSink, SequencerRuntime, TerminationCause};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_reference_session_wall_clock() {
    let sink = Arc::new(CollectingSink::new());
    let report = SequencerRuntime::new(reference_config(), sink.clone())
        .run()
        .unwrap();

    assert_eq!(report.cause, TerminationCause::Completed);
    assert_eq!(report.cycles, 30);
    assert_eq!(report.scheduled(), vec![15, 3, 2]);
    assert!(report.tokens_balanced());

    // 30 ticks of 10 ms, the first one a full interval after arming.
    assert!(report.elapsed >= Duration::from_millis(290), "{:?}", report.elapsed);

    assert_eq!(report.dispatch.total, 30);
    assert_eq!(report.dispatch.overrun_count, 0);
    let max = report.dispatch.max_ns.unwrap_or(0);
    assert!(max < 10_000_000, "dispatch max {max}ns");

    let emitted: u64 = report.services.iter().map(|s| s.events).sum();
    assert_eq!(sink.events().len() as u64, emitted);
}

#[test]
#[ignore = "Requires SCHED_FIFO privileges and 4 online cores"]
fn test_realtime_reference_session() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {e}");
        return;
    }

    let mut config = reference_config();
    config.realtime.enabled = true;
    config.affinity = AffinityRule::default();

    let sink = Arc::new(CollectingSink::new());
    let report = SequencerRuntime::new(config, sink.clone()).run().unwrap();

    assert!(report.realtime);
    assert_eq!(report.plan.sequencer.priority, 99);
    let priorities: Vec<u8> = report.plan.services.iter().map(|s| s.placement.priority).collect();
    assert_eq!(priorities, vec![98, 97, 96]);
    assert_eq!(report.plan.sequencer.cpus, vec![1]);
    assert_eq!(report.plan.services[0].placement.cpus, vec![2]);
    assert_eq!(report.plan.services[1].placement.cpus, vec![3]);

    assert_eq!(report.scheduled(), vec![15, 3, 2]);
    assert!(report.tokens_balanced());
    assert_eq!(report.dispatch.overrun_count, 0);

    for s in &report.services {
        let expected = report.plan.services[s.index].placement.cpus[0];
        assert!(sink
            .events_for(s.index)
            .iter()
            .all(|e| e.core.map_or(true, |c| c == expected)));
    }

    // S1 and S3 share core 2 and are both released on tick 0; the higher
    // priority S1 must stamp its first event no later than S3.
    let first_stamp = |service: usize| {
        sink.events_for(service)
            .into_iter()
            .find(|e| e.sequence == 1)
            .map(|e| e.elapsed)
            .unwrap()
    };
    assert_eq!(report.plan.services[2].placement.cpus, vec![2]);
    assert!(first_stamp(0) <= first_stamp(2));
}
