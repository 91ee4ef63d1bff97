//! Shutdown and startup-failure acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A service that does not exit within the join window is reported as a
//!   shutdown timeout instead of hanging the caller
//! - Invalid configurations fail before any tick is dispatched
//! - A configuration file reproduces the built-in reference layout

use super::common::{config_for, fire_until_stopped, reference_config};
use seq_common::config::{AffinityRule, SequencerConfig};
use seq_common::error::SeqError;
use seq_runtime::{manual_ticks, CollectingSink, EventRecord, EventSink, SequencerRuntime};
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Sink that blocks service 0 inside `record` until opened.
#[derive(Default)]
struct GateSink {
    open: Mutex<bool>,
    opened: Condvar,
}

impl GateSink {
    fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.opened.notify_all();
    }
}

impl EventSink for GateSink {
    fn record(&self, event: EventRecord) {
        if event.service != 0 {
            return;
        }
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = self
                .opened
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[test]
fn test_stuck_service_reports_shutdown_timeout() {
    let mut config = config_for(&[1, 2], Some(4));
    config.join_timeout = Duration::from_millis(100);

    let sink = Arc::new(GateSink::default());
    let (source, trigger) = manual_ticks();
    let runtime = SequencerRuntime::new(config, sink.clone()).with_tick_source(Box::new(source));
    let driver = thread::spawn(move || fire_until_stopped(&trigger));

    let started = Instant::now();
    let err = runtime.run().unwrap_err();
    let waited = started.elapsed();
    driver.join().unwrap();

    assert_eq!(
        err,
        SeqError::ShutdownTimeout {
            pending: 1,
            timeout_ms: 100
        }
    );
    assert!(!err.is_startup_fatal());
    assert!(waited < Duration::from_secs(5), "join took {waited:?}");

    // Let the detached service finish.
    sink.open();
}

#[test]
fn test_invalid_run_length_fails_at_startup() {
    let sink = Arc::new(CollectingSink::new());
    let err = SequencerRuntime::new(config_for(&[2, 3], Some(8)), sink.clone())
        .run()
        .unwrap_err();

    assert!(err.is_startup_fatal());
    assert!(sink.events().is_empty());
}

#[test]
fn test_config_file_matches_reference_layout() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
tick_interval = "10ms"

[affinity]
rule = "none"

[[services]]
divisor = 2

[[services]]
divisor = 10

[[services]]
divisor = 15
"#
    )
    .unwrap();

    let config = SequencerConfig::from_file(file.path()).unwrap();
    let reference = reference_config();
    assert_eq!(config.divisors(), reference.divisors());
    assert_eq!(config.tick_interval, reference.tick_interval);
    assert_eq!(config.affinity, reference.affinity);
    assert_eq!(config.service_name(1), "S2");
}

#[test]
fn test_shipped_config_requests_realtime_placement() {
    let config = SequencerConfig::from_toml(include_str!("../../config/default.toml")).unwrap();
    config.validate().unwrap();

    assert!(config.realtime.enabled);
    assert_eq!(config.divisors(), vec![2, 10, 15]);
    assert_eq!(
        config.affinity,
        AffinityRule::EvenOdd {
            sequencer_cpu: 1,
            even_cpu: 2,
            odd_cpu: 3,
        }
    );
}
