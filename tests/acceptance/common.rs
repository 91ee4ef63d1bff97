//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Checking real-time prerequisites (PREEMPT_RT, privileges, cores)
//! - Building session configurations
//! - Driving a session tick by tick

#![allow(dead_code)]

use seq_common::config::{AffinityRule, SequencerConfig, ServiceConfig};
use seq_runtime::{
    check_rt_capabilities, manual_ticks, online_cpus, CollectingSink, RunReport,
    SequencerRuntime, TickTrigger,
};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Check if the system has PREEMPT_RT kernel.
pub fn has_preempt_rt() -> bool {
    if let Ok(version) = fs::read_to_string("/proc/version") {
        version.contains("PREEMPT_RT") || version.contains("PREEMPT RT")
    } else {
        false
    }
}

/// Check all prerequisites for tests that apply real-time placement.
pub fn check_rt_prerequisites() -> Result<(), String> {
    let mut errors = Vec::new();

    if !check_rt_capabilities().can_use_rt_priority(99) {
        errors.push("Not allowed to use SCHED_FIFO priority 99".to_string());
    }
    let cpus = online_cpus();
    if cpus < 4 {
        errors.push(format!("Need 4 online cores, found {cpus}"));
    }
    if !has_preempt_rt() {
        eprintln!("WARNING: PREEMPT_RT kernel not detected - timing results may be unreliable");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// The reference three-service layout without real-time placement.
pub fn reference_config() -> SequencerConfig {
    SequencerConfig {
        affinity: AffinityRule::None,
        ..SequencerConfig::default()
    }
}

/// A configuration with one service per divisor.
pub fn config_for(divisors: &[u64], total_cycles: Option<u64>) -> SequencerConfig {
    SequencerConfig {
        tick_interval: Duration::from_millis(1),
        total_cycles,
        affinity: AffinityRule::None,
        services: divisors.iter().map(|&d| ServiceConfig::every(d)).collect(),
        ..SequencerConfig::default()
    }
}

/// Run `config` from a manual tick source.
///
/// `drive` receives the trigger on its own thread and fires the ticks.
pub fn run_manual<F>(config: SequencerConfig, drive: F) -> (RunReport, Arc<CollectingSink>)
where
    F: FnOnce(&TickTrigger, &seq_runtime::AbortHandle) + Send + 'static,
{
    let sink = Arc::new(CollectingSink::new());
    let (source, trigger) = manual_ticks();
    let runtime =
        SequencerRuntime::new(config, sink.clone()).with_tick_source(Box::new(source));
    let abort = runtime.abort_handle();

    let driver = thread::spawn(move || drive(&trigger, &abort));
    let report = runtime.run().expect("session failed");
    driver.join().expect("driver panicked");
    (report, sink)
}

/// Fire ticks until the session stops.
pub fn fire_until_stopped(trigger: &TickTrigger) -> u64 {
    trigger.fire_n(u64::MAX)
}
