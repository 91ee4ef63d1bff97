//! Run report diagnostics for the daemon.
//!
//! Turns a [`RunReport`] into a health verdict, a human-readable summary, or
//! JSON for external tooling.

use seq_common::metrics::TimingSnapshot;
use seq_runtime::{RunReport, TerminationCause};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{info, warn};

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Completed with no overrun, no missed tick, and balanced tokens.
    Healthy,
    /// Completed, but some ticks overran or were coalesced.
    Degraded,
    /// Aborted before the configured run length.
    Aborted,
    /// A posted token was never consumed.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Aborted => write!(f, "aborted"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Classify a finished run.
#[must_use]
pub fn health(report: &RunReport) -> HealthStatus {
    if !report.tokens_balanced() {
        HealthStatus::Unhealthy
    } else if report.cause == TerminationCause::Aborted {
        HealthStatus::Aborted
    } else if report.dispatch.overrun_count > 0 || report.missed_ticks > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn micros(ns: Option<u64>) -> String {
    ns.map_or_else(
        || "-".to_string(),
        |ns| format!("{:.1}us", Duration::from_nanos(ns).as_secs_f64() * 1e6),
    )
}

fn timing_line(out: &mut String, label: &str, snap: &TimingSnapshot) {
    let _ = writeln!(
        out,
        "{label:<10} n={} min={} mean={} p99={} max={} jitter={} over-deadline={}",
        snap.total,
        micros(snap.min_ns),
        micros(snap.mean_ns),
        micros(snap.p99_ns),
        micros(snap.max_ns),
        micros(snap.jitter_ns()),
        snap.overrun_count
    );
}

/// Render the report as plain text.
#[must_use]
pub fn format_report_text(report: &RunReport) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "run: {} after {} of {} cycles in {:.3}s ({}), realtime={}",
        cause_label(report.cause),
        report.cycles,
        report.total_cycles,
        report.elapsed.as_secs_f64(),
        health(report),
        report.realtime
    );
    let _ = writeln!(
        out,
        "sequencer: priority {} cpus {:?}",
        report.plan.sequencer.priority, report.plan.sequencer.cpus
    );
    let _ = writeln!(
        out,
        "{:<4} {:<12} {:>7} {:>4} {:>5} {:>9} {:>6} {:>8} {:>8} {:>7}",
        "idx",
        "name",
        "divisor",
        "prio",
        "cpus",
        "scheduled",
        "forced",
        "posted",
        "consumed",
        "events"
    );
    for s in &report.services {
        let placement = report
            .plan
            .services
            .iter()
            .find(|p| p.index == s.index)
            .map(|p| &p.placement);
        let _ = writeln!(
            out,
            "{:<4} {:<12} {:>7} {:>4} {:>5} {:>9} {:>6} {:>8} {:>8} {:>7}",
            s.index,
            s.name,
            s.divisor,
            placement.map_or(0, |p| p.priority),
            placement.map_or_else(|| "-".to_string(), |p| format!("{:?}", p.cpus)),
            s.scheduled,
            s.forced,
            s.posted,
            s.consumed,
            s.events
        );
    }
    timing_line(&mut out, "dispatch", &report.dispatch);
    timing_line(&mut out, "wakeup", &report.wakeup);
    let _ = writeln!(out, "missed ticks: {}", report.missed_ticks);
    if let Some(u) = report.plan.utilization {
        let _ = writeln!(
            out,
            "utilization: {:.3} (bound {:.3}, {})",
            u.utilization,
            u.bound,
            if u.within_bound { "within" } else { "exceeded" }
        );
    }
    out
}

/// Render the report as pretty JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn format_report_json(report: &RunReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// Log the headline figures of a run.
pub fn log_report(report: &RunReport) {
    let status = health(report);
    for s in &report.services {
        info!(
            service = s.index,
            name = %s.name,
            scheduled = s.scheduled,
            forced = s.forced,
            events = s.events,
            drained = s.drained,
            "Service summary"
        );
    }
    if status == HealthStatus::Healthy || status == HealthStatus::Aborted {
        info!(
            %status,
            cycles = report.cycles,
            dispatch_max_ns = report.dispatch.max_ns,
            "Run finished"
        );
    } else {
        warn!(
            %status,
            cycles = report.cycles,
            overruns = report.dispatch.overrun_count,
            missed_ticks = report.missed_ticks,
            "Run finished with problems"
        );
    }
}

fn cause_label(cause: TerminationCause) -> &'static str {
    match cause {
        TerminationCause::Completed => "completed",
        TerminationCause::Aborted => "aborted",
    }
}
