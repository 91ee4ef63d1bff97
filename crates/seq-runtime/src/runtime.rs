//! Session orchestration.
//!
//! [`SequencerRuntime::run`] performs one complete run:
//!
//! 1. Validate the configuration and build the placement plan
//! 2. Check real-time privileges and lock memory (when enabled)
//! 3. Create descriptors, release tokens, and the sequencer
//! 4. Start the timer thread, then the services, and wait for both handshakes
//! 5. Arm the timer and wait for termination
//! 6. Join the services within the join window and build a [`RunReport`]
//!
//! A failure after services exist cancels the sequencer so every service is
//! released and joined before the error is returned.

use crate::planner::{plan, SchedulePlan};
use crate::realtime::{init_realtime, online_cpus, validate_rt_capabilities};
use crate::sequencer::{
    AbortHandle, ReleaseStats, Sequencer, ServiceDescriptor, TerminationCause,
};
use crate::service::{ServiceContext, ServiceGroup, ServiceStats};
use crate::sink::EventSink;
use crate::timer::{IntervalTimer, TickSource, Timer};
use crate::token::release_channel;
use crossbeam_channel::{bounded, RecvTimeoutError};
use seq_common::config::SequencerConfig;
use seq_common::error::{SeqError, SeqResult};
use seq_common::metrics::TimingSnapshot;
use seq_common::state::SequencerPhase;
use seq_common::time::ProcessClock;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Per-service outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    /// Service index.
    pub index: usize,
    /// Display name.
    pub name: String,
    /// Period divisor.
    pub divisor: u64,
    /// Releases due to the divisor.
    pub scheduled: u64,
    /// Releases posted at termination.
    pub forced: u64,
    /// Tokens posted.
    pub posted: u64,
    /// Tokens consumed.
    pub consumed: u64,
    /// Events emitted.
    pub events: u64,
    /// Tokens drained at shutdown without an event.
    pub drained: u64,
}

impl ServiceReport {
    fn new(release: ReleaseStats, service: Option<&ServiceStats>) -> Self {
        Self {
            index: release.index,
            name: release.name,
            divisor: release.divisor,
            scheduled: release.scheduled,
            forced: release.forced,
            posted: release.tokens.posted,
            consumed: release.tokens.consumed,
            events: service.map_or(0, |s| s.events),
            drained: service.map_or(0, |s| s.drained),
        }
    }
}

/// Outcome of a complete run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Ticks dispatched.
    pub cycles: u64,
    /// Configured run length.
    pub total_cycles: u64,
    /// Why the run ended.
    pub cause: TerminationCause,
    /// Final sequencer phase.
    pub phase: SequencerPhase,
    /// Whether the real-time placement was applied.
    pub realtime: bool,
    /// The placement plan.
    pub plan: SchedulePlan,
    /// Per-service totals, in index order.
    pub services: Vec<ServiceReport>,
    /// Dispatch step durations.
    pub dispatch: TimingSnapshot,
    /// Tick wake-up lateness.
    pub wakeup: TimingSnapshot,
    /// Coalesced timer expirations.
    pub missed_ticks: u64,
    /// Wall-clock duration from timer arming to the last join.
    pub elapsed: Duration,
}

impl RunReport {
    /// Whether every posted token was consumed.
    #[must_use]
    pub fn tokens_balanced(&self) -> bool {
        self.services.iter().all(|s| s.posted == s.consumed)
    }

    /// Scheduled releases per service, in index order.
    #[must_use]
    pub fn scheduled(&self) -> Vec<u64> {
        self.services.iter().map(|s| s.scheduled).collect()
    }
}

/// Runs one sequencer session.
pub struct SequencerRuntime {
    config: SequencerConfig,
    sink: Arc<dyn EventSink>,
    abort: AbortHandle,
    source: Option<Box<dyn TickSource>>,
}

impl std::fmt::Debug for SequencerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerRuntime")
            .field("config", &self.config)
            .field("aborted", &self.abort.is_aborted())
            .finish_non_exhaustive()
    }
}

impl SequencerRuntime {
    /// Create a runtime that reports events to `sink`.
    #[must_use]
    pub fn new(config: SequencerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            abort: AbortHandle::new(),
            source: None,
        }
    }

    /// Replace the interval timer with another tick source.
    #[must_use]
    pub fn with_tick_source(mut self, source: Box<dyn TickSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Handle that ends the run early.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Execute the session to completion.
    ///
    /// # Errors
    ///
    /// Returns a startup error (invalid configuration, plan, privileges,
    /// thread creation) before any tick is dispatched, or
    /// [`SeqError::ShutdownTimeout`] if services do not exit in time.
    pub fn run(self) -> SeqResult<RunReport> {
        let Self {
            config,
            sink,
            abort,
            source,
        } = self;

        config
            .validate()
            .map_err(|e| SeqError::Initialization(e.to_string()))?;

        let rt = &config.realtime;
        let plan = plan(&config, rt.enabled.then(online_cpus))?;
        plan.log();

        if rt.enabled {
            validate_rt_capabilities(rt)?;
            init_realtime(rt)?;
        } else {
            info!("Real-time placement disabled; plan computed but not applied");
        }

        let clock = ProcessClock::start();
        let total_cycles = config.total_cycles.unwrap_or(plan.hyperperiod);

        let mut pairs = Vec::with_capacity(plan.services.len());
        let mut waiters = Vec::with_capacity(plan.services.len());
        for service in &plan.services {
            let descriptor = Arc::new(ServiceDescriptor::new(
                service.index,
                service.name.clone(),
                service.divisor,
                rt.enabled.then(|| service.placement.clone()),
            )?);
            let (poster, waiter) = release_channel();
            pairs.push((Arc::clone(&descriptor), poster));
            waiters.push((descriptor, waiter));
        }
        let sequencer = Sequencer::new(pairs, total_cycles, abort.clone());

        let source = source.unwrap_or_else(|| {
            Box::new(IntervalTimer::new(config.tick_interval)) as Box<dyn TickSource>
        });
        let timer = Timer::spawn(
            sequencer,
            source,
            rt.enabled.then(|| plan.sequencer.clone()),
            config.tick_interval,
            config.metrics.histogram_size,
        )?;

        let mut group = ServiceGroup::new(ServiceContext {
            sink,
            clock,
            prefault_stack: if rt.enabled { rt.prefault_stack_size } else { 0 },
        });
        let started = waiters
            .into_iter()
            .try_for_each(|(descriptor, waiter)| group.spawn(descriptor, waiter))
            .and_then(|()| group.await_ready(config.join_timeout));
        if let Err(e) = started {
            return Err(abandon(timer, group, config.join_timeout, e));
        }

        let start = Instant::now();
        if let Err(e) = timer.start() {
            return Err(abandon(timer, group, config.join_timeout, e));
        }
        info!(
            tick_us = config.tick_interval.as_micros(),
            total_cycles,
            services = group.len(),
            "Sequencer running"
        );

        let limit = config.max_runtime.map(|limit| RunLimit::start(limit, abort.clone()));

        let timer_report = timer.join();
        if let Some(limit) = limit {
            limit.stop();
        }
        let timer_report = timer_report?;
        let stats = group.join(config.join_timeout)?;
        let elapsed = start.elapsed();

        let mut sequencer = timer_report.sequencer;
        sequencer.mark_stopped()?;
        let cause = sequencer.cause().unwrap_or(TerminationCause::Aborted);

        let services = sequencer
            .release_stats()
            .into_iter()
            .map(|release| {
                let service = stats.iter().find(|s| s.index == release.index);
                ServiceReport::new(release, service)
            })
            .collect();

        let report = RunReport {
            cycles: sequencer.cycles(),
            total_cycles,
            cause,
            phase: sequencer.phase(),
            realtime: rt.enabled,
            plan,
            services,
            dispatch: timer_report.dispatch,
            wakeup: timer_report.wakeup,
            missed_ticks: timer_report.missed_ticks,
            elapsed,
        };
        info!(
            cycles = report.cycles,
            cause = ?report.cause,
            elapsed_ms = elapsed.as_millis(),
            "Sequencer stopped"
        );
        Ok(report)
    }
}

/// Release and join everything after a failed startup, returning `error`.
fn abandon(timer: Timer, group: ServiceGroup, join_timeout: Duration, error: SeqError) -> SeqError {
    error!("Startup failed, releasing services: {error}");
    timer.cancel();
    if let Err(e) = timer.join() {
        warn!("Timer thread did not stop cleanly: {e}");
    }
    if let Err(e) = group.join(join_timeout) {
        warn!("Services did not stop cleanly: {e}");
    }
    error
}

/// Wall-clock limit that aborts the run when it expires.
struct RunLimit {
    stop: crossbeam_channel::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RunLimit {
    fn start(limit: Duration, abort: AbortHandle) -> Self {
        let (stop, stopped) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("seq-limit".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(limit) {
                    warn!(limit_ms = limit.as_millis(), "Run-time limit reached, aborting");
                    abort.abort();
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Run-time limit not enforced: {e}");
                None
            }
        };
        Self { stop, handle }
    }

    fn stop(self) {
        drop(self.stop);
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}
