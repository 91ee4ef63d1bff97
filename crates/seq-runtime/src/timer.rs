//! Timer source driving the sequencer.
//!
//! The sequencer runs on its own thread at the highest priority of the
//! session. That thread sleeps to absolute deadlines on `CLOCK_MONOTONIC`
//! with `clock_nanosleep(TIMER_ABSTIME)`, so the tick phase does not drift
//! with dispatch time, and calls [`Sequencer::tick`] on every expiration.
//!
//! Startup is two-phase. [`Timer::spawn`] creates the thread and waits
//! until it has applied its placement. The session then starts its services
//! and calls [`Timer::start`] to arm the tick source, or [`Timer::cancel`] to
//! release the services without dispatching anything.

use crate::planner::ThreadPlacement;
use crate::realtime::apply_placement;
use crate::sequencer::{Sequencer, TickOutcome};
use crossbeam_channel::{bounded, Receiver, Sender};
use seq_common::error::{SeqError, SeqResult};
use seq_common::metrics::{DispatchMetrics, TimingSnapshot};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Source of base ticks.
pub trait TickSource: Send {
    /// Prepare the source. Called once on the timer thread before the first
    /// [`wait_next`](TickSource::wait_next).
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::Initialization`] if the source cannot be armed.
    fn arm(&mut self) -> SeqResult<()> {
        Ok(())
    }

    /// Block until the next tick is due.
    ///
    /// Returns how late the wake-up was relative to the tick deadline, or
    /// `None` once the source has no more ticks.
    fn wait_next(&mut self) -> Option<Duration>;

    /// Expirations that were coalesced because the thread woke too late.
    fn missed_ticks(&self) -> u64 {
        0
    }
}

/// Periodic tick source on the monotonic clock.
#[derive(Debug)]
pub struct IntervalTimer {
    interval: Duration,
    epoch: Option<Epoch>,
    next: u64,
    missed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Epoch {
    instant: Instant,
    #[cfg(target_os = "linux")]
    timespec: nix::sys::time::TimeSpec,
}

impl IntervalTimer {
    /// Tick every `interval`, the first tick one interval after arming.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: None,
            next: 1,
            missed: 0,
        }
    }

    /// Configured interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn offset(&self, n: u64) -> Duration {
        let ns = self.interval.as_nanos().saturating_mul(u128::from(n));
        Duration::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX))
    }
}

#[cfg(target_os = "linux")]
fn capture_epoch() -> SeqResult<Epoch> {
    use nix::time::{clock_gettime, ClockId};

    let timespec = clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map_err(|e| SeqError::Initialization(format!("clock_gettime failed: {e}")))?;
    Ok(Epoch {
        instant: Instant::now(),
        timespec,
    })
}

#[cfg(not(target_os = "linux"))]
fn capture_epoch() -> SeqResult<Epoch> {
    Ok(Epoch {
        instant: Instant::now(),
    })
}

/// Sleep until `epoch + offset`, retrying when a signal interrupts the sleep.
#[cfg(target_os = "linux")]
fn sleep_until(epoch: &Epoch, offset: Duration) {
    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_nanosleep, ClockId, ClockNanosleepFlags};

    let target = epoch.timespec + TimeSpec::from(offset);
    loop {
        match clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &target,
        ) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                // Fall back to a relative sleep so the loop keeps its cadence.
                warn!("clock_nanosleep failed: {e}");
                let deadline = epoch.instant + offset;
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                return;
            }
            Ok(_) => return,
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep_until(epoch: &Epoch, offset: Duration) {
    let deadline = epoch.instant + offset;
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

impl TickSource for IntervalTimer {
    fn arm(&mut self) -> SeqResult<()> {
        if self.interval.is_zero() {
            return Err(SeqError::Initialization(
                "tick interval must be non-zero".into(),
            ));
        }
        self.epoch = Some(capture_epoch()?);
        self.next = 1;
        self.missed = 0;
        Ok(())
    }

    fn wait_next(&mut self) -> Option<Duration> {
        let epoch = self.epoch?;
        let offset = self.offset(self.next);
        sleep_until(&epoch, offset);

        let late = Instant::now().saturating_duration_since(epoch.instant + offset);
        // Expirations that passed while we were late collapse into this one.
        let behind = u64::try_from(late.as_nanos() / self.interval.as_nanos()).unwrap_or(u64::MAX);
        self.missed = self.missed.saturating_add(behind);
        self.next = self.next.saturating_add(behind).saturating_add(1);
        Some(late)
    }

    fn missed_ticks(&self) -> u64 {
        self.missed
    }
}

/// Tick source fired by hand through a [`TickTrigger`].
///
/// The source is exhausted once every trigger has been dropped.
#[derive(Debug)]
pub struct ManualTicks {
    ticks: Receiver<()>,
    done: Sender<()>,
    pending_ack: bool,
}

/// Fires ticks into a [`ManualTicks`] source.
#[derive(Debug, Clone)]
pub struct TickTrigger {
    ticks: Sender<()>,
    done: Receiver<()>,
}

/// Create a connected manual source and its trigger.
#[must_use]
pub fn manual_ticks() -> (ManualTicks, TickTrigger) {
    let (tick_tx, tick_rx) = bounded(0);
    let (done_tx, done_rx) = bounded(1);
    (
        ManualTicks {
            ticks: tick_rx,
            done: done_tx,
            pending_ack: false,
        },
        TickTrigger {
            ticks: tick_tx,
            done: done_rx,
        },
    )
}

impl TickSource for ManualTicks {
    fn wait_next(&mut self) -> Option<Duration> {
        if self.pending_ack {
            // The previous tick has been dispatched.
            let _ = self.done.send(());
            self.pending_ack = false;
        }
        self.ticks.recv().ok()?;
        self.pending_ack = true;
        Some(Duration::ZERO)
    }
}

impl TickTrigger {
    /// Fire one tick and wait until it has been dispatched.
    ///
    /// Returns false once the timer thread has stopped, including when this
    /// tick ended the run.
    pub fn fire(&self) -> bool {
        if self.ticks.send(()).is_err() {
            return false;
        }
        self.done.recv().is_ok()
    }

    /// Fire up to `n` ticks. Returns how many were acknowledged.
    pub fn fire_n(&self, n: u64) -> u64 {
        let mut fired = 0;
        while fired < n && self.fire() {
            fired += 1;
        }
        fired
    }
}

/// What the timer thread hands back when it exits.
#[derive(Debug)]
pub struct TimerReport {
    /// The sequencer, in TERMINATING.
    pub sequencer: Sequencer,
    /// Duration of each dispatch step against the tick interval.
    pub dispatch: TimingSnapshot,
    /// Wake-up lateness of each tick against the tick interval.
    pub wakeup: TimingSnapshot,
    /// Coalesced expirations.
    pub missed_ticks: u64,
}

enum Command {
    Start,
    Cancel,
}

/// Handle to the sequencer (timer) thread.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<TimerReport>,
    commands: Sender<Command>,
    ready: Receiver<SeqResult<()>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Start => "Start",
            Self::Cancel => "Cancel",
        })
    }
}

impl Timer {
    /// Create the sequencer thread and apply `placement` on it.
    ///
    /// `deadline` is the budget of one dispatch step, normally the tick
    /// interval.
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::Initialization`] if the thread cannot be created,
    /// or the placement error reported by the thread. No tick has been
    /// dispatched in either case.
    pub fn spawn(
        sequencer: Sequencer,
        source: Box<dyn TickSource>,
        placement: Option<ThreadPlacement>,
        deadline: Duration,
        histogram_size: usize,
    ) -> SeqResult<Self> {
        let (ready_tx, ready_rx) = bounded(1);
        let (command_tx, command_rx) = bounded(1);

        let handle = thread::Builder::new()
            .name("seq-timer".into())
            .spawn(move || {
                timer_thread(
                    sequencer,
                    source,
                    placement.as_ref(),
                    &ready_tx,
                    &command_rx,
                    deadline,
                    histogram_size,
                )
            })
            .map_err(|e| SeqError::Initialization(format!("failed to spawn timer thread: {e}")))?;

        let timer = Self {
            handle,
            commands: command_tx,
            ready: ready_rx,
        };
        let placed = timer.ready.recv();
        match placed {
            Ok(Ok(())) => Ok(timer),
            Ok(Err(e)) => {
                let _ = timer.join();
                Err(e)
            }
            Err(_) => {
                let _ = timer.join();
                Err(SeqError::Initialization(
                    "timer thread exited during startup".into(),
                ))
            }
        }
    }

    /// Arm the tick source and begin dispatching.
    ///
    /// # Errors
    ///
    /// Returns the arming error. The sequencer has then been cancelled and
    /// the thread is exiting; call [`Timer::join`] to collect it.
    pub fn start(&self) -> SeqResult<()> {
        self.commands
            .send(Command::Start)
            .map_err(|_| SeqError::Initialization("timer thread is gone".into()))?;
        self.ready
            .recv()
            .map_err(|_| SeqError::Initialization("timer thread exited while arming".into()))?
    }

    /// Cancel the sequencer without dispatching a tick.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    /// Wait for the timer thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::Initialization`] if the thread panicked.
    pub fn join(self) -> SeqResult<TimerReport> {
        drop(self.commands);
        self.handle
            .join()
            .map_err(|_| SeqError::Initialization("timer thread panicked".into()))
    }
}

fn finish(
    sequencer: Sequencer,
    dispatch: &DispatchMetrics,
    wakeup: &DispatchMetrics,
    missed_ticks: u64,
) -> TimerReport {
    TimerReport {
        sequencer,
        dispatch: dispatch.snapshot(),
        wakeup: wakeup.snapshot(),
        missed_ticks,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn timer_thread(
    mut sequencer: Sequencer,
    mut source: Box<dyn TickSource>,
    placement: Option<&ThreadPlacement>,
    ready: &Sender<SeqResult<()>>,
    commands: &Receiver<Command>,
    deadline: Duration,
    histogram_size: usize,
) -> TimerReport {
    let mut dispatch = DispatchMetrics::new(histogram_size, deadline);
    let mut wakeup = DispatchMetrics::new(histogram_size, deadline);

    if let Some(placement) = placement {
        if let Err(e) = apply_placement(placement) {
            error!("Sequencer placement failed: {e}");
            sequencer.cancel();
            let _ = ready.send(Err(e));
            return finish(sequencer, &dispatch, &wakeup, 0);
        }
    }
    let _ = ready.send(Ok(()));

    match commands.recv() {
        Ok(Command::Start) => {}
        Ok(Command::Cancel) | Err(_) => {
            debug!("Timer cancelled before arming");
            sequencer.cancel();
            return finish(sequencer, &dispatch, &wakeup, 0);
        }
    }

    if let Err(e) = source.arm() {
        error!("Tick source failed to arm: {e}");
        sequencer.cancel();
        let _ = ready.send(Err(e));
        return finish(sequencer, &dispatch, &wakeup, 0);
    }
    let _ = ready.send(Ok(()));
    info!(total_cycles = sequencer.total_cycles(), "Timer armed");

    loop {
        let Some(late) = source.wait_next() else {
            info!(cycles = sequencer.cycles(), "Tick source exhausted");
            sequencer.cancel();
            break;
        };
        wakeup.record(late);

        let start = Instant::now();
        let outcome = sequencer.tick();
        let took = start.elapsed();

        if dispatch.record(took) {
            warn!(
                cycle = sequencer.cycles(),
                dispatch_us = took.as_micros(),
                deadline_us = deadline.as_micros(),
                "Tick overrun"
            );
        }

        if let TickOutcome::Terminated(cause) = outcome {
            info!(
                ?cause,
                cycles = sequencer.cycles(),
                total_cycles = sequencer.total_cycles(),
                "Disabling sequencer timer"
            );
            break;
        }
    }

    let missed = source.missed_ticks();
    if missed > 0 {
        warn!(missed, "Timer expirations were coalesced");
    }
    finish(sequencer, &dispatch, &wakeup, missed)
}
