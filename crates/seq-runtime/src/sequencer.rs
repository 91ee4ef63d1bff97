//! The dispatcher: decides on every base tick which services to release.
//!
//! Each tick evaluates every service in index order and posts a release
//! token when `cycle % divisor == 0`, then advances the cycle counter. Cycle 0
//! therefore releases every service. When the run length is reached or the
//! abort flag is set, the sequencer enters TERMINATING: every service's abort
//! flag is raised and one extra (forced) token is posted to each so that no
//! service stays blocked. Each token channel is then closed.
//!
//! [`Sequencer::tick`] is called from the timer thread. It never blocks,
//! allocates, or logs.

use crate::planner::ThreadPlacement;
use crate::token::{ReleasePoster, TokenCounts};
use seq_common::error::{SeqError, SeqResult};
use seq_common::state::{SequencerPhase, StateMachine};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Static description of one service plus its stop flag.
///
/// Shared between the sequencer and the service thread. Only the abort flag
/// changes after creation, and only the sequencer sets it.
#[derive(Debug)]
pub struct ServiceDescriptor {
    /// Service index.
    pub index: usize,
    /// Display name.
    pub name: String,
    /// Release every `divisor`-th tick.
    pub divisor: u64,
    /// Placement the service applies to itself; `None` leaves the thread at
    /// the default policy.
    pub placement: Option<ThreadPlacement>,
    abort: AtomicBool,
}

impl ServiceDescriptor {
    /// Create a descriptor with a clear abort flag.
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::Plan`] for a zero divisor.
    pub fn new(
        index: usize,
        name: impl Into<String>,
        divisor: u64,
        placement: Option<ThreadPlacement>,
    ) -> SeqResult<Self> {
        if divisor == 0 {
            return Err(SeqError::Plan(format!("service {index} has a zero divisor")));
        }
        Ok(Self {
            index,
            name: name.into(),
            divisor,
            placement,
            abort: AtomicBool::new(false),
        })
    }

    /// Whether the service has been told to stop.
    #[inline]
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.abort.store(true, Ordering::Release);
    }
}

/// External request to end a run early.
///
/// Cheap to clone; typically held by a signal handler or a run-time limit.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a handle with the flag clear.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination at the end of the next tick.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether termination was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// The configured number of ticks was dispatched.
    Completed,
    /// The abort flag was set before the run length was reached.
    Aborted,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// More ticks are expected.
    Continue,
    /// Termination has begun; the timer must stop.
    Terminated(TerminationCause),
}

struct ServiceSlot {
    descriptor: Arc<ServiceDescriptor>,
    poster: ReleasePoster,
    scheduled: u64,
    forced: u64,
}

/// Release totals of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseStats {
    /// Service index.
    pub index: usize,
    /// Display name.
    pub name: String,
    /// Period divisor.
    pub divisor: u64,
    /// Releases due to `cycle % divisor == 0`.
    pub scheduled: u64,
    /// Releases posted on entry to TERMINATING (0 or 1).
    pub forced: u64,
    /// Token totals.
    pub tokens: TokenCounts,
}

/// Dispatcher state for one run.
pub struct Sequencer {
    services: Vec<ServiceSlot>,
    cycle: u64,
    total_cycles: u64,
    abort: AbortHandle,
    state: StateMachine,
    cause: Option<TerminationCause>,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("services", &self.services.len())
            .field("cycle", &self.cycle)
            .field("total_cycles", &self.total_cycles)
            .field("phase", &self.state.phase())
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

impl Sequencer {
    /// Create a sequencer that runs for `total_cycles` ticks unless aborted.
    ///
    /// `services` pairs each descriptor with the posting half of its token,
    /// in index order.
    #[must_use]
    pub fn new(
        services: Vec<(Arc<ServiceDescriptor>, ReleasePoster)>,
        total_cycles: u64,
        abort: AbortHandle,
    ) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|(descriptor, poster)| ServiceSlot {
                    descriptor,
                    poster,
                    scheduled: 0,
                    forced: 0,
                })
                .collect(),
            cycle: 0,
            total_cycles,
            abort,
            state: StateMachine::new(),
            cause: None,
        }
    }

    /// Dispatch one base tick.
    ///
    /// Calls after termination has begun are no-ops that report the same
    /// cause again.
    pub fn tick(&mut self) -> TickOutcome {
        if let Some(cause) = self.cause {
            return TickOutcome::Terminated(cause);
        }
        if self.state.phase() == SequencerPhase::Idle {
            // IDLE -> RUNNING is always valid.
            let _ = self.state.transition(SequencerPhase::Running);
        }

        for slot in &mut self.services {
            if self.cycle % slot.descriptor.divisor == 0 {
                slot.poster.post();
                slot.scheduled += 1;
            }
        }
        self.cycle += 1;

        let cause = if self.cycle >= self.total_cycles {
            TerminationCause::Completed
        } else if self.abort.is_aborted() {
            TerminationCause::Aborted
        } else {
            return TickOutcome::Continue;
        };
        self.begin_termination(cause);
        TickOutcome::Terminated(cause)
    }

    /// Release every service for shutdown without dispatching a tick.
    ///
    /// Used when setup fails after services were started or when the tick
    /// source runs dry. No-op once termination has begun.
    pub fn cancel(&mut self) {
        if self.cause.is_none() {
            self.begin_termination(TerminationCause::Aborted);
        }
    }

    fn begin_termination(&mut self, cause: TerminationCause) {
        if self.state.transition(SequencerPhase::Terminating).is_err() {
            return;
        }
        self.cause = Some(cause);
        // Flags first: a service woken by the forced token must observe them.
        for slot in &self.services {
            slot.descriptor.request_stop();
        }
        for slot in &mut self.services {
            slot.poster.post();
            slot.forced += 1;
            slot.poster.close();
        }
    }

    /// Record that every service has been joined.
    ///
    /// # Errors
    ///
    /// Returns an error unless the sequencer is TERMINATING.
    pub fn mark_stopped(&mut self) -> SeqResult<()> {
        self.state.transition(SequencerPhase::Stopped)
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SequencerPhase {
        self.state.phase()
    }

    /// Ticks dispatched so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Configured run length.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Termination cause once termination has begun.
    #[must_use]
    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause
    }

    /// Handle that aborts this sequencer.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Per-service release and token totals.
    #[must_use]
    pub fn release_stats(&self) -> Vec<ReleaseStats> {
        self.services
            .iter()
            .map(|slot| ReleaseStats {
                index: slot.descriptor.index,
                name: slot.descriptor.name.clone(),
                divisor: slot.descriptor.divisor,
                scheduled: slot.scheduled,
                forced: slot.forced,
                tokens: slot.poster.counts(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperperiod::releases_through;
    use crate::token::{release_channel, ReleaseWaiter};

    type Built = (Sequencer, Vec<Arc<ServiceDescriptor>>, Vec<ReleaseWaiter>);

    fn build(divisors: &[u64], total: u64) -> Built {
        let mut pairs = Vec::new();
        let mut descriptors = Vec::new();
        let mut waiters = Vec::new();
        for (i, &d) in divisors.iter().enumerate() {
            let descriptor =
                Arc::new(ServiceDescriptor::new(i, format!("S{}", i + 1), d, None).unwrap());
            let (poster, waiter) = release_channel();
            pairs.push((Arc::clone(&descriptor), poster));
            descriptors.push(descriptor);
            waiters.push(waiter);
        }
        (Sequencer::new(pairs, total, AbortHandle::new()), descriptors, waiters)
    }

    fn scheduled(seq: &Sequencer) -> Vec<u64> {
        seq.release_stats().iter().map(|s| s.scheduled).collect()
    }

    #[test]
    fn test_first_tick_releases_everything() {
        let (mut seq, _, _) = build(&[2, 10, 15], 30);
        assert_eq!(seq.phase(), SequencerPhase::Idle);
        assert_eq!(seq.tick(), TickOutcome::Continue);
        assert_eq!(seq.phase(), SequencerPhase::Running);
        assert_eq!(scheduled(&seq), vec![1, 1, 1]);
        assert_eq!(seq.cycles(), 1);
    }

    #[test]
    fn test_full_hyperperiod() {
        let (mut seq, descriptors, _) = build(&[2, 10, 15], 30);
        let mut ticks = 0;
        loop {
            ticks += 1;
            match seq.tick() {
                TickOutcome::Continue => assert!(ticks < 30),
                TickOutcome::Terminated(cause) => {
                    assert_eq!(cause, TerminationCause::Completed);
                    break;
                }
            }
        }
        assert_eq!(ticks, 30);
        assert_eq!(scheduled(&seq), vec![15, 3, 2]);
        for (stats, d) in seq.release_stats().iter().zip([2, 10, 15]) {
            assert_eq!(stats.scheduled, releases_through(29, d));
            assert_eq!(stats.forced, 1);
            assert_eq!(stats.tokens.posted, stats.scheduled + 1);
        }
        assert!(descriptors.iter().all(|d| d.should_stop()));
        assert_eq!(seq.phase(), SequencerPhase::Terminating);
    }

    #[test]
    fn test_abort_at_tick_five() {
        let (mut seq, _, _) = build(&[2, 10, 15], 30);
        for _ in 0..5 {
            assert_eq!(seq.tick(), TickOutcome::Continue);
        }
        seq.abort_handle().abort();
        // Tick 5 still releases what is due, then terminates.
        assert_eq!(seq.tick(), TickOutcome::Terminated(TerminationCause::Aborted));
        assert_eq!(seq.cycles(), 6);
        assert_eq!(scheduled(&seq), vec![3, 1, 1]);
        let forced: Vec<u64> = seq.release_stats().iter().map(|s| s.forced).collect();
        assert_eq!(forced, vec![1, 1, 1]);
    }

    #[test]
    fn test_tick_after_termination_is_idempotent() {
        let (mut seq, _, waiters) = build(&[1], 2);
        seq.tick();
        assert_eq!(seq.tick(), TickOutcome::Terminated(TerminationCause::Completed));
        let before = seq.release_stats();
        assert_eq!(seq.tick(), TickOutcome::Terminated(TerminationCause::Completed));
        assert_eq!(seq.release_stats(), before);
        assert_eq!(seq.cycles(), 2);
        // Two scheduled plus one forced.
        assert_eq!(waiters[0].drain(), 3);
    }

    #[test]
    fn test_cancel_before_first_tick() {
        let (mut seq, descriptors, waiters) = build(&[2, 3], 6);
        seq.cancel();
        assert_eq!(seq.phase(), SequencerPhase::Terminating);
        assert_eq!(seq.cause(), Some(TerminationCause::Aborted));
        assert!(descriptors.iter().all(|d| d.should_stop()));
        assert!(waiters.iter().all(ReleaseWaiter::try_wait));
        assert_eq!(scheduled(&seq), vec![0, 0]);

        seq.cancel();
        let forced: Vec<u64> = seq.release_stats().iter().map(|s| s.forced).collect();
        assert_eq!(forced, vec![1, 1]);
        assert!(seq.mark_stopped().is_ok());
        assert_eq!(seq.phase(), SequencerPhase::Stopped);
    }

    #[test]
    fn test_mark_stopped_requires_termination() {
        let (mut seq, _, _) = build(&[2], 4);
        seq.tick();
        assert!(seq.mark_stopped().is_err());
    }

    #[test]
    fn test_abort_flag_visible_before_forced_token() {
        let (mut seq, descriptors, waiters) = build(&[4], 100);
        let descriptor = Arc::clone(&descriptors[0]);
        let waiter = waiters.into_iter().next().unwrap();
        let service = std::thread::spawn(move || {
            let mut woken = 0;
            while !descriptor.should_stop() {
                waiter.wait();
                woken += 1;
            }
            (woken, waiter.drain_closed())
        });

        seq.tick();
        seq.abort_handle().abort();
        seq.tick();

        let (woken, drained) = service.join().unwrap();
        assert!(woken >= 1);
        assert_eq!(woken + drained, 2);
        let tokens = seq.release_stats()[0].tokens;
        assert_eq!(tokens.posted, tokens.consumed);
    }

    #[test]
    fn test_termination_closes_token_channels() {
        let (mut seq, _, waiters) = build(&[1, 2], 2);
        seq.tick();
        seq.tick();
        // Returns immediately: the channels are closed after the forced post.
        let drained: Vec<u64> = waiters.iter().map(ReleaseWaiter::drain_closed).collect();
        assert_eq!(drained, vec![3, 2]);
    }

    #[test]
    fn test_zero_divisor_rejected() {
        let err = ServiceDescriptor::new(2, "S3", 0, None).unwrap_err();
        assert!(matches!(err, SeqError::Plan(_)));
    }
}
