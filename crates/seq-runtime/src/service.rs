//! Worker service threads.
//!
//! A service blocks on its release token, stamps the release against the
//! shared process clock, and hands an [`EventRecord`] to the sink. It repeats
//! until the sequencer raises its abort flag, then waits for the sequencer to
//! close its token channel and drains what is left, so that every posted
//! token is accounted for.

use crate::realtime::{apply_placement, current_cpu, prefault_stack};
use crate::sequencer::ServiceDescriptor;
use crate::sink::{EventRecord, EventSink};
use crate::token::ReleaseWaiter;
use crossbeam_channel::{unbounded, Receiver, Sender};
use seq_common::error::{SeqError, SeqResult};
use seq_common::time::ProcessClock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Totals reported by a service thread when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Service index.
    pub index: usize,
    /// Events emitted (one per consumed release while running).
    pub events: u64,
    /// Tokens consumed in total, including drained ones.
    pub consumed: u64,
    /// Tokens drained without an event at shutdown.
    pub drained: u64,
}

/// State shared by every service of a session.
#[derive(Clone)]
pub struct ServiceContext {
    /// Event destination.
    pub sink: Arc<dyn EventSink>,
    /// Common time reference.
    pub clock: ProcessClock,
    /// Stack bytes to pre-fault before the first wait (0 to skip).
    pub prefault_stack: usize,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("clock", &self.clock)
            .field("prefault_stack", &self.prefault_stack)
            .finish_non_exhaustive()
    }
}

/// Notifies the group when the thread exits, also on panic.
struct ExitGuard {
    index: usize,
    exits: Sender<usize>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.exits.send(self.index);
    }
}

/// The running service threads of a session.
#[derive(Debug)]
pub struct ServiceGroup {
    context: ServiceContext,
    handles: Vec<(usize, JoinHandle<ServiceStats>)>,
    ready_tx: Sender<(usize, SeqResult<()>)>,
    ready_rx: Receiver<(usize, SeqResult<()>)>,
    exits_tx: Sender<usize>,
    exits_rx: Receiver<usize>,
}

impl ServiceGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new(context: ServiceContext) -> Self {
        let (ready_tx, ready_rx) = unbounded();
        let (exits_tx, exits_rx) = unbounded();
        Self {
            context,
            handles: Vec::new(),
            ready_tx,
            ready_rx,
            exits_tx,
            exits_rx,
        }
    }

    /// Number of spawned services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no service has been spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Start the thread of one service.
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::Initialization`] if the thread cannot be created.
    pub fn spawn(
        &mut self,
        descriptor: Arc<ServiceDescriptor>,
        waiter: ReleaseWaiter,
    ) -> SeqResult<()> {
        let index = descriptor.index;
        let context = self.context.clone();
        let ready = self.ready_tx.clone();
        let guard = ExitGuard {
            index,
            exits: self.exits_tx.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("seq-{}", descriptor.name))
            .spawn(move || {
                let _guard = guard;
                service_thread(&descriptor, &waiter, &context, &ready)
            })
            .map_err(|e| {
                SeqError::Initialization(format!("failed to spawn service {index}: {e}"))
            })?;

        self.handles.push((index, handle));
        Ok(())
    }

    /// Wait for every spawned service to report its startup outcome.
    ///
    /// # Errors
    ///
    /// Returns the first placement error, or [`SeqError::Initialization`] if
    /// a thread died before reporting or `timeout` elapsed.
    pub fn await_ready(&self, timeout: Duration) -> SeqResult<()> {
        let deadline = Instant::now() + timeout;
        for _ in 0..self.handles.len() {
            match self.ready_rx.recv_deadline(deadline) {
                Ok((_, Ok(()))) => {}
                Ok((index, Err(e))) => {
                    error!(service = index, "Service startup failed: {e}");
                    return Err(e);
                }
                Err(_) => {
                    return Err(SeqError::Initialization(
                        "service did not report startup in time".into(),
                    ));
                }
            }
        }
        debug!(services = self.handles.len(), "All services ready");
        Ok(())
    }

    /// Wait up to `timeout` for every service to exit and collect its totals.
    ///
    /// Call after the sequencer has entered TERMINATING.
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::ShutdownTimeout`] if some service is still running
    /// when the window closes. Those threads are left detached.
    pub fn join(self, timeout: Duration) -> SeqResult<Vec<ServiceStats>> {
        let Self {
            handles, exits_tx, exits_rx, ..
        } = self;
        drop(exits_tx);

        let deadline = Instant::now() + timeout;
        let mut running: BTreeSet<usize> = handles.iter().map(|(i, _)| *i).collect();
        while !running.is_empty() {
            match exits_rx.recv_deadline(deadline) {
                Ok(index) => {
                    running.remove(&index);
                }
                Err(_) => break,
            }
        }

        if !running.is_empty() {
            warn!(?running, timeout_ms = timeout.as_millis(), "Services did not exit in time");
            return Err(SeqError::ShutdownTimeout {
                pending: running.len(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let stats = handles
            .into_iter()
            .map(|(index, handle)| {
                handle.join().unwrap_or_else(|_| {
                    error!(service = index, "Service thread panicked");
                    ServiceStats {
                        index,
                        ..ServiceStats::default()
                    }
                })
            })
            .collect();
        Ok(stats)
    }
}

fn service_thread(
    descriptor: &ServiceDescriptor,
    waiter: &ReleaseWaiter,
    context: &ServiceContext,
    ready: &Sender<(usize, SeqResult<()>)>,
) -> ServiceStats {
    let index = descriptor.index;
    let mut stats = ServiceStats {
        index,
        ..ServiceStats::default()
    };

    if let Some(placement) = &descriptor.placement {
        if let Err(e) = apply_placement(placement) {
            let _ = ready.send((index, Err(e)));
            return stats;
        }
        prefault_stack(context.prefault_stack);
    }
    let _ = ready.send((index, Ok(())));

    info!(
        service = index,
        name = %descriptor.name,
        sec = context.clock.elapsed().as_secs_f64(),
        core = ?current_cpu(),
        "Service started"
    );

    let mut sequence = 0;
    while !descriptor.should_stop() {
        waiter.wait();
        sequence += 1;
        let elapsed = context.clock.elapsed();
        context.sink.record(EventRecord {
            service: index,
            sequence,
            elapsed,
            core: current_cpu(),
        });
    }

    stats.events = sequence;
    stats.drained = waiter.drain_closed();
    stats.consumed = waiter.counts().consumed;
    debug!(
        service = index,
        events = stats.events,
        drained = stats.drained,
        "Service exiting"
    );
    stats
}
