//! Event records and sinks.
//!
//! Services report each release through [`EventSink::record`]. The
//! [`ChannelSink`] hands records over a bounded channel to a drain thread
//! that does the formatting and logging, keeping it off the service's
//! critical path.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use seq_common::error::{SeqError, SeqResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One service release as observed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// Service index.
    pub service: usize,
    /// Per-service sequence number, starting at 1.
    pub sequence: u64,
    /// Time since the shared process-start reference.
    pub elapsed: Duration,
    /// Core the service was executing on, if reported.
    pub core: Option<usize>,
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thread {} start {} @ sec={:.9} on core ",
            self.service + 1,
            self.sequence,
            self.elapsed.as_secs_f64()
        )?;
        match self.core {
            Some(core) => write!(f, "{core}"),
            None => write!(f, "?"),
        }
    }
}

/// Destination for service events.
///
/// Called from real-time service threads: implementations must not block
/// for long and must not drop records.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: EventRecord);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn record(&self, event: EventRecord) {
        (**self).record(event);
    }
}

/// Sink that forwards records to a drain thread over a bounded channel.
///
/// A full channel blocks the sender until the drain catches up, so no record
/// is ever dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<EventRecord>,
}

/// Handle to the drain thread of a [`ChannelSink`].
#[derive(Debug)]
pub struct SinkDrain {
    handle: JoinHandle<DrainStats>,
    closing: Arc<AtomicBool>,
}

/// Records handled by a drain thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    /// Total records logged.
    pub total: u64,
    /// Records per service index.
    pub per_service: BTreeMap<usize, u64>,
}

const DRAIN_POLL: Duration = Duration::from_millis(20);

impl ChannelSink {
    /// Create the sink and start its drain thread.
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::Initialization`] for a zero capacity or if the
    /// drain thread cannot be spawned.
    pub fn spawn(capacity: usize) -> SeqResult<(Self, SinkDrain)> {
        if capacity == 0 {
            return Err(SeqError::Initialization(
                "event sink capacity must be non-zero".into(),
            ));
        }
        let (tx, rx) = bounded(capacity);
        let closing = Arc::new(AtomicBool::new(false));
        let closing_drain = Arc::clone(&closing);

        let handle = thread::Builder::new()
            .name("seq-sink".into())
            .spawn(move || drain_loop(&rx, &closing_drain))
            .map_err(|e| SeqError::Initialization(format!("failed to spawn sink drain: {e}")))?;

        debug!(capacity, "Event sink started");
        Ok((Self { tx }, SinkDrain { handle, closing }))
    }
}

impl EventSink for ChannelSink {
    fn record(&self, event: EventRecord) {
        if self.tx.send(event).is_err() {
            // Only possible once the drain thread has exited.
            warn!(service = event.service, sequence = event.sequence, "Event sink closed");
        }
    }
}

fn drain_loop(rx: &Receiver<EventRecord>, closing: &AtomicBool) -> DrainStats {
    let mut stats = DrainStats::default();
    let mut log = |event: EventRecord| {
        info!(target: "seq::events", "{event}");
        stats.total += 1;
        *stats.per_service.entry(event.service).or_default() += 1;
    };

    loop {
        match rx.recv_timeout(DRAIN_POLL) {
            Ok(event) => log(event),
            Err(RecvTimeoutError::Timeout) => {
                if closing.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for event in rx.try_iter() {
        log(event);
    }
    stats
}

impl SinkDrain {
    /// Stop the drain once the channel is empty and return its totals.
    ///
    /// Call after every producer has stopped recording.
    #[must_use]
    pub fn finish(self) -> DrainStats {
        self.closing.store(true, Ordering::Release);
        match self.handle.join() {
            Ok(stats) => {
                debug!(total = stats.total, "Event sink drained");
                stats
            }
            Err(_) => {
                warn!("Event sink drain thread panicked");
                DrainStats::default()
            }
        }
    }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EventRecord>>,
}

impl CollectingSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all records in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<EventRecord> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records of one service in arrival order.
    #[must_use]
    pub fn events_for(&self, service: usize) -> Vec<EventRecord> {
        self.events()
            .into_iter()
            .filter(|e| e.service == service)
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn record(&self, event: EventRecord) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
