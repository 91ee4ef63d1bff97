//! Signal handling for early termination of a run.
//!
//! SIGINT and SIGTERM are turned into an abort request on the sequencer. The
//! C handler only stores an atomic; a watcher thread forwards it to the
//! [`AbortHandle`], so the sequencer sees it at its next tick and performs the
//! normal TERMINATING sequence.

use seq_runtime::AbortHandle;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Signals that abort a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl SignalKind {
    fn from_raw(signal: i32) -> Option<Self> {
        match signal {
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGINT => Some(Self::Interrupt),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Last signal number delivered, 0 when none is pending.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Serializes tests that install handlers, since dispositions are process-wide.
#[cfg(test)]
pub(crate) static SIGNAL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Debug, Default)]
struct WatchState {
    stop: AtomicBool,
    signal_count: AtomicU32,
}

/// Forwards termination signals to a sequencer's abort handle.
#[derive(Debug)]
pub struct SignalHandler {
    state: Arc<WatchState>,
    watcher: Option<JoinHandle<()>>,
}

impl SignalHandler {
    /// Register the handlers and start forwarding to `abort`.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher thread cannot be created or a handler
    /// cannot be registered.
    pub fn install(abort: AbortHandle) -> std::io::Result<Self> {
        let state = Arc::new(WatchState::default());
        let watch = Arc::clone(&state);

        let watcher = thread::Builder::new()
            .name("seq-signals".into())
            .spawn(move || forward_signals(&watch, &abort))?;

        #[cfg(unix)]
        register_unix_handlers()?;

        Ok(Self {
            state,
            watcher: Some(watcher),
        })
    }

    /// Number of termination signals forwarded so far.
    pub fn signal_count(&self) -> u32 {
        self.state.signal_count.load(Ordering::Relaxed)
    }

    /// Stop forwarding and join the watcher thread.
    pub fn shutdown(mut self) {
        self.stop_watcher();
    }

    fn stop_watcher(&mut self) {
        self.state.stop.store(true, Ordering::Relaxed);
        if let Some(watcher) = self.watcher.take() {
            #[cfg(unix)]
            restore_default_handlers();
            if watcher.join().is_err() {
                warn!("Signal watcher thread panicked");
            }
        }
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

fn forward_signals(state: &WatchState, abort: &AbortHandle) {
    while !state.stop.load(Ordering::Relaxed) {
        let raw = PENDING_SIGNAL.swap(0, Ordering::Relaxed);
        if let Some(kind) = SignalKind::from_raw(raw) {
            info!(signal = %kind, "Termination signal received, aborting run");
            state.signal_count.fetch_add(1, Ordering::Relaxed);
            abort.abort();
        }
        thread::sleep(POLL_INTERVAL);
    }
    debug!("Signal watcher stopped");
}

#[cfg(unix)]
fn register_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    extern "C" fn on_signal(signal: c_int) {
        PENDING_SIGNAL.store(signal, Ordering::Relaxed);
    }

    for signal in [libc::SIGTERM, libc::SIGINT] {
        // SAFETY: the handler only performs an atomic store, which is
        // async-signal-safe.
        let previous = unsafe { libc::signal(signal, on_signal as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    debug!("Unix signal handlers registered");
    Ok(())
}

/// Put SIGTERM and SIGINT back to their default dispositions, so a signal
/// after the run ends the process instead of being swallowed.
#[cfg(unix)]
fn restore_default_handlers() {
    for signal in [libc::SIGTERM, libc::SIGINT] {
        // SAFETY: installing SIG_DFL has no handler code to run.
        let previous = unsafe { libc::signal(signal, libc::SIG_DFL) };
        if previous == libc::SIG_ERR {
            warn!(signal, "Failed to restore default signal handler");
        }
    }
    debug!("Unix signal handlers restored");
}
