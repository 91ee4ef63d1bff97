//! Real-time scheduling and memory locking utilities.
//!
//! Provides platform-specific initialization for deterministic dispatch:
//! - Memory locking (mlockall) to prevent page faults
//! - Stack pre-faulting so thread stacks are resident before the first release
//! - Per-thread fixed-priority policy (`SCHED_FIFO`/`SCHED_RR`) and CPU affinity
//! - Capability checks so privilege problems surface before any thread starts

#![allow(unused_imports)] // Platform-specific code may not use all imports

use crate::planner::ThreadPlacement;
use seq_common::config::{RealtimeConfig, SchedPolicy};
use seq_common::error::{SeqError, SeqResult};
use tracing::{debug, error, info, warn};

/// Result of process-wide real-time initialization.
#[derive(Debug, Clone)]
pub struct RealtimeStatus {
    /// Whether memory was locked successfully.
    pub memory_locked: bool,
    /// Stack bytes pre-faulted on the calling thread.
    pub stack_prefaulted: usize,
}

/// Initialize the process for real-time dispatch.
///
/// Does nothing when real-time scheduling is disabled. Per-thread policy and
/// affinity are applied later by each thread through [`apply_placement`].
///
/// # Errors
///
/// Returns an error if memory locking fails for a reason other than missing
/// privileges.
pub fn init_realtime(config: &RealtimeConfig) -> SeqResult<RealtimeStatus> {
    if !config.enabled {
        info!("Real-time scheduling disabled in configuration");
        return Ok(RealtimeStatus {
            memory_locked: false,
            stack_prefaulted: 0,
        });
    }

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };

    let stack_prefaulted = prefault_stack(config.prefault_stack_size);

    let status = RealtimeStatus {
        memory_locked,
        stack_prefaulted,
    };
    info!(?status, "Real-time initialization complete");
    Ok(status)
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory() -> SeqResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("Locking memory pages with mlockall");

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM | nix::errno::Errno::ENOMEM) => {
            warn!(
                "mlockall failed - running without CAP_IPC_LOCK or with a low RLIMIT_MEMLOCK. \
                 Page faults may occur during dispatch."
            );
            Ok(false)
        }
        Err(e) => Err(SeqError::Initialization(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> SeqResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Pre-fault stack pages of the calling thread.
///
/// Touches `size` bytes of stack in page-sized frames so the pages are
/// resident before the thread enters its release loop.
pub fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let faulted = prefault_stack_recursive(size, 0);
    debug!(faulted, "Stack pre-fault complete");
    faulted
}

#[inline(never)]
fn prefault_stack_recursive(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096;
    const MAX_DEPTH: usize = 256;

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }

    let mut buffer = [0u8; FRAME_SIZE];
    buffer[0] = 0xBB;
    buffer[FRAME_SIZE - 1] = 0xCC;
    std::hint::black_box(&mut buffer);

    FRAME_SIZE + prefault_stack_recursive(remaining - FRAME_SIZE, depth + 1)
}

/// Placement actually in effect on a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPlacement {
    /// Policy installed on the thread.
    pub policy: SchedPolicy,
    /// Priority installed on the thread.
    pub priority: u8,
    /// CPUs the thread is pinned to (empty when unpinned).
    pub cpus: Vec<usize>,
}

/// Apply a scheduling placement to the calling thread.
///
/// # Errors
///
/// Returns [`SeqError::SchedulingPrivilege`] if the policy, priority, or
/// affinity cannot be installed. Unlike a best-effort setup, a privilege
/// failure here is fatal: the rate-monotonic ordering would not hold.
pub fn apply_placement(placement: &ThreadPlacement) -> SeqResult<AppliedPlacement> {
    set_thread_scheduler(placement.policy, placement.priority)?;
    set_thread_affinity(&placement.cpus)?;
    Ok(AppliedPlacement {
        policy: placement.policy,
        priority: placement.priority,
        cpus: placement.cpus.clone(),
    })
}

/// Set the scheduling policy and priority of the calling thread.
#[cfg(target_os = "linux")]
fn set_thread_scheduler(policy: SchedPolicy, priority: u8) -> SeqResult<()> {
    let (min, max) = policy.priority_range();
    if priority < min || priority > max {
        return Err(SeqError::SchedulingPrivilege(format!(
            "priority {priority} outside {min}..={max} for {policy:?}"
        )));
    }

    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => libc::SCHED_OTHER,
    };
    let param = libc::sched_param {
        sched_priority: i32::from(priority),
    };

    // SAFETY: pthread_self() is always a valid handle for the calling thread
    // and `param` outlives the call.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), linux_policy, &param) };
    if rc != 0 {
        let err = std::io::Error::from_raw_os_error(rc);
        let hint = if rc == libc::EPERM {
            " (grant CAP_SYS_NICE or raise RLIMIT_RTPRIO)"
        } else {
            ""
        };
        return Err(SeqError::SchedulingPrivilege(format!(
            "pthread_setschedparam({policy:?}, {priority}) failed: {err}{hint}"
        )));
    }

    debug!(?policy, priority, "Thread scheduler configured");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_thread_scheduler(policy: SchedPolicy, priority: u8) -> SeqResult<()> {
    if policy.is_realtime() {
        return Err(SeqError::SchedulingPrivilege(format!(
            "{policy:?} priority {priority} not available on this platform"
        )));
    }
    Ok(())
}

/// Pin the calling thread to `cpus` (no-op for an empty set).
#[cfg(target_os = "linux")]
fn set_thread_affinity(cpus: &[usize]) -> SeqResult<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    if cpus.is_empty() {
        return Ok(());
    }

    let mut cpu_set = CpuSet::new();
    for &cpu in cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| SeqError::SchedulingPrivilege(format!("invalid CPU index {cpu}: {e}")))?;
    }

    // Pid 0 targets the calling thread, not the whole process.
    sched_setaffinity(Pid::from_raw(0), &cpu_set).map_err(|e| {
        SeqError::SchedulingPrivilege(format!("sched_setaffinity({cpus:?}) failed: {e}"))
    })?;

    debug!(?cpus, "Thread affinity set");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_thread_affinity(cpus: &[usize]) -> SeqResult<()> {
    if cpus.is_empty() {
        return Ok(());
    }
    Err(SeqError::SchedulingPrivilege(
        "CPU affinity not available on this platform".into(),
    ))
}

/// CPU the calling thread is executing on, if the platform reports it.
#[cfg(target_os = "linux")]
#[inline]
#[must_use]
pub fn current_cpu() -> Option<usize> {
    nix::sched::sched_getcpu().ok()
}

/// CPU the calling thread is executing on, if the platform reports it.
#[cfg(not(target_os = "linux"))]
#[inline]
#[must_use]
pub fn current_cpu() -> Option<usize> {
    None
}

/// Number of CPUs available to this process.
#[must_use]
pub fn online_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Check if the current process has real-time capabilities.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    use std::fs;

    // SAFETY: geteuid has no preconditions.
    let mut caps = RtCapabilities {
        is_root: unsafe { libc::geteuid() } == 0,
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid, writable rlimit struct.
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }

    // SAFETY: as above.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    if let Ok(version) = fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }

    caps
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Information about real-time capabilities of the system.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Whether running as root.
    pub is_root: bool,
    /// `RLIMIT_RTPRIO` value (max RT priority allowed).
    pub rtprio_limit: Option<u64>,
    /// `RLIMIT_MEMLOCK` value (max lockable memory).
    pub memlock_limit: Option<u64>,
    /// Whether running on a `PREEMPT_RT` kernel.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Check if RT scheduling up to `priority` is likely to succeed.
    #[must_use]
    pub fn can_use_rt_priority(&self, priority: u8) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l >= u64::from(priority))
    }
}

/// Validate that the configured real-time policy can be installed.
///
/// Called by the runtime before any thread is created, so a missing
/// privilege aborts the run instead of degrading it silently.
///
/// # Errors
///
/// Returns [`SeqError::SchedulingPrivilege`] when neither root nor a
/// sufficient `RLIMIT_RTPRIO` is available for the sequencer priority.
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> SeqResult<()> {
    if !config.enabled || !config.policy.is_realtime() {
        return Ok(());
    }

    let caps = check_rt_capabilities();

    if !caps.preempt_rt {
        warn!(
            "PREEMPT_RT kernel not detected. Release latency may be degraded; \
             fixed-priority ordering still applies."
        );
    }

    if caps.can_use_rt_priority(config.sequencer_priority) {
        info!(?caps, "Real-time capabilities validated");
        Ok(())
    } else {
        let message = format!(
            "cannot use SCHED_{:?} at priority {}: RLIMIT_RTPRIO={:?}, is_root={}. \
             Grant CAP_SYS_NICE or raise RLIMIT_RTPRIO.",
            config.policy, config.sequencer_priority, caps.rtprio_limit, caps.is_root
        );
        error!("{}", message);
        Err(SeqError::SchedulingPrivilege(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_rt() {
        let config = RealtimeConfig {
            enabled: false,
            ..Default::default()
        };

        let status = init_realtime(&config).unwrap();
        assert!(!status.memory_locked);
        assert_eq!(status.stack_prefaulted, 0);
        assert!(validate_rt_capabilities(&config).is_ok());
    }

    #[test]
    fn test_stack_prefault() {
        let faulted = prefault_stack(64 * 1024);
        assert_eq!(faulted, 64 * 1024);
        assert_eq!(prefault_stack(0), 0);
    }

    #[test]
    fn test_capability_priority_check() {
        let caps = RtCapabilities {
            is_root: false,
            rtprio_limit: Some(50),
            ..Default::default()
        };
        assert!(caps.can_use_rt_priority(50));
        assert!(!caps.can_use_rt_priority(99));

        let root = RtCapabilities {
            is_root: true,
            ..Default::default()
        };
        assert!(root.can_use_rt_priority(99));
    }

    #[test]
    fn test_online_cpus() {
        assert!(online_cpus() >= 1);
    }

    #[test]
    fn test_unpinned_other_placement_applies() {
        // SCHED_OTHER at priority 0 with no pinning needs no privileges.
        let placement = ThreadPlacement {
            policy: SchedPolicy::Other,
            priority: 0,
            cpus: vec![],
        };
        let handle = std::thread::spawn(move || apply_placement(&placement));
        let applied = handle.join().unwrap().unwrap();
        assert_eq!(applied.policy, SchedPolicy::Other);
        assert!(applied.cpus.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_out_of_range_priority_rejected() {
        let result = set_thread_scheduler(SchedPolicy::Fifo, 0);
        assert!(matches!(result, Err(SeqError::SchedulingPrivilege(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_cpu_reported() {
        let cpu = current_cpu().unwrap();
        assert!(cpu < 4096);
    }
}
