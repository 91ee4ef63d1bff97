//! Scheduling and affinity planning.
//!
//! Computes, once and before any thread exists, the fixed priority and CPU
//! set of the sequencer thread and of every service:
//!
//! - Rate-monotonic priorities: the shorter the period (smaller divisor), the
//!   higher the priority. The sequencer sits above every service.
//! - CPU partitioning: the sequencer gets a reserved core and services are
//!   spread over the remaining cores by an [`AffinityRule`]. At least one
//!   online core is never used by the plan.

use crate::hyperperiod::lcm_of_slice;
use seq_common::config::{AffinityRule, SchedPolicy, SequencerConfig};
use seq_common::error::{SeqError, SeqResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// Scheduling attributes for one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadPlacement {
    /// Scheduler policy.
    pub policy: SchedPolicy,
    /// Fixed priority within the policy.
    pub priority: u8,
    /// CPUs the thread is pinned to; empty means unpinned.
    pub cpus: Vec<usize>,
}

/// Planned placement of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServicePlan {
    /// Service index.
    pub index: usize,
    /// Display name.
    pub name: String,
    /// Period divisor in base ticks.
    pub divisor: u64,
    /// Priority and CPU set.
    pub placement: ThreadPlacement,
}

/// Complete placement plan for a session.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulePlan {
    /// Placement of the sequencer (timer) thread.
    pub sequencer: ThreadPlacement,
    /// Placement of every service, in index order.
    pub services: Vec<ServicePlan>,
    /// LCM of all divisors.
    pub hyperperiod: u64,
    /// Utilization check, present when every service declares a WCET.
    pub utilization: Option<UtilizationReport>,
}

/// Rate-monotonic utilization against the Liu & Layland bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilizationReport {
    /// Sum of `wcet / period` over all services.
    pub utilization: f64,
    /// Least upper bound `n(2^(1/n) - 1)`.
    pub bound: f64,
    /// Whether the utilization is within the bound.
    pub within_bound: bool,
}

impl SchedulePlan {
    /// Emit the plan at `info` level.
    pub fn log(&self) {
        info!(
            policy = ?self.sequencer.policy,
            priority = self.sequencer.priority,
            cpus = ?self.sequencer.cpus,
            hyperperiod = self.hyperperiod,
            "Sequencer placement"
        );
        for s in &self.services {
            info!(
                service = s.index,
                name = %s.name,
                divisor = s.divisor,
                priority = s.placement.priority,
                cpus = ?s.placement.cpus,
                "Service placement"
            );
        }
        if let Some(u) = self.utilization {
            if u.within_bound {
                info!(
                    utilization = u.utilization,
                    bound = u.bound,
                    "Service set within rate-monotonic bound"
                );
            } else {
                warn!(
                    utilization = u.utilization,
                    bound = u.bound,
                    "Service set exceeds rate-monotonic bound"
                );
            }
        }
    }
}

/// Build the placement plan for `config`.
///
/// `online_cpus` is the number of cores the plan may use. When `None`, core
/// indices are not checked against the machine (the plan is only logged).
///
/// # Errors
///
/// Returns [`SeqError::Plan`] if there are no services, a divisor is zero,
/// the priorities run out, a core is not online, or no core is left free.
pub fn plan(config: &SequencerConfig, online_cpus: Option<usize>) -> SeqResult<SchedulePlan> {
    if config.services.is_empty() {
        return Err(SeqError::Plan("no services configured".into()));
    }
    let divisors = config.divisors();
    if let Some(index) = divisors.iter().position(|&d| d == 0) {
        return Err(SeqError::Plan(format!("service {index} has a zero divisor")));
    }

    let policy = config.realtime.policy;
    let sequencer_priority = sequencer_priority(policy, config.realtime.sequencer_priority)?;
    let priorities = service_priorities(policy, sequencer_priority, &divisors)?;
    let (sequencer_cpus, service_cpus) = partition(&config.affinity, divisors.len())?;

    if let Some(online) = online_cpus {
        check_cores(online, &sequencer_cpus, &service_cpus)?;
    }

    let services = divisors
        .iter()
        .zip(priorities)
        .zip(service_cpus)
        .enumerate()
        .map(|(index, ((&divisor, priority), cpus))| ServicePlan {
            index,
            name: config.service_name(index),
            divisor,
            placement: ThreadPlacement {
                policy,
                priority,
                cpus,
            },
        })
        .collect();

    Ok(SchedulePlan {
        sequencer: ThreadPlacement {
            policy,
            priority: sequencer_priority,
            cpus: sequencer_cpus,
        },
        services,
        hyperperiod: lcm_of_slice(&divisors)?,
        utilization: utilization(config),
    })
}

fn sequencer_priority(policy: SchedPolicy, configured: u8) -> SeqResult<u8> {
    let (min, max) = policy.priority_range();
    if !policy.is_realtime() {
        return Ok(min);
    }
    if configured < min || configured > max {
        return Err(SeqError::Plan(format!(
            "sequencer priority {configured} outside {min}..={max} for {policy:?}"
        )));
    }
    Ok(configured)
}

/// Service index order sorted by rate: divisor ascending, ties by index.
#[must_use]
pub fn rate_monotonic_order(divisors: &[u64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..divisors.len()).collect();
    order.sort_by_key(|&i| (divisors[i], i));
    order
}

fn service_priorities(
    policy: SchedPolicy,
    sequencer_priority: u8,
    divisors: &[u64],
) -> SeqResult<Vec<u8>> {
    let (min, _) = policy.priority_range();
    let mut priorities = vec![min; divisors.len()];
    if !policy.is_realtime() {
        return Ok(priorities);
    }

    for (rank, index) in rate_monotonic_order(divisors).into_iter().enumerate() {
        let priority = usize::from(sequencer_priority)
            .checked_sub(rank + 1)
            .and_then(|p| u8::try_from(p).ok())
            .filter(|&p| p >= min)
            .ok_or_else(|| {
                SeqError::Plan(format!(
                    "priorities exhausted: {} services below sequencer priority \
                     {sequencer_priority} (policy minimum {min})",
                    divisors.len()
                ))
            })?;
        priorities[index] = priority;
    }
    Ok(priorities)
}

fn partition(rule: &AffinityRule, count: usize) -> SeqResult<(Vec<usize>, Vec<Vec<usize>>)> {
    let (sequencer_cpu, services) = match rule {
        AffinityRule::None => return Ok((vec![], vec![vec![]; count])),
        AffinityRule::EvenOdd {
            sequencer_cpu,
            even_cpu,
            odd_cpu,
        } => {
            let services = (0..count)
                .map(|i| vec![if i % 2 == 0 { *even_cpu } else { *odd_cpu }])
                .collect::<Vec<_>>();
            (*sequencer_cpu, services)
        }
        AffinityRule::RoundRobin {
            sequencer_cpu,
            service_cpus,
        } => {
            if service_cpus.is_empty() {
                return Err(SeqError::Plan(
                    "round_robin affinity needs at least one service core".into(),
                ));
            }
            let services = (0..count)
                .map(|i| vec![service_cpus[i % service_cpus.len()]])
                .collect::<Vec<_>>();
            (*sequencer_cpu, services)
        }
    };

    if services.iter().flatten().any(|&cpu| cpu == sequencer_cpu) {
        return Err(SeqError::Plan(format!(
            "core {sequencer_cpu} is reserved for the sequencer but also assigned to a service"
        )));
    }
    Ok((vec![sequencer_cpu], services))
}

fn check_cores(online: usize, sequencer: &[usize], services: &[Vec<usize>]) -> SeqResult<()> {
    let used: BTreeSet<usize> = sequencer
        .iter()
        .chain(services.iter().flatten())
        .copied()
        .collect();

    if let Some(&cpu) = used.iter().find(|&&cpu| cpu >= online) {
        return Err(SeqError::Plan(format!(
            "core {cpu} is not online ({online} cores available)"
        )));
    }
    if !used.is_empty() && used.len() >= online {
        return Err(SeqError::Plan(format!(
            "plan uses all {online} online cores; at least one must stay free"
        )));
    }
    Ok(())
}

fn utilization(config: &SequencerConfig) -> Option<UtilizationReport> {
    let tick = config.tick_interval.as_secs_f64();
    if tick <= 0.0 {
        return None;
    }
    let utilization = config
        .services
        .iter()
        .map(|s| {
            #[allow(clippy::cast_precision_loss)]
            let period = tick * s.divisor as f64;
            s.wcet.map(|w: Duration| w.as_secs_f64() / period)
        })
        .sum::<Option<f64>>()?;

    #[allow(clippy::cast_precision_loss)]
    let n = config.services.len() as f64;
    let bound = n * (2f64.powf(1.0 / n) - 1.0);
    Some(UtilizationReport {
        utilization,
        bound,
        within_bound: utilization <= bound,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_common::config::ServiceConfig;

    #[test]
    fn test_default_plan() {
        let config = SequencerConfig::default();
        let plan = plan(&config, Some(4)).unwrap();

        assert_eq!(plan.hyperperiod, 30);
        assert_eq!(plan.sequencer.priority, 99);
        assert_eq!(plan.sequencer.cpus, vec![1]);

        let prios: Vec<u8> = plan.services.iter().map(|s| s.placement.priority).collect();
        assert_eq!(prios, vec![98, 97, 96]);

        let cpus: Vec<Vec<usize>> =
            plan.services.iter().map(|s| s.placement.cpus.clone()).collect();
        assert_eq!(cpus, vec![vec![2], vec![3], vec![2]]);
        assert!(plan.utilization.is_none());
    }

    #[test]
    fn test_rate_monotonic_ordering_independent_of_index() {
        let mut config = SequencerConfig::default();
        config.services = vec![
            ServiceConfig::every(15),
            ServiceConfig::every(2),
            ServiceConfig::every(10),
            ServiceConfig::every(2),
        ];
        config.affinity = AffinityRule::None;
        let plan = plan(&config, None).unwrap();

        let prios: Vec<u8> = plan.services.iter().map(|s| s.placement.priority).collect();
        // Divisor 2 at index 1 outranks divisor 2 at index 3.
        assert_eq!(prios, vec![95, 98, 96, 97]);
        for a in &plan.services {
            assert!(plan.sequencer.priority > a.placement.priority);
            for b in &plan.services {
                if a.divisor < b.divisor {
                    assert!(a.placement.priority > b.placement.priority);
                }
            }
        }
    }

    #[test]
    fn test_priority_exhaustion() {
        let mut config = SequencerConfig::default();
        config.realtime.sequencer_priority = 3;
        assert!(matches!(plan(&config, None), Err(SeqError::Plan(_))));

        config.realtime.sequencer_priority = 4;
        let plan = plan(&config, None).unwrap();
        assert_eq!(plan.services[2].placement.priority, 1);
    }

    #[test]
    fn test_other_policy_flattens_priorities() {
        let mut config = SequencerConfig::default();
        config.realtime.policy = SchedPolicy::Other;
        let plan = plan(&config, None).unwrap();
        assert_eq!(plan.sequencer.priority, 0);
        assert!(plan.services.iter().all(|s| s.placement.priority == 0));
    }

    #[test]
    fn test_affinity_checks() {
        let config = SequencerConfig::default();
        // Cores 1..=3 on a 3-core machine: core 3 is not online.
        let err = plan(&config, Some(3)).unwrap_err();
        assert!(err.to_string().contains("not online"), "{err}");

        let mut config = SequencerConfig::default();
        config.affinity = AffinityRule::EvenOdd {
            sequencer_cpu: 0,
            even_cpu: 1,
            odd_cpu: 2,
        };
        let err = plan(&config, Some(3)).unwrap_err();
        assert!(err.to_string().contains("free"), "{err}");

        config.affinity = AffinityRule::EvenOdd {
            sequencer_cpu: 1,
            even_cpu: 1,
            odd_cpu: 2,
        };
        assert!(plan(&config, Some(8)).is_err());
    }

    #[test]
    fn test_round_robin() {
        let mut config = SequencerConfig::default();
        config.affinity = AffinityRule::RoundRobin {
            sequencer_cpu: 0,
            service_cpus: vec![2, 3],
        };
        let plan = plan(&config, Some(8)).unwrap();
        let cpus: Vec<usize> = plan.services.iter().map(|s| s.placement.cpus[0]).collect();
        assert_eq!(cpus, vec![2, 3, 2]);

        let mut config = SequencerConfig::default();
        config.affinity = AffinityRule::RoundRobin {
            sequencer_cpu: 0,
            service_cpus: vec![],
        };
        assert!(super::plan(&config, None).is_err());
    }

    #[test]
    fn test_no_services() {
        let mut config = SequencerConfig::default();
        config.services.clear();
        assert!(matches!(plan(&config, None), Err(SeqError::Plan(_))));
    }

    #[test]
    fn test_utilization_report() {
        let mut config = SequencerConfig::default();
        config.services = vec![
            ServiceConfig::every(2).with_wcet(Duration::from_millis(5)),
            ServiceConfig::every(10).with_wcet(Duration::from_millis(10)),
        ];
        let report = plan(&config, None).unwrap().utilization.unwrap();
        // 5/20 + 10/100
        assert!((report.utilization - 0.35).abs() < 1e-9);
        assert!((report.bound - 2.0 * (2f64.sqrt() - 1.0)).abs() < 1e-9);
        assert!(report.within_bound);

        config.services[0].wcet = Some(Duration::from_millis(18));
        let report = plan(&config, None).unwrap().utilization.unwrap();
        assert!(!report.within_bound);
    }
}
