//! Hyperperiod arithmetic over period divisors.
//!
//! The default run length of a session is the LCM of all divisors, the
//! smallest tick count after which every service has completed a whole
//! number of periods.

use seq_common::error::{SeqError, SeqResult};

/// Iterative Euclidean GCD. `gcd(0, 0) == 0`.
#[must_use]
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Checked LCM. Returns `Ok(0)` when either input is 0.
///
/// # Errors
///
/// Returns [`SeqError::Plan`] if the result does not fit in `u64`.
pub fn lcm(a: u64, b: u64) -> SeqResult<u64> {
    if a == 0 || b == 0 {
        return Ok(0);
    }
    (a / gcd(a, b))
        .checked_mul(b)
        .ok_or_else(|| SeqError::Plan(format!("hyperperiod overflow computing lcm({a}, {b})")))
}

/// LCM of all divisors, `Ok(0)` for an empty slice.
///
/// # Errors
///
/// Returns [`SeqError::Plan`] on the first overflow.
pub fn lcm_of_slice(divisors: &[u64]) -> SeqResult<u64> {
    divisors
        .iter()
        .try_fold(divisors.first().copied().unwrap_or(0), |acc, &d| lcm(acc, d))
}

/// Scheduled releases of a service with `divisor` after ticks `0..=last_tick`.
///
/// Tick 0 releases every service, so the count is `last_tick / divisor + 1`.
#[must_use]
pub fn releases_through(last_tick: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return 0;
    }
    last_tick / divisor + 1
}
