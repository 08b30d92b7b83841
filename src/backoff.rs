//! Retry schedule for delivery attempts.
//!
//! Pure arithmetic, no wall-clock state: the processor and the tests must
//! agree on the schedule. The delay before attempt n is `BASE · 2^(n-1)`,
//! so a job that exhausts all attempts waits 2 s, 4 s, 8 s and 16 s between
//! its five tries.

/// Maximum number of delivery attempts for a message, counting the initial
/// try. The failure of attempt `MAX_ATTEMPTS` moves the job to the
/// dead-letter queue.
pub const MAX_ATTEMPTS: i64 = 5;

/// Base retry delay in milliseconds.
pub const BASE_DELAY_MS: u64 = 1000;

/// Logical store queue the processor reserves from.
pub const MAIN_QUEUE: &str = "message-delivery";

/// Terminal holding queue for messages that exhausted their attempts.
pub const DEAD_LETTER_QUEUE: &str = "message-delivery-dead-letter";

/// Delay in milliseconds to apply before the given attempt number.
///
/// Defined for every input: attempt 0 yields half the base delay and
/// negative attempts keep halving, so callers never have to guard the
/// argument.
pub fn delay_ms(attempt: i64) -> u64 {
    if attempt >= 1 {
        let exp = (attempt - 1).min(32) as u32;
        BASE_DELAY_MS.saturating_mul(1u64 << exp)
    } else {
        let exp = attempt.unsigned_abs().saturating_add(1).min(63) as u32;
        BASE_DELAY_MS.checked_shr(exp).unwrap_or(0)
    }
}
