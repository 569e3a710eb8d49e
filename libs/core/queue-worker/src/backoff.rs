//! Retry delay strategies
//!
//! A job carries at most one strategy. The delay is computed from the
//! attempt count after it has been incremented for the current run, so the
//! first retry uses attempt 1.

use serde::{Deserialize, Serialize};

/// Delay before a failed job becomes available again, in whole seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay for every retry
    Constant { secs: u64 },
    /// `base ^ attempt`, capped at `cap` seconds
    Exponential { base: u64, cap: u64 },
    /// Explicit delays per attempt; the last entry repeats
    Table { delays: Vec<u64> },
}

impl Backoff {
    pub fn constant(secs: u64) -> Self {
        Backoff::Constant { secs }
    }

    /// Exponential backoff with a one hour cap.
    pub fn exponential(base: u64) -> Self {
        Backoff::Exponential { base, cap: 3600 }
    }

    pub fn table(delays: impl Into<Vec<u64>>) -> Self {
        Backoff::Table {
            delays: delays.into(),
        }
    }

    /// Delay in seconds for the given attempt (1-based; 0 is treated as 1).
    pub fn calculate(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        match self {
            Backoff::Constant { secs } => *secs,
            Backoff::Exponential { base, cap } => base.saturating_pow(attempt).min(*cap),
            Backoff::Table { delays } => {
                let index = (attempt as usize - 1).min(delays.len().saturating_sub(1));
                delays.get(index).copied().unwrap_or(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_per_attempt() {
        let backoff = Backoff::exponential(2);
        let delays: Vec<u64> = (1..=3).map(|n| backoff.calculate(n)).collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn test_exponential_respects_cap() {
        let backoff = Backoff::Exponential { base: 10, cap: 60 };
        assert_eq!(backoff.calculate(1), 10);
        assert_eq!(backoff.calculate(2), 60);
        assert_eq!(backoff.calculate(40), 60);
    }

    #[test]
    fn test_constant_is_flat() {
        let backoff = Backoff::constant(5);
        let delays: Vec<u64> = (1..=3).map(|n| backoff.calculate(n)).collect();
        assert_eq!(delays, vec![5, 5, 5]);
    }

    #[test]
    fn test_table_repeats_last_entry() {
        let backoff = Backoff::table([1, 5, 30]);
        assert_eq!(backoff.calculate(1), 1);
        assert_eq!(backoff.calculate(3), 30);
        assert_eq!(backoff.calculate(9), 30);
        assert_eq!(Backoff::table(Vec::new()).calculate(2), 0);
    }

    #[test]
    fn test_zero_attempt_treated_as_first() {
        assert_eq!(Backoff::exponential(3).calculate(0), 3);
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Backoff::Exponential { base: 2, cap: 60 }).unwrap();
        assert_eq!(json["strategy"], "exponential");
        assert_eq!(json["base"], 2);
    }
}
