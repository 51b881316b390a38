//! Failure classification, retry policy and backoff.
//!
//! Every per-item failure goes through [`record_failure`], which is the only
//! place that moves an item into `failed_retryable` or `failed_permanent`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catalogsync_core::DomainError;

use crate::jobs::types::{Item, ItemStatus};

/// What went wrong with an item, as recorded in `last_error_type`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The row was rejected before any operation was generated.
    Validation,
    /// The transformer itself failed on the row.
    Transformation,
    /// A child operation ran after its parent failed.
    MissingParent,
    ConstraintViolation,
    BusinessRule,
    Timeout,
    LockContention,
    Connectivity,
    /// Any other storage failure.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transformation => "transformation",
            ErrorKind::MissingParent => "missing_parent",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::BusinessRule => "business_rule",
            ErrorKind::Timeout => "timeout",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Storage => "storage",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "validation" => ErrorKind::Validation,
            "transformation" => ErrorKind::Transformation,
            "missing_parent" => ErrorKind::MissingParent,
            "constraint_violation" => ErrorKind::ConstraintViolation,
            "business_rule" => ErrorKind::BusinessRule,
            "timeout" => ErrorKind::Timeout,
            "lock_contention" => ErrorKind::LockContention,
            "connectivity" => ErrorKind::Connectivity,
            "storage" => ErrorKind::Storage,
            other => return Err(DomainError::validation(format!("unknown error kind '{other}'"))),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    Retryable,
    Permanent,
}

/// Transient conditions are retryable; anything tied to the input is not.
///
/// Unclassified storage failures count as retryable: the retry cap bounds
/// them either way.
pub fn classify(kind: ErrorKind) -> FailureClass {
    match kind {
        ErrorKind::Timeout
        | ErrorKind::LockContention
        | ErrorKind::Connectivity
        | ErrorKind::Storage => FailureClass::Retryable,
        ErrorKind::Validation
        | ErrorKind::Transformation
        | ErrorKind::MissingParent
        | ErrorKind::ConstraintViolation
        | ErrorKind::BusinessRule => FailureClass::Permanent,
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            other => Err(DomainError::validation(format!("unknown backoff strategy '{other}'"))),
        }
    }
}

/// Retry policy for item failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Cap on `retry_count` given to new items.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) applied around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Record a failed attempt on `item` and return the class it ended up in.
///
/// Retryable failures bump `retry_count`; reaching `max_retries` turns the
/// item permanent. `retry_count` never exceeds `max_retries`.
pub fn record_failure(
    item: &mut Item,
    kind: ErrorKind,
    message: impl Into<String>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> FailureClass {
    item.last_error_type = Some(kind);
    item.last_error_message = Some(message.into());
    item.last_attempted_at = Some(now);
    if item.first_attempted_at.is_none() {
        item.first_attempted_at = Some(now);
    }

    match classify(kind) {
        FailureClass::Permanent => {
            item.status = ItemStatus::FailedPermanent;
            item.retry_after = None;
            FailureClass::Permanent
        }
        FailureClass::Retryable => {
            let attempts = item.retry_count.saturating_add(1);
            if attempts >= item.max_retries {
                item.retry_count = attempts.min(item.max_retries);
                item.status = ItemStatus::FailedPermanent;
                item.retry_after = None;
                FailureClass::Permanent
            } else {
                item.retry_count = attempts;
                item.status = ItemStatus::FailedRetryable;
                let delay = policy.delay_for_attempt(attempts);
                item.retry_after =
                    Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
                FailureClass::Retryable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_core::{ItemId, JobId};
    use proptest::prelude::*;

    fn item(max_retries: u32) -> Item {
        Item::new(ItemId::new(1), JobId::new(1), "A-1", 1, max_retries)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn linear_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn permanent_failure_keeps_retry_count() {
        let mut item = item(3);
        let class = record_failure(
            &mut item,
            ErrorKind::Validation,
            "row 1: missing required field(s): item_name",
            &RetryPolicy::default(),
            Utc::now(),
        );

        assert_eq!(class, FailureClass::Permanent);
        assert_eq!(item.status, ItemStatus::FailedPermanent);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.last_error_type, Some(ErrorKind::Validation));
        assert!(item.retry_after.is_none());
    }

    #[test]
    fn retryable_failure_schedules_retry() {
        let now = Utc::now();
        let mut item = item(3);
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));

        let class = record_failure(&mut item, ErrorKind::Timeout, "timed out", &policy, now);

        assert_eq!(class, FailureClass::Retryable);
        assert_eq!(item.status, ItemStatus::FailedRetryable);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.retry_after, Some(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn reaching_the_cap_turns_permanent() {
        let mut item = item(2);
        let policy = RetryPolicy::fixed(2, Duration::ZERO);
        let now = Utc::now();

        assert_eq!(
            record_failure(&mut item, ErrorKind::LockContention, "deadlock", &policy, now),
            FailureClass::Retryable
        );
        assert_eq!(
            record_failure(&mut item, ErrorKind::LockContention, "deadlock", &policy, now),
            FailureClass::Permanent
        );
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.status, ItemStatus::FailedPermanent);
    }

    #[test]
    fn error_kind_round_trips_through_its_name() {
        for kind in [ErrorKind::MissingParent, ErrorKind::Connectivity, ErrorKind::BusinessRule] {
            assert_eq!(kind.as_str().parse::<ErrorKind>(), Ok(kind));
        }
        assert!("gremlins".parse::<ErrorKind>().is_err());
    }

    fn any_kind() -> impl Strategy<Value = ErrorKind> {
        prop_oneof![
            Just(ErrorKind::Validation),
            Just(ErrorKind::Transformation),
            Just(ErrorKind::MissingParent),
            Just(ErrorKind::ConstraintViolation),
            Just(ErrorKind::BusinessRule),
            Just(ErrorKind::Timeout),
            Just(ErrorKind::LockContention),
            Just(ErrorKind::Connectivity),
            Just(ErrorKind::Storage),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn retry_count_never_exceeds_cap(
            max_retries in 0u32..6,
            kinds in prop::collection::vec(any_kind(), 1..12),
        ) {
            let mut item = item(max_retries);
            let policy = RetryPolicy::fixed(max_retries, Duration::ZERO);
            let now = Utc::now();

            for kind in kinds {
                // Permanent items are never retried.
                if item.status == ItemStatus::FailedPermanent {
                    break;
                }
                let before = item.retry_count;
                let class = record_failure(&mut item, kind, "boom", &policy, now);

                prop_assert!(item.retry_count <= item.max_retries);
                if classify(kind) == FailureClass::Retryable {
                    let reached_cap = before + 1 >= max_retries;
                    prop_assert_eq!(class == FailureClass::Permanent, reached_cap);
                } else {
                    prop_assert_eq!(item.retry_count, before);
                }
            }
        }
    }
}
