use async_trait::async_trait;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::CommError;
use crate::time::{ClockOffset, Timestamp};

/// Offsets beyond this need operator acknowledgement before they drive
/// overwrite decisions.
pub const DRIFT_LIMIT: Duration = Duration::from_secs(2);

/// Anything that can report the controller's wall clock.
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn controller_time(&self) -> Result<Timestamp, CommError>;
}

/// Holds the most recent `local - controller` measurement.
#[derive(Debug, Default)]
pub struct ClockEstimator {
    offset: RwLock<Option<ClockOffset>>,
}

impl ClockEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the first successful measurement.
    pub fn current(&self) -> Option<ClockOffset> {
        match self.offset.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, offset: ClockOffset) {
        match self.offset.write() {
            Ok(mut guard) => *guard = Some(offset),
            Err(poisoned) => *poisoned.into_inner() = Some(offset),
        }
    }

    /// Round-trip a time query and store the midpoint-adjusted offset. A
    /// failed query leaves the previous value in place.
    pub async fn measure<S>(&self, source: &S) -> Result<ClockOffset, CommError>
    where
        S: TimeSource + ?Sized,
    {
        let before = Timestamp::now();
        let controller = source.controller_time().await?;
        let after = Timestamp::now();

        let offset = estimate(before, after, controller);
        tracing::debug!(
            "clock offset {offset} (round trip {}ms)",
            after.millis_since(before)
        );
        self.set(offset);
        Ok(offset)
    }
}

/// The controller read its clock somewhere inside the round trip; assume the
/// middle.
pub fn estimate(before: Timestamp, after: Timestamp, controller: Timestamp) -> ClockOffset {
    let midpoint = before.as_unix_millis() + after.millis_since(before) / 2;
    ClockOffset::from_millis(midpoint - controller.as_unix_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(Result<Timestamp, CommError>);

    #[async_trait]
    impl TimeSource for FixedClock {
        async fn controller_time(&self) -> Result<Timestamp, CommError> {
            self.0.clone()
        }
    }

    #[test]
    fn test_estimate_uses_midpoint() {
        let offset = estimate(
            Timestamp::from_unix_millis(1_000),
            Timestamp::from_unix_millis(1_200),
            Timestamp::from_unix_millis(500),
        );
        assert_eq!(offset.as_millis(), 600);
    }

    #[tokio::test]
    async fn test_measure_stores_offset() {
        let estimator = ClockEstimator::new();
        assert!(estimator.current().is_none());

        // Controller one minute behind
        let behind = Timestamp::from_unix_millis(Timestamp::now().as_unix_millis() - 60_000);
        let offset = estimator.measure(&FixedClock(Ok(behind))).await.unwrap();
        assert!((offset.as_millis() - 60_000).abs() < 1_000);
        assert_eq!(estimator.current(), Some(offset));
    }

    #[tokio::test]
    async fn test_failed_measure_keeps_previous() {
        let estimator = ClockEstimator::new();
        estimator.set(ClockOffset::from_millis(42));
        let err = estimator
            .measure(&FixedClock(Err(CommError::Unavailable("no route".into()))))
            .await
            .unwrap_err();
        assert!(matches!(err, CommError::Unavailable(_)));
        assert_eq!(estimator.current(), Some(ClockOffset::from_millis(42)));
    }
}
