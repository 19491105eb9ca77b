//! Collection scheduling state of a point
//!
//! After every fire the point computes when it next wants data:
//!
//! - valid data: `timestamp + period`, anchored to data time so it does not drift
//! - no valid data: `now + min(period, retry interval)`
//! - the same data timestamp as last time: `now + period / 2`, with a warning
//!
//! Points with a zero period are driven externally and never become due.

use crate::types::{Period, Timestamp};

/// How the last fire ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// The chain produced a valid sample with this timestamp
    Valid(Timestamp),
    /// Null result or null value
    NoData,
}

/// Mutable scheduling fields of a point
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// When the point next wants collecting; `None` before the first
    /// collection or for externally driven points
    pub next_epoch: Option<Timestamp>,
    /// A collection request is outstanding
    pub collecting: bool,
    pub collecting_since: Option<Timestamp>,
    /// Timestamp of the last valid sample
    pub last_timestamp: Option<Timestamp>,
}

impl ScheduleState {
    /// True when the point should be collected at `now`
    pub fn is_due(&self, now: Timestamp) -> bool {
        !self.collecting && self.next_epoch.map_or(true, |t| t <= now)
    }

    /// Mark a collection request as outstanding
    pub fn begin_collect(&mut self, now: Timestamp) {
        self.collecting = true;
        self.collecting_since = Some(now);
    }

    /// Abandon a collection that never came back
    pub fn expire_collect(&mut self, now: Timestamp, timeout: Period) -> bool {
        match self.collecting_since {
            Some(since) if self.collecting && now - since >= timeout => {
                self.collecting = false;
                self.collecting_since = None;
                true
            }
            _ => false,
        }
    }

    /// Update after a fire; returns the new epoch
    pub fn reschedule(
        &mut self,
        point: &str,
        period: Period,
        outcome: FireOutcome,
        now: Timestamp,
        retry: Period,
    ) -> Option<Timestamp> {
        self.collecting = false;
        self.collecting_since = None;

        let duplicate = match outcome {
            FireOutcome::Valid(ts) => {
                let dup = self.last_timestamp == Some(ts);
                self.last_timestamp = Some(ts);
                dup
            }
            FireOutcome::NoData => false,
        };

        if period <= Period::zero() {
            self.next_epoch = None;
            return None;
        }

        let next = match outcome {
            FireOutcome::Valid(ts) if duplicate => {
                tracing::warn!(
                    "({}) Duplicate data timestamp {}, retrying in half a period",
                    point,
                    ts
                );
                now + period / 2
            }
            FireOutcome::Valid(ts) => ts + period,
            FireOutcome::NoData => now + period.min(retry),
        };

        self.next_epoch = Some(next);
        self.next_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::timestamp_from_secs;

    const RETRY: i64 = 1;

    fn retry() -> Period {
        Period::seconds(RETRY)
    }

    #[test]
    fn test_valid_anchors_to_data_time() {
        let mut state = ScheduleState::default();
        let next = state.reschedule(
            "a.b",
            Period::seconds(10),
            FireOutcome::Valid(timestamp_from_secs(100)),
            timestamp_from_secs(103),
            retry(),
        );
        assert_eq!(next, Some(timestamp_from_secs(110)));
    }

    #[test]
    fn test_no_data_uses_capped_retry() {
        let mut state = ScheduleState::default();
        let next = state.reschedule(
            "a.b",
            Period::seconds(10),
            FireOutcome::NoData,
            timestamp_from_secs(100),
            retry(),
        );
        assert_eq!(next, Some(timestamp_from_secs(101)));

        // Retry is capped by a shorter period
        let next = state.reschedule(
            "a.b",
            Period::milliseconds(200),
            FireOutcome::NoData,
            timestamp_from_secs(100),
            retry(),
        );
        assert_eq!(next, Some(timestamp_from_secs(100) + Period::milliseconds(200)));
    }

    #[test]
    fn test_duplicate_timestamp_half_period() {
        let mut state = ScheduleState::default();
        let ts = timestamp_from_secs(100);
        state.reschedule("a.b", Period::seconds(10), FireOutcome::Valid(ts), ts, retry());
        let next = state.reschedule(
            "a.b",
            Period::seconds(10),
            FireOutcome::Valid(ts),
            timestamp_from_secs(110),
            retry(),
        );
        assert_eq!(next, Some(timestamp_from_secs(115)));
    }

    #[test]
    fn test_zero_period_never_due_after_fire() {
        let mut state = ScheduleState::default();
        state.begin_collect(timestamp_from_secs(0));
        let next = state.reschedule(
            "a.b",
            Period::zero(),
            FireOutcome::Valid(timestamp_from_secs(1)),
            timestamp_from_secs(1),
            retry(),
        );
        assert!(next.is_none());
        assert!(!state.collecting);
    }

    #[test]
    fn test_due_and_collecting() {
        let mut state = ScheduleState::default();
        let now = timestamp_from_secs(5);
        assert!(state.is_due(now));
        state.begin_collect(now);
        assert!(!state.is_due(now));
        assert!(!state.expire_collect(timestamp_from_secs(6), Period::seconds(10)));
        assert!(state.expire_collect(timestamp_from_secs(15), Period::seconds(10)));
        assert!(state.is_due(now));
    }
}
