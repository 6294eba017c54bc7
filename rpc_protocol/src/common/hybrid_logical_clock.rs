// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A hybrid logical clock (HLC) used to stamp the `__ts` user property (`§3`) carried by every
//! request, response, and telemetry message: a wall-clock timestamp paired with a logical
//! counter, so that causally related events from the same node can be totally ordered even when
//! their wall clocks tie or briefly regress.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::RpcError;

/// Default maximum allowed drift between a remote HLC and local wall-clock time.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// A hybrid logical clock value: RFC 3339 timestamp, logical counter, and owning node id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HybridLogicalClock {
    /// Wall-clock component, truncated to millisecond precision.
    pub timestamp: DateTime<Utc>,
    /// Logical counter disambiguating events that share a timestamp.
    pub counter: u64,
    /// Identifier of the node that owns this clock.
    pub node_id: String,
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogicalClock {
    /// Creates a new clock at the current time, counter zero, with a fresh random node id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            counter: 0,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    /// Merges `other` (received from a peer) into `self`, following the standard HLC merge
    /// rule: advance to the latest of (wall clock, self, other), breaking ties by counter.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorKind::InternalLogicError`] if the counter would overflow, or
    /// [`crate::error::ErrorKind::StateInvalid`] if the resulting drift from wall-clock time
    /// would exceed `max_clock_drift`.
    pub fn update(&mut self, other: &HybridLogicalClock, max_clock_drift: Duration) -> Result<(), RpcError> {
        if self.node_id == other.node_id {
            return Ok(());
        }

        let now = Utc::now();

        if now > self.timestamp && now > other.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else if other.timestamp == self.timestamp {
            if self.counter >= other.counter {
                self.validate(now, max_clock_drift)?;
                self.counter += 1;
            } else {
                other.validate(now, max_clock_drift)?;
                self.counter = other.counter + 1;
            }
        } else if self.timestamp > other.timestamp {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        } else {
            other.validate(now, max_clock_drift)?;
            self.timestamp = other.timestamp;
            self.counter = other.counter + 1;
        }

        Ok(())
    }

    /// Advances the clock to the current wall-clock time, or increments the counter if the
    /// clock is already ahead of wall-clock time (within `max_clock_drift`).
    ///
    /// # Errors
    /// Same as [`Self::update`].
    pub fn update_now(&mut self, max_clock_drift: Duration) -> Result<(), RpcError> {
        let now = Utc::now();
        if now > self.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        }
        Ok(())
    }

    /// Validates that this clock is not more than `max_clock_drift` ahead of `now`, and that
    /// the counter has not overflowed.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorKind::InternalLogicError`] on counter overflow, or
    /// [`crate::error::ErrorKind::StateInvalid`] if the clock drifts too far into the future.
    pub fn validate(&self, now: DateTime<Utc>, max_clock_drift: Duration) -> Result<(), RpcError> {
        if self.counter == u64::MAX {
            return Err(RpcError::internal_logic_error(
                "counter",
                Some("hybrid logical clock counter overflowed".to_string()),
            ));
        }
        if let Ok(diff) = (self.timestamp - now).to_std() {
            if diff > max_clock_drift {
                return Err(RpcError::state_invalid(
                    "max_clock_drift",
                    Some("hybrid logical clock drift exceeds the maximum allowed".to_string()),
                ));
            }
        }
        Ok(())
    }
}

impl Display for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:0>5}:{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.counter,
            self.node_id
        )
    }
}

impl FromStr for HybridLogicalClock {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, RpcError> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        let [ts_part, counter_part, node_id] = parts[..] else {
            return Err(RpcError::header_invalid(
                "__ts",
                s,
                Some("malformed hybrid logical clock: expected 3 ':'-separated segments".to_string()),
            ));
        };

        let timestamp = DateTime::parse_from_rfc3339(ts_part)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                RpcError::header_invalid("__ts", s, Some(format!("malformed hybrid logical clock timestamp: {e}")))
            })?;

        let counter = counter_part.parse::<u64>().map_err(|e| {
            RpcError::header_invalid("__ts", s, Some(format!("malformed hybrid logical clock counter: {e}")))
        })?;

        Ok(Self {
            timestamp,
            counter,
            node_id: node_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_starts_at_counter_zero() {
        assert_eq!(HybridLogicalClock::new().counter, 0);
    }

    #[test]
    fn display_then_parse_round_trips() {
        let hlc = HybridLogicalClock {
            timestamp: Utc::now(),
            counter: 7,
            node_id: Uuid::new_v4().to_string(),
        };
        let s = hlc.to_string();
        let parsed: HybridLogicalClock = s.parse().unwrap();
        assert_eq!(parsed.counter, hlc.counter);
        assert_eq!(parsed.node_id, hlc.node_id);
        assert_eq!(
            parsed.timestamp.timestamp_millis(),
            hlc.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn update_from_same_node_is_noop() {
        let mut a = HybridLogicalClock::new();
        let before = a.clone();
        let b = a.clone();
        a.update(&b, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(a, before);
    }

    #[test]
    fn update_advances_counter_on_matching_timestamp() {
        let ts = Utc::now() - chrono::Duration::seconds(5);
        let mut a = HybridLogicalClock {
            timestamp: ts,
            counter: 3,
            node_id: "node-a".to_string(),
        };
        let b = HybridLogicalClock {
            timestamp: ts,
            counter: 1,
            node_id: "node-b".to_string(),
        };
        a.update(&b, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(a.counter, 4);
    }

    #[test]
    fn update_adopts_later_remote_timestamp() {
        let mut a = HybridLogicalClock {
            timestamp: Utc::now() - chrono::Duration::seconds(10),
            counter: 0,
            node_id: "node-a".to_string(),
        };
        let b = HybridLogicalClock {
            timestamp: Utc::now() - chrono::Duration::seconds(1),
            counter: 5,
            node_id: "node-b".to_string(),
        };
        a.update(&b, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.counter, 6);
    }

    #[test]
    fn excessive_drift_is_rejected() {
        let mut a = HybridLogicalClock::new();
        let b = HybridLogicalClock {
            timestamp: Utc::now() + chrono::Duration::hours(1),
            counter: 0,
            node_id: "node-b".to_string(),
        };
        let err = a.update(&b, DEFAULT_MAX_CLOCK_DRIFT).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::StateInvalid);
    }

    #[test]
    fn malformed_string_is_header_invalid() {
        let err = "not-an-hlc".parse::<HybridLogicalClock>().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::HeaderInvalid);
    }
}
