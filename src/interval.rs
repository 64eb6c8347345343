//! Closed time intervals used by the negotiation loop.
//!
//! Times are UTC ticks of the acquisition clock. Two sentinel intervals exist:
//! [`Interval::EMPTY`] (no opinion / nothing yet) and [`Interval::FLUSH`]
//! (the owner is done forever).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Tick value reserved for the empty interval.
pub const EMPTY_TIME: i64 = i64::MIN;

/// Tick value reserved for the flush interval.
pub const FLUSH_TIME: i64 = i64::MAX;

/// A closed time range `[start, end]`.
///
/// # Examples
///
/// ```
/// use trigctl::Interval;
///
/// let a = Interval::new(100, 200).unwrap();
/// let b = Interval::new(200, 300).unwrap();
/// assert!(a.overlaps(&b));
/// assert!(Interval::new(5, 1).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    start: i64,
    end: i64,
}

impl Interval {
    /// The distinguished empty interval.
    pub const EMPTY: Self = Self {
        start: EMPTY_TIME,
        end: EMPTY_TIME,
    };

    /// The distinguished flush interval.
    pub const FLUSH: Self = Self {
        start: FLUSH_TIME,
        end: FLUSH_TIME,
    };

    /// Creates an interval.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidInterval` if `start > end`.
    pub fn new(start: i64, end: i64) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates a single-tick interval.
    #[must_use]
    pub const fn at(time: i64) -> Self {
        Self {
            start: time,
            end: time,
        }
    }

    #[must_use]
    pub const fn start(&self) -> i64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> i64 {
        self.end
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == EMPTY_TIME && self.end == EMPTY_TIME
    }

    #[must_use]
    pub const fn is_flush(&self) -> bool {
        self.start == FLUSH_TIME && self.end == FLUSH_TIME
    }

    /// True for intervals that are neither empty nor flush.
    #[must_use]
    pub const fn is_real(&self) -> bool {
        !self.is_empty() && !self.is_flush()
    }

    /// Closed-interval overlap; touching endpoints overlap.
    ///
    /// The empty interval overlaps nothing.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.start <= other.end && other.start <= self.end
    }

    #[must_use]
    pub const fn contains(&self, time: i64) -> bool {
        !self.is_empty() && self.start <= time && time <= self.end
    }

    /// True if `other` lies entirely inside this interval.
    #[must_use]
    pub const fn contains_interval(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.start <= other.start && other.end <= self.end
    }

    /// Smallest interval covering both. The empty interval is the identity.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Ordering used by the negotiator.
    ///
    /// Overlapping intervals compare `Equal`; otherwise intervals are ordered by
    /// position. The empty interval sorts before everything else and is equal only
    /// to itself. Equality here is not transitive, so this is not an `Ord`.
    #[must_use]
    pub fn negotiation_cmp(&self, other: &Self) -> Ordering {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        if self.overlaps(other) {
            Ordering::Equal
        } else if self.end < other.start {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[EMPTY]")
        } else if self.is_flush() {
            write!(f, "[FLUSH]")
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(s: i64, e: i64) -> Interval {
        Interval::new(s, e).unwrap()
    }

    #[test]
    fn test_interval_new_rejects_inverted() {
        assert!(Interval::new(10, 9).is_err());
        assert!(Interval::new(10, 10).is_ok());
    }

    #[test]
    fn test_sentinels() {
        assert!(Interval::EMPTY.is_empty());
        assert!(!Interval::EMPTY.is_flush());
        assert!(Interval::FLUSH.is_flush());
        assert!(!Interval::FLUSH.is_real());
        assert!(iv(1, 2).is_real());
        assert_eq!(Interval::default(), Interval::EMPTY);
    }

    #[test]
    fn test_overlap_is_closed() {
        assert!(iv(100, 200).overlaps(&iv(200, 300)));
        assert!(iv(200, 300).overlaps(&iv(100, 200)));
        assert!(!iv(100, 199).overlaps(&iv(200, 300)));
        assert!(iv(100, 500).overlaps(&iv(200, 300)));
    }

    #[test]
    fn test_empty_overlaps_nothing() {
        assert!(!Interval::EMPTY.overlaps(&Interval::EMPTY));
        assert!(!Interval::EMPTY.overlaps(&iv(i64::MIN, 0)));
    }

    #[test]
    fn test_union_identity() {
        assert_eq!(Interval::EMPTY.union(&iv(3, 4)), iv(3, 4));
        assert_eq!(iv(3, 4).union(&Interval::EMPTY), iv(3, 4));
        assert_eq!(iv(100, 200).union(&iv(150, 250)), iv(100, 250));
    }

    #[test]
    fn test_negotiation_cmp_overlap_is_equal() {
        assert_eq!(iv(100, 200).negotiation_cmp(&iv(150, 250)), Ordering::Equal);
        assert_eq!(iv(100, 149).negotiation_cmp(&iv(150, 250)), Ordering::Less);
        assert_eq!(iv(300, 400).negotiation_cmp(&iv(150, 250)), Ordering::Greater);
        assert_eq!(Interval::EMPTY.negotiation_cmp(&iv(1, 2)), Ordering::Less);
        assert_eq!(Interval::EMPTY.negotiation_cmp(&Interval::EMPTY), Ordering::Equal);
        assert_eq!(Interval::FLUSH.negotiation_cmp(&iv(1, 2)), Ordering::Greater);
    }

    #[test]
    fn test_contains() {
        let i = iv(10, 20);
        assert!(i.contains(10));
        assert!(i.contains(20));
        assert!(!i.contains(21));
        assert!(i.contains_interval(&iv(12, 20)));
        assert!(!i.contains_interval(&iv(5, 12)));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", iv(1, 2)), "[1, 2]");
        assert_eq!(format!("{}", Interval::FLUSH), "[FLUSH]");
        assert_eq!(format!("{}", Interval::EMPTY), "[EMPTY]");
    }

    #[test]
    fn test_serialization() {
        let i = iv(7, 9);
        let json = serde_json::to_string(&i).unwrap();
        let back: Interval = serde_json::from_str(&json).unwrap();
        assert_eq!(i, back);
    }
}
