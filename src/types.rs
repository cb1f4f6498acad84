use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use parse_display::Display;
use serde::{Deserialize, Serialize};

/// A time point in simulation
#[derive(Debug, Default, Clone, Copy, Display, Serialize, Deserialize)]
#[display("{0:.6}")]
pub struct Time(pub f64);

impl From<f64> for Time {
    fn from(v: f64) -> Self {
        Time(v)
    }
}

impl PartialEq for Time {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0).is_eq()
    }
}

impl Eq for Time {}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.0.total_cmp(&other.0))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Time {
    pub const ZERO: Time = Time(0.0);
}

/// A duration of time in simulation
#[derive(Debug, Default, Clone, Copy, Display, Serialize, Deserialize)]
#[display("{0:.6}")]
pub struct Duration(pub f64);

impl From<f64> for Duration {
    fn from(v: f64) -> Self {
        Duration(v)
    }
}

impl PartialEq for Duration {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0).is_eq()
    }
}

impl Eq for Duration {}

impl PartialOrd for Duration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.0.total_cmp(&other.0))
    }
}

impl Ord for Duration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Duration {
    pub const ZERO: Duration = Duration(0.0);

    /// Clamp a possibly-negative duration to zero.
    pub fn non_negative(self) -> Duration {
        if self.0 < 0.0 {
            Duration(0.0)
        } else {
            self
        }
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Self::Output {
        Time(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Sub<Duration> for Time {
    type Output = Time;

    fn sub(self, rhs: Duration) -> Self::Output {
        Time(self.0 - rhs.0)
    }
}

impl SubAssign<Duration> for Time {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0;
    }
}

impl Sub for Time {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        Duration(self.0 - rhs.0)
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Self::Output {
        Duration(self.0 - rhs.0)
    }
}
