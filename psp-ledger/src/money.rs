use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::ops::AddAssign;
use std::ops::Sub;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de;

/// Fixed-point monetary amount with four fractional digits.
///
/// Amounts are always carried at scale 4 so that equality, ordering and
/// serialization are stable regardless of how a value was produced. There is
/// deliberately no conversion from or to floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Money {
    pub const SCALE: u32 = 4;

    pub fn new(amount: Decimal) -> Self {
        let mut rescaled = amount;
        rescaled.rescale(Self::SCALE);
        Self(rescaled)
    }

    pub fn zero() -> Self {
        Self::new(Decimal::ZERO)
    }

    pub fn from_major(units: i64) -> Self {
        Self::new(Decimal::from(units))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Scales by a decimal factor, e.g. for threshold ratios.
    pub fn scaled_by(&self, factor: Decimal) -> Self {
        Self::new(self.0 * factor)
    }

    /// Divides evenly by a count, e.g. for trailing averages.
    pub fn divided_by(&self, count: u32) -> Option<Self> {
        if count == 0 {
            return None;
        }
        Some(Self::new(self.0 / Decimal::from(count)))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money::new(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::zero(), Money::add)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(input).map(Money::new)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Decimals cross serialization boundaries as strings to preserve precision.
impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Money::from_str(&raw).map_err(de::Error::custom)
    }
}
