use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;

use crate::{Fps, TimelineError};

/// Exact fraction used for every timeline position and duration.
///
/// Always stored normalized: numerator and denominator share no common
/// factor, the denominator is positive and zero is `0/1`. Because of that,
/// derived equality is exact equality of the represented value.
///
/// Arithmetic runs in 128 bits. The operators saturate a result that does
/// not fit back into 64 bits: magnitudes past `i64::MAX` clamp to
/// `±i64::MAX`, and a denominator too large to store is rounded to the
/// nearest representable fraction. The `checked_*` methods return
/// [`TimelineError::Overflow`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRational", into = "RawRational")]
pub struct Rational {
    num: i64,
    den: i64,
}

#[derive(Serialize, Deserialize)]
struct RawRational {
    num: i64,
    den: i64,
}

impl TryFrom<RawRational> for Rational {
    type Error = TimelineError;

    fn try_from(raw: RawRational) -> Result<Self, Self::Error> {
        Rational::try_new(raw.num, raw.den)
    }
}

impl From<Rational> for RawRational {
    fn from(r: Rational) -> Self {
        Self {
            num: r.num,
            den: r.den,
        }
    }
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    /// Panics on a zero denominator or an `i64::MIN` one; use [`Rational::try_new`]
    /// for untrusted input.
    pub fn new(num: i64, den: i64) -> Self {
        match Self::try_new(num, den) {
            Ok(r) => r,
            Err(e) => panic!("invalid rational {num}/{den}: {e}"),
        }
    }

    pub fn try_new(num: i64, den: i64) -> Result<Self, TimelineError> {
        if den == 0 {
            return Err(TimelineError::ZeroDenominator);
        }
        Self::try_reduce(num as i128, den as i128)
    }

    pub const fn from_integer(value: i64) -> Self {
        Self { num: value, den: 1 }
    }

    /// Normalized `num / den` in 128 bits; `den` must be non-zero.
    fn normalize(num: i128, den: i128) -> (i128, i128) {
        if num == 0 {
            return (0, 1);
        }
        let g = gcd(num, den);
        let (num, den) = (num / g, den / g);
        if den < 0 {
            (-num, -den)
        } else {
            (num, den)
        }
    }

    fn fits(num: i128, den: i128) -> bool {
        num.unsigned_abs() <= i64::MAX as u128 && den <= i64::MAX as i128
    }

    fn try_reduce(num: i128, den: i128) -> Result<Self, TimelineError> {
        let (num, den) = Self::normalize(num, den);
        if !Self::fits(num, den) {
            return Err(TimelineError::Overflow);
        }
        Ok(Self {
            num: num as i64,
            den: den as i64,
        })
    }

    fn reduce(num: i128, den: i128) -> Self {
        let (num, den) = Self::normalize(num, den);
        if Self::fits(num, den) {
            return Self {
                num: num as i64,
                den: den as i64,
            };
        }
        let max = i64::MAX as i128;
        if num.unsigned_abs() / den.unsigned_abs() >= max as u128 {
            return Self {
                num: if num < 0 { -i64::MAX } else { i64::MAX },
                den: 1,
            };
        }
        // Scale both terms down until they fit, rounding the numerator.
        let scale = ((den - 1) / max + 1).max((num.abs() - 1) / max + 1);
        let den = (den / scale).max(1);
        let half = scale / 2;
        let num = if num < 0 {
            -((-num + half) / scale)
        } else {
            (num + half) / scale
        };
        let (num, den) = Self::normalize(num.clamp(-max, max), den);
        Self {
            num: num as i64,
            den: den as i64,
        }
    }

    pub fn numerator(&self) -> i64 {
        self.num
    }

    pub fn denominator(&self) -> i64 {
        self.den
    }

    /// Time of `frame` at the given frame rate, in seconds.
    pub fn from_frames(frame: i64, fps: Fps) -> Self {
        Self::reduce(frame as i128 * fps.den as i128, fps.num as i128)
    }

    /// Frame index containing this time (floor).
    pub fn to_frames(&self, fps: Fps) -> i64 {
        let n = self.num as i128 * fps.num as i128;
        let d = self.den as i128 * fps.den as i128;
        n.div_euclid(d) as i64
    }

    /// Lossy; only for display and blend weights.
    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_negative(&self) -> bool {
        self.num < 0
    }

    pub fn abs(self) -> Self {
        Self::reduce((self.num as i128).abs(), self.den as i128)
    }

    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Self) -> Self {
        if self >= other {
            self
        } else {
            other
        }
    }

    pub fn clamp(self, lo: Self, hi: Self) -> Self {
        self.max(lo).min(hi)
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, TimelineError> {
        Self::try_reduce(
            self.num as i128 * rhs.den as i128 + rhs.num as i128 * self.den as i128,
            self.den as i128 * rhs.den as i128,
        )
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, TimelineError> {
        self.checked_add(Self::reduce(-(rhs.num as i128), rhs.den as i128))
    }

    pub fn checked_mul(self, rhs: Self) -> Result<Self, TimelineError> {
        Self::try_reduce(
            self.num as i128 * rhs.num as i128,
            self.den as i128 * rhs.den as i128,
        )
    }

    pub fn checked_div(self, rhs: Self) -> Result<Self, TimelineError> {
        if rhs.is_zero() {
            return Err(TimelineError::ZeroDenominator);
        }
        Self::try_reduce(
            self.num as i128 * rhs.den as i128,
            self.den as i128 * rhs.num as i128,
        )
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.num as i128 * other.den as i128;
        let rhs = other.num as i128 * self.den as i128;
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Rational {
    type Output = Rational;
    fn add(self, rhs: Rational) -> Rational {
        Rational::reduce(
            self.num as i128 * rhs.den as i128 + rhs.num as i128 * self.den as i128,
            self.den as i128 * rhs.den as i128,
        )
    }
}

impl Sub for Rational {
    type Output = Rational;
    fn sub(self, rhs: Rational) -> Rational {
        self + (-rhs)
    }
}

impl Mul for Rational {
    type Output = Rational;
    fn mul(self, rhs: Rational) -> Rational {
        Rational::reduce(
            self.num as i128 * rhs.num as i128,
            self.den as i128 * rhs.den as i128,
        )
    }
}

/// Panics when dividing by zero, like integer division.
impl Div for Rational {
    type Output = Rational;
    fn div(self, rhs: Rational) -> Rational {
        if rhs.is_zero() {
            panic!("rational division by zero");
        }
        Rational::reduce(
            self.num as i128 * rhs.den as i128,
            self.den as i128 * rhs.num as i128,
        )
    }
}

impl Mul<i64> for Rational {
    type Output = Rational;
    fn mul(self, rhs: i64) -> Rational {
        self * Rational::from_integer(rhs)
    }
}

impl Div<i64> for Rational {
    type Output = Rational;
    fn div(self, rhs: i64) -> Rational {
        self / Rational::from_integer(rhs)
    }
}

impl Neg for Rational {
    type Output = Rational;
    fn neg(self) -> Rational {
        Rational::reduce(-(self.num as i128), self.den as i128)
    }
}

impl AddAssign for Rational {
    fn add_assign(&mut self, rhs: Rational) {
        *self = *self + rhs;
    }
}

impl SubAssign for Rational {
    fn sub_assign(&mut self, rhs: Rational) {
        *self = *self - rhs;
    }
}

impl From<i64> for Rational {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl FromStr for Rational {
    type Err = TimelineError;

    /// Accepts `"n"` or `"n/d"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| TimelineError::InvalidOp(format!("invalid rational: {s}")))
        };
        match s.split_once('/') {
            Some((n, d)) => Rational::try_new(parse(n)?, parse(d)?),
            None => Ok(Rational::from_integer(parse(s)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_sign_and_factors() {
        let r = Rational::new(6, -8);
        assert_eq!(r.numerator(), -3);
        assert_eq!(r.denominator(), 4);
        assert_eq!(Rational::new(0, -5), Rational::ZERO);
    }

    #[test]
    fn zero_denominator_is_rejected() {
        assert!(matches!(
            Rational::try_new(1, 0),
            Err(TimelineError::ZeroDenominator)
        ));
        assert!(Rational::ONE.checked_div(Rational::ZERO).is_err());
    }

    #[test]
    fn ntsc_frames_accumulate_without_drift() {
        let fps = Fps::new(30000, 1001);
        let one_frame = Rational::from_frames(1, fps);
        let mut t = Rational::ZERO;
        for _ in 0..108_000 {
            t += one_frame;
        }
        assert_eq!(t, Rational::from_frames(108_000, fps));
        assert_eq!(t.to_frames(fps), 108_000);
    }

    #[test]
    fn to_frames_floors_negative_times() {
        let fps = Fps::new(24, 1);
        assert_eq!(Rational::new(-1, 48).to_frames(fps), -1);
        assert_eq!(Rational::new(1, 48).to_frames(fps), 0);
    }

    #[test]
    fn overflow_saturates_in_operators() {
        let max = Rational::from_integer(i64::MAX);
        assert_eq!(max + Rational::ONE, max);
        assert_eq!(-max - Rational::from_integer(2), -max);
        assert_eq!(max * Rational::from_integer(3), max);
        assert_eq!(-Rational::from_integer(i64::MIN), max);
    }

    #[test]
    fn huge_denominators_round_to_nearest() {
        let tiny = Rational::new(1, i64::MAX);
        let third = tiny * Rational::new(1, 3);
        assert!(third >= Rational::ZERO && third <= tiny);

        let a = Rational::new(1, i64::MAX - 1);
        let b = Rational::new(1, i64::MAX - 2);
        let sum = a + b;
        let exact = 2.0 / i64::MAX as f64;
        assert!((sum.to_f64() - exact).abs() < 1e-30);
        assert!(sum.denominator() > 0);
    }

    #[test]
    fn checked_arithmetic_reports_overflow() {
        let max = Rational::from_integer(i64::MAX);
        assert!(matches!(
            max.checked_add(Rational::ONE),
            Err(TimelineError::Overflow)
        ));
        assert!(matches!(
            max.checked_mul(Rational::from_integer(2)),
            Err(TimelineError::Overflow)
        ));
        assert!(matches!(
            Rational::try_new(1, i64::MIN),
            Err(TimelineError::Overflow)
        ));
        assert_eq!(
            Rational::new(1, 2).checked_add(Rational::new(1, 3)).unwrap(),
            Rational::new(5, 6)
        );
        assert_eq!(
            max.checked_sub(Rational::ONE).unwrap(),
            Rational::from_integer(i64::MAX - 1)
        );
    }

    #[test]
    fn parses_and_displays() {
        assert_eq!("3/6".parse::<Rational>().unwrap(), Rational::new(1, 2));
        assert_eq!("7".parse::<Rational>().unwrap(), Rational::from_integer(7));
        assert!("1/0".parse::<Rational>().is_err());
        assert_eq!(Rational::new(1001, 30000).to_string(), "1001/30000");
    }

    #[test]
    fn serde_rejects_zero_denominator() {
        let err = serde_json::from_str::<Rational>(r#"{"num":1,"den":0}"#);
        assert!(err.is_err());
        let ok: Rational = serde_json::from_str(r#"{"num":2,"den":4}"#).unwrap();
        assert_eq!(ok, Rational::new(1, 2));
    }

    proptest! {
        #[test]
        fn add_then_sub_is_identity(a in -10_000i64..10_000, b in 1i64..5_000,
                                    c in -10_000i64..10_000, d in 1i64..5_000) {
            let x = Rational::new(a, b);
            let y = Rational::new(c, d);
            prop_assert_eq!(x + y - y, x);
        }

        #[test]
        fn serde_round_trip_is_exact(a in -1_000_000i64..1_000_000, b in 1i64..100_000) {
            let x = Rational::new(a, b);
            let json = serde_json::to_string(&x).unwrap();
            let back: Rational = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, x);
        }

        #[test]
        fn ordering_matches_cross_multiplication(a in -1_000i64..1_000, b in 1i64..1_000,
                                                 c in -1_000i64..1_000, d in 1i64..1_000) {
            let x = Rational::new(a, b);
            let y = Rational::new(c, d);
            prop_assert_eq!(x < y, (a * d) < (c * b));
        }
    }
}
