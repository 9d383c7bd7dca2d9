//! Signed 17.14 fixed-point arithmetic for the MLFQS formulas. Nothing
//! outside the scheduler sees these values except scaled-by-100 readouts.

use core::ops::{Add, Div, Mul, Sub};

/// The fixed-point scale factor.
pub const F: i32 = 1 << 14;

/// A signed 17.14 fixed-point real.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Real(i32);

impl Real {
    pub const ZERO: Real = Real(0);

    pub fn from_int(n: i32) -> Real {
        Real(n * F)
    }

    /// Round to the nearest integer, halves away from zero.
    pub fn to_int(self) -> i32 {
        let x = if self.0 >= 0 {
            self.0 + F / 2
        } else {
            self.0 - F / 2
        };
        x / F
    }

    pub fn add_int(self, n: i32) -> Real {
        Real(self.0 + n * F)
    }

    pub fn sub_int(self, n: i32) -> Real {
        Real(self.0 - n * F)
    }

    pub fn mul_int(self, n: i32) -> Real {
        Real(self.0 * n)
    }

    pub fn div_int(self, n: i32) -> Real {
        Real(self.0 / n)
    }

    /// Raw bits, for storage in an atomic.
    pub fn to_bits(self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Real {
        Real(bits)
    }
}

impl Add for Real {
    type Output = Real;
    fn add(self, rhs: Real) -> Real {
        Real(self.0 + rhs.0)
    }
}

impl Sub for Real {
    type Output = Real;
    fn sub(self, rhs: Real) -> Real {
        Real(self.0 - rhs.0)
    }
}

impl Mul for Real {
    type Output = Real;
    fn mul(self, rhs: Real) -> Real {
        Real((self.0 as i64 * rhs.0 as i64 / F as i64) as i32)
    }
}

impl Div for Real {
    type Output = Real;
    fn div(self, rhs: Real) -> Real {
        Real((self.0 as i64 * F as i64 / rhs.0 as i64) as i32)
    }
}
