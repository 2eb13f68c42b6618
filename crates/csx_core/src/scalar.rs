use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

use num_traits::Float;

/// Matrix value type. The engine supports the two IEEE binary float widths;
/// index math is `usize` throughout and does not go through this trait.
pub trait Scalar:
    Float
    + Default
    + Sum
    + FromStr
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + 'static
{
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Scalar for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }
}
