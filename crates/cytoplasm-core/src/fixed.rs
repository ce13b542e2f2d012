use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Every compound amount, rate and energy figure in the simulation uses this
/// type so that runs are reproducible bit-for-bit on any thread layout.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in sim loop.
/// Out-of-range values saturate; NaN becomes zero.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    if v.is_nan() {
        return Fixed64::ZERO;
    }
    Fixed64::saturating_from_num(v)
}

/// Convert Fixed64 to f64. Use only for display and logging, never in sim loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Checked division for Fixed64 that returns None on zero divisor.
#[inline]
pub fn checked_div_64(a: Fixed64, b: Fixed64) -> Option<Fixed64> {
    a.checked_div(b)
}

/// `num / den` clamped into `[0, 1]`.
///
/// A non-positive denominator means nothing is required, which yields 1.
/// A non-positive numerator yields 0.
#[inline]
pub fn unit_ratio(num: Fixed64, den: Fixed64) -> Fixed64 {
    if den <= Fixed64::ZERO {
        return Fixed64::ONE;
    }
    if num <= Fixed64::ZERO {
        return Fixed64::ZERO;
    }
    checked_div_64(num, den)
        .unwrap_or(Fixed64::ONE)
        .min(Fixed64::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed64_basic_arithmetic() {
        let a = f64_to_fixed64(1.5);
        let b = f64_to_fixed64(2.0);
        assert_eq!(fixed64_to_f64(a + b), 3.5);
    }

    #[test]
    fn fixed64_checked_div_by_zero() {
        let a = f64_to_fixed64(1.0);
        assert!(checked_div_64(a, Fixed64::ZERO).is_none());
    }

    #[test]
    fn conversion_saturates() {
        assert_eq!(f64_to_fixed64(1e30), Fixed64::MAX);
        assert_eq!(f64_to_fixed64(-1e30), Fixed64::MIN);
        assert_eq!(f64_to_fixed64(f64::NAN), Fixed64::ZERO);
    }

    #[test]
    fn unit_ratio_clamps() {
        let four = f64_to_fixed64(4.0);
        let ten = f64_to_fixed64(10.0);
        let r = fixed64_to_f64(unit_ratio(four, ten));
        assert!((r - 0.4).abs() < 1e-9);
        assert_eq!(unit_ratio(ten, four), Fixed64::ONE);
        assert_eq!(unit_ratio(four, Fixed64::ZERO), Fixed64::ONE);
        assert_eq!(unit_ratio(-four, ten), Fixed64::ZERO);
    }

    #[test]
    fn fixed64_determinism() {
        let a = f64_to_fixed64(1.0 / 3.0);
        let b = f64_to_fixed64(1.0 / 3.0);
        assert_eq!(a * f64_to_fixed64(3.0), b * f64_to_fixed64(3.0));
    }
}
