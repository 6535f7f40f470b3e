use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Used for link error probabilities, sample fractions and error rates so
/// that Bernoulli trials and threshold comparisons are bit-identical across
/// platforms.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in sim loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display, never in sim loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Whether `v` lies in the closed unit interval.
#[inline]
pub fn is_probability(v: Fixed64) -> bool {
    v >= Fixed64::ZERO && v <= Fixed64::ONE
}

/// `numerator / denominator` as a Fixed64 ratio. Zero when the denominator is zero.
#[inline]
pub fn ratio(numerator: usize, denominator: usize) -> Fixed64 {
    if denominator == 0 {
        return Fixed64::ZERO;
    }
    Fixed64::from_num(numerator) / Fixed64::from_num(denominator)
}

/// `ceil(fraction * count)`, computed exactly in fixed point.
#[inline]
pub fn ceil_fraction(fraction: Fixed64, count: usize) -> usize {
    (fraction * Fixed64::from_num(count)).ceil().to_num::<usize>()
}
