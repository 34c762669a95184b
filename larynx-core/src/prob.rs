//! Log-domain probability arithmetic for numerically stable computation.
//!
//! Probabilities are stored as natural logarithms. Zero probability is the
//! finite sentinel [`LOG_ZERO`] rather than IEEE negative infinity, so the
//! combine operator [`log_add`] needs no special case for it: the sentinel is
//! far enough below any reachable log probability that `exp` of the
//! difference underflows to exactly zero.
//!
//! Every value at or below [`LOG_ZERO`] denotes zero probability.

use crate::{LarynxError, Result};

/// Log of zero probability.
pub const LOG_ZERO: f64 = -1.0e30;

/// Whether `x` denotes zero probability.
#[inline]
pub fn is_log_zero(x: f64) -> bool {
    x <= LOG_ZERO
}

/// Log-sum-exp: `ln(exp(a) + exp(b))` computed as
/// `max(a, b) + ln(1 + exp(-|a - b|))`.
///
/// `log_add(LOG_ZERO, x) == x` for every `x >= LOG_ZERO`, and
/// `log_add(LOG_ZERO, LOG_ZERO) == LOG_ZERO`.
#[inline]
pub fn log_add(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    max + (-(a - b).abs()).exp().ln_1p()
}

/// Product in log space, saturating at [`LOG_ZERO`].
#[inline]
pub fn log_mul(a: f64, b: f64) -> f64 {
    (a + b).max(LOG_ZERO)
}

/// Log-sum-exp over any number of terms; [`LOG_ZERO`] for an empty input.
pub fn log_sum<I>(terms: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    terms.into_iter().fold(LOG_ZERO, log_add)
}

/// Map a raw log probability onto the sentinel convention.
///
/// `-inf` and anything below [`LOG_ZERO`] become [`LOG_ZERO`].
///
/// # Errors
///
/// Returns an error for NaN.
pub fn clamp_log_prob(x: f64) -> Result<f64> {
    if x.is_nan() {
        return Err(LarynxError::InvalidInput("log probability is NaN".into()));
    }
    Ok(x.max(LOG_ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn sentinel_is_identity_for_add() {
        for &x in &[0.0, -1.0, -745.0, -1.0e6, 3.5, -1.0e20] {
            assert_eq!(log_add(LOG_ZERO, x), x);
            assert_eq!(log_add(x, LOG_ZERO), x);
        }
        assert_eq!(log_add(LOG_ZERO, LOG_ZERO), LOG_ZERO);
    }

    #[test]
    fn sentinel_absorbs_mul() {
        assert_eq!(log_mul(LOG_ZERO, -3.0), LOG_ZERO);
        assert_eq!(log_mul(LOG_ZERO, LOG_ZERO), LOG_ZERO);
        assert!(is_log_zero(log_mul(LOG_ZERO, 0.0)));
    }

    #[test]
    fn log_add_numerical_stability() {
        let r = log_add(-1000.0, -1001.0);
        assert!(r.is_finite());
        assert!(r >= -1000.0 && r < -999.0);

        assert!((log_add(0.0, 0.0) - 2.0_f64.ln()).abs() < 1e-12);

        let big = log_add(700.0, 700.0);
        assert!((big - (700.0 + 2.0_f64.ln())).abs() < 1e-10);
    }

    #[test]
    fn log_sum_matches_direct_sum() {
        let ps: [f64; 3] = [0.1, 0.2, 0.3];
        let total = log_sum(ps.iter().map(|p| p.ln()));
        assert!((total.exp() - 0.6).abs() < TOL);
        assert_eq!(log_sum(std::iter::empty()), LOG_ZERO);
    }

    #[test]
    fn clamp_handles_negative_infinity_and_nan() {
        assert_eq!(clamp_log_prob(f64::NEG_INFINITY).unwrap(), LOG_ZERO);
        assert_eq!(clamp_log_prob(-2.0e30).unwrap(), LOG_ZERO);
        assert_eq!(clamp_log_prob(-1.5).unwrap(), -1.5);
        assert!(clamp_log_prob(f64::NAN).is_err());
    }
}
