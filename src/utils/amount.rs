use alloy_primitives::U256;

/// Converts a raw on-chain amount to `f64` for the analysis stages.
///
/// Amounts that fit in `u128` convert directly; larger ones go through their decimal
/// representation. Anything that would not be finite comes back as zero.
pub fn amount_to_f64(value: U256) -> f64 {
    let converted = match u128::try_from(value) {
        Ok(small) => small as f64,
        Err(_) => value.to_string().parse::<f64>().unwrap_or(0.0),
    };
    finite_or_zero(converted)
}

/// Guards a derived quantity (ratio, variance, mean) against NaN and infinity.
pub fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Ratio that reports zero instead of NaN/inf when the denominator is degenerate.
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 { 0.0 } else { finite_or_zero(numerator / denominator) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_amount() {
        assert_eq!(amount_to_f64(U256::from(10u64)), 10.0);
        assert_eq!(amount_to_f64(U256::ZERO), 0.0);
    }

    #[test]
    fn test_large_amount_stays_finite() {
        let huge = U256::MAX;
        let converted = amount_to_f64(huge);
        assert!(converted.is_finite());
        assert!(converted > 1e70);
    }

    #[test]
    fn test_guards() {
        assert_eq!(finite_or_zero(f64::NAN), 0.0);
        assert_eq!(finite_or_zero(f64::INFINITY), 0.0);
        assert_eq!(safe_ratio(1.0, 0.0), 0.0);
        assert_eq!(safe_ratio(1.0, 4.0), 0.25);
    }
}
