// =============================================================================
// Precision Formatter: tick/step-size driven display rounding
// =============================================================================
//
// Exchange filters publish a minimum price increment (tick size) and a
// minimum quantity increment (step size).  Both are turned into decimal-place
// counts:
//
//   places = clamp(round(-log10(size)), 0, MAX_DECIMAL_PLACES)
//
// Display values are TRUNCATED to that many places, never rounded: rounding
// up would overstate an affordable amount.  The integer part is grouped in
// thousands with commas.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Upper bound on any derived or inferred place count.
pub const MAX_DECIMAL_PLACES: u32 = 8;

/// Rendered in place of a value when no data exists at all.
pub const MISSING_VALUE: &str = "-";

/// Decimal-place configuration for one symbol, derived from exchange filters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionSpec {
    pub tick_size: f64,
    pub step_size: f64,
    pub price_places: u32,
    pub quantity_places: u32,
}

/// Build a [`PrecisionSpec`] from tick and step sizes.  Malformed sizes
/// (zero, negative, NaN, infinite) yield zero places.
pub fn derive_precision(tick_size: f64, step_size: f64) -> PrecisionSpec {
    PrecisionSpec {
        tick_size,
        step_size,
        price_places: places_from_increment(tick_size),
        quantity_places: places_from_increment(step_size),
    }
}

/// `max(0, round(-log10(size)))`, capped at [`MAX_DECIMAL_PLACES`].
pub fn places_from_increment(size: f64) -> u32 {
    if !size.is_finite() || size <= 0.0 {
        return 0;
    }
    let places = (-size.log10()).round();
    if !places.is_finite() || places <= 0.0 {
        return 0;
    }
    (places as u32).min(MAX_DECIMAL_PLACES)
}

/// Format a price with the symbol's price places, or `fallback_places` when
/// no metadata is available.  Missing or non-finite values render as
/// [`MISSING_VALUE`].
pub fn format_price(value: Option<f64>, spec: Option<&PrecisionSpec>, fallback_places: u32) -> String {
    let places = spec.map_or(fallback_places, |s| s.price_places);
    format_truncated(value, places)
}

/// Format a quantity with the symbol's quantity places, or `fallback_places`.
pub fn format_amount(value: Option<f64>, spec: Option<&PrecisionSpec>, fallback_places: u32) -> String {
    let places = spec.map_or(fallback_places, |s| s.quantity_places);
    format_truncated(value, places)
}

/// Truncate `value` to `places` decimals and group the integer part.
pub fn format_truncated(value: Option<f64>, places: u32) -> String {
    match value {
        Some(v) if v.is_finite() => {
            let places = places.min(MAX_DECIMAL_PLACES) as usize;
            let (negative, int_part, frac_part) = truncate_digits(v, places);
            let mut out = String::with_capacity(int_part.len() + frac_part.len() + 6);
            if negative {
                out.push('-');
            }
            out.push_str(&group_thousands(&int_part));
            if places > 0 {
                out.push('.');
                out.push_str(&frac_part);
            }
            out
        }
        _ => MISSING_VALUE.to_string(),
    }
}

/// Compact large magnitudes for depth displays: `1_234_567.0` -> `1.23M`.
/// The scaled value is truncated (not rounded) to 2 decimals.
pub fn compact_number(value: Option<f64>) -> String {
    let v = match value {
        Some(v) if v.is_finite() => v,
        _ => return MISSING_VALUE.to_string(),
    };

    const SCALES: [(f64, &str); 4] = [(1e12, "T"), (1e9, "B"), (1e6, "M"), (1e3, "k")];

    let magnitude = v.abs();
    for (scale, suffix) in SCALES {
        if magnitude >= scale {
            let scaled = format_truncated(Some(v / scale), 2);
            return format!("{scaled}{suffix}");
        }
    }
    format_truncated(Some(v), 2)
}

/// Number of significant fractional digits in a numeric string, used as a
/// per-update hint when a payload is more precise than the tick size.
/// Trailing zeros are ignored (`"37000.01000000"` -> 2).
pub fn decimal_hint(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    if trimmed.parse::<f64>().is_err() {
        return None;
    }
    let frac = match trimmed.split_once('.') {
        Some((_, frac)) => frac,
        None => return Some(0),
    };
    let digits = frac
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    let significant = digits.trim_end_matches('0');
    Some(significant.len() as u32)
}

/// Places used for one formatting call: `max(cached, hint)`, capped.
pub fn effective_places(cached: u32, hint: Option<u32>) -> u32 {
    cached.max(hint.unwrap_or(0)).min(MAX_DECIMAL_PLACES)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Split `value` into sign, integer digits and exactly `places` fractional
/// digits, truncating.  Works on the shortest round-trip decimal form so
/// `0.29` stays `0.29` instead of `0.28999...`.
fn truncate_digits(value: f64, places: usize) -> (bool, String, String) {
    // f64 Display never uses exponent notation.
    let repr = format!("{}", value.abs());
    let (int_part, frac_part) = match repr.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (repr.clone(), String::new()),
    };

    let mut frac: String = frac_part.chars().take(places).collect();
    while frac.len() < places {
        frac.push('0');
    }

    let is_zero = int_part.chars().all(|c| c == '0') && frac.chars().all(|c| c == '0');
    let negative = value.is_sign_negative() && !is_zero;
    (negative, int_part, frac)
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_common_sizes() {
        let spec = derive_precision(0.01, 0.0001);
        assert_eq!(spec.price_places, 2);
        assert_eq!(spec.quantity_places, 4);

        let spec = derive_precision(0.00000100, 1.0);
        assert_eq!(spec.price_places, 6);
        assert_eq!(spec.quantity_places, 0);
    }

    #[test]
    fn derive_malformed_sizes_are_zero() {
        let spec = derive_precision(0.0, 0.0);
        assert_eq!(spec.price_places, 0);
        assert_eq!(spec.quantity_places, 0);

        assert_eq!(places_from_increment(f64::NAN), 0);
        assert_eq!(places_from_increment(-0.01), 0);
        assert_eq!(places_from_increment(f64::INFINITY), 0);
        // Tick sizes above one would give negative places.
        assert_eq!(places_from_increment(10.0), 0);
    }

    #[test]
    fn derive_caps_at_eight() {
        assert_eq!(places_from_increment(1e-12), MAX_DECIMAL_PLACES);
    }

    #[test]
    fn amount_truncates_not_rounds() {
        let spec = derive_precision(0.01, 0.01);
        assert_eq!(format_amount(Some(1234.5678), Some(&spec), 6), "1,234.56");
        assert_eq!(format_price(Some(0.29), Some(&spec), 6), "0.29");
        assert_eq!(format_price(Some(1.999), Some(&spec), 6), "1.99");
    }

    #[test]
    fn fallback_places_without_metadata() {
        assert_eq!(format_price(Some(42.5), None, 2), "42.50");
        assert_eq!(format_amount(Some(0.1234567891), None, 6), "0.123456");
    }

    #[test]
    fn missing_values_render_sentinel() {
        assert_eq!(format_price(None, None, 2), MISSING_VALUE);
        assert_eq!(format_price(Some(f64::NAN), None, 2), MISSING_VALUE);
        assert_eq!(compact_number(None), MISSING_VALUE);
    }

    #[test]
    fn grouping_and_sign() {
        assert_eq!(format_truncated(Some(1_234_567.891), 2), "1,234,567.89");
        assert_eq!(format_truncated(Some(-98_765.4), 0), "-98,765");
        assert_eq!(format_truncated(Some(-0.001), 2), "0.00");
        assert_eq!(format_truncated(Some(100.0), 3), "100.000");
    }

    #[test]
    fn compact_suffixes_truncate() {
        assert_eq!(compact_number(Some(999.999)), "999.99");
        assert_eq!(compact_number(Some(1_239.0)), "1.23k");
        assert_eq!(compact_number(Some(1_999_999.0)), "1.99M");
        assert_eq!(compact_number(Some(2_500_000_000.0)), "2.50B");
        assert_eq!(compact_number(Some(-3_000_000_000_000.0)), "-3.00T");
    }

    #[test]
    fn decimal_hint_counts_significant_digits() {
        assert_eq!(decimal_hint("37000.01000000"), Some(2));
        assert_eq!(decimal_hint("0.00001234"), Some(8));
        assert_eq!(decimal_hint("42"), Some(0));
        assert_eq!(decimal_hint("abc"), None);
    }

    #[test]
    fn effective_places_takes_max_and_caps() {
        assert_eq!(effective_places(2, Some(5)), 5);
        assert_eq!(effective_places(4, Some(1)), 4);
        assert_eq!(effective_places(2, Some(12)), MAX_DECIMAL_PLACES);
        assert_eq!(effective_places(3, None), 3);
    }
}
