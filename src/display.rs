//! Channel-name formatting for the two indicators.
//!
//! Pure and total: every `f64` (including NaN/inf, rendered as zero) maps to a label.

use crate::models::Metrics;

const COMPACT_TIERS: [(f64, &str); 4] = [(1e3, "K"), (1e6, "M"), (1e9, "B"), (1e12, "T")];

/// `1234.5` -> `"$1,234.5000"`
pub fn format_price(value: f64) -> String {
    // Round half away from zero before formatting; `{:.4}` alone rounds ties to even.
    let value = round_to(finite_or_zero(value), 1e4);
    let fixed = format!("{:.4}", value.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "0000"));
    let sign = if value < 0.0 && fixed.bytes().any(|b| (b'1'..=b'9').contains(&b)) {
        "-"
    } else {
        ""
    };
    format!("{}${}.{}", sign, group_thousands(int_part), frac_part)
}

/// Short compact notation with at most two fraction digits: `1_234_000` -> `"1.23M"`.
/// `None` renders as `"0"`.
pub fn format_compact(value: Option<f64>) -> String {
    let Some(value) = value else {
        return "0".to_string();
    };
    let value = finite_or_zero(value);
    let magnitude = value.abs();

    let mut tier: Option<usize> = COMPACT_TIERS.iter().rposition(|(divisor, _)| magnitude >= *divisor);
    let mut scaled = round2(tier.map_or(magnitude, |i| magnitude / COMPACT_TIERS[i].0));

    // 999_999 rounds to 1000K; promote to the next tier like Intl does.
    while scaled >= 1000.0 {
        let next = tier.map_or(0, |i| i + 1);
        if next >= COMPACT_TIERS.len() {
            break;
        }
        tier = Some(next);
        scaled = round2(magnitude / COMPACT_TIERS[next].0);
    }

    let digits = trim_fraction(&format!("{:.2}", scaled));
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (digits.clone(), None),
    };
    let mut out = String::new();
    if value < 0.0 && scaled != 0.0 {
        out.push('-');
    }
    out.push_str(&group_thousands(&int_part));
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(&frac);
    }
    if let Some(i) = tier {
        out.push_str(COMPACT_TIERS[i].1);
    }
    out
}

pub fn price_label(metrics: &Metrics) -> String {
    format!("Price: {}", format_price(metrics.price))
}

pub fn countdown_label(metrics: &Metrics) -> String {
    format!("Halving: {} blocks", format_compact(Some(metrics.countdown)))
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

// Half away from zero
fn round_to(value: f64, scale: f64) -> f64 {
    (value * scale).round() / scale
}

fn round2(value: f64) -> f64 {
    round_to(value, 100.0)
}

fn trim_fraction(digits: &str) -> String {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        digits.to_string()
    }
}

fn group_thousands(int_part: &str) -> String {
    let len = int_part.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
