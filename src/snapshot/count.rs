//! Parsing of human-readable, abbreviated list sizes ("1.2K", "166 K", "1,5 M").

use regex::Regex;
use std::sync::OnceLock;

fn count_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d[\d\s.,]*)([kmb])?(?:\b|$)").expect("count regex is valid")
    })
}

/// Parse a displayed count, tolerating locale separators and K/M/B suffixes.
///
/// Returns `None` when no number can be read. Callers must not treat that as
/// zero: an empty estimate means "unknown", not "empty list".
pub fn parse_compact_count(text: &str) -> Option<u64> {
    let normalized = text.replace(['\u{a0}', '\u{202f}'], " ");
    let caps = count_regex().captures(&normalized)?;
    let digits: String = caps[1]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let digits = digits.trim_end_matches(['.', ',']);
    if digits.is_empty() {
        return None;
    }

    let multiplier: f64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(ref s) if s == "k" => 1e3,
        Some(ref s) if s == "m" => 1e6,
        Some(ref s) if s == "b" => 1e9,
        _ => 1.0,
    };

    let value: f64 = if multiplier > 1.0 {
        suffixed_mantissa(digits)?
    } else {
        plain_number(digits)?
    };

    let scaled = (value * multiplier).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > u64::MAX as f64 {
        return None;
    }
    Some(scaled as u64)
}

/// "1.5" / "1,5" / "1.234,5": with a suffix a lone separator is a decimal mark.
fn suffixed_mantissa(digits: &str) -> Option<f64> {
    let seps: Vec<(usize, char)> = digits
        .char_indices()
        .filter(|(_, c)| *c == '.' || *c == ',')
        .collect();
    let canonical = match seps.as_slice() {
        [] => digits.to_string(),
        [(_, _)] => digits.replace(',', "."),
        many => {
            let (last_idx, last_char) = many[many.len() - 1];
            if many.iter().all(|(_, c)| *c == last_char) {
                // "1.234.567K" only makes sense as grouping.
                digits.replace(['.', ','], "")
            } else {
                let (int_part, frac_part) = digits.split_at(last_idx);
                format!(
                    "{}.{}",
                    int_part.replace(['.', ','], ""),
                    &frac_part[1..]
                )
            }
        }
    };
    canonical.parse().ok()
}

/// Without a suffix separators are grouping unless the last group is not
/// three digits long, in which case it is a decimal mark.
fn plain_number(digits: &str) -> Option<f64> {
    let groups: Vec<&str> = digits.split(['.', ',']).collect();
    if groups.iter().any(|g| g.is_empty()) {
        return None;
    }
    if groups.len() == 1 || groups[1..].iter().all(|g| g.len() == 3) {
        return groups.concat().parse().ok();
    }
    let (frac, int) = groups.split_last()?;
    format!("{}.{}", int.concat(), frac)
        .parse::<f64>()
        .ok()
        .map(f64::floor)
}
