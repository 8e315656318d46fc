//! Phone number normalization to international `+<digits>` form.

use std::sync::OnceLock;

use regex::Regex;

fn re_international() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+\d{8,15}$").unwrap())
}

/// Normalize a raw phone value for the given default calling code (`"31"`).
///
/// Spreadsheet coercion artifacts like `3,16E+10` are expanded back to
/// digits first. Anything that does not end up as `+` followed by 8-15
/// digits yields an empty string.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }

    let expanded;
    let raw = if raw.contains("E+") || raw.contains("e+") {
        match raw.replace(',', ".").parse::<f64>() {
            Ok(n) if n.is_finite() && n > 0.0 => {
                expanded = format!("{:.0}", n.round());
                expanded.as_str()
            }
            _ => raw,
        }
    } else {
        raw
    };

    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    let candidate = if let Some(rest) = cleaned.strip_prefix("00") {
        format!("+{}", rest)
    } else if cleaned.starts_with('+') {
        cleaned
    } else if cleaned.starts_with(country_code) && cleaned.len() >= country_code.len() + 9 {
        format!("+{}", cleaned)
    } else if let Some(rest) = cleaned.strip_prefix('0') {
        format!("+{}{}", country_code, rest)
    } else if (9..=10).contains(&cleaned.len()) {
        format!("+{}{}", country_code, cleaned)
    } else {
        cleaned
    };

    if re_international().is_match(&candidate) {
        candidate
    } else {
        String::new()
    }
}
