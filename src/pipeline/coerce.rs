//! Leaf coercions: currency glyphs, amounts, dates and sentinels.
//!
//! Each function is a pure `&str → value` rule with no shared state, so the
//! normaliser can apply them in any tree walk and re-apply them to its own
//! output without changing it.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Number, Value};
use std::borrow::Cow;

use crate::schema::CURRENCY_TOKEN;

// ── Currency ─────────────────────────────────────────────────────────────

/// Non-ASCII currency glyphs (Unicode `Sc` outside ASCII `$`).
pub fn is_currency_glyph(c: char) -> bool {
    matches!(
        c,
        '\u{00A2}'..='\u{00A5}'
            | '\u{058F}'
            | '\u{060B}'
            | '\u{07FE}'
            | '\u{07FF}'
            | '\u{09F2}'
            | '\u{09F3}'
            | '\u{09FB}'
            | '\u{0AF1}'
            | '\u{0BF9}'
            | '\u{0E3F}'
            | '\u{17DB}'
            | '\u{20A0}'..='\u{20C0}'
            | '\u{A838}'
            | '\u{FDFC}'
            | '\u{FE69}'
            | '\u{FF04}'
            | '\u{FFE0}'
            | '\u{FFE1}'
            | '\u{FFE5}'
            | '\u{FFE6}'
    )
}

/// Replace every non-ASCII currency glyph with `Rs.`.
pub fn rewrite_currency(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_currency_glyph) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 4);
    for c in s.chars() {
        if is_currency_glyph(c) {
            out.push_str(CURRENCY_TOKEN);
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Apply [`rewrite_currency`] to every string leaf of a JSON tree.
pub fn rewrite_strings(v: Value) -> Value {
    match v {
        Value::String(s) => match rewrite_currency(&s) {
            Cow::Borrowed(_) => Value::String(s),
            Cow::Owned(o) => Value::String(o),
        },
        Value::Array(a) => Value::Array(a.into_iter().map(rewrite_strings).collect()),
        Value::Object(o) => Value::Object(
            o.into_iter()
                .map(|(k, v)| (k, rewrite_strings(v)))
                .collect(),
        ),
        other => other,
    }
}

// ── Sentinels ────────────────────────────────────────────────────────────

/// Strings models use to mean "no value".
pub fn is_missing_marker(s: &str) -> bool {
    let t = s.trim();
    t.is_empty()
        || ["n/a", "na", "n.a.", "null", "none", "nil", "-", "--"]
            .iter()
            .any(|m| t.eq_ignore_ascii_case(m))
}

// ── Amounts ──────────────────────────────────────────────────────────────

static RE_CURRENCY_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:rs\.?|inr|usd|eur|gbp)").unwrap());

/// Parse an amount as written on an invoice: `₹2,500.00`, `Rs. 500/-`,
/// `1 180.50`, `(120.00)`. Returns `None` for anything that is not a number.
pub fn parse_amount(s: &str) -> Option<f64> {
    let cleaned: String = rewrite_currency(s).into_owned();
    let cleaned = RE_CURRENCY_WORD.replace_all(&cleaned, "");
    let mut t: String = cleaned
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '$')
        .collect();
    if let Some(stripped) = t.strip_suffix("/-") {
        t = stripped.to_string();
    }
    let negative = t.starts_with('(') && t.ends_with(')');
    if negative {
        t = t[1..t.len() - 1].to_string();
    }
    let n: f64 = t.parse().ok()?;
    if !n.is_finite() {
        return None;
    }
    Some(if negative { -n } else { n })
}

/// JSON number for an amount, integral values kept as integers.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or_else(|| Value::from(0))
    }
}

/// Round to cents so float sums compare and print cleanly.
pub fn round_cents(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

// ── Dates ────────────────────────────────────────────────────────────────

/// Layouts seen on invoices; day-first where ambiguous.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%d %b %Y",
    "%d %B %Y",
    "%d-%b-%Y",
    "%d-%B-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d/%m/%y",
    "%d-%m-%y",
    "%d-%b-%y",
];

/// Parse a date in any known layout. Years before 1900 are rejected so a
/// two-digit year never matches a four-digit pattern.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let t = s.trim().trim_end_matches('.');
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(t, fmt)
            .ok()
            .filter(|d| d.year() >= 1900)
    })
}

/// Best-effort ISO date; unrecognised input is returned unchanged.
pub fn normalize_date(s: &str) -> String {
    match parse_date(s) {
        Some(d) => d.format("%Y-%m-%d").to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rupee_rewritten() {
        let out = rewrite_currency("Total: \u{20b9}500");
        assert_eq!(out, "Total: Rs.500");
        assert!(!out.contains('\u{20b9}'));
    }

    #[test]
    fn other_glyphs_rewritten() {
        for glyph in ['\u{20ac}', '\u{00a3}', '\u{00a5}', '\u{20a9}', '\u{0e3f}', '\u{ffe5}'] {
            let s = format!("{glyph}12");
            let out = rewrite_currency(&s);
            assert_eq!(out, "Rs.12", "glyph U+{:04X}", glyph as u32);
        }
    }

    #[test]
    fn ascii_untouched_and_borrowed() {
        assert!(matches!(rewrite_currency("$5 for Rs. 10"), Cow::Borrowed(_)));
    }

    #[test]
    fn rewrite_strings_walks_tree() {
        let v = json!({"a": ["\u{20b9}1", {"b": "\u{20ac}2"}], "n": 3});
        let out = rewrite_strings(v);
        assert_eq!(out, json!({"a": ["Rs.1", {"b": "Rs.2"}], "n": 3}));
    }

    #[test]
    fn amounts_parse() {
        assert_eq!(parse_amount("\u{20b9}2,500.00"), Some(2500.0));
        assert_eq!(parse_amount("Rs. 500/-"), Some(500.0));
        assert_eq!(parse_amount("INR 1 180.50"), Some(1180.5));
        assert_eq!(parse_amount("(120.00)"), Some(-120.0));
        assert_eq!(parse_amount("18"), Some(18.0));
        assert_eq!(parse_amount("twelve"), None);
        assert_eq!(parse_amount("N/A"), None);
        assert_eq!(parse_amount("inf"), None);
    }

    #[test]
    fn number_value_keeps_integers() {
        assert_eq!(number_value(500.0), json!(500));
        assert_eq!(number_value(230.5), json!(230.5));
        assert_eq!(number_value(f64::NAN), json!(0));
    }

    #[test]
    fn missing_markers() {
        assert!(is_missing_marker(""));
        assert!(is_missing_marker(" N/A "));
        assert!(is_missing_marker("null"));
        assert!(!is_missing_marker("0"));
        assert!(!is_missing_marker("NAGPUR"));
    }

    #[test]
    fn dates_normalised() {
        assert_eq!(normalize_date("2023-05-21"), "2023-05-21");
        assert_eq!(normalize_date("21/05/2023"), "2023-05-21");
        assert_eq!(normalize_date("21.05.2023"), "2023-05-21");
        assert_eq!(normalize_date("21 May 2023"), "2023-05-21");
        assert_eq!(normalize_date("May 21, 2023"), "2023-05-21");
        assert_eq!(normalize_date("21-May-23"), "2023-05-21");
        assert_eq!(normalize_date("sometime in May"), "sometime in May");
    }
}
