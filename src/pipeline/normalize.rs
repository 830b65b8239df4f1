//! Response normaliser: raw completion → [`InvoiceRecord`].
//!
//! The completion is untrusted. This module is where it gets checked against
//! the schema contract and repaired.
//!
//! ## Stages
//!
//! 1. **Recover** the JSON value. Outer markdown fences, surrounding prose
//!    and a double-encoded string are tolerated; if nothing parses the
//!    document fails with [`DocumentError::MalformedResponse`]. This is the
//!    only hard failure.
//! 2. **Conform** every invoice grouping to the declared field shapes:
//!    missing fields get the schema sentinel, numbers are coerced, dates are
//!    rewritten to `YYYY-MM-DD` and currency glyphs become `Rs.`.
//! 3. **Merge** groupings that share identity (see [`super::merge`]).
//! 4. **Cross-check** `sum(item totals)` against the declared total and
//!    annotate a mismatch.
//!
//! Normalising the JSON of an already normalised record yields the same
//! record, so stored documents can be re-validated at any time. Amount
//! mismatches are recomputed; a `multiple_invoices` annotation cannot be,
//! since the dropped groupings are gone, so it is carried over.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::coerce::{
    is_missing_marker, normalize_date, number_value, parse_amount, rewrite_currency,
    rewrite_strings, round_cents,
};
use super::merge::merge_invoices;
use crate::error::DocumentError;
use crate::record::{InvoiceRecord, RecordAnnotation, RESERVED_KEYS};
use crate::schema::{Field, SchemaKind, Shape};

/// Parse, conform, merge and cross-check one completion.
///
/// `amount_tolerance` is the largest difference between the item sum and
/// the declared total that still counts as equal.
pub fn normalize(
    raw: &str,
    schema: SchemaKind,
    filename: &str,
    amount_tolerance: f64,
) -> Result<InvoiceRecord, DocumentError> {
    let value = recover_json(raw).map_err(|detail| DocumentError::MalformedResponse {
        filename: filename.to_string(),
        detail,
    })?;
    normalize_value(value, schema, filename, amount_tolerance)
}

/// [`normalize`] for an already parsed value.
pub fn normalize_value(
    value: Value,
    schema: SchemaKind,
    filename: &str,
    amount_tolerance: f64,
) -> Result<InvoiceRecord, DocumentError> {
    let malformed = |detail: &str| DocumentError::MalformedResponse {
        filename: filename.to_string(),
        detail: detail.to_string(),
    };

    let groups: Vec<Map<String, Value>> = match value {
        Value::Object(obj) => vec![obj],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(obj) => Some(obj),
                _ => None,
            })
            .collect(),
        _ => return Err(malformed("expected a JSON object")),
    };
    if groups.is_empty() {
        return Err(malformed("expected a JSON object, got an array without objects"));
    }

    let carried = carried_multiple_invoices(&groups);

    let conformed: Vec<Map<String, Value>> = groups
        .into_iter()
        .map(|mut g| {
            for key in RESERVED_KEYS {
                g.remove(*key);
            }
            conform_fields(g, schema.fields(), schema)
        })
        .collect();

    let outcome = merge_invoices(conformed, schema)
        .ok_or_else(|| malformed("no invoice grouping in completion"))?;

    let mut record = InvoiceRecord::new(filename, schema, outcome.fields);
    if outcome.dropped > 0 {
        record.annotations.push(RecordAnnotation::MultipleInvoices {
            kept: outcome.merged,
            dropped: outcome.dropped,
        });
    } else if let Some(previous) = carried {
        record.annotations.push(previous);
    }
    cross_check(&mut record, amount_tolerance);

    debug!(
        "{}: normalised {} line items ({} groupings merged)",
        filename,
        record.line_items().len(),
        outcome.merged
    );
    Ok(record)
}

/// A `multiple_invoices` annotation already present on the input, if any.
fn carried_multiple_invoices(groups: &[Map<String, Value>]) -> Option<RecordAnnotation> {
    groups
        .iter()
        .filter_map(|g| g.get("annotations").and_then(Value::as_array))
        .flatten()
        .filter_map(|a| serde_json::from_value::<RecordAnnotation>(a.clone()).ok())
        .find(|a| matches!(a, RecordAnnotation::MultipleInvoices { .. }))
}

// ── Stage 1: Recover JSON ────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n?(.*?)\n?```").unwrap());

/// Recover a JSON value from a completion that may be fenced or wrapped in prose.
pub fn recover_json(raw: &str) -> Result<Value, String> {
    let text = raw.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}' || c == '\u{200b}');
    if text.is_empty() {
        return Err("empty completion".to_string());
    }

    let first_err = match serde_json::from_str::<Value>(text) {
        Ok(v) => return Ok(unwrap_encoded(v)),
        Err(e) => e.to_string(),
    };

    if let Some(caps) = RE_FENCED.captures(text) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            warn!("Completion was wrapped in markdown fences");
            return Ok(unwrap_encoded(v));
        }
    }

    if let Some(span) = json_span(text) {
        if let Ok(v) = serde_json::from_str::<Value>(span) {
            warn!("Completion carried text around the JSON value");
            return Ok(unwrap_encoded(v));
        }
    }

    Err(first_err)
}

/// Slice from the first `{`/`[` to the last matching closer.
fn json_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

/// A completion that is a JSON string holding JSON is decoded once more.
fn unwrap_encoded(v: Value) -> Value {
    if let Value::String(s) = &v {
        if let Ok(inner @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str(s.trim()) {
            return inner;
        }
    }
    v
}

// ── Stage 2: Conform to declared shapes ──────────────────────────────────

/// Conform an object to `fields`. Declared fields come first in declaration
/// order; undeclared keys are kept after them with currency rewritten.
fn conform_fields(
    mut obj: Map<String, Value>,
    fields: &[Field],
    schema: SchemaKind,
) -> Map<String, Value> {
    let mut out = Map::new();
    for field in fields {
        let value = obj.remove(field.name);
        out.insert(field.name.to_string(), conform(value, field, schema));
    }
    for (key, value) in obj {
        out.insert(key, rewrite_strings(value));
    }
    out
}

fn conform(value: Option<Value>, field: &Field, schema: SchemaKind) -> Value {
    let value = value.filter(|v| !v.is_null());
    match field.shape {
        Shape::Record(inner) => match value {
            Some(Value::Object(obj)) => Value::Object(conform_fields(obj, inner, schema)),
            other => {
                if other.is_some() {
                    warn!("Field '{}' is not an object; filling with sentinels", field.name);
                }
                Value::Object(conform_fields(Map::new(), inner, schema))
            }
        },
        Shape::List(item) => {
            let entries = match value {
                Some(Value::Array(entries)) => entries,
                Some(obj @ Value::Object(_)) => vec![obj],
                _ => Vec::new(),
            };
            Value::Array(
                entries
                    .into_iter()
                    .filter_map(|e| match e {
                        Value::Object(obj) => Some(Value::Object(conform_fields(obj, item, schema))),
                        _ => None,
                    })
                    .collect(),
            )
        }
        Shape::Any => value.map(rewrite_strings).unwrap_or(Value::Array(Vec::new())),
        leaf if schema.is_scored() => scored_leaf(value, leaf),
        leaf => plain_leaf(value, leaf, field.name, schema.sentinel()),
    }
}

/// Flat and nested families: numbers as numbers, `N/A` for missing.
fn plain_leaf(value: Option<Value>, shape: Shape, name: &str, sentinel: &str) -> Value {
    let value = match value {
        Some(Value::Object(mut obj)) if obj.contains_key("value") => obj.remove("value"),
        other => other,
    }
    .filter(|v| !v.is_null());

    let Some(value) = value else {
        return Value::String(sentinel.to_string());
    };

    match shape {
        Shape::Number => match value {
            Value::Number(_) => value,
            Value::String(s) if is_missing_marker(&s) => Value::String(sentinel.to_string()),
            Value::String(s) => match parse_amount(&s) {
                Some(n) => number_value(n),
                None => {
                    warn!("Field '{}': '{}' is not numeric, using 0", name, s);
                    Value::from(0)
                }
            },
            other => {
                warn!("Field '{}': {} is not numeric, using 0", name, other);
                Value::from(0)
            }
        },
        Shape::Date => match leaf_string(value) {
            Some(s) if !is_missing_marker(&s) => Value::String(normalize_date(&s)),
            _ => Value::String(sentinel.to_string()),
        },
        _ => match value {
            Value::String(s) if is_missing_marker(&s) => Value::String(sentinel.to_string()),
            Value::String(s) => Value::String(rewrite_currency(&s).into_owned()),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => rewrite_strings(other),
        },
    }
}

/// Confidence-annotated family: `{"value": string, "conf": 0..1}`, `""` for missing.
fn scored_leaf(value: Option<Value>, shape: Shape) -> Value {
    let (inner, conf) = match value {
        Some(Value::Object(mut obj)) => {
            let conf = obj.get("conf").and_then(conf_of).unwrap_or(0.0);
            (obj.remove("value"), conf)
        }
        other => (other, 0.0),
    };

    let text = inner
        .and_then(leaf_string)
        .filter(|s| !is_missing_marker(s))
        .map(|s| match shape {
            Shape::Date => normalize_date(&s),
            _ => rewrite_currency(s.trim()).into_owned(),
        })
        .unwrap_or_default();

    let mut out = Map::new();
    out.insert("value".into(), Value::String(text));
    out.insert("conf".into(), Value::from(conf));
    Value::Object(out)
}

fn conf_of(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    n.is_finite().then(|| n.clamp(0.0, 1.0))
}

fn leaf_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ── Stage 4: Cross-check ─────────────────────────────────────────────────

/// Annotate the record when its items do not add up to its declared total.
/// Skipped when the total is missing.
fn cross_check(record: &mut InvoiceRecord, tolerance: f64) {
    let Some(declared) = record.total_amount() else {
        return;
    };
    let items_total = round_cents(record.items_total());
    if (items_total - declared).abs() > tolerance + 1e-9 {
        warn!(
            "{}: line items sum to {:.2} but the declared total is {:.2}",
            record.filename, items_total, declared
        );
        record.annotations.push(RecordAnnotation::AmountMismatch {
            items_total,
            declared_total: declared,
        });
    }
}
