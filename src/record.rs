//! The normalised, persisted invoice record.

use crate::schema::{RecordLayout, SchemaKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys the record owns; stripped from model output so they cannot be forged.
pub const RESERVED_KEYS: &[&str] = &["filename", "schema", "annotations", "_id"];

/// A normalised invoice, keyed by the filename of the document it came from.
///
/// `fields` holds the schema-shaped body (every declared field present,
/// sentinels for missing values). It is flattened into the persisted JSON
/// document next to `filename`, so the stored layout is one object per
/// invoice with `filename` as its identity field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub filename: String,
    #[serde(default)]
    pub schema: SchemaKind,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<RecordAnnotation>,
}

/// Non-fatal findings attached to a record. None of them block persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordAnnotation {
    /// `sum(item totals)` disagrees with the declared total.
    AmountMismatch { items_total: f64, declared_total: f64 },
    /// The completion held several invoices with different identities; only
    /// the first was kept.
    MultipleInvoices { kept: usize, dropped: usize },
}

/// One line item read out of a record, whatever the schema family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
}

impl InvoiceRecord {
    pub fn new(filename: impl Into<String>, schema: SchemaKind, fields: Map<String, Value>) -> Self {
        Self {
            filename: filename.into(),
            schema,
            fields,
            annotations: Vec::new(),
        }
    }

    /// Value at a path of object keys.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        get_path(&self.fields, path)
    }

    /// Text of a leaf, unwrapping `{"value", "conf"}` pairs.
    pub fn text(&self, path: &[&str]) -> Option<String> {
        self.get_path(path).and_then(leaf_text)
    }

    pub fn invoice_number(&self) -> Option<String> {
        self.text(self.schema.layout().invoice_number)
    }

    pub fn purchaser_address(&self) -> Option<String> {
        self.text(self.schema.layout().purchaser_address)
    }

    /// Declared total, `None` when it is the sentinel or not numeric.
    pub fn total_amount(&self) -> Option<f64> {
        self.get_path(self.schema.layout().total).and_then(leaf_number)
    }

    /// Line items in document order.
    pub fn line_items(&self) -> Vec<LineItem> {
        let layout = self.schema.layout();
        items_of(&self.fields, layout)
            .iter()
            .filter_map(Value::as_object)
            .map(|item| LineItem {
                name: item.get(layout.item_name).and_then(leaf_text).unwrap_or_default(),
                quantity: item.get(layout.item_quantity).and_then(leaf_number),
                unit_price: layout
                    .item_unit_price
                    .and_then(|k| item.get(k))
                    .and_then(leaf_number),
                total_price: item.get(layout.item_total).and_then(leaf_number),
            })
            .collect()
    }

    /// Sum of line-item totals; non-numeric totals count as zero.
    pub fn items_total(&self) -> f64 {
        self.line_items()
            .iter()
            .filter_map(|i| i.total_price)
            .sum()
    }

    pub fn has_amount_mismatch(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| matches!(a, RecordAnnotation::AmountMismatch { .. }))
    }
}

// ── Leaf helpers shared with the normaliser and merge pass ───────────────

pub(crate) fn get_path<'a>(fields: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = fields.get(*first)?;
    for key in rest {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

pub(crate) fn get_path_mut<'a>(
    fields: &'a mut Map<String, Value>,
    path: &[&str],
) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let mut current = fields.get_mut(*first)?;
    for key in rest {
        current = current.as_object_mut()?.get_mut(*key)?;
    }
    Some(current)
}

/// Items array under the layout's item path (empty if absent).
pub(crate) fn items_of<'a>(fields: &'a Map<String, Value>, layout: &RecordLayout) -> &'a [Value] {
    get_path(fields, layout.items)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Unwrap a scored leaf to its inner value.
pub(crate) fn leaf_value(v: &Value) -> &Value {
    match v {
        Value::Object(o) if o.contains_key("value") => &o["value"],
        other => other,
    }
}

pub(crate) fn leaf_text(v: &Value) -> Option<String> {
    match leaf_value(v) {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn leaf_number(v: &Value) -> Option<f64> {
    match leaf_value(v) {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => crate::pipeline::coerce::parse_amount(s),
        _ => None,
    }
}
