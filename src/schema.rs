//! Schema contracts sent to the inference capability.
//!
//! A schema contract is two things kept side by side so they cannot drift:
//!
//! 1. **Instruction text**: the target JSON shape plus the formatting,
//!    currency, missing-field, merge and output-discipline rules, sent with
//!    every inference request.
//! 2. **Field shapes**: the same shape as data, used by
//!    [`crate::pipeline::normalize`] to fill sentinels and coerce types on the
//!    way back. The model is never trusted to have followed the text.
//!
//! The three families are a closed set chosen once per deployment through
//! [`crate::config::ExtractionConfig::schema`]; nothing is inferred at runtime.
//! The flat and nested families encode numbers as numbers and use `N/A` for
//! missing fields. The confidence-annotated family wraps every leaf in
//! `{"value", "conf"}`, encodes *all* values as strings and uses `""`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for missing fields in the flat and nested families.
pub const NOT_AVAILABLE: &str = "N/A";

/// Token that replaces every non-ASCII currency glyph.
pub const CURRENCY_TOKEN: &str = "Rs.";

/// System message sent ahead of the content on every request.
pub const SYSTEM_PROMPT: &str = "You are an assistant that ONLY replies with valid JSON matching the \
specified schema, with no extra text, explanations or markdown fences.";

// ── Field shapes ─────────────────────────────────────────────────────────

/// Shape of one schema-declared value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Free text.
    Text,
    /// A calendar date, emitted as `YYYY-MM-DD`.
    Date,
    /// A numeric amount or quantity.
    Number,
    /// A nested object with its own declared fields.
    Record(&'static [Field]),
    /// An ordered list of objects with the given fields.
    List(&'static [Field]),
    /// Free-form content passed through untouched apart from currency rewriting.
    Any,
}

/// A named, schema-declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub shape: Shape,
}

impl Field {
    const fn text(name: &'static str) -> Self {
        Self { name, shape: Shape::Text }
    }
    const fn date(name: &'static str) -> Self {
        Self { name, shape: Shape::Date }
    }
    const fn number(name: &'static str) -> Self {
        Self { name, shape: Shape::Number }
    }
    const fn record(name: &'static str, fields: &'static [Field]) -> Self {
        Self { name, shape: Shape::Record(fields) }
    }
    const fn list(name: &'static str, fields: &'static [Field]) -> Self {
        Self { name, shape: Shape::List(fields) }
    }
    const fn any(name: &'static str) -> Self {
        Self { name, shape: Shape::Any }
    }
}

const LINE_ITEM: &[Field] = &[
    Field::text("name"),
    Field::number("quantity"),
    Field::number("unit_price"),
    Field::number("total_price"),
];

const FLAT_FIELDS: &[Field] = &[
    Field::date("invoice_date"),
    Field::text("invoice_number"),
    Field::text("purchase_order_number"),
    Field::date("purchase_date"),
    Field::text("purchaser_address"),
    Field::text("currency"),
    Field::list("items", LINE_ITEM),
    Field::text("pan_id"),
    Field::text("gst_number"),
    Field::number("total_amount_with_gst"),
];

const INVOICE_DETAILS: &[Field] = &[
    Field::text("invoice_number"),
    Field::date("invoice_date"),
    Field::text("purchase_order_number"),
    Field::date("purchase_date"),
];

const TAX_DETAILS: &[Field] = &[Field::text("pan_id"), Field::text("gst_number")];

const DETAILS: &[Field] = &[
    Field::record("invoice_details", INVOICE_DETAILS),
    Field::record("tax_details", TAX_DETAILS),
    Field::text("purchaser_address"),
];

const PURCHASE_DETAILS: &[Field] = &[
    Field::text("currency"),
    Field::list("items", LINE_ITEM),
    Field::number("total_amount_with_gst"),
];

const NESTED_FIELDS: &[Field] = &[
    Field::record("Details", DETAILS),
    Field::record("purchase_details", PURCHASE_DETAILS),
];

const SCORED_LINE_ITEM: &[Field] = &[
    Field::text("item_description"),
    Field::text("hsn_sac_code"),
    Field::text("unit_of_measurement"),
    Field::number("quantity"),
    Field::number("base_amount"),
    Field::number("total_amount"),
];

const SCORED_TAX: &[Field] = &[
    Field::text("category"),
    Field::number("rate"),
    Field::number("amount"),
];

const SCORED_FIELDS: &[Field] = &[
    Field::text("IRN"),
    Field::text("invoice_number"),
    Field::date("invoice_date"),
    Field::text("invoice_header"),
    Field::text("po_number"),
    Field::date("po_date"),
    Field::text("vendor_name"),
    Field::text("vendor_address"),
    Field::text("vendor_gst"),
    Field::text("vendor_pan"),
    Field::text("bill_to_name"),
    Field::text("billing_address"),
    Field::text("billing_gst"),
    Field::text("billing_pan"),
    Field::text("ship_to_address"),
    Field::number("total_invoice_amount"),
    Field::list("line_items", SCORED_LINE_ITEM),
    Field::list("taxes", SCORED_TAX),
    Field::any("additional_data"),
];

// ── Record layout ────────────────────────────────────────────────────────

/// Where the identity, line-item and total fields live in a schema family.
///
/// Paths are object keys from the record root. Leaves may be scored
/// (`{"value", "conf"}`) in the confidence-annotated family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub purchaser_address: &'static [&'static str],
    /// Tax identity fields (PAN, GST); compared as a tuple.
    pub tax_ids: &'static [&'static [&'static str]],
    pub invoice_number: &'static [&'static str],
    pub items: &'static [&'static str],
    pub item_name: &'static str,
    pub item_quantity: &'static str,
    pub item_unit_price: Option<&'static str>,
    pub item_total: &'static str,
    pub total: &'static [&'static str],
}

const FLAT_LAYOUT: RecordLayout = RecordLayout {
    purchaser_address: &["purchaser_address"],
    tax_ids: &[&["pan_id"], &["gst_number"]],
    invoice_number: &["invoice_number"],
    items: &["items"],
    item_name: "name",
    item_quantity: "quantity",
    item_unit_price: Some("unit_price"),
    item_total: "total_price",
    total: &["total_amount_with_gst"],
};

const NESTED_LAYOUT: RecordLayout = RecordLayout {
    purchaser_address: &["Details", "purchaser_address"],
    tax_ids: &[
        &["Details", "tax_details", "pan_id"],
        &["Details", "tax_details", "gst_number"],
    ],
    invoice_number: &["Details", "invoice_details", "invoice_number"],
    items: &["purchase_details", "items"],
    item_name: "name",
    item_quantity: "quantity",
    item_unit_price: Some("unit_price"),
    item_total: "total_price",
    total: &["purchase_details", "total_amount_with_gst"],
};

const SCORED_LAYOUT: RecordLayout = RecordLayout {
    purchaser_address: &["billing_address"],
    tax_ids: &[&["billing_pan"], &["billing_gst"]],
    invoice_number: &["invoice_number"],
    items: &["line_items"],
    item_name: "item_description",
    item_quantity: "quantity",
    item_unit_price: None,
    item_total: "total_amount",
    total: &["total_invoice_amount"],
};

// ── Contract text ────────────────────────────────────────────────────────

const FLAT_SHAPE: &str = r#"{
  "invoice_date": "YYYY-MM-DD",
  "invoice_number": "string",
  "purchase_order_number": "string",
  "purchase_date": "YYYY-MM-DD",
  "purchaser_address": "string",
  "currency": "string",
  "items": [
    {"name": "string", "quantity": 0, "unit_price": 0.0, "total_price": 0.0}
  ],
  "pan_id": "string",
  "gst_number": "string",
  "total_amount_with_gst": 0.0
}"#;

const NESTED_SHAPE: &str = r#"{
  "Details": {
    "invoice_details": {
      "invoice_number": "string",
      "invoice_date": "YYYY-MM-DD",
      "purchase_order_number": "string",
      "purchase_date": "YYYY-MM-DD"
    },
    "tax_details": {"pan_id": "string", "gst_number": "string"},
    "purchaser_address": "string"
  },
  "purchase_details": {
    "currency": "string",
    "items": [
      {"name": "string", "quantity": 0, "unit_price": 0.0, "total_price": 0.0}
    ],
    "total_amount_with_gst": 0.0
  }
}"#;

const SCORED_SHAPE: &str = r#"{
  "IRN": {"value": "string", "conf": 0.0},
  "invoice_number": {"value": "string", "conf": 0.0},
  "invoice_date": {"value": "YYYY-MM-DD", "conf": 0.0},
  "invoice_header": {"value": "string", "conf": 0.0},
  "po_number": {"value": "string", "conf": 0.0},
  "po_date": {"value": "YYYY-MM-DD", "conf": 0.0},
  "vendor_name": {"value": "string", "conf": 0.0},
  "vendor_address": {"value": "string", "conf": 0.0},
  "vendor_gst": {"value": "string", "conf": 0.0},
  "vendor_pan": {"value": "string", "conf": 0.0},
  "bill_to_name": {"value": "string", "conf": 0.0},
  "billing_address": {"value": "string", "conf": 0.0},
  "billing_gst": {"value": "string", "conf": 0.0},
  "billing_pan": {"value": "string", "conf": 0.0},
  "ship_to_address": {"value": "string", "conf": 0.0},
  "total_invoice_amount": {"value": "string", "conf": 0.0},
  "line_items": [
    {
      "item_description": {"value": "string", "conf": 0.0},
      "hsn_sac_code": {"value": "string", "conf": 0.0},
      "unit_of_measurement": {"value": "string", "conf": 0.0},
      "quantity": {"value": "string", "conf": 0.0},
      "base_amount": {"value": "string", "conf": 0.0},
      "total_amount": {"value": "string", "conf": 0.0}
    }
  ],
  "taxes": [
    {"category": {"value": "IGST", "conf": 1.0}, "rate": {"value": "string", "conf": 0.0}, "amount": {"value": "string", "conf": 0.0}},
    {"category": {"value": "CGST", "conf": 1.0}, "rate": {"value": "string", "conf": 0.0}, "amount": {"value": "string", "conf": 0.0}},
    {"category": {"value": "SGST", "conf": 1.0}, "rate": {"value": "string", "conf": 0.0}, "amount": {"value": "string", "conf": 0.0}}
  ],
  "additional_data": []
}"#;

const NUMERIC_RULES: &str = "\
2. Dates MUST be in YYYY-MM-DD format.
3. quantity, unit_price, total_price and total_amount_with_gst MUST be numeric literals, never strings. \
For example \"quantity\": 2 and \"unit_price\": 100.00. If a value is 0, include it with the value 0.
4. Replace any currency symbol such as '\u{20b9}' with 'Rs.' throughout. State the currency separately \
in the \"currency\" field.
5. If any field is missing or empty, set its value to \"N/A\". Never omit a field and never use null.";

const SCORED_RULES: &str = "\
2. Dates MUST be in YYYY-MM-DD format. For missing dates use an empty string, not 0000-00-00.
3. ALL values MUST be strings, including numbers, amounts, rates and quantities ('18.00' not 18).
4. Currency amounts are strings without symbols ('2500.00' not '\u{20b9}2,500'). Replace any other \
currency symbol in text with 'Rs.'.
5. If any field is missing or empty, use an empty string (\"\"), never null and never N/A.
6. Every value carries a confidence score \"conf\" between 0 and 1. Scores are not binary; the 0.0 \
shown above is only a placeholder to be replaced.
7. Keep the tax categories exactly as given (IGST, CGST, SGST).
8. additional_data is a list of {\"heading\": \"value\"} objects holding only other important invoice facts.
9. Some text may be handwritten, possibly in the middle of typed text. Read everything before answering \
and take care not to confuse letters with digits.";

const MERGE_RULE: &str = "If the invoice spans multiple pages, or the document holds several invoices that \
share the same purchaser address and the same identity (PAN and GST number, or invoice number), merge them \
into a single invoice: concatenate their line items and set the total to the sum of the merged item totals. \
Sum the item totals to verify that they match the declared total.";

const OUTPUT_RULE: &str = "Output ONLY the single JSON object. No prose, no explanations, no markdown fences, \
no backslash escapes beyond what JSON requires.";

// ── Schema family ────────────────────────────────────────────────────────

/// The closed set of schema families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    /// Flat invoice: header fields, items, total. Numbers as numbers, `N/A` sentinel.
    #[default]
    Flat,
    /// Invoice detail blocks nested under `Details` and `purchase_details`.
    Nested,
    /// Every leaf is `{"value": string, "conf": 0..1}`; `""` sentinel.
    ConfidenceAnnotated,
}

impl SchemaKind {
    pub const ALL: [SchemaKind; 3] = [
        SchemaKind::Flat,
        SchemaKind::Nested,
        SchemaKind::ConfidenceAnnotated,
    ];

    /// Stable contract identifier, recorded on every extracted record.
    pub fn version(self) -> &'static str {
        match self {
            SchemaKind::Flat => "flat-invoice/v1",
            SchemaKind::Nested => "nested-invoice/v1",
            SchemaKind::ConfidenceAnnotated => "confidence-invoice/v1",
        }
    }

    /// Top-level declared fields.
    pub fn fields(self) -> &'static [Field] {
        match self {
            SchemaKind::Flat => FLAT_FIELDS,
            SchemaKind::Nested => NESTED_FIELDS,
            SchemaKind::ConfidenceAnnotated => SCORED_FIELDS,
        }
    }

    /// Placeholder for a missing text, date or number field.
    pub fn sentinel(self) -> &'static str {
        match self {
            SchemaKind::Flat | SchemaKind::Nested => NOT_AVAILABLE,
            SchemaKind::ConfidenceAnnotated => "",
        }
    }

    /// Whether a dotted path (`Details.tax_details.pan_id`) names a declared
    /// field. Paths into list items or free-form content are not checked
    /// below that point.
    pub fn declares(self, path: &str) -> bool {
        let mut fields = self.fields();
        for seg in path.split('.') {
            let Some(field) = fields.iter().find(|f| f.name == seg) else {
                return false;
            };
            match field.shape {
                Shape::Record(inner) => fields = inner,
                _ => return true,
            }
        }
        true
    }

    /// Leaves are `{"value", "conf"}` pairs with string values.
    pub fn is_scored(self) -> bool {
        matches!(self, SchemaKind::ConfidenceAnnotated)
    }

    pub fn layout(self) -> &'static RecordLayout {
        match self {
            SchemaKind::Flat => &FLAT_LAYOUT,
            SchemaKind::Nested => &NESTED_LAYOUT,
            SchemaKind::ConfidenceAnnotated => &SCORED_LAYOUT,
        }
    }

    fn shape_text(self) -> &'static str {
        match self {
            SchemaKind::Flat => FLAT_SHAPE,
            SchemaKind::Nested => NESTED_SHAPE,
            SchemaKind::ConfidenceAnnotated => SCORED_SHAPE,
        }
    }

    /// The full instruction text sent alongside the document content.
    pub fn instructions(self) -> String {
        let rules = if self.is_scored() { SCORED_RULES } else { NUMERIC_RULES };
        format!(
            "Extract the invoice data from the document above and return it in exactly this JSON \
structure, with all fields present:\n\n{shape}\n\nSTRICT FORMATTING RULES:\n\
1. Maintain the exact JSON structure shown; do not rename or drop keys.\n\
{rules}\n\n{MERGE_RULE}\n\n{OUTPUT_RULE}",
            shape = self.shape_text(),
        )
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchemaKind::Flat => "flat",
            SchemaKind::Nested => "nested",
            SchemaKind::ConfidenceAnnotated => "confidence_annotated",
        })
    }
}

impl std::str::FromStr for SchemaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(SchemaKind::Flat),
            "nested" => Ok(SchemaKind::Nested),
            "confidence" | "confidence_annotated" | "scored" => Ok(SchemaKind::ConfidenceAnnotated),
            other => Err(format!(
                "unknown schema '{other}' (expected flat, nested or confidence)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(fields: &'a [Field], name: &str) -> Option<&'a Field> {
        fields.iter().find(|f| f.name == name)
    }

    /// Every key printed in the shape text must be a declared field, so the
    /// normaliser fills exactly what the model was asked for.
    #[test]
    fn shape_text_matches_declared_fields() {
        for kind in SchemaKind::ALL {
            let shape: serde_json::Value =
                serde_json::from_str(kind.shape_text()).expect("shape text is JSON");
            let obj = shape.as_object().unwrap();
            assert_eq!(obj.len(), kind.fields().len(), "{kind}");
            for key in obj.keys() {
                assert!(find(kind.fields(), key).is_some(), "{kind}: {key} undeclared");
            }
        }
    }

    #[test]
    fn sentinels_differ_between_families() {
        assert_eq!(SchemaKind::Flat.sentinel(), "N/A");
        assert_eq!(SchemaKind::Nested.sentinel(), "N/A");
        assert_eq!(SchemaKind::ConfidenceAnnotated.sentinel(), "");
    }

    #[test]
    fn numeric_instructions_per_family() {
        let flat = SchemaKind::Flat.instructions();
        assert!(flat.contains("numeric literals"));
        assert!(flat.contains("\"N/A\""));
        assert!(flat.contains("'Rs.'"));
        assert!(flat.contains("merge them"));

        let scored = SchemaKind::ConfidenceAnnotated.instructions();
        assert!(scored.contains("ALL values MUST be strings"));
        assert!(scored.contains("empty string"));
        assert!(!scored.contains("numeric literals"));
    }

    #[test]
    fn layout_paths_resolve_to_declared_fields() {
        for kind in SchemaKind::ALL {
            let layout = kind.layout();
            let mut fields = kind.fields();
            for (i, key) in layout.items.iter().enumerate() {
                let field = find(fields, key).unwrap_or_else(|| panic!("{kind}: {key}"));
                match field.shape {
                    Shape::Record(inner) => fields = inner,
                    Shape::List(item) if i + 1 == layout.items.len() => {
                        assert!(find(item, layout.item_total).is_some());
                        assert!(find(item, layout.item_name).is_some());
                    }
                    other => panic!("{kind}: unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn declared_paths() {
        assert!(SchemaKind::Flat.declares("invoice_number"));
        assert!(SchemaKind::Flat.declares("items"));
        assert!(!SchemaKind::Flat.declares("Invoice_number"));
        assert!(!SchemaKind::Flat.declares("Items"));
        assert!(SchemaKind::Nested.declares("purchase_details.items"));
        assert!(SchemaKind::Nested.declares("Details.tax_details.pan_id"));
        assert!(!SchemaKind::Nested.declares("Details.tax_details.pan"));
        assert!(SchemaKind::ConfidenceAnnotated.declares("line_items"));
    }

    #[test]
    fn parse_schema_names() {
        assert_eq!("flat".parse::<SchemaKind>().unwrap(), SchemaKind::Flat);
        assert_eq!("Nested".parse::<SchemaKind>().unwrap(), SchemaKind::Nested);
        assert_eq!(
            "confidence".parse::<SchemaKind>().unwrap(),
            SchemaKind::ConfidenceAnnotated
        );
        assert!("xml".parse::<SchemaKind>().is_err());
    }
}
