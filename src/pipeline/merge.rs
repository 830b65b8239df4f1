//! Merge pass: fold invoice groupings that belong to the same logical invoice.
//!
//! The schema contract asks the model to merge multi-page and multi-invoice
//! documents itself. That instruction is unverifiable, so the normaliser runs
//! this pass on whatever the model returned: groupings with the same
//! purchaser address and the same identity are folded into one, their line
//! items concatenated in document order and the total recomputed from the
//! merged items.
//!
//! Two groupings are the same invoice when their purchaser addresses match
//! and either their tax pairs (PAN, GST number) match or their invoice
//! numbers match. Missing values never match. Matching is transitive: a
//! grouping that matches two earlier invoices joins them into one.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::coerce::{number_value, round_cents};
use crate::record::{get_path, get_path_mut, leaf_number, leaf_text};
use crate::schema::{RecordLayout, SchemaKind};

/// Result of merging the groupings found in one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The logical invoice kept as the record body.
    pub fields: Map<String, Value>,
    /// How many groupings were folded into `fields`.
    pub merged: usize,
    /// Groupings with a different identity, not part of `fields`.
    pub dropped: usize,
}

/// Comparison keys of one grouping. Empty strings stand for missing values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupKey {
    address: String,
    tax: Vec<String>,
    number: String,
}

impl GroupKey {
    fn same_invoice(&self, other: &GroupKey) -> bool {
        if self.address != other.address {
            return false;
        }
        let tax_match = self.tax.iter().any(|t| !t.is_empty()) && self.tax == other.tax;
        let number_match = !self.number.is_empty() && self.number == other.number;
        tax_match || number_match
    }
}

/// Merge already-conformed groupings. Returns `None` for an empty input.
///
/// A single grouping is returned untouched; its total is never recomputed.
pub fn merge_invoices(groups: Vec<Map<String, Value>>, schema: SchemaKind) -> Option<MergeOutcome> {
    let layout = schema.layout();
    let sentinel = schema.sentinel();

    let keyed: Vec<(GroupKey, Map<String, Value>)> = groups
        .into_iter()
        .map(|g| (group_key(&g, layout, sentinel), g))
        .collect();
    let keys: Vec<&GroupKey> = keyed.iter().map(|(k, _)| k).collect();
    let buckets = bucket_indices(&keys);

    let dropped = buckets.len().saturating_sub(1);
    let first = buckets.into_iter().next()?;
    if dropped > 0 {
        warn!(
            "Completion holds {} invoices with different identities; keeping the first",
            dropped + 1
        );
    }

    let merged = first.len();
    let mut members = keyed
        .into_iter()
        .enumerate()
        .filter(|(i, _)| first.contains(i))
        .map(|(_, (_, g))| g);
    let mut fields = members.next()?;
    if merged > 1 {
        for other in members {
            absorb(&mut fields, other, layout, sentinel);
        }
        recompute_total(&mut fields, schema);
        debug!("Merged {} invoice groupings into one record", merged);
    }

    Some(MergeOutcome {
        fields,
        merged,
        dropped,
    })
}

/// Partition grouping indices into invoices, in order of first appearance.
/// Each bucket's indices are ascending, so members keep document order.
fn bucket_indices(keys: &[&GroupKey]) -> Vec<Vec<usize>> {
    let mut buckets: Vec<Vec<usize>> = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let hits: Vec<usize> = buckets
            .iter()
            .enumerate()
            .filter(|(_, members)| members.iter().any(|&m| keys[m].same_invoice(key)))
            .map(|(b, _)| b)
            .collect();

        match hits.split_first() {
            None => buckets.push(vec![i]),
            Some((&target, rest)) => {
                // Later buckets fold into the earliest; remove back to front.
                for &b in rest.iter().rev() {
                    let joined = buckets.remove(b);
                    buckets[target].extend(joined);
                }
                buckets[target].push(i);
                buckets[target].sort_unstable();
            }
        }
    }
    buckets
}

fn group_key(fields: &Map<String, Value>, layout: &RecordLayout, sentinel: &str) -> GroupKey {
    let text = |path: &[&str]| -> String {
        get_path(fields, path)
            .and_then(leaf_text)
            .filter(|s| s != sentinel)
            .map(|s| normalise_key(&s))
            .unwrap_or_default()
    };

    GroupKey {
        address: text(layout.purchaser_address),
        tax: layout.tax_ids.iter().map(|p| text(p)).collect(),
        number: text(layout.invoice_number),
    }
}

/// Case- and whitespace-insensitive comparison key.
fn normalise_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Append `other`'s items to `into` and fill header fields `into` lacks.
fn absorb(
    into: &mut Map<String, Value>,
    mut other: Map<String, Value>,
    layout: &RecordLayout,
    sentinel: &str,
) {
    let extra_items = get_path_mut(&mut other, layout.items)
        .and_then(Value::as_array_mut)
        .map(std::mem::take)
        .unwrap_or_default();

    if let Some(items) = get_path_mut(into, layout.items).and_then(Value::as_array_mut) {
        items.extend(extra_items);
    }

    fill_missing(into, &other, sentinel);
}

/// Copy leaves from `from` wherever `into` holds the sentinel.
fn fill_missing(into: &mut Map<String, Value>, from: &Map<String, Value>, sentinel: &str) {
    for (key, src) in from {
        match into.get_mut(key) {
            Some(Value::Object(dst)) if !dst.contains_key("value") => {
                if let Value::Object(src) = src {
                    fill_missing(dst, src, sentinel);
                }
            }
            Some(dst) if is_sentinel_leaf(dst, sentinel) && !is_sentinel_leaf(src, sentinel) => {
                *dst = src.clone();
            }
            Some(_) => {}
            None => {
                into.insert(key.clone(), src.clone());
            }
        }
    }
}

fn is_sentinel_leaf(v: &Value, sentinel: &str) -> bool {
    match v {
        Value::Array(_) => false,
        Value::Object(o) if !o.contains_key("value") => false,
        other => leaf_text(other).is_none_or(|s| s == sentinel),
    }
}

/// Set the total to the sum of item totals.
fn recompute_total(fields: &mut Map<String, Value>, schema: SchemaKind) {
    let layout = schema.layout();
    let sum = round_cents(
        get_path(fields, layout.items)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get(layout.item_total))
                    .filter_map(leaf_number)
                    .sum()
            })
            .unwrap_or(0.0),
    );

    let Some(total) = get_path_mut(fields, layout.total) else {
        return;
    };
    if schema.is_scored() {
        let text = Value::String(format!("{sum:.2}"));
        match total {
            Value::Object(o) => {
                o.insert("value".into(), text);
            }
            other => *other = text,
        }
    } else {
        *total = number_value(sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn page(items: Value, total: f64, date: &str) -> Map<String, Value> {
        obj(json!({
            "invoice_number": "INV9",
            "invoice_date": date,
            "purchaser_address": "12 Park Street, Kolkata",
            "pan_id": "ABCDE1234F",
            "gst_number": "19ABCDE1234F1Z1",
            "items": items,
            "total_amount_with_gst": total
        }))
    }

    #[test]
    fn single_group_untouched() {
        let p = page(json!([{"name": "A", "total_price": 10}]), 99.0, "2024-01-02");
        let out = merge_invoices(vec![p.clone()], SchemaKind::Flat).unwrap();
        assert_eq!(out.fields, p, "total must not be recomputed");
        assert_eq!(out.merged, 1);
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn same_identity_pages_merge() {
        let p1 = page(json!([{"name": "A", "total_price": 100}]), 100.0, "2024-01-02");
        let p2 = page(json!([{"name": "B", "total_price": 50.5}]), 50.5, "N/A");
        let out = merge_invoices(vec![p1, p2], SchemaKind::Flat).unwrap();

        assert_eq!(out.merged, 2);
        let items = out.fields["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["name"], "A");
        assert_eq!(items[1]["name"], "B");
        assert_eq!(out.fields["total_amount_with_gst"], json!(150.5));
        assert_eq!(out.fields["invoice_date"], "2024-01-02");
    }

    #[test]
    fn sentinel_header_filled_from_later_page() {
        let p1 = page(json!([]), 0.0, "N/A");
        let p2 = page(json!([{"name": "B", "total_price": 5}]), 5.0, "2024-03-04");
        let out = merge_invoices(vec![p1, p2], SchemaKind::Flat).unwrap();
        assert_eq!(out.fields["invoice_date"], "2024-03-04");
        assert_eq!(out.fields["total_amount_with_gst"], json!(5));
    }

    #[test]
    fn address_compared_loosely() {
        let p1 = page(json!([{"name": "A", "total_price": 1}]), 1.0, "N/A");
        let mut p2 = page(json!([{"name": "B", "total_price": 2}]), 2.0, "N/A");
        p2.insert("purchaser_address".into(), json!("12  PARK street,   kolkata"));
        let out = merge_invoices(vec![p1, p2], SchemaKind::Flat).unwrap();
        assert_eq!(out.merged, 2);
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn different_identity_dropped() {
        let p1 = page(json!([{"name": "A", "total_price": 1}]), 1.0, "N/A");
        let mut p2 = page(json!([{"name": "B", "total_price": 2}]), 2.0, "N/A");
        p2.insert("gst_number".into(), json!("27ZZZZZ9999Z1Z9"));
        p2.insert("invoice_number".into(), json!("INV10"));
        let out = merge_invoices(vec![p1.clone(), p2], SchemaKind::Flat).unwrap();
        assert_eq!(out.fields, p1);
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn invoice_number_identity_when_no_tax_ids() {
        let mk = |n: &str| {
            obj(json!({
                "invoice_number": n,
                "purchaser_address": "X",
                "pan_id": "N/A",
                "gst_number": "N/A",
                "items": [{"name": n, "total_price": 1}],
                "total_amount_with_gst": 1
            }))
        };
        let out = merge_invoices(vec![mk("1"), mk("1"), mk("2")], SchemaKind::Flat).unwrap();
        assert_eq!(out.merged, 2);
        assert_eq!(out.dropped, 1);
        assert_eq!(out.fields["total_amount_with_gst"], json!(2));
    }

    #[test]
    fn nested_items_merge() {
        let mk = |name: &str, total: f64| {
            obj(json!({
                "Details": {
                    "invoice_details": {"invoice_number": "N1"},
                    "tax_details": {"pan_id": "P", "gst_number": "G"},
                    "purchaser_address": "Addr"
                },
                "purchase_details": {
                    "items": [{"name": name, "total_price": total}],
                    "total_amount_with_gst": total
                }
            }))
        };
        let out = merge_invoices(vec![mk("a", 10.0), mk("b", 20.25)], SchemaKind::Nested).unwrap();
        let pd = &out.fields["purchase_details"];
        assert_eq!(pd["items"].as_array().unwrap().len(), 2);
        assert_eq!(pd["total_amount_with_gst"], json!(30.25));
    }

    #[test]
    fn scored_total_recomputed_as_string() {
        let mk = |amount: &str| {
            obj(json!({
                "invoice_number": {"value": "S1", "conf": 0.9},
                "billing_address": {"value": "Addr", "conf": 0.9},
                "billing_gst": {"value": "G", "conf": 0.9},
                "billing_pan": {"value": "", "conf": 0.0},
                "line_items": [{"total_amount": {"value": amount, "conf": 0.8}}],
                "total_invoice_amount": {"value": amount, "conf": 0.7}
            }))
        };
        let out =
            merge_invoices(vec![mk("100.00"), mk("18.50")], SchemaKind::ConfidenceAnnotated).unwrap();
        assert_eq!(
            out.fields["total_invoice_amount"],
            json!({"value": "118.50", "conf": 0.7})
        );
    }

    #[test]
    fn shared_invoice_number_merges_despite_missing_pan() {
        let p1 = obj(json!({
            "invoice_number": "INV9",
            "purchaser_address": "12 Park St",
            "pan_id": "ABCDE1234F",
            "gst_number": "19ABCDE1234F1Z1",
            "items": [{"name": "A", "total_price": 100}],
            "total_amount_with_gst": 100
        }));
        let mut p2 = p1.clone();
        p2.insert("pan_id".into(), json!("N/A"));
        p2.insert("items".into(), json!([{"name": "B", "total_price": 18}]));
        p2.insert("total_amount_with_gst".into(), json!(18));

        let out = merge_invoices(vec![p1, p2], SchemaKind::Flat).unwrap();
        assert_eq!(out.merged, 2);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.fields["items"].as_array().unwrap().len(), 2);
        assert_eq!(out.fields["total_amount_with_gst"], json!(118));
        assert_eq!(out.fields["pan_id"], "ABCDE1234F");
    }

    #[test]
    fn shared_tax_pair_merges_despite_different_numbers() {
        let mk = |n: &str, name: &str| {
            obj(json!({
                "invoice_number": n,
                "purchaser_address": "Addr",
                "pan_id": "P1",
                "gst_number": "G1",
                "items": [{"name": name, "total_price": 1}],
                "total_amount_with_gst": 1
            }))
        };
        let out = merge_invoices(vec![mk("N/A", "a"), mk("77", "b")], SchemaKind::Flat).unwrap();
        assert_eq!(out.merged, 2);
        assert_eq!(out.fields["invoice_number"], "77");
    }

    #[test]
    fn same_number_at_other_address_is_another_invoice() {
        let mk = |addr: &str| {
            obj(json!({
                "invoice_number": "1",
                "purchaser_address": addr,
                "pan_id": "N/A",
                "gst_number": "N/A",
                "items": [],
                "total_amount_with_gst": "N/A"
            }))
        };
        let out = merge_invoices(vec![mk("A"), mk("B")], SchemaKind::Flat).unwrap();
        assert_eq!(out.merged, 1);
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn bridging_group_joins_earlier_invoices_in_order() {
        // First two share nothing; the third shares the number with the
        // first and the tax pair with the second.
        let g = |n: &str, pan: &str, name: &str| {
            obj(json!({
                "invoice_number": n,
                "purchaser_address": "Addr",
                "pan_id": pan,
                "gst_number": "N/A",
                "items": [{"name": name, "total_price": 1}],
                "total_amount_with_gst": 1
            }))
        };
        let out = merge_invoices(
            vec![g("10", "N/A", "a"), g("N/A", "P2", "b"), g("10", "P2", "c")],
            SchemaKind::Flat,
        )
        .unwrap();
        assert_eq!(out.merged, 3);
        assert_eq!(out.dropped, 0);
        let names: Vec<_> = out.fields["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn empty_input() {
        assert!(merge_invoices(vec![], SchemaKind::Flat).is_none());
    }
}
