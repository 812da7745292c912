//! Structured-output contract shared by every extraction call.
//!
//! Two schemas exist, one per phase of the header protocol:
//!
//! | Schema | Used for | Shape |
//! |--------|----------|-------|
//! | [`ResponseSchema::Headers`] | page 0, header discovery | `{"headers": [string]}` |
//! | [`ResponseSchema::Items`]   | every page, line items   | `{"items": [InvoiceItem]}` |
//!
//! The JSON Schemas are generated from the Rust types with `schemars` so the
//! contract sent to the model can never drift from what we decode. Decoding
//! is lenient about *envelope* (a bare array is accepted for either schema)
//! and about scalar *types* (numeric strings for quantities, numbers for
//! prices), but never invents values: anything unreadable becomes `null`.

use crate::output::InvoiceItem;
use crate::pipeline::repair::clean_json;
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Header-only response, requested for page 0.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HeaderExtraction {
    /// The column headers found in the invoice table, left to right.
    pub headers: Vec<String>,
}

/// Item-list response, requested for every page.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PageItems {
    /// Product lines found on this page.
    pub items: Vec<InvoiceItem>,
}

/// Which structured-output contract a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSchema {
    Headers,
    Items,
}

static HEADERS_SCHEMA: Lazy<Value> = Lazy::new(|| schema_value(schemars::schema_for!(HeaderExtraction)));
static ITEMS_SCHEMA: Lazy<Value> = Lazy::new(|| schema_value(schemars::schema_for!(PageItems)));

fn schema_value(root: schemars::schema::RootSchema) -> Value {
    // RootSchema is plain data; serialisation cannot fail.
    serde_json::to_value(root).unwrap_or(Value::Null)
}

impl ResponseSchema {
    /// Short name used in logs, errors and transport requests.
    pub fn name(self) -> &'static str {
        match self {
            ResponseSchema::Headers => "headers",
            ResponseSchema::Items => "items",
        }
    }

    /// The JSON Schema the model is asked to conform to.
    pub fn json_schema(self) -> &'static Value {
        match self {
            ResponseSchema::Headers => &HEADERS_SCHEMA,
            ResponseSchema::Items => &ITEMS_SCHEMA,
        }
    }
}

impl fmt::Display for ResponseSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum HeadersEnvelope {
    Wrapped { headers: Vec<String> },
    Bare(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ItemsEnvelope {
    Wrapped {
        #[serde(deserialize_with = "nullable_items")]
        items: Vec<InvoiceItem>,
    },
    Bare(Vec<InvoiceItem>),
}

/// The `items` key is required; an explicit `null` means no items.
fn nullable_items<'de, D>(deserializer: D) -> Result<Vec<InvoiceItem>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<InvoiceItem>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode a header-schema response into a trimmed header list.
pub fn parse_headers(raw: &str) -> Result<Vec<String>, serde_json::Error> {
    let cleaned = clean_json(raw);
    let headers = match serde_json::from_str::<HeadersEnvelope>(&cleaned)? {
        HeadersEnvelope::Wrapped { headers } | HeadersEnvelope::Bare(headers) => headers,
    };
    Ok(headers
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect())
}

/// Decode an item-schema response. `{"items": null}` means no items.
///
/// An object without an `items` key is an error, and so is a row in which
/// no field could be read.
pub fn parse_items(raw: &str) -> Result<Vec<InvoiceItem>, serde_json::Error> {
    let cleaned = clean_json(raw);
    let items = match serde_json::from_str::<ItemsEnvelope>(&cleaned)? {
        ItemsEnvelope::Wrapped { items } | ItemsEnvelope::Bare(items) => items,
    };
    if let Some(row) = items.iter().position(|item| *item == InvoiceItem::default()) {
        return Err(serde::de::Error::custom(format!(
            "item {row} has no readable field"
        )));
    }
    Ok(items)
}

/// Accept strings and numbers for text fields; anything else is `None`.
pub(crate) fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accept integers, integral floats and numeric strings ("1,200", " 12 ").
pub(crate) fn lenient_quantity<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(quantity_from_value))
}

fn quantity_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let digits = s.trim().replace(',', "");
            digits
                .parse::<i64>()
                .ok()
                .or_else(|| digits.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0).then_some(f as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemas_describe_all_item_fields() {
        let schema = ResponseSchema::Items.json_schema().to_string();
        for field in [
            "product_name",
            "batch_number",
            "expiry_date",
            "mrp",
            "quantity",
        ] {
            assert!(schema.contains(field), "schema missing {field}: {schema}");
        }
        assert!(ResponseSchema::Headers
            .json_schema()
            .to_string()
            .contains("headers"));
    }

    #[test]
    fn headers_wrapped_and_bare() {
        assert_eq!(
            parse_headers(r#"{"headers": ["Name", " Batch ", ""]}"#).unwrap(),
            vec!["Name", "Batch"]
        );
        assert_eq!(
            parse_headers(r#"["Name","Qty"]"#).unwrap(),
            vec!["Name", "Qty"]
        );
    }

    #[test]
    fn headers_reject_wrong_shape() {
        assert!(parse_headers(r#"{"columns": 3}"#).is_err());
        assert!(parse_headers("not json at all").is_err());
    }

    #[test]
    fn items_default_missing_fields_to_null() {
        let items = parse_items(r#"{"items": [{"product_name": "Pan 40"}]}"#).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_name.as_deref(), Some("Pan 40"));
        assert_eq!(items[0].batch_number, None);
        assert_eq!(items[0].quantity, None);
    }

    #[test]
    fn items_bare_array_and_null_items() {
        let items = parse_items(r#"[{"product_name": "A", "quantity": 2}]"#).unwrap();
        assert_eq!(items[0].quantity, Some(2));
        assert!(parse_items(r#"{"items": null}"#).unwrap().is_empty());
    }

    #[test]
    fn quantities_are_coerced_but_never_invented() {
        let items = parse_items(
            r#"[{"product_name": "A", "quantity": "1,200"}, {"product_name": "B", "quantity": 3.0},
                {"product_name": "C", "quantity": 2.5}, {"product_name": "D", "quantity": "ten"}]"#,
        )
        .unwrap();
        let q: Vec<_> = items.iter().map(|i| i.quantity).collect();
        assert_eq!(q, vec![Some(1200), Some(3), None, None]);
    }

    #[test]
    fn numeric_text_fields_become_strings() {
        let items = parse_items(r#"[{"mrp": 125.5, "batch_number": 44821}]"#).unwrap();
        assert_eq!(items[0].mrp.as_deref(), Some("125.5"));
        assert_eq!(items[0].batch_number.as_deref(), Some("44821"));
    }

    #[test]
    fn items_reject_wrong_shape() {
        assert!(parse_items(r#"{"items": "none"}"#).is_err());
        assert!(parse_items(r#"[1, 2, 3]"#).is_err());
        assert!(parse_items("{}").is_err());
        assert!(parse_items(r#"{"error": "cannot read table"}"#).is_err());
        assert!(parse_items(r#"{"headers": ["A", "B"]}"#).is_err());
    }

    #[test]
    fn rows_without_any_field_are_rejected() {
        assert!(parse_items("[{}]").is_err());
        assert!(parse_items(r#"{"items": [{"product_name": "A"}, {"mrp": null}]}"#).is_err());
        assert!(parse_items(r#"{"items": []}"#).unwrap().is_empty());
    }
}
