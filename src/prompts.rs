//! Prompts for VLM-based invoice line-item extraction.
//!
//! Every prompt lives here so the header protocol can be read (and tested)
//! in one place:
//!
//! * **Phase A**: [`header_prompt`], sent once for page 0 with the header
//!   schema.
//! * **Page 0 items**: [`first_page_prompt`], the header page's own item
//!   extraction, which reads columns straight off the page.
//! * **Phase B**: [`subsequent_page_prompt`], every other page, carrying the
//!   canonical header list as fixed context.
//!
//! [`system_prompt`] wraps all of them with the JSON-only instruction and the
//! schema the answer must satisfy.

use crate::schema::ResponseSchema;

/// Phase A: column headers only, verbatim, left to right.
pub const HEADER_PROMPT: &str = "Extract only the column headers from this invoice table.
Return them exactly as they appear, maintaining their order from left to right.
Only extract the headers, not any data from the rows.";

/// Field-by-field instructions shared by every item prompt.
pub const ITEM_FIELDS: &str = "For each product row, extract:
1. Product name
2. Batch number
3. Expiry date (MM/YY format)
4. MRP (Maximum Retail Price)
5. Quantity (as integer)

Use null for any value you cannot extract. Never guess a value that is not printed on the page.";

/// Build the system message for a request targeting `schema`.
pub fn system_prompt(schema: ResponseSchema) -> String {
    format!(
        "You are an expert invoice reader. You look at a scanned or rendered invoice page \
and answer with a single JSON value.\n\n\
Respond with JSON only: no Markdown fences, no commentary.\n\
The JSON must conform to this JSON Schema ({name}):\n{schema}",
        name = schema.name(),
        schema = schema.json_schema(),
    )
}

/// Phase A prompt for page 0.
pub fn header_prompt() -> String {
    HEADER_PROMPT.to_string()
}

/// Item prompt for page 0: columns are read from the page itself.
pub fn first_page_prompt(invoice_kind: Option<&str>) -> String {
    format!(
        "{intro}\nUse the exact column headers you see in the table.\n\n{fields}",
        intro = intro(invoice_kind),
        fields = ITEM_FIELDS,
    )
}

/// Phase B prompt for every page after the first.
///
/// With an empty header list (Phase A failed) the model falls back to
/// reading the columns of this page, exactly as on page 0.
pub fn subsequent_page_prompt(
    page_index: usize,
    headers: &[String],
    invoice_kind: Option<&str>,
) -> String {
    let mut prompt = intro(invoice_kind);
    prompt.push_str(&format!(
        "\nThis is page {} of the same invoice.\n",
        page_index + 1
    ));
    if headers.is_empty() {
        prompt.push_str("Use the exact column headers you see in the table.\n");
    } else {
        prompt.push_str(&format!(
            "Use these column headers: {}\n\
Ensure the extracted data aligns with these columns in order.\n",
            headers.join(", ")
        ));
    }
    prompt.push('\n');
    prompt.push_str(ITEM_FIELDS);
    prompt
}

fn intro(invoice_kind: Option<&str>) -> String {
    match invoice_kind.map(str::trim).filter(|k| !k.is_empty()) {
        Some(kind) => format!("Extract product details from this {kind} invoice table."),
        None => "Extract product details from this invoice table.".to_string(),
    }
}
