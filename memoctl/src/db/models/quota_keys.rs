//! Database models for API key rows in the shared code table.

/// One API key row as stored. The usage counter is kept as free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaKeyDBResponse {
    pub group: String,
    pub code: String,
    pub usage_raw: Option<String>,
    pub secret: Option<String>,
    pub active: bool,
}
