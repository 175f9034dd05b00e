//! Input normalization helpers.
//!
//! Every store funnels caller strings through these before validation so
//! that natural keys compare consistently:
//!
//! ```text
//! normalize(text)       = trim(text)
//! normalize_key(text)   = lowercase(trim(text))
//! ```

/// Trim leading and trailing whitespace.
pub fn normalize(text: &str) -> String {
    text.trim().to_string()
}

/// Trim and lowercase, for natural keys and enumerations.
///
/// # Example
///
/// ```rust
/// use masterchef_control::text::normalize_key;
///
/// assert_eq!(normalize_key("  HostA "), "hosta");
/// ```
pub fn normalize_key(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Trim an optional string, mapping blank values to `None`.
pub fn normalize_optional(text: Option<&str>) -> Option<String> {
    text.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Return the trimmed value or a validation message naming `field`.
pub fn require(text: &str, field: &str) -> crate::Result<String> {
    let value = normalize(text);
    if value.is_empty() {
        return Err(crate::Error::validation(format!("{field} is required")));
    }
    Ok(value)
}

/// Trim every entry, drop blanks, and drop repeats while keeping first-seen order.
pub fn dedup_preserve_order<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let value = item.as_ref().trim();
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.to_string()) {
            out.push(value.to_string());
        }
    }
    out
}
