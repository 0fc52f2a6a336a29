//! Search filter construction: value escaping, placeholder substitution and
//! watermark formatting.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Duration, Utc};

use crate::config::DN_PLACEHOLDER;
use crate::errors::ConfigError;

/// Placeholder in incremental filter templates replaced by the watermark.
pub const WATERMARK_PLACEHOLDER: char = '?';

/// Non-strftime placeholders accepted by the photo name template.
pub const PHOTO_TEMPLATE_PLACEHOLDERS: [&str; 2] = ["{username}", "{uuid4}"];

/// Escape a value for use inside an LDAP filter (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\5c"),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Substitute the escaped user DN into a membership filter template.
pub fn membership_filter(template: &str, user_dn: &str) -> String {
    template.replace(DN_PLACEHOLDER, &escape_filter_value(user_dn))
}

/// Check that `pattern` only contains strftime items chrono understands.
pub fn check_strftime(pattern: &str) -> Result<(), String> {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(format!("'{pattern}' is not a valid strftime pattern"));
    }
    Ok(())
}

/// Format `watermark - offset_mins` with a strftime pattern.
pub fn format_watermark(
    watermark: DateTime<Utc>,
    offset_mins: i64,
    pattern: &str,
) -> Result<String, ConfigError> {
    check_strftime(pattern)
        .map_err(|detail| ConfigError::invalid("incremental.timestamp_format", detail))?;
    let shifted = watermark - Duration::minutes(offset_mins);
    Ok(shifted.format(pattern).to_string())
}

/// Build an incremental filter by replacing every `?` in `template`.
pub fn incremental_filter(
    template: &str,
    watermark: DateTime<Utc>,
    offset_mins: i64,
    pattern: &str,
) -> Result<String, ConfigError> {
    let stamp = format_watermark(watermark, offset_mins, pattern)?;
    Ok(template.replace(WATERMARK_PLACEHOLDER, &stamp))
}
