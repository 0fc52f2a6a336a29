//! Translation of raw directory attributes into local field values.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::errors::ConfigError;
use crate::models::DirectoryRecord;

/// Attribute carrying the account control flags.
pub const DISABLED_ATTRIBUTE: &str = "userAccountControl";

/// `ACCOUNTDISABLE` bit of `userAccountControl`.
pub const ACCOUNT_DISABLE_FLAG: i64 = 0x2;

/// Attributes whose values are raw image bytes.
pub const PHOTO_ATTRIBUTES: [&str; 2] = ["thumbnailPhoto", "jpegPhoto"];

pub fn is_photo_attribute(name: &str) -> bool {
    PHOTO_ATTRIBUTES.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// A mapped attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedValue {
    Text(String),
    Binary(Vec<u8>),
}

impl MappedValue {
    /// Representation stored in a text field; binary values are base64.
    pub fn to_field_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Binary(bytes) => STANDARD.encode(bytes),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

/// Maps the configured directory attributes of a record onto local field
/// names.
#[derive(Debug, Clone)]
pub struct AttributeMapper {
    setting: String,
    mapping: Vec<(String, String)>,
}

impl AttributeMapper {
    /// `setting` names the config table the mapping comes from, for errors.
    pub fn new(setting: impl Into<String>, mapping: &BTreeMap<String, String>) -> Self {
        Self {
            setting: setting.into(),
            mapping: mapping
                .iter()
                .map(|(attr, field)| (attr.clone(), field.clone()))
                .collect(),
        }
    }

    /// Map the first value of every configured attribute present on
    /// `record`. Attribute names match without regard to case.
    pub fn map(&self, record: &DirectoryRecord) -> Result<BTreeMap<String, MappedValue>, ConfigError> {
        let mut fields = BTreeMap::new();
        for (attr, field) in &self.mapping {
            let Some(raw) = record.first_value(attr) else {
                continue;
            };
            let value = if is_photo_attribute(attr) {
                MappedValue::Binary(raw.to_vec())
            } else {
                MappedValue::Text(decode_text(&format!("{}.{attr}", self.setting), raw)?)
            };
            fields.insert(field.clone(), value);
        }
        Ok(fields)
    }
}

/// Decode a text attribute value. Invalid UTF-8 means the attribute should
/// not be mapped as text, which is a configuration problem.
pub fn decode_text(setting: &str, raw: &[u8]) -> Result<String, ConfigError> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| ConfigError::invalid(setting, format!("value is not valid UTF-8 text ({e})")))
}

/// Decode and join every value of a multi-valued text attribute.
pub fn join_text_values(
    setting: &str,
    values: &[Vec<u8>],
    separator: &str,
) -> Result<String, ConfigError> {
    let decoded = values
        .iter()
        .map(|raw| decode_text(setting, raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(decoded.join(separator))
}

/// First value of a text attribute, looked up without regard to case.
pub fn first_text(record: &DirectoryRecord, attribute: &str) -> Result<Option<String>, ConfigError> {
    record
        .first_value(attribute)
        .map(|raw| decode_text(attribute, raw))
        .transpose()
}

/// Whether `userAccountControl` carries the disable bit. A missing or
/// unparsable value counts as enabled.
pub fn is_account_disabled(record: &DirectoryRecord) -> bool {
    record
        .first_value(DISABLED_ATTRIBUTE)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|text| text.trim().parse::<i64>().ok())
        .is_some_and(|flags| flags & ACCOUNT_DISABLE_FLAG != 0)
}
