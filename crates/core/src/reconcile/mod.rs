//! Entity reconcilers.
//!
//! Each reconciler walks directory items of one kind, applies the differences
//! to the identity store and moves the counters of one [`EntityStats`].
//! A failing record is logged and counted; only configuration errors stop
//! the walk.
//!
//! [`EntityStats`]: crate::models::EntityStats

pub mod groups;
pub mod memberships;
pub mod profiles;
pub mod users;

use std::collections::BTreeMap;

use tracing::warn;

use crate::mapper::MappedValue;
use crate::models::{DirectoryItem, DirectoryRecord, EntityStats};

pub use groups::reconcile_groups;
pub use memberships::reconcile_memberships;
pub use profiles::{ProfileField, ProfileSchema};
pub use users::{UserOutcome, UserReconciler};

/// The record behind an item, or `None` after counting a malformed item.
pub(crate) fn record_or_count<'i>(
    item: &'i DirectoryItem,
    kind: &str,
    stats: &mut EntityStats,
) -> Option<&'i DirectoryRecord> {
    match item {
        DirectoryItem::Record(record) => Some(record),
        DirectoryItem::Malformed { dn, reason } => {
            warn!(kind, dn = dn.as_deref().unwrap_or("-"), reason = %reason, "skipping malformed directory entry");
            stats.errors += 1;
            None
        }
    }
}

/// Text form of every mapped field, for store defaults and comparisons.
pub(crate) fn field_texts(fields: &BTreeMap<String, MappedValue>) -> BTreeMap<String, String> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), value.to_field_text()))
        .collect()
}

/// A mapped text field that is present and not blank.
pub(crate) fn required_text(fields: &BTreeMap<String, MappedValue>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(MappedValue::as_text)
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}
