//! Destination key layout and content-identity tags.

use base64::Engine;
use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};

use crate::catalog::WorkItem;
use crate::store::{ObjectAttributes, ObjectHead};

pub const TAG_ITEM_ID: &str = "source-item-id";
pub const TAG_IDENTITY: &str = "source-identity";
pub const TAG_PROVIDER: &str = "source-provider";
pub const TAG_AUTO_SYNC: &str = "auto-sync";

/// Clean a filename by removing characters that are invalid in object keys
/// or on common filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
/// Leading dots are replaced so the name never looks hidden.
pub fn clean_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    match cleaned.strip_prefix('.') {
        Some(rest) => format!("_{rest}"),
        None if cleaned.is_empty() => "_".to_string(),
        None => cleaned,
    }
}

/// `{provider}-videos/{YYYY}/{MM}/{filename}`, dated by the item's creation
/// time or the current month when that is unknown.
pub fn destination_key(provider: &str, filename: &str, created_at: Option<DateTime<Utc>>) -> String {
    let date = created_at.unwrap_or_else(Utc::now);
    format!(
        "{}-videos/{:04}/{:02}/{}",
        provider,
        date.year(),
        date.month(),
        clean_filename(filename)
    )
}

/// Add a string suffix before the file extension of the last key segment.
///
/// For example, `"a/GH01.MP4"` with suffix `"abc"` becomes `"a/GH01-abc.MP4"`.
pub fn insert_suffix(key: &str, suffix: &str) -> String {
    let name_start = key.rfind('/').map_or(0, |i| i + 1);
    match key[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = key.split_at(name_start + dot);
            format!("{stem}-{suffix}{ext}")
        }
        _ => format!("{key}-{suffix}"),
    }
}

/// Key used when the primary key already holds a different item's object.
pub fn disambiguated_key(key: &str, item_id: &str) -> String {
    insert_suffix(key, &clean_filename(item_id))
}

/// Stable identity of one capture of one item. A re-uploaded or re-captured
/// item keeps its id but gets a new creation time, hence a new identity.
pub fn content_identity(provider: &str, item_id: &str, created_at: Option<DateTime<Utc>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0u8]);
    hasher.update(item_id.as_bytes());
    hasher.update([0u8]);
    if let Some(created) = created_at {
        hasher.update(created.timestamp().to_string().as_bytes());
    }
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

pub fn object_attributes(provider: &str, item: &WorkItem, storage_class: &str) -> ObjectAttributes {
    let mut attributes = ObjectAttributes {
        storage_class: storage_class.to_string(),
        ..Default::default()
    };
    let tags = &mut attributes.tags;
    tags.insert(TAG_ITEM_ID.into(), item.item_id.clone());
    tags.insert(
        TAG_IDENTITY.into(),
        content_identity(provider, &item.item_id, item.created_at),
    );
    tags.insert(TAG_PROVIDER.into(), provider.to_string());
    tags.insert(TAG_AUTO_SYNC.into(), "true".into());
    attributes
}

/// How an existing object at a candidate key relates to the item being synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    /// Nothing there.
    Vacant,
    /// The completed transfer of this exact item.
    ThisItem,
    /// An earlier capture of the same item id; safe to replace.
    Superseded,
    /// Somebody else's object.
    Foreign,
}

pub fn classify_occupant(
    head: Option<&ObjectHead>,
    provider: &str,
    item: &WorkItem,
) -> Occupant {
    let Some(head) = head else {
        return Occupant::Vacant;
    };
    if head.tags.get(TAG_ITEM_ID) != Some(&item.item_id)
        || head.tags.get(TAG_PROVIDER).map(String::as_str) != Some(provider)
    {
        return Occupant::Foreign;
    }
    let identity = content_identity(provider, &item.item_id, item.created_at);
    if head.tags.get(TAG_IDENTITY) == Some(&identity) {
        Occupant::ThisItem
    } else {
        Occupant::Superseded
    }
}
