//! Per-provider parsing and filtering of raw catalog items.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use super::WorkItem;

/// A raw item that could not be turned into a [`WorkItem`]. Usually means
/// the provider changed its response shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaWarning {
    MissingField {
        field: &'static str,
        item_id: Option<String>,
    },
    InvalidField {
        field: &'static str,
        item_id: Option<String>,
        reason: String,
    },
}

impl std::fmt::Display for SchemaWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField { field, item_id } => write!(
                f,
                "item {} is missing required field '{}'",
                item_id.as_deref().unwrap_or("<unknown>"),
                field
            ),
            Self::InvalidField {
                field,
                item_id,
                reason,
            } => write!(
                f,
                "item {} has invalid '{}': {}",
                item_id.as_deref().unwrap_or("<unknown>"),
                field,
                reason
            ),
        }
    }
}

pub trait ItemAdapter: Send + Sync {
    /// Validate required fields and extract a work item.
    fn parse(&self, raw: &Value) -> Result<WorkItem, SchemaWarning>;

    /// Whether the item is genuine target content.
    fn include(&self, item: &WorkItem) -> bool;
}

/// Adapter for the GoPro cloud media search response.
#[derive(Debug, Clone)]
pub struct GoProAdapter {
    include_prefixes: Vec<String>,
}

impl GoProAdapter {
    pub fn new(include_prefixes: Vec<String>) -> Self {
        Self {
            include_prefixes: include_prefixes
                .into_iter()
                .map(|p| p.to_ascii_uppercase())
                .collect(),
        }
    }
}

impl Default for GoProAdapter {
    fn default() -> Self {
        Self::new(vec!["GH".into(), "GO".into()])
    }
}

/// Accept a JSON string or integer id.
fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_size(value: Option<&Value>) -> Result<u64, String> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| format!("'{n}' is not a non-negative integer")),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(0),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("'{s}' is not a byte count")),
        Some(other) => Err(format!("unexpected type: {other}")),
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

impl ItemAdapter for GoProAdapter {
    fn parse(&self, raw: &Value) -> Result<WorkItem, SchemaWarning> {
        let item_id = raw
            .get("id")
            .and_then(as_id)
            .ok_or(SchemaWarning::MissingField {
                field: "id",
                item_id: None,
            })?;

        let filename = raw
            .get("filename")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| SchemaWarning::MissingField {
                field: "filename",
                item_id: Some(item_id.clone()),
            })?
            .to_string();

        let expected_size =
            parse_size(raw.get("file_size")).map_err(|reason| SchemaWarning::InvalidField {
                field: "file_size",
                item_id: Some(item_id.clone()),
                reason,
            })?;

        let created_at = ["created_at", "captured_at"]
            .iter()
            .filter_map(|field| raw.get(*field).and_then(Value::as_str))
            .find_map(parse_timestamp);

        Ok(WorkItem {
            source_locator: item_id.clone(),
            item_id,
            filename,
            expected_size,
            created_at,
        })
    }

    fn include(&self, item: &WorkItem) -> bool {
        let upper = item.filename.to_ascii_uppercase();
        self.include_prefixes.iter().any(|p| upper.starts_with(p))
    }
}
