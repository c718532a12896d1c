//! Best-effort metrics, emitted as structured tracing events.

pub const MEDIA_LISTED: &str = "MediaListedFromProvider";
pub const NEW_ITEMS_FOUND: &str = "NewItemsFound";
pub const LISTING_DURATION: &str = "ListingDuration";
pub const STRUCTURAL_WARNINGS: &str = "StructuralWarnings";
pub const ITEM_SYNCED: &str = "ItemSynced";
pub const BYTES_TRANSFERRED: &str = "BytesTransferred";
pub const TRANSFER_DURATION: &str = "TransferDuration";
pub const TIME_TO_FIRST_BYTE: &str = "TimeToFirstByte";
pub const SYNC_FAILURE: &str = "SyncFailure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Count,
    Bytes,
    Seconds,
    Milliseconds,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Count => "Count",
            Unit::Bytes => "Bytes",
            Unit::Seconds => "Seconds",
            Unit::Milliseconds => "Milliseconds",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    /// Never blocks and never fails.
    fn record(&self, name: &str, value: f64, unit: Unit, dimensions: &[(&str, &str)]);
}

/// Emits each data point at INFO under the `mediasync::metrics` target, so
/// it can be routed separately with `RUST_LOG=mediasync::metrics=info`.
#[derive(Debug, Clone)]
pub struct TracingMetrics {
    namespace: String,
}

impl TracingMetrics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

fn format_dimensions(dimensions: &[(&str, &str)]) -> String {
    dimensions
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

impl MetricsSink for TracingMetrics {
    fn record(&self, name: &str, value: f64, unit: Unit, dimensions: &[(&str, &str)]) {
        tracing::info!(
            target: "mediasync::metrics",
            namespace = %self.namespace,
            metric = name,
            value,
            unit = unit.as_str(),
            dimensions = %format_dimensions(dimensions),
        );
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    pub name: String,
    pub value: f64,
    pub unit: Unit,
    pub dimensions: Vec<(String, String)>,
}

/// Keeps every data point for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMetrics {
    pub points: std::sync::Mutex<Vec<RecordedMetric>>,
}

#[cfg(test)]
impl RecordingMetrics {
    pub fn sum(&self, name: &str) -> f64 {
        self.points
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.value)
            .sum()
    }

    pub fn with_dimension(&self, name: &str, key: &str, value: &str) -> usize {
        self.points
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.name == name)
            .filter(|p| p.dimensions.iter().any(|(k, v)| k == key && v == value))
            .count()
    }
}

#[cfg(test)]
impl MetricsSink for RecordingMetrics {
    fn record(&self, name: &str, value: f64, unit: Unit, dimensions: &[(&str, &str)]) {
        self.points.lock().unwrap().push(RecordedMetric {
            name: name.to_string(),
            value,
            unit,
            dimensions: dimensions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_dimensions() {
        assert_eq!(format_dimensions(&[]), "");
        assert_eq!(
            format_dimensions(&[("provider", "gopro"), ("error_type", "Transient")]),
            "provider=gopro,error_type=Transient"
        );
    }

    #[test]
    fn test_tracing_metrics_does_not_panic_without_subscriber() {
        TracingMetrics::new("MediaSync").record(ITEM_SYNCED, 1.0, Unit::Count, &[("provider", "gopro")]);
    }

    #[test]
    fn test_recording_metrics() {
        let metrics = RecordingMetrics::default();
        metrics.record(SYNC_FAILURE, 1.0, Unit::Count, &[("error_type", "Permanent")]);
        metrics.record(SYNC_FAILURE, 1.0, Unit::Count, &[("error_type", "Transient")]);
        assert_eq!(metrics.sum(SYNC_FAILURE), 2.0);
        assert_eq!(metrics.with_dimension(SYNC_FAILURE, "error_type", "Permanent"), 1);
    }
}
