//! Fire-and-forget operator alerts.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

/// How long `flush` waits for in-flight webhook deliveries at shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    CriticalFailure,
    ApiStructureChange,
    PartialFailure,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CriticalFailure => "CRITICAL_FAILURE",
            Self::ApiStructureChange => "API_STRUCTURE_CHANGE",
            Self::PartialFailure => "PARTIAL_FAILURE",
        }
    }
}

impl std::fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Publish without waiting for delivery. Must never fail the caller.
    fn publish(&self, event: AlertEvent, payload: Value);

    /// Wait (bounded) for deliveries still in flight. Called before exit.
    async fn flush(&self) {}
}

/// Writes alerts to the log only.
#[derive(Debug, Default)]
pub struct LogAlertChannel;

impl AlertChannel for LogAlertChannel {
    fn publish(&self, event: AlertEvent, payload: Value) {
        match event {
            AlertEvent::CriticalFailure => {
                tracing::error!(event = %event, payload = %payload, "Alert")
            }
            AlertEvent::ApiStructureChange | AlertEvent::PartialFailure => {
                tracing::warn!(event = %event, payload = %payload, "Alert")
            }
        }
    }
}

/// POSTs alerts as JSON to a webhook, and logs them too.
pub struct WebhookAlertChannel {
    client: reqwest::Client,
    url: String,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookAlertChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            in_flight: Mutex::new(Vec::new()),
        }
    }
}

fn envelope(event: AlertEvent, payload: Value) -> Value {
    json!({
        "event_type": event.as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "payload": payload,
    })
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    fn publish(&self, event: AlertEvent, payload: Value) {
        LogAlertChannel.publish(event, payload.clone());

        let request = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&envelope(event, payload));
        let handle = tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(event = %event, "Alert delivered");
                }
                Ok(resp) => {
                    tracing::warn!(event = %event, status = resp.status().as_u16(), "Alert webhook rejected delivery");
                }
                Err(e) => tracing::warn!(event = %event, error = %e, "Alert delivery failed"),
            }
        });

        match self.in_flight.lock() {
            Ok(mut handles) => {
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => tracing::debug!("Alert handle list poisoned: {}", e),
        }
    }

    async fn flush(&self) {
        let handles = match self.in_flight.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        let all = futures_util::future::join_all(handles);
        if tokio::time::timeout(FLUSH_TIMEOUT, all).await.is_err() {
            tracing::warn!("Timed out waiting for alert deliveries");
        }
    }
}

/// Keeps every published alert for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingAlerts {
    pub events: Mutex<Vec<(AlertEvent, Value)>>,
}

#[cfg(test)]
impl RecordingAlerts {
    pub fn kinds(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().iter().map(|(e, _)| *e).collect()
    }
}

#[cfg(test)]
impl AlertChannel for RecordingAlerts {
    fn publish(&self, event: AlertEvent, payload: Value) {
        self.events.lock().unwrap().push((event, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(AlertEvent::CriticalFailure.as_str(), "CRITICAL_FAILURE");
        assert_eq!(AlertEvent::ApiStructureChange.as_str(), "API_STRUCTURE_CHANGE");
        assert_eq!(AlertEvent::PartialFailure.to_string(), "PARTIAL_FAILURE");
    }

    #[test]
    fn test_envelope_shape() {
        let body = envelope(AlertEvent::PartialFailure, json!({"failed": 2}));
        assert_eq!(body["event_type"], "PARTIAL_FAILURE");
        assert_eq!(body["payload"]["failed"], 2);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_propagate() {
        // Nothing listens on port 9 locally; delivery fails and is only logged.
        let channel = WebhookAlertChannel::new("http://127.0.0.1:9/alerts");
        channel.publish(AlertEvent::CriticalFailure, json!({"reason": "test"}));
        channel.flush().await;
        assert!(channel.in_flight.lock().unwrap().is_empty());
    }

    #[test]
    fn test_recording_alerts() {
        let alerts = RecordingAlerts::default();
        alerts.publish(AlertEvent::ApiStructureChange, json!({}));
        assert_eq!(alerts.kinds(), vec![AlertEvent::ApiStructureChange]);
    }
}
