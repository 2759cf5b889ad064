//! Operator alerting.
//!
//! The rollback controller raises [`Alert`]s on rollbacks and on sustained
//! threshold breaches. An [`AlertDispatcher`] fans each alert out to every
//! configured [`AlertSink`], suppressing repeats of the same alert key
//! within a cooldown so that a flapping metric cannot cause an alert storm.
//!
//! Sink failures are logged and swallowed; alerting never affects routing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::RouterError;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Needs attention, no automatic action taken.
    Warning,
    /// An automatic action (rollback) was taken.
    Critical,
}

/// One alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Deduplication key; alerts sharing a key share a cooldown.
    pub key: String,
    /// Severity.
    pub severity: Severity,
    /// Human-readable summary.
    pub message: String,
    /// Metric involved, e.g. `"error_rate"`.
    pub metric: String,
    /// Observed value.
    pub value: f64,
    /// Threshold that was breached.
    pub threshold: f64,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Deliver one alert.
    ///
    /// # Errors
    ///
    /// Any delivery failure; the dispatcher logs it and moves on.
    async fn send(&self, alert: &Alert) -> Result<(), RouterError>;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), RouterError> {
        match alert.severity {
            Severity::Critical => error!(
                key = %alert.key,
                metric = %alert.metric,
                value = alert.value,
                threshold = alert.threshold,
                "ALERT: {}",
                alert.message
            ),
            Severity::Warning => warn!(
                key = %alert.key,
                metric = %alert.metric,
                value = alert.value,
                threshold = alert.threshold,
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// POSTs each alert as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookAlertSink {
    /// Sink posting to `url` with a 10 s timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), RouterError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(alert)
            .send()
            .await
            .map_err(|e| RouterError::Connection(format!("alert webhook: {e}")))?;

        if !response.status().is_success() {
            return Err(RouterError::Other(format!(
                "alert webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Keeps every alert in memory; used by tests and the admin endpoint.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, alert: &Alert) -> Result<(), RouterError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

/// Fans alerts out to sinks with a per-key cooldown.
pub struct AlertDispatcher {
    sinks: Vec<Arc<dyn AlertSink>>,
    cooldown: chrono::Duration,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("AlertDispatcher")
            .field("sinks", &names)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl AlertDispatcher {
    /// Dispatcher over `sinks` suppressing same-key repeats for `cooldown`.
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>, cooldown: Duration) -> Self {
        Self {
            sinks,
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Log-only dispatcher.
    pub fn log_only(cooldown: Duration) -> Self {
        Self::new(vec![Arc::new(LogAlertSink)], cooldown)
    }

    /// Deliver `alert` unless its key fired within the cooldown of
    /// `alert.timestamp`. Returns `true` if it was delivered.
    pub async fn notify(&self, alert: Alert) -> bool {
        {
            let mut last = self.last_sent.lock();
            if let Some(prev) = last.get(&alert.key) {
                if alert.timestamp.signed_duration_since(*prev) < self.cooldown {
                    info!(key = %alert.key, "alert suppressed (cooldown)");
                    return false;
                }
            }
            last.insert(alert.key.clone(), alert.timestamp);
        }

        for sink in &self.sinks {
            if let Err(e) = sink.send(&alert).await {
                warn!(sink = sink.name(), key = %alert.key, error = %e, "alert delivery failed");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(key: &str, at: DateTime<Utc>) -> Alert {
        Alert {
            key: key.to_string(),
            severity: Severity::Critical,
            message: "rolled back".into(),
            metric: "error_rate".into(),
            value: 0.08,
            threshold: 0.05,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat() {
        let sink = Arc::new(MemoryAlertSink::new());
        let d = AlertDispatcher::new(vec![sink.clone()], Duration::from_secs(900));
        let t0 = Utc::now();

        assert!(d.notify(alert("rollback", t0)).await);
        assert!(!d.notify(alert("rollback", t0 + chrono::Duration::seconds(60))).await);
        assert!(d.notify(alert("rollback", t0 + chrono::Duration::seconds(901))).await);
        assert_eq!(sink.alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share_cooldown() {
        let sink = Arc::new(MemoryAlertSink::new());
        let d = AlertDispatcher::new(vec![sink.clone()], Duration::from_secs(900));
        let t0 = Utc::now();
        assert!(d.notify(alert("a", t0)).await);
        assert!(d.notify(alert("b", t0)).await);
        assert_eq!(sink.alerts().len(), 2);
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        async fn send(&self, _alert: &Alert) -> Result<(), RouterError> {
            Err(RouterError::Other("down".into()))
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let sink = Arc::new(MemoryAlertSink::new());
        let d = AlertDispatcher::new(vec![Arc::new(FailingSink), sink.clone()], Duration::ZERO);
        assert!(d.notify(alert("k", Utc::now())).await);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn test_alert_serializes_severity_lowercase() {
        let json = serde_json::to_value(alert("k", Utc::now())).unwrap();
        assert_eq!(json["severity"], "critical");
    }
}
