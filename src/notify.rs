//! Danger tier tracking and MQTT notifications.
//!
//! A [`Notifier`] remembers the last tier it announced and only publishes
//! when the latest point of a risk series falls into a different tier.
//! Messages go out retained with at-least-once delivery so a subscriber that
//! connects later still sees the current state.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::{Location, RiskSeries};

/// Fire danger bands over time to flashover (minutes). Boundaries belong to
/// the more dangerous band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DangerTier {
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl DangerTier {
    pub fn classify(ttf: f64) -> Self {
        if ttf > 60.0 {
            DangerTier::Low
        } else if ttf > 30.0 {
            DangerTier::Moderate
        } else if ttf > 15.0 {
            DangerTier::High
        } else {
            DangerTier::VeryHigh
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DangerTier::Low => "LOW",
            DangerTier::Moderate => "MODERATE",
            DangerTier::High => "HIGH",
            DangerTier::VeryHigh => "VERY_HIGH",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            DangerTier::Low => "Fire danger is LOW - conditions are safe",
            DangerTier::Moderate => "Fire danger is MODERATE - exercise caution",
            DangerTier::High => "Fire danger is HIGH - be vigilant",
            DangerTier::VeryHigh => "Fire danger is VERY HIGH - take immediate precautions",
        }
    }
}

impl fmt::Display for DangerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub timestamp: String,
    pub danger_level: DangerTier,
    pub ttf_minutes: f64,
    pub message: String,
    /// Set when one topic carries alerts for several locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl NotificationMessage {
    pub fn new(timestamp: DateTime<Utc>, tier: DangerTier, ttf: f64) -> Self {
        Self {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            danger_level: tier,
            ttf_minutes: (ttf * 100.0).round() / 100.0,
            message: tier.message().to_string(),
            location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            topic: "frcm/fire-danger".to_string(),
            username: None,
            password: None,
            client_id: "frcm-notifier".to_string(),
        }
    }
}

/// A pub/sub connection. Published payloads are retained on the topic and
/// delivered at least once.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// MQTT broker connection driven by a background event loop task.
pub struct MqttBroker {
    client: AsyncClient,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

const MQTT_RETRY_DELAY: Duration = Duration::from_secs(5);
const MQTT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn mqtt_options(config: &NotificationConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(Duration::from_secs(60));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    options
}

impl MqttBroker {
    /// Creates the client and spawns its event loop. The TCP connection is
    /// made by the loop, so this never blocks on the network.
    pub fn connect(config: &NotificationConfig) -> Self {
        let (client, mut event_loop) = AsyncClient::new(mqtt_options(config), 10);
        let address = format!("{}:{}", config.broker_host, config.broker_port);

        let handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %address, "connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        debug!(pkid = ack.pkid, "publish acknowledged");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!(broker = %address, "disconnected from MQTT broker");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(broker = %address, error = %e, "MQTT connection error");
                        tokio::time::sleep(MQTT_RETRY_DELAY).await;
                    }
                }
            }
        });

        Self {
            client,
            event_loop: Mutex::new(Some(handle)),
        }
    }

    fn take_event_loop(&self) -> Option<JoinHandle<()>> {
        match self.event_loop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(mut handle) = self.take_event_loop() else {
            return Ok(());
        };

        let requested = self.client.disconnect().await;
        if tokio::time::timeout(MQTT_DISCONNECT_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
        requested.map_err(|e| Error::Publish(e.to_string()))
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(handle) = self.take_event_loop() {
            handle.abort();
        }
    }
}

/// Debounced tier notifier for one stream of risk series.
pub struct Notifier {
    broker: Option<Arc<dyn Broker>>,
    topic: String,
    location: Option<String>,
    last_tier: Option<DangerTier>,
}

impl Notifier {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker: Some(broker),
            topic: topic.into(),
            location: None,
            last_tier: None,
        }
    }

    /// Tracks tiers without publishing anything.
    pub fn disabled() -> Self {
        Self {
            broker: None,
            topic: String::new(),
            location: None,
            last_tier: None,
        }
    }

    /// A notifier for `location` with its own tier state. It shares this
    /// notifier's broker and topic and names the location in each message.
    pub fn for_location(&self, location: &Location) -> Self {
        Self {
            broker: self.broker.clone(),
            topic: self.topic.clone(),
            location: Some(location.name.clone()),
            last_tier: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn last_tier(&self) -> Option<DangerTier> {
        self.last_tier
    }

    /// Classifies the latest point of `series` and publishes if the tier
    /// differs from the last one seen. Returns the new tier on a transition.
    pub async fn notify(&mut self, series: &RiskSeries) -> Option<DangerTier> {
        let latest = series.latest()?;
        let tier = DangerTier::classify(latest.ttf);

        if self.last_tier == Some(tier) {
            debug!(topic = %self.topic, tier = %tier, "danger tier unchanged");
            return None;
        }

        self.publish(latest.timestamp, tier, latest.ttf).await;
        self.last_tier = Some(tier);
        Some(tier)
    }

    /// Best-effort delivery: failures are logged, never returned.
    pub async fn publish(&self, timestamp: DateTime<Utc>, tier: DangerTier, ttf: f64) {
        let Some(broker) = &self.broker else {
            debug!(tier = %tier, "notifications disabled, skipping publish");
            return;
        };

        let mut message = NotificationMessage::new(timestamp, tier, ttf);
        message.location = self.location.clone();
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode notification");
                return;
            }
        };

        match broker.publish(&self.topic, payload).await {
            Ok(()) => info!(
                topic = %self.topic,
                tier = %tier,
                ttf,
                "published fire danger change"
            ),
            Err(e) => error!(topic = %self.topic, error = %e, "failed to publish notification"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::RiskPoint;
    use chrono::TimeZone;

    #[derive(Default)]
    pub(crate) struct RecordingBroker {
        pub published: Mutex<Vec<(String, Vec<u8>)>>,
        pub fail: bool,
    }

    impl RecordingBroker {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn messages(&self) -> Vec<(String, NotificationMessage)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, payload)| (topic.clone(), serde_json::from_slice(payload).unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if self.fail {
                return Err(Error::Publish("broker unavailable".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn series(ttfs: &[f64]) -> RiskSeries {
        let start = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        RiskSeries::new(
            ttfs.iter()
                .enumerate()
                .map(|(i, &ttf)| RiskPoint {
                    timestamp: start + chrono::Duration::hours(i as i64),
                    ttf,
                })
                .collect(),
        )
    }

    #[test]
    fn classify_boundaries_resolve_downward() {
        assert_eq!(DangerTier::classify(61.0), DangerTier::Low);
        assert_eq!(DangerTier::classify(60.0), DangerTier::Moderate);
        assert_eq!(DangerTier::classify(45.0), DangerTier::Moderate);
        assert_eq!(DangerTier::classify(31.0), DangerTier::Moderate);
        assert_eq!(DangerTier::classify(30.0), DangerTier::High);
        assert_eq!(DangerTier::classify(16.0), DangerTier::High);
        assert_eq!(DangerTier::classify(15.0), DangerTier::VeryHigh);
        assert_eq!(DangerTier::classify(5.0), DangerTier::VeryHigh);
        assert_eq!(DangerTier::classify(0.0), DangerTier::VeryHigh);
    }

    #[tokio::test]
    async fn tier_change_publishes_twice() {
        let broker = Arc::new(RecordingBroker::default());
        let mut notifier = Notifier::new(broker.clone(), "frcm/fire-danger");

        assert_eq!(notifier.notify(&series(&[20.0])).await, Some(DangerTier::High));
        assert_eq!(
            notifier.notify(&series(&[10.0])).await,
            Some(DangerTier::VeryHigh)
        );

        let messages = broker.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].1.danger_level, DangerTier::High);
        assert_eq!(messages[1].1.danger_level, DangerTier::VeryHigh);
    }

    #[tokio::test]
    async fn same_tier_is_debounced() {
        let broker = Arc::new(RecordingBroker::default());
        let mut notifier = Notifier::new(broker.clone(), "frcm/fire-danger");

        notifier.notify(&series(&[20.0])).await;
        assert_eq!(notifier.notify(&series(&[25.0])).await, None);

        assert_eq!(broker.messages().len(), 1);
        assert_eq!(notifier.last_tier(), Some(DangerTier::High));
    }

    #[tokio::test]
    async fn only_latest_point_is_classified() {
        let broker = Arc::new(RecordingBroker::default());
        let mut notifier = Notifier::new(broker.clone(), "t");

        notifier.notify(&series(&[90.0, 50.0, 8.0])).await;

        let messages = broker.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1.danger_level, DangerTier::VeryHigh);
        assert_eq!(messages[0].1.timestamp, "2026-07-01T14:00:00Z");
    }

    #[tokio::test]
    async fn empty_series_is_ignored() {
        let broker = Arc::new(RecordingBroker::default());
        let mut notifier = Notifier::new(broker.clone(), "t");

        assert_eq!(notifier.notify(&RiskSeries::default()).await, None);
        assert!(broker.messages().is_empty());
        assert_eq!(notifier.last_tier(), None);
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let broker = Arc::new(RecordingBroker::failing());
        let mut notifier = Notifier::new(broker, "t");

        assert_eq!(notifier.notify(&series(&[40.0])).await, Some(DangerTier::Moderate));
        assert_eq!(notifier.last_tier(), Some(DangerTier::Moderate));
    }

    #[tokio::test]
    async fn disabled_notifier_still_tracks_tier() {
        let mut notifier = Notifier::disabled();
        assert_eq!(notifier.notify(&series(&[70.0])).await, Some(DangerTier::Low));
        assert_eq!(notifier.notify(&series(&[65.0])).await, None);
    }

    #[test]
    fn message_has_wire_shape() {
        let timestamp = Utc.with_ymd_and_hms(2026, 1, 1, 6, 30, 0).unwrap();
        let message = NotificationMessage::new(timestamp, DangerTier::VeryHigh, 12.3456);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["timestamp"], "2026-01-01T06:30:00Z");
        assert_eq!(value["danger_level"], "VERY_HIGH");
        assert_eq!(value["ttf_minutes"], 12.35);
        assert_eq!(
            value["message"],
            "Fire danger is VERY HIGH - take immediate precautions"
        );
    }

    #[tokio::test]
    async fn location_notifiers_publish_on_configured_topic() {
        let broker = Arc::new(RecordingBroker::default());
        let base = Notifier::new(broker.clone(), "frcm/fire-danger");
        let bergen = Location {
            name: "Bergen".to_string(),
            latitude: 60.39,
            longitude: 5.32,
            altitude: 12,
        };
        let oslo = Location {
            name: "Oslo".to_string(),
            latitude: 59.91,
            longitude: 10.75,
            altitude: 23,
        };
        let mut bergen = base.for_location(&bergen);
        let mut oslo = base.for_location(&oslo);
        assert_eq!(bergen.topic(), "frcm/fire-danger");

        bergen.notify(&series(&[10.0])).await;
        oslo.notify(&series(&[10.0])).await;
        assert_eq!(oslo.notify(&series(&[12.0])).await, None);
        assert_eq!(base.last_tier(), None);

        let messages = broker.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|(topic, _)| topic == "frcm/fire-danger"));
        assert_eq!(messages[0].1.location.as_deref(), Some("Bergen"));
        assert_eq!(messages[1].1.location.as_deref(), Some("Oslo"));
    }

    #[test]
    fn message_without_location_omits_field() {
        let timestamp = Utc.with_ymd_and_hms(2026, 1, 1, 6, 30, 0).unwrap();
        let value =
            serde_json::to_value(NotificationMessage::new(timestamp, DangerTier::Low, 90.0)).unwrap();
        assert!(value.get("location").is_none());
    }

    #[test]
    fn mqtt_options_follow_config() {
        let config = NotificationConfig {
            broker_host: "mqtt.example.com".to_string(),
            broker_port: 8883,
            client_id: "custom-client".to_string(),
            ..NotificationConfig::default()
        };
        let options = mqtt_options(&config);
        assert_eq!(
            options.broker_address(),
            ("mqtt.example.com".to_string(), 8883)
        );
        assert_eq!(options.client_id(), "custom-client");
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = NotificationConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.topic, "frcm/fire-danger");
        assert_eq!(config.client_id, "frcm-notifier");
    }
}
