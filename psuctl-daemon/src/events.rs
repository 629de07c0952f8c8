use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

/// Puits d'événements vers le monde extérieur (UI connectées, intégrations).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, name: &str, payload: Value);
}

/// Publication MQTT sur psuctl/psu/{name}, timestamp RFC3339 ajouté.
pub struct MqttEventSink {
    client: AsyncClient,
}

impl MqttEventSink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for MqttEventSink {
    async fn publish(&self, name: &str, payload: Value) {
        let topic = format!("psuctl/psu/{name}");
        let mut payload = payload;
        if let Value::Object(map) = &mut payload {
            let ts = OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default();
            map.insert("ts".into(), Value::String(ts));
        }
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
        {
            warn!("failed to publish {}: {:?}", name, e);
        }
    }
}
