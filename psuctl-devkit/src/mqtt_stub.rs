/*!
Mock MQTT Client pour développement sans broker

Permet de développer et tester le shim hôte d'impression et les autres
intégrations psuctl sans démarrer un broker MQTT réel. Enregistre tous
les messages publiés et permet de simuler la réception.
*/

use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT Client qui simule rumqttc::AsyncClient
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration d'un channel pour recevoir les messages simulés
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Simule la publication d'un message (compatible avec AsyncClient)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };

        log::info!("[MOCK] published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    /// Simule l'abonnement à un topic (compatible avec AsyncClient)
    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::info!("[MOCK] subscribed to {}", topic);
        self.subscriptions.lock().unwrap().push(topic);
        Ok(())
    }

    /// Simule la réception d'un message (pour tests)
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender
                .send(message.clone())
                .map_err(|e| anyhow::anyhow!("send error: {}", e))?;
        }

        log::info!("[MOCK] simulated incoming: {}", message.topic);
        Ok(())
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Récupère les abonnements (pour assertions de tests)
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        match messages.last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    /// Reset tous les messages enregistrés
    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Helper pour créer des messages de test conformes aux contrats psuctl
pub struct PsuMessageBuilder;

impl PsuMessageBuilder {
    /// Tap du flux G-code : psuctl/printer/queuing@v1
    pub fn gcode_queuing_v1<S: Into<String>>(id: S, line: S) -> Value {
        let id: String = id.into();
        let line: String = line.into();
        serde_json::json!({
            "id": id,
            "line": line,
        })
    }

    /// Événement hôte : psuctl/host/event@v1
    pub fn host_event_v1<S: Into<String>>(event: S) -> Value {
        let event: String = event.into();
        serde_json::json!({
            "event": event,
            "ts": now_rfc3339(),
        })
    }

    /// Réponse job state : psuctl/printer/response@v1
    pub fn job_state_v1<S: Into<String>>(request_id: S, printing: bool, paused: bool) -> Value {
        let request_id: String = request_id.into();
        serde_json::json!({
            "type": "job_state",
            "request_id": request_id,
            "printing": printing,
            "paused": paused,
        })
    }

    /// Réponse connexion : psuctl/printer/response@v1
    pub fn connection_v1<S: Into<String>>(request_id: S, closed_or_error: bool) -> Value {
        let request_id: String = request_id.into();
        serde_json::json!({
            "type": "connection",
            "request_id": request_id,
            "closed_or_error": closed_or_error,
        })
    }

    /// Réponse températures : psuctl/printer/response@v1
    pub fn temperatures_v1<S: Into<String>>(request_id: S, heaters: Value) -> Value {
        let request_id: String = request_id.into();
        serde_json::json!({
            "type": "temperatures",
            "request_id": request_id,
            "heaters": heaters,
        })
    }

    /// Diffusion d'état PSU : psuctl/psu/state@v1
    pub fn psu_state_v1(is_on: bool) -> Value {
        serde_json::json!({
            "is_on": is_on,
            "ts": now_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_records_publish_and_subscribe() {
        env_logger::try_init().ok();
        let client = MockMqttClient::new();

        client
            .subscribe("psuctl/printer/queuing@v1", QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(client.get_subscriptions(), vec!["psuctl/printer/queuing@v1"]);

        let payload = serde_json::to_vec(&PsuMessageBuilder::psu_state_v1(true)).unwrap();
        client
            .publish("psuctl/psu/state@v1", QoS::AtLeastOnce, false, payload)
            .await
            .unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "psuctl/psu/state@v1");

        let parsed: Option<Value> = client.get_last_json_message("psuctl/psu/state@v1").unwrap();
        assert_eq!(parsed.unwrap()["is_on"], true);
    }

    #[tokio::test]
    async fn simulate_incoming_reaches_receiver() {
        let client = MockMqttClient::new();
        let mut receiver = client.setup_receiver();

        let payload =
            serde_json::to_vec(&PsuMessageBuilder::gcode_queuing_v1("q1", "G28")).unwrap();
        client
            .simulate_incoming("psuctl/printer/queuing@v1", payload)
            .await
            .unwrap();

        let msg = receiver.recv().await.unwrap();
        assert_eq!(msg.topic, "psuctl/printer/queuing@v1");
        let body: Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["line"], "G28");
    }

    #[test]
    fn message_builders_follow_the_contracts() {
        let queuing = PsuMessageBuilder::gcode_queuing_v1("q42", "M104 S210");
        assert_eq!(queuing["id"], "q42");
        assert_eq!(queuing["line"], "M104 S210");

        let job = PsuMessageBuilder::job_state_v1("r1", true, false);
        assert_eq!(job["type"], "job_state");
        assert!(job["printing"].as_bool().unwrap());

        let temps = PsuMessageBuilder::temperatures_v1(
            "r2",
            serde_json::json!({ "tool0": { "actual": 42.0, "target": 0.0 } }),
        );
        assert_eq!(temps["heaters"]["tool0"]["actual"], 42.0);

        let event = PsuMessageBuilder::host_event_v1("client_opened");
        assert_eq!(event["event"], "client_opened");
        assert!(event["ts"].as_str().is_some());
    }
}
