/**
 * PRINTER BRIDGE - Pont daemon ↔ hôte d'impression via MQTT
 *
 * RÔLE :
 * Le daemon ne parle jamais au firmware directement : l'hôte d'impression
 * possède le port série, les températures et les scripts G-code. Ce module
 * traduit les besoins du contrôleur PSU en messages MQTT.
 *
 * FONCTIONNEMENT :
 * - Commandes fire-and-forget sur psuctl/printer/command@v1
 * - Requêtes corrélées par request_id, réponse attendue sous 5s
 * - Les réponses arrivent sur psuctl/printer/response@v1
 */

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::warn;
use uuid::Uuid;

pub const COMMAND_TOPIC: &str = "psuctl/printer/command@v1";
pub const RESPONSE_TOPIC: &str = "psuctl/printer/response@v1";

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lecture d'un heater côté hôte. `None` = heater absent du firmware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterReading {
    pub actual: Option<f64>,
    pub target: Option<f64>,
}

/// Contrat de l'hôte d'impression consommé par le contrôleur PSU.
#[async_trait]
pub trait PrinterHost: Send + Sync {
    async fn send_gcode(&self, commands: &[String]) -> Result<()>;
    async fn is_printing_or_paused(&self) -> Result<bool>;
    async fn is_closed_or_error(&self) -> Result<bool>;
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn current_temperatures(&self) -> Result<HashMap<String, HeaterReading>>;
    async fn set_temperature(&self, heater: &str, target: f64) -> Result<()>;
    async fn run_script(&self, name: &str) -> Result<()>;
}

/// Commandes MQTT envoyées à l'hôte
#[derive(Debug, Serialize)]
#[serde(tag = "action")]
pub enum PrinterCommand {
    #[serde(rename = "send_gcode")]
    SendGcode { commands: Vec<String> },
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "set_temperature")]
    SetTemperature { heater: String, target: f64 },
    #[serde(rename = "run_script")]
    RunScript { name: String },
    #[serde(rename = "query_job_state")]
    QueryJobState { request_id: String },
    #[serde(rename = "query_connection")]
    QueryConnection { request_id: String },
    #[serde(rename = "query_temperatures")]
    QueryTemperatures { request_id: String },
}

/// Réponses de l'hôte (corrélées par request_id)
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum PrinterResponse {
    #[serde(rename = "job_state")]
    JobState {
        request_id: String,
        printing: bool,
        paused: bool,
    },
    #[serde(rename = "connection")]
    Connection {
        request_id: String,
        closed_or_error: bool,
    },
    #[serde(rename = "temperatures")]
    Temperatures {
        request_id: String,
        heaters: HashMap<String, HeaterReading>,
    },
    #[serde(rename = "error")]
    Error { request_id: String, error: String },
}

impl PrinterResponse {
    fn request_id(&self) -> &str {
        match self {
            PrinterResponse::JobState { request_id, .. } => request_id,
            PrinterResponse::Connection { request_id, .. } => request_id,
            PrinterResponse::Temperatures { request_id, .. } => request_id,
            PrinterResponse::Error { request_id, .. } => request_id,
        }
    }
}

/// Gestionnaire des requêtes en attente de réponse
pub struct MqttPrinterBridge {
    mqtt_client: AsyncClient,
    /// Map des requêtes en attente : request_id -> sender pour réponse
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<PrinterResponse>>>>,
}

impl MqttPrinterBridge {
    pub fn new(mqtt_client: AsyncClient) -> Self {
        Self {
            mqtt_client,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Traite une réponse MQTT de l'hôte
    pub fn handle_response(&self, response: PrinterResponse) {
        let request_id = response.request_id().to_string();
        let sender = self.pending.lock().remove(&request_id);
        match sender {
            Some(sender) => {
                if sender.send(response).is_err() {
                    warn!("response receiver dropped for request {}", request_id);
                }
            }
            None => warn!("received response for unknown request {}", request_id),
        }
    }

    async fn send(&self, command: &PrinterCommand) -> Result<()> {
        let payload = serde_json::to_string(command)?;
        self.mqtt_client
            .publish(COMMAND_TOPIC, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| anyhow!("publish to printer host failed: {e:?}"))
    }

    /// Envoie une requête et attend la réponse corrélée
    async fn query(&self, request_id: String, command: PrinterCommand) -> Result<PrinterResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = self.send(&command).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                Err(anyhow!("response channel closed for request {request_id}"))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(anyhow!(
                    "printer host did not answer within {RESPONSE_TIMEOUT:?}"
                ))
            }
        }
    }
}

#[async_trait]
impl PrinterHost for MqttPrinterBridge {
    async fn send_gcode(&self, commands: &[String]) -> Result<()> {
        self.send(&PrinterCommand::SendGcode {
            commands: commands.to_vec(),
        })
        .await
    }

    async fn is_printing_or_paused(&self) -> Result<bool> {
        let request_id = Uuid::new_v4().to_string();
        match self
            .query(request_id.clone(), PrinterCommand::QueryJobState { request_id })
            .await?
        {
            PrinterResponse::JobState { printing, paused, .. } => Ok(printing || paused),
            PrinterResponse::Error { error, .. } => Err(anyhow!(error)),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn is_closed_or_error(&self) -> Result<bool> {
        let request_id = Uuid::new_v4().to_string();
        match self
            .query(request_id.clone(), PrinterCommand::QueryConnection { request_id })
            .await?
        {
            PrinterResponse::Connection { closed_or_error, .. } => Ok(closed_or_error),
            PrinterResponse::Error { error, .. } => Err(anyhow!(error)),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn connect(&self) -> Result<()> {
        self.send(&PrinterCommand::Connect).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.send(&PrinterCommand::Disconnect).await
    }

    async fn current_temperatures(&self) -> Result<HashMap<String, HeaterReading>> {
        let request_id = Uuid::new_v4().to_string();
        match self
            .query(
                request_id.clone(),
                PrinterCommand::QueryTemperatures { request_id },
            )
            .await?
        {
            PrinterResponse::Temperatures { heaters, .. } => Ok(heaters),
            PrinterResponse::Error { error, .. } => Err(anyhow!(error)),
            other => Err(anyhow!("unexpected response: {other:?}")),
        }
    }

    async fn set_temperature(&self, heater: &str, target: f64) -> Result<()> {
        self.send(&PrinterCommand::SetTemperature {
            heater: heater.to_string(),
            target,
        })
        .await
    }

    async fn run_script(&self, name: &str) -> Result<()> {
        self.send(&PrinterCommand::RunScript {
            name: name.to_string(),
        })
        .await
    }
}
