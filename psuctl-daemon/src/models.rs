use serde::{Deserialize, Serialize};

/// Tap du flux de commandes G-code (hôte -> daemon), une entrée par
/// commande mise en file avant envoi au firmware.
#[derive(Debug, Deserialize)]
pub struct QueuingIn {
    pub id: String,
    pub line: String,
}

/// Verdict renvoyé à l'hôte pour chaque commande observée.
#[derive(Debug, Serialize)]
pub struct QueuingVerdictOut {
    pub id: String,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Événement du cycle de vie de l'hôte (client connecté, erreur firmware...).
#[derive(Debug, Deserialize)]
pub struct HostEventIn {
    pub event: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}
