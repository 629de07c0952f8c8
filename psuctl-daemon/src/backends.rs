/**
 * BACKENDS DÉLÉGUÉS - Registre des backends PSU tiers
 *
 * RÔLE :
 * Ce module permet à un composant tiers d'exposer ses capacités de
 * commutation et/ou de sensing du PSU (relais propriétaire, prise
 * connectée, carte relais...). L'orchestrateur ne sonde jamais la
 * présence d'une méthode à l'exécution : chaque capacité est un
 * accesseur typé, et son absence une erreur typée.
 *
 * FONCTIONNEMENT :
 * - register(id, backend) : premier arrivé, premier servi, jamais remplacé
 * - durée de vie = process, pas de désenregistrement
 * - les échecs d'appel sont remontés à l'appelant qui logge et abandonne
 */

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Erreurs possibles lors d'un appel à un backend délégué
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {0} is configured but it is not registered.")]
    NotRegistered(String),
    #[error("Backend {id} is configured but {capability} is not provided.")]
    MissingCapability { id: String, capability: &'static str },
    #[error("Error while executing backend {id} callback: {source}")]
    Callback {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Capacité de commutation du PSU
pub trait PsuSwitch: Send + Sync {
    fn turn_on(&self) -> Result<()>;
    fn turn_off(&self) -> Result<()>;
}

/// Capacité de lecture de l'état réel du PSU
pub trait PsuSense: Send + Sync {
    fn read_state(&self) -> Result<bool>;
}

/// Backend délégué : expose zéro, une ou deux capacités.
pub trait PsuBackend: Send + Sync {
    fn switching(&self) -> Option<&dyn PsuSwitch> {
        None
    }
    fn sensing(&self) -> Option<&dyn PsuSense> {
        None
    }
}

/// Registre central des backends délégués
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn PsuBackend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Enregistre un backend. No-op si l'identifiant est déjà pris.
    pub fn register(&self, id: &str, backend: Arc<dyn PsuBackend>) {
        let mut map = self.backends.write();
        if map.contains_key(id) {
            debug!("backend {} already registered, keeping first registration", id);
            return;
        }
        info!("Registered backend - {}", id);
        map.insert(id.to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn PsuBackend>> {
        self.backends.read().get(id).cloned()
    }

    /// Commute le PSU via le backend `id`.
    pub fn switch(&self, id: &str, on: bool) -> Result<(), BackendError> {
        let backend = self
            .get(id)
            .ok_or_else(|| BackendError::NotRegistered(id.to_string()))?;
        let switching = backend.switching().ok_or_else(|| BackendError::MissingCapability {
            id: id.to_string(),
            capability: if on { "turn_on" } else { "turn_off" },
        })?;
        let r = if on {
            switching.turn_on()
        } else {
            switching.turn_off()
        };
        r.map_err(|source| BackendError::Callback {
            id: id.to_string(),
            source,
        })
    }

    /// Lit l'état du PSU via le backend `id`.
    pub fn read_state(&self, id: &str) -> Result<bool, BackendError> {
        let backend = self
            .get(id)
            .ok_or_else(|| BackendError::NotRegistered(id.to_string()))?;
        let sensing = backend.sensing().ok_or_else(|| BackendError::MissingCapability {
            id: id.to_string(),
            capability: "read_state",
        })?;
        sensing.read_state().map_err(|source| BackendError::Callback {
            id: id.to_string(),
            source,
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
