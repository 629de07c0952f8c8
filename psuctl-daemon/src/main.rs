/**
 * PSUCTL DAEMON - Point d'entrée principal du service
 *
 * RÔLE : Orchestration de tous les modules : config, MQTT, contrôleur PSU,
 * API REST. Bootstrap du système complet avec gestion d'erreurs et logging.
 *
 * ARCHITECTURE : Event-driven via MQTT (flux G-code + événements hôte) +
 * poll loop d'état + timers idle + API REST de commande.
 */

mod backends;
mod config;
mod controller;
mod events;
mod gpio;
mod http;
mod idle;
mod models;
mod mqtt;
mod printer;
mod state;

use crate::backends::BackendRegistry;
use crate::config::load_config;
use crate::controller::PsuController;
use crate::events::MqttEventSink;
use crate::http::AppState;
use crate::printer::MqttPrinterBridge;
use crate::state::new_state;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // config partagée
    let cfg_loaded = load_config().await;
    let cfg = new_state(cfg_loaded.clone());

    // client MQTT partagé (événements + bridge imprimante + flux G-code)
    let (mqtt_client, eventloop) = mqtt::create_mqtt_client(&cfg_loaded);

    // registre des backends délégués (les intégrations tierces s'y enregistrent)
    let registry = Arc::new(BackendRegistry::new());

    // collaborateurs
    let bridge = Arc::new(MqttPrinterBridge::new(mqtt_client.clone()));
    let events = Arc::new(MqttEventSink::new(mqtt_client.clone()));

    // contrôleur PSU : broches configurées, timer idle armé si besoin
    let controller = PsuController::new(cfg.clone(), registry.clone(), bridge.clone(), events);
    controller.apply_config(cfg_loaded.clone());

    // MQTT : flux G-code + réponses imprimante + événements hôte
    mqtt::spawn_mqtt_listener(controller.clone(), bridge.clone(), mqtt_client, eventloop);

    // poll loop d'état PSU
    controller.spawn_state_poller();

    // HTTP
    let app_state = AppState { controller: controller.clone(), cfg };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg_loaded.http_port));
    info!("psuctl-daemon listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
