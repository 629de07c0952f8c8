/**
 * API REST PSUCTL - Surface de commande HTTP du daemon
 *
 * RÔLE :
 * Expose la petite surface RPC du PSU pour le dashboard, les scripts et
 * les outils d'admin : état, on/off/toggle, rechargement de config.
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes les routes sauf /health
 * - Clé control (PSUCTL_API_KEY) requise pour on/off/toggle/reload
 * - Clé status (PSUCTL_STATUS_API_KEY) OU control pour la lecture d'état
 * - Clé control absente de l'environnement = accès refusé partout
 */

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{load_config, PsuConfig};
use crate::controller::PsuController;
use crate::state::Shared;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<PsuController>,
    pub cfg: Shared<PsuConfig>,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let control = std::env::var("PSUCTL_API_KEY").unwrap_or_default();
    let status = std::env::var("PSUCTL_STATUS_API_KEY").unwrap_or_default();
    if control.is_empty() {
        error!("SECURITY: PSUCTL_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    // la lecture d'état accepte aussi la clé status
    let read_only = req.method() == Method::GET && path == "/psu";
    let ok = if read_only {
        provided == control || (!status.is_empty() && provided == status)
    } else {
        provided == control
    };

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/psu", get(get_psu_state))
        .route("/psu/on", post(turn_psu_on))
        .route("/psu/off", post(turn_psu_off))
        .route("/psu/toggle", post(toggle_psu))
        .route("/config", get(get_config))
        .route("/config/reload", post(reload_config))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /psu (état courant)
async fn get_psu_state(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "is_on": app.controller.is_on() }))
}

// POST /psu/on
async fn turn_psu_on(State(app): State<AppState>) -> StatusCode {
    app.controller.turn_psu_on().await;
    StatusCode::NO_CONTENT
}

// POST /psu/off
async fn turn_psu_off(State(app): State<AppState>) -> StatusCode {
    app.controller.turn_psu_off().await;
    StatusCode::NO_CONTENT
}

// POST /psu/toggle
async fn toggle_psu(State(app): State<AppState>) -> StatusCode {
    app.controller.toggle().await;
    StatusCode::NO_CONTENT
}

// GET /config (snapshot courant)
async fn get_config(State(app): State<AppState>) -> Json<PsuConfig> {
    Json(app.cfg.lock().clone())
}

// POST /config/reload (seul point de remise à zéro complet)
async fn reload_config(State(app): State<AppState>) -> Json<serde_json::Value> {
    let new_cfg = load_config().await;
    app.controller.apply_config(new_cfg);
    info!("configuration reloaded");
    Json(serde_json::json!({ "status": "reloaded" }))
}
