//! Superficie HTTP del backend. Tres modos de autenticacion: token bearer
//! del proveedor de identidad, API key de integraciones y llave estatica de
//! servicio; los endpoints /public y /health son abiertos.

pub mod auth;
pub mod handlers;

use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use crate::core::Contexto;

/// Limite de cuerpo: los P12 pesan pocos KB, 4 MB da margen de sobra.
const LIMITE_BODY: usize = 4 * 1024 * 1024;

static INICIO: OnceLock<Instant> = OnceLock::new();

pub fn router(ctx: Contexto) -> Router {
    INICIO.get_or_init(Instant::now);

    Router::new()
        .route("/auth/sync", post(handlers::auth::sync))
        .route("/auth/activar-ruc", post(handlers::auth::activar_ruc))
        .route("/emitter/profile", get(handlers::emisor::perfil))
        .route("/emitter/upload-p12", post(handlers::emisor::subir_p12))
        .route("/emitter/config", patch(handlers::emisor::actualizar_config))
        .route(
            "/structure/establishments",
            get(handlers::estructura::listar_establecimientos)
                .post(handlers::estructura::crear_establecimiento),
        )
        .route(
            "/structure/issuing-points",
            get(handlers::estructura::listar_puntos).post(handlers::estructura::crear_punto),
        )
        .route("/structure/tree", get(handlers::estructura::arbol))
        .route("/structure/validate", post(handlers::estructura::validar))
        .route("/invoices/emit", post(handlers::facturas::emitir))
        .route("/invoices/history", get(handlers::facturas::historial))
        .route("/integrations/invoice", post(handlers::integraciones::emitir))
        .route("/integrations/status", get(handlers::integraciones::estado))
        .route("/integrations/validate", post(handlers::integraciones::validar))
        .route("/keys", get(handlers::claves::listar).post(handlers::claves::crear))
        .route("/keys/{id}", delete(handlers::claves::revocar))
        .route("/admin/topup", post(handlers::admin::topup))
        .route("/public/pdf/{clave}", get(handlers::publico::pdf))
        .route("/public/xml/{clave}", get(handlers::publico::xml))
        .route("/health", get(salud))
        .layer(DefaultBodyLimit::max(LIMITE_BODY))
        .with_state(ctx)
}

async fn salud() -> Json<serde_json::Value> {
    let uptime = INICIO.get().map(|i| i.elapsed().as_secs()).unwrap_or(0);
    Json(json!({
        "status": "ok",
        "uptime": uptime,
        "timestamp": Utc::now(),
    }))
}
