use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Evento de cambio de estado que se publica al webhook configurado.
#[derive(Debug, Clone, Serialize)]
pub struct EventoFactura {
    pub user_uid: String,
    pub invoice_id: i64,
    pub clave_acceso: String,
    pub estado: String,
    pub mensaje_sri: Option<String>,
    pub fecha: DateTime<Utc>,
}

/// Publica transiciones terminales a un webhook. Entrega at-most-once: los
/// fallos se registran y se descartan, nunca bloquean al worker.
#[derive(Clone)]
pub struct Notificador {
    http: reqwest::Client,
    url: Option<String>,
}

impl Notificador {
    pub fn nuevo(url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("configuracion estatica del cliente http");
        Self { http, url }
    }

    pub async fn notificar(&self, evento: &EventoFactura) {
        let Some(url) = &self.url else {
            debug!(invoice_id = evento.invoice_id, "webhook no configurado, evento descartado");
            return;
        };

        match self.http.post(url).json(evento).send().await {
            Ok(respuesta) if respuesta.status().is_success() => {
                debug!(invoice_id = evento.invoice_id, estado = %evento.estado, "webhook notificado");
            }
            Ok(respuesta) => {
                warn!(
                    invoice_id = evento.invoice_id,
                    status = %respuesta.status(),
                    "webhook respondio con error"
                );
            }
            Err(e) => {
                warn!(invoice_id = evento.invoice_id, error = %e, "fallo notificando webhook");
            }
        }
    }
}
