pub mod emision;
pub mod notificar;
pub mod worker;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::storage::ArtifactStore;
use notificar::Notificador;

/// Dependencias compartidas entre el pipeline de emision, el worker y el
/// servidor HTTP.
#[derive(Clone)]
pub struct Contexto {
    pub pool: PgPool,
    pub store: ArtifactStore,
    pub config: Arc<Config>,
    pub notificador: Notificador,
    /// Cliente compartido para el proveedor de identidad.
    pub http: reqwest::Client,
}

impl Contexto {
    pub fn nuevo(pool: PgPool, store: ArtifactStore, config: Arc<Config>) -> Self {
        let notificador = Notificador::nuevo(config.webhook_notificaciones.clone());
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("configuracion estatica del cliente http");
        Self {
            pool,
            store,
            config,
            notificador,
            http,
        }
    }
}
