use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Llave de integracion de un emisor. Solo se persiste el SHA-256 de la
/// clave cruda; el prefijo queda para mostrar y filtrar.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub emisor_id: i64,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub nombre: String,
    pub revocada: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Entrada de auditoria de creditos (recargas y ajustes). Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransaccionLog {
    pub id: i64,
    pub emisor_id: i64,
    pub tipo: String,
    pub cantidad: i64,
    pub detalle: Option<String>,
    pub created_at: DateTime<Utc>,
}
