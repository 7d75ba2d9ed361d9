use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::core::Contexto;
use crate::error::ApiError;
use crate::http::auth::LlaveServicio;

#[derive(Deserialize)]
pub struct TopupBody {
    pub ruc: String,
    pub cantidad: i64,
    #[serde(default)]
    pub motivo: Option<String>,
}

/// Recarga de creditos con registro de auditoria. Solo para el servicio de
/// cobros (llave x-n8n-key).
pub async fn topup(
    State(ctx): State<Contexto>,
    _llave: LlaveServicio,
    Json(body): Json<TopupBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.cantidad <= 0 {
        return Err(ApiError::Validacion("cantidad debe ser positiva".into()));
    }

    let mut tx = ctx.pool.begin().await?;

    let emisor_id: i64 = sqlx::query_scalar("SELECT id FROM emisores WHERE ruc = $1")
        .bind(&body.ruc)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NoEncontrado("emisor"))?;

    let balance: i64 = sqlx::query_scalar(
        "UPDATE creditos SET balance = balance + $2, updated_at = now()
          WHERE emisor_id = $1 RETURNING balance",
    )
    .bind(emisor_id)
    .bind(body.cantidad)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO transacciones_log (emisor_id, tipo, cantidad, detalle) VALUES ($1, 'TOPUP', $2, $3)",
    )
    .bind(emisor_id)
    .bind(body.cantidad)
    .bind(&body.motivo)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(emisor_id, cantidad = body.cantidad, balance, "recarga de creditos");

    Ok(Json(json!({ "ruc": body.ruc, "balance": balance })))
}
