use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::core::{emision, Contexto};
use crate::error::ApiError;
use crate::http::auth::Identidad;
use crate::models::{Factura, FacturaInput};

/// Encola una factura en PENDIENTE; el worker la firma y la lleva por el
/// pipeline de liquidacion. El JSON crudo se conserva como auditoria.
pub async fn emitir(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Json(raw): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let emisor = identidad.emisor(&ctx).await?;

    let input: FacturaInput = serde_json::from_value(raw.clone())
        .map_err(|e| ApiError::Validacion(format!("payload de factura invalido: {e}")))?;

    let factura_id = emision::encolar_factura(&ctx, emisor.id, &input, &raw).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "invoice_id": factura_id, "estado": "PENDIENTE" })),
    ))
}

/// Ultimas 50 facturas del emisor.
pub async fn historial(
    State(ctx): State<Contexto>,
    identidad: Identidad,
) -> Result<Json<Vec<Factura>>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;
    let filas = sqlx::query_as::<_, Factura>(
        "SELECT * FROM facturas WHERE emisor_id = $1 ORDER BY created_at DESC LIMIT 50",
    )
    .bind(emisor.id)
    .fetch_all(&ctx.pool)
    .await?;
    Ok(Json(filas))
}
