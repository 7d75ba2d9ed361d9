use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::core::emision::{self, ResultadoEmision};
use crate::core::Contexto;
use crate::error::ApiError;
use crate::http::auth::EmisorApi;
use crate::http::handlers::estructura;
use crate::models::{Factura, FacturaInput};

/// Emision sincrona: la factura vuelve FIRMADO, con clave de acceso y
/// artefactos ya subidos. Pensado para integraciones de sistemas.
pub async fn emitir(
    State(ctx): State<Contexto>,
    EmisorApi(emisor): EmisorApi,
    Json(raw): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<ResultadoEmision>), ApiError> {
    let input: FacturaInput = serde_json::from_value(raw)
        .map_err(|e| ApiError::Validacion(format!("payload de factura invalido: {e}")))?;

    let resultado = emision::emitir_factura(&ctx, emisor.id, &input, None).await?;
    Ok((StatusCode::CREATED, Json(resultado)))
}

/// Resumen del emisor + sus ultimas 20 facturas.
pub async fn estado(
    State(ctx): State<Contexto>,
    EmisorApi(emisor): EmisorApi,
) -> Result<Json<serde_json::Value>, ApiError> {
    let balance: i64 = sqlx::query_scalar("SELECT balance FROM creditos WHERE emisor_id = $1")
        .bind(emisor.id)
        .fetch_optional(&ctx.pool)
        .await?
        .unwrap_or(0);

    let facturas = sqlx::query_as::<_, Factura>(
        "SELECT * FROM facturas WHERE emisor_id = $1 ORDER BY created_at DESC LIMIT 20",
    )
    .bind(emisor.id)
    .fetch_all(&ctx.pool)
    .await?;

    Ok(Json(json!({
        "ruc": emisor.ruc,
        "razon_social": emisor.razon_social,
        "ambiente": emisor.ambiente,
        "firma_cargada": emisor.p12_path.is_some(),
        "firma_expiracion": emisor.p12_expiracion,
        "creditos": balance,
        "facturas": facturas,
    })))
}

/// Igual que /structure/validate pero autenticado por API key.
pub async fn validar(
    State(ctx): State<Contexto>,
    EmisorApi(emisor): EmisorApi,
    Json(body): Json<estructura::ValidarBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let valido =
        estructura::par_valido(&ctx.pool, emisor.id, &body.establecimiento, &body.punto_emision)
            .await?;
    Ok(Json(json!({ "valido": valido })))
}
