use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::Contexto;
use crate::crypto;
use crate::error::ApiError;
use crate::http::auth::Identidad;
use crate::models::ApiKey;

/// Lista las API keys del emisor (prefijo y metadata; el hash no sale).
pub async fn listar(
    State(ctx): State<Contexto>,
    identidad: Identidad,
) -> Result<Json<Vec<ApiKey>>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;
    let filas = sqlx::query_as::<_, ApiKey>(
        "SELECT * FROM api_keys WHERE emisor_id = $1 ORDER BY created_at DESC",
    )
    .bind(emisor.id)
    .fetch_all(&ctx.pool)
    .await?;
    Ok(Json(filas))
}

#[derive(Deserialize)]
pub struct CrearClaveBody {
    pub nombre: String,
}

/// Crea una API key. La clave en claro se devuelve UNA sola vez; despues
/// solo queda el hash y el prefijo.
pub async fn crear(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Json(body): Json<CrearClaveBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.nombre.trim().is_empty() {
        return Err(ApiError::Validacion("nombre es requerido".into()));
    }
    let emisor = identidad.emisor(&ctx).await?;

    let (cruda, prefijo, hash) = crypto::generar_api_key();

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO api_keys (emisor_id, key_hash, key_prefix, nombre) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(emisor.id)
    .bind(&hash)
    .bind(&prefijo)
    .bind(body.nombre.trim())
    .fetch_one(&ctx.pool)
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "nombre": body.nombre.trim(),
            "prefijo": prefijo,
            // Unica vez que la clave viaja en claro.
            "api_key": cruda,
        })),
    ))
}

/// Revoca una API key del emisor.
pub async fn revocar(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;

    let filas = sqlx::query("UPDATE api_keys SET revocada = TRUE WHERE id = $1 AND emisor_id = $2")
        .bind(id)
        .bind(emisor.id)
        .execute(&ctx.pool)
        .await?
        .rows_affected();

    if filas == 0 {
        return Err(ApiError::NoEncontrado("api key"));
    }
    Ok(Json(json!({ "revocada": true })))
}
