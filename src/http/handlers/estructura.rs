use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;

use crate::core::Contexto;
use crate::error::ApiError;
use crate::http::auth::Identidad;
use crate::models::{self, Establecimiento, PuntoEmision};

pub async fn listar_establecimientos(
    State(ctx): State<Contexto>,
    identidad: Identidad,
) -> Result<Json<Vec<Establecimiento>>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;
    let filas = sqlx::query_as::<_, Establecimiento>(
        "SELECT * FROM establecimientos WHERE emisor_id = $1 ORDER BY codigo",
    )
    .bind(emisor.id)
    .fetch_all(&ctx.pool)
    .await?;
    Ok(Json(filas))
}

#[derive(Deserialize)]
pub struct CrearEstablecimientoBody {
    pub codigo: String,
    #[serde(default)]
    pub direccion: Option<String>,
}

pub async fn crear_establecimiento(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Json(body): Json<CrearEstablecimientoBody>,
) -> Result<Json<Establecimiento>, ApiError> {
    if !models::codigo_valido(&body.codigo) {
        return Err(ApiError::Validacion("codigo debe ser 3 digitos".into()));
    }
    let emisor = identidad.emisor(&ctx).await?;

    // El codigo duplicado por emisor cae como 409 via la restriccion unica.
    let fila = sqlx::query_as::<_, Establecimiento>(
        "INSERT INTO establecimientos (emisor_id, codigo, direccion) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(emisor.id)
    .bind(&body.codigo)
    .bind(&body.direccion)
    .fetch_one(&ctx.pool)
    .await?;
    Ok(Json(fila))
}

pub async fn listar_puntos(
    State(ctx): State<Contexto>,
    identidad: Identidad,
) -> Result<Json<Vec<PuntoEmision>>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;
    let filas = sqlx::query_as::<_, PuntoEmision>(
        r#"SELECT p.* FROM puntos_emision p
             JOIN establecimientos es ON es.id = p.establecimiento_id
            WHERE es.emisor_id = $1 ORDER BY es.codigo, p.codigo"#,
    )
    .bind(emisor.id)
    .fetch_all(&ctx.pool)
    .await?;
    Ok(Json(filas))
}

#[derive(Deserialize)]
pub struct CrearPuntoBody {
    pub establecimiento: String,
    pub codigo: String,
}

pub async fn crear_punto(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Json(body): Json<CrearPuntoBody>,
) -> Result<Json<PuntoEmision>, ApiError> {
    if !models::codigo_valido(&body.codigo) {
        return Err(ApiError::Validacion("codigo debe ser 3 digitos".into()));
    }
    let emisor = identidad.emisor(&ctx).await?;

    // El establecimiento debe pertenecer al emisor autenticado.
    let establecimiento_id: i64 = sqlx::query_scalar(
        "SELECT id FROM establecimientos WHERE emisor_id = $1 AND codigo = $2",
    )
    .bind(emisor.id)
    .bind(&body.establecimiento)
    .fetch_optional(&ctx.pool)
    .await?
    .ok_or(ApiError::NoEncontrado("establecimiento"))?;

    let fila = sqlx::query_as::<_, PuntoEmision>(
        "INSERT INTO puntos_emision (establecimiento_id, codigo) VALUES ($1, $2) RETURNING *",
    )
    .bind(establecimiento_id)
    .bind(&body.codigo)
    .fetch_one(&ctx.pool)
    .await?;
    Ok(Json(fila))
}

/// Vista jerarquica: establecimientos con sus puntos de emision.
pub async fn arbol(
    State(ctx): State<Contexto>,
    identidad: Identidad,
) -> Result<Json<serde_json::Value>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;

    let establecimientos = sqlx::query_as::<_, Establecimiento>(
        "SELECT * FROM establecimientos WHERE emisor_id = $1 ORDER BY codigo",
    )
    .bind(emisor.id)
    .fetch_all(&ctx.pool)
    .await?;

    let puntos = sqlx::query_as::<_, PuntoEmision>(
        r#"SELECT p.* FROM puntos_emision p
             JOIN establecimientos es ON es.id = p.establecimiento_id
            WHERE es.emisor_id = $1 ORDER BY p.codigo"#,
    )
    .bind(emisor.id)
    .fetch_all(&ctx.pool)
    .await?;

    let ramas: Vec<serde_json::Value> = establecimientos
        .iter()
        .map(|es| {
            let hijos: Vec<&PuntoEmision> = puntos
                .iter()
                .filter(|p| p.establecimiento_id == es.id)
                .collect();
            json!({
                "codigo": es.codigo,
                "direccion": es.direccion,
                "puntos_emision": hijos,
            })
        })
        .collect();

    Ok(Json(json!({ "ruc": emisor.ruc, "establecimientos": ramas })))
}

#[derive(Deserialize)]
pub struct ValidarBody {
    pub establecimiento: String,
    #[serde(rename = "puntoEmision")]
    pub punto_emision: String,
}

/// Existe el par (establecimiento, punto) para este emisor?
pub async fn validar(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Json(body): Json<ValidarBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;
    let valido = par_valido(&ctx.pool, emisor.id, &body.establecimiento, &body.punto_emision).await?;
    Ok(Json(json!({ "valido": valido })))
}

pub async fn par_valido(
    pool: &PgPool,
    emisor_id: i64,
    establecimiento: &str,
    punto: &str,
) -> Result<bool, ApiError> {
    let existe: Option<i64> = sqlx::query_scalar(
        r#"SELECT p.id FROM puntos_emision p
             JOIN establecimientos es ON es.id = p.establecimiento_id
            WHERE es.emisor_id = $1 AND es.codigo = $2 AND p.codigo = $3"#,
    )
    .bind(emisor_id)
    .bind(establecimiento)
    .bind(punto)
    .fetch_optional(pool)
    .await?;
    Ok(existe.is_some())
}
