use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::core::Contexto;
use crate::error::ApiError;
use crate::http::auth::Identidad;
use crate::models::{self, Perfil};

#[derive(Deserialize, Default)]
pub struct SyncBody {
    #[serde(default)]
    pub email: Option<String>,
}

/// Crea o recupera el perfil del usuario autenticado e indica si falta el
/// onboarding (activar un RUC). El cuerpo es opcional: puede traer el email
/// preferido del perfil.
pub async fn sync(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    cuerpo: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let email = serde_json::from_slice::<SyncBody>(&cuerpo)
        .ok()
        .and_then(|b| b.email)
        .or(identidad.email.clone());

    let perfil: Perfil = sqlx::query_as(
        r#"INSERT INTO perfiles (user_uid, email) VALUES ($1, $2)
           ON CONFLICT (user_uid)
           DO UPDATE SET email = COALESCE(EXCLUDED.email, perfiles.email)
           RETURNING *"#,
    )
    .bind(&identidad.user_uid)
    .bind(&email)
    .fetch_one(&ctx.pool)
    .await?;

    Ok(Json(json!({
        "user_uid": perfil.user_uid,
        "email": perfil.email,
        "emisor_id": perfil.emisor_id,
        "requiere_onboarding": perfil.emisor_id.is_none(),
    })))
}

#[derive(Deserialize)]
pub struct ActivarRucBody {
    pub ruc: String,
    #[serde(rename = "razonSocial")]
    pub razon_social: String,
    pub direccion: String,
    #[serde(default)]
    pub ambiente: Option<String>,
    #[serde(rename = "obligadoContabilidad", default)]
    pub obligado_contabilidad: Option<String>,
}

/// Activa un RUC: crea el emisor con su establecimiento 001, punto de
/// emision 100 y los creditos iniciales, y lo liga al perfil del usuario.
pub async fn activar_ruc(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Json(body): Json<ActivarRucBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !models::ruc_valido(&body.ruc) {
        return Err(ApiError::Validacion("ruc debe tener 13 digitos".into()));
    }
    if body.razon_social.trim().is_empty() {
        return Err(ApiError::Validacion("razonSocial es requerida".into()));
    }
    let ambiente = body.ambiente.as_deref().unwrap_or("1");
    if !matches!(ambiente, "1" | "2") {
        return Err(ApiError::Validacion("ambiente debe ser 1 o 2".into()));
    }
    let obligado = body.obligado_contabilidad.as_deref().unwrap_or("NO");
    if !matches!(obligado, "SI" | "NO") {
        return Err(ApiError::Validacion("obligadoContabilidad debe ser SI o NO".into()));
    }

    let perfil = identidad.perfil(&ctx).await?;
    if perfil.emisor_id.is_some() {
        return Err(ApiError::Conflicto("el perfil ya tiene un RUC activado".into()));
    }

    let mut tx = ctx.pool.begin().await?;

    let emisor_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO emisores (ruc, razon_social, direccion_matriz, ambiente, obligado_contabilidad)
           VALUES ($1, $2, $3, $4, $5) RETURNING id"#,
    )
    .bind(&body.ruc)
    .bind(body.razon_social.trim())
    .bind(&body.direccion)
    .bind(ambiente)
    .bind(obligado)
    .fetch_one(&mut *tx)
    .await?;

    let establecimiento_id: i64 = sqlx::query_scalar(
        "INSERT INTO establecimientos (emisor_id, codigo, direccion) VALUES ($1, '001', $2) RETURNING id",
    )
    .bind(emisor_id)
    .bind(&body.direccion)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO puntos_emision (establecimiento_id, codigo) VALUES ($1, '100')")
        .bind(establecimiento_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("INSERT INTO creditos (emisor_id, balance) VALUES ($1, $2)")
        .bind(emisor_id)
        .bind(ctx.config.creditos_iniciales)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO transacciones_log (emisor_id, tipo, cantidad, detalle)
         VALUES ($1, 'SEED', $2, 'creditos iniciales de activacion')",
    )
    .bind(emisor_id)
    .bind(ctx.config.creditos_iniciales)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE perfiles SET emisor_id = $1 WHERE id = $2")
        .bind(emisor_id)
        .bind(perfil.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(emisor_id, ruc = %body.ruc, "RUC activado");

    Ok(Json(json!({
        "emisor_id": emisor_id,
        "ruc": body.ruc,
        "establecimiento": "001",
        "punto_emision": "100",
        "creditos": ctx.config.creditos_iniciales,
    })))
}
