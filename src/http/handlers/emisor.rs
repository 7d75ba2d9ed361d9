use axum::extract::{Multipart, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::core::Contexto;
use crate::crypto;
use crate::error::ApiError;
use crate::http::auth::Identidad;
use crate::sri::certificado::cargar_credencial;
use crate::storage::rutas;

/// Perfil del emisor: identidad tributaria, estado de la firma y saldo.
pub async fn perfil(
    State(ctx): State<Contexto>,
    identidad: Identidad,
) -> Result<Json<serde_json::Value>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;

    let balance: i64 = sqlx::query_scalar("SELECT balance FROM creditos WHERE emisor_id = $1")
        .bind(emisor.id)
        .fetch_optional(&ctx.pool)
        .await?
        .unwrap_or(0);

    let total_facturas: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facturas WHERE emisor_id = $1")
        .bind(emisor.id)
        .fetch_one(&ctx.pool)
        .await?;

    Ok(Json(json!({
        "emisor": {
            "id": emisor.id,
            "ruc": emisor.ruc,
            "razon_social": emisor.razon_social,
            "nombre_comercial": emisor.nombre_comercial,
            "direccion_matriz": emisor.direccion_matriz,
            "ambiente": emisor.ambiente,
            "obligado_contabilidad": emisor.obligado_contabilidad,
        },
        "firma": {
            "cargada": emisor.p12_path.is_some(),
            "expiracion": emisor.p12_expiracion,
        },
        "creditos": balance,
        "facturas_emitidas": total_facturas,
    })))
}

/// Recibe el P12 (multipart: `file` + `password`), lo valida abriendolo,
/// verifica el RUC del titular y lo guarda con el password cifrado.
pub async fn subir_p12(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;

    let mut p12: Option<Vec<u8>> = None;
    let mut password: Option<String> = None;

    while let Some(campo) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validacion(format!("multipart invalido: {e}")))?
    {
        let nombre = campo.name().map(|n| n.to_string());
        match nombre.as_deref() {
            Some("file") | Some("p12") => {
                let datos = campo
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validacion(format!("archivo invalido: {e}")))?;
                p12 = Some(datos.to_vec());
            }
            Some("password") => {
                password = Some(
                    campo
                        .text()
                        .await
                        .map_err(|e| ApiError::Validacion(format!("password invalido: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let p12 = p12.ok_or_else(|| ApiError::Validacion("falta el archivo P12".into()))?;
    let password = password.ok_or_else(|| ApiError::Validacion("falta el password".into()))?;

    // Abrir el contenedor valida el password y selecciona el certificado.
    let credencial = cargar_credencial(&p12, &password)?;
    credencial.verificar_vigencia(Utc::now())?;
    credencial.verificar_ruc(&emisor.ruc)?;

    let (bucket, key) = rutas::certificado(&emisor.ruc, Utc::now().timestamp());
    let p12_path = ctx
        .store
        .put(bucket, &key, p12, "application/x-pkcs12")
        .await?;

    let password_cifrada = crypto::cifrar_password(&password, &ctx.config.encryption_key);

    sqlx::query(
        r#"UPDATE emisores
              SET p12_path = $2, p12_password_cifrada = $3, p12_expiracion = $4,
                  updated_at = now()
            WHERE id = $1"#,
    )
    .bind(emisor.id)
    .bind(&p12_path)
    .bind(&password_cifrada)
    .bind(credencial.expira)
    .execute(&ctx.pool)
    .await?;

    info!(emisor_id = emisor.id, sujeto = %credencial.sujeto, "P12 cargado");

    Ok(Json(json!({
        "sujeto": credencial.sujeto,
        "expiracion": credencial.expira,
        "ruta": p12_path,
    })))
}

#[derive(Deserialize)]
pub struct ConfigBody {
    #[serde(default)]
    pub ambiente: Option<String>,
    #[serde(rename = "nombreComercial", default)]
    pub nombre_comercial: Option<String>,
    #[serde(rename = "direccionMatriz", default)]
    pub direccion_matriz: Option<String>,
}

/// Actualiza ambiente, nombre comercial o direccion del emisor.
pub async fn actualizar_config(
    State(ctx): State<Contexto>,
    identidad: Identidad,
    Json(body): Json<ConfigBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let emisor = identidad.emisor(&ctx).await?;

    if let Some(ambiente) = &body.ambiente {
        if !matches!(ambiente.as_str(), "1" | "2") {
            return Err(ApiError::Validacion("ambiente debe ser 1 o 2".into()));
        }
    }

    sqlx::query(
        r#"UPDATE emisores
              SET ambiente = COALESCE($2, ambiente),
                  nombre_comercial = COALESCE($3, nombre_comercial),
                  direccion_matriz = COALESCE($4, direccion_matriz),
                  updated_at = now()
            WHERE id = $1"#,
    )
    .bind(emisor.id)
    .bind(&body.ambiente)
    .bind(&body.nombre_comercial)
    .bind(&body.direccion_matriz)
    .execute(&ctx.pool)
    .await?;

    Ok(Json(json!({ "actualizado": true })))
}
