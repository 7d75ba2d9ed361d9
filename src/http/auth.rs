//! Extractores de autenticacion: token bearer del proveedor de identidad,
//! API key de integraciones y llave estatica de servicio.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use crate::core::Contexto;
use crate::crypto;
use crate::error::ApiError;
use crate::models::{Emisor, Perfil};

/// Identidad verificada contra el proveedor externo.
#[derive(Debug, Clone)]
pub struct Identidad {
    pub user_uid: String,
    pub email: Option<String>,
}

#[derive(Deserialize)]
struct ClaimsIdentidad {
    uid: String,
    #[serde(default)]
    email: Option<String>,
}

impl FromRequestParts<Contexto> for Identidad {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, ctx: &Contexto) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::TokenInvalido)?;

        // La verificacion del token la hace el proveedor de identidad; aqui
        // solo se reenvia y se confia en su veredicto.
        let respuesta = ctx
            .http
            .get(&ctx.config.identidad_url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "proveedor de identidad inalcanzable");
                ApiError::TokenInvalido
            })?;

        if !respuesta.status().is_success() {
            return Err(ApiError::TokenInvalido);
        }

        let claims: ClaimsIdentidad = respuesta.json().await.map_err(|_| ApiError::TokenInvalido)?;
        Ok(Identidad {
            user_uid: claims.uid,
            email: claims.email,
        })
    }
}

impl Identidad {
    /// Perfil del usuario, si ya paso por /auth/sync.
    pub async fn perfil(&self, ctx: &Contexto) -> Result<Perfil, ApiError> {
        sqlx::query_as::<_, Perfil>("SELECT * FROM perfiles WHERE user_uid = $1")
            .bind(&self.user_uid)
            .fetch_optional(&ctx.pool)
            .await?
            .ok_or(ApiError::NoEncontrado("perfil"))
    }

    /// Emisor del usuario; falla si no completo el onboarding.
    pub async fn emisor(&self, ctx: &Contexto) -> Result<Emisor, ApiError> {
        sqlx::query_as::<_, Emisor>(
            r#"SELECT e.* FROM emisores e
                 JOIN perfiles p ON p.emisor_id = e.id
                WHERE p.user_uid = $1"#,
        )
        .bind(&self.user_uid)
        .fetch_optional(&ctx.pool)
        .await?
        .ok_or(ApiError::NoEncontrado("emisor"))
    }
}

/// Emisor autenticado por API key (`x-api-key`).
pub struct EmisorApi(pub Emisor);

impl FromRequestParts<Contexto> for EmisorApi {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, ctx: &Contexto) -> Result<Self, Self::Rejection> {
        let cruda = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::ApiKeyInvalida)?;

        let hash = crypto::hash_api_key(cruda);
        let emisor = sqlx::query_as::<_, Emisor>(
            r#"SELECT e.* FROM emisores e
                 JOIN api_keys k ON k.emisor_id = e.id
                WHERE k.key_hash = $1 AND NOT k.revocada"#,
        )
        .bind(&hash)
        .fetch_optional(&ctx.pool)
        .await?
        .ok_or(ApiError::ApiKeyInvalida)?;

        // Marca de ultimo uso, best-effort.
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = $1 WHERE key_hash = $2")
            .bind(Utc::now())
            .bind(&hash)
            .execute(&ctx.pool)
            .await;

        Ok(EmisorApi(emisor))
    }
}

/// Llave estatica de servicio (`x-n8n-key`) para operaciones administrativas.
pub struct LlaveServicio;

impl FromRequestParts<Contexto> for LlaveServicio {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, ctx: &Contexto) -> Result<Self, Self::Rejection> {
        let llave = parts
            .headers
            .get("x-n8n-key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::LlaveServicioInvalida)?;

        if llave != ctx.config.n8n_api_key {
            return Err(ApiError::LlaveServicioInvalida);
        }
        Ok(LlaveServicio)
    }
}
