use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::sri::certificado::CredencialError;
use crate::sri::clave_acceso::ClaveError;
use crate::sri::firma::FirmaError;
use crate::storage::StorageError;

/// Error central del backend. Cada variante mapea a un codigo HTTP fijo;
/// los errores de infraestructura se colapsan en `Interno` y nunca exponen
/// detalles al cliente.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Datos del cliente no pasan las reglas de forma (RUC, codigos, items).
    #[error("validacion: {0}")]
    Validacion(String),

    /// Token del proveedor de identidad invalido o expirado.
    #[error("token invalido")]
    TokenInvalido,

    /// API key ausente, desconocida o revocada.
    #[error("api key invalida")]
    ApiKeyInvalida,

    /// Llave de servicio (x-n8n-key) incorrecta.
    #[error("llave de servicio invalida")]
    LlaveServicioInvalida,

    /// Problemas con el certificado de firma del emisor.
    #[error("credencial: {0}")]
    Credencial(#[from] CredencialError),

    /// El emisor no tiene certificado cargado.
    #[error("el emisor no tiene firma electronica cargada")]
    CredencialFaltante,

    /// La firma electronica del emisor esta vencida.
    #[error("firma expirada")]
    CredencialExpirada,

    /// Saldo de creditos agotado.
    #[error("creditos insuficientes")]
    CreditosInsuficientes,

    #[error("{0} no encontrado")]
    NoEncontrado(&'static str),

    /// Punto de emision inexistente para el emisor.
    #[error("punto de emision desconocido")]
    PuntoEmisionDesconocido,

    #[error("conflicto: {0}")]
    Conflicto(String),

    #[error(transparent)]
    Interno(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validacion(_) | Self::Credencial(_) | Self::CredencialFaltante | Self::CredencialExpirada => {
                StatusCode::BAD_REQUEST
            }
            Self::TokenInvalido => StatusCode::UNAUTHORIZED,
            Self::ApiKeyInvalida | Self::LlaveServicioInvalida => StatusCode::FORBIDDEN,
            Self::CreditosInsuficientes => StatusCode::PAYMENT_REQUIRED,
            Self::NoEncontrado(_) | Self::PuntoEmisionDesconocido => StatusCode::NOT_FOUND,
            Self::Conflicto(_) => StatusCode::CONFLICT,
            Self::Interno(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Los errores internos no exponen causa al cliente.
        let mensaje = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "error interno");
            "error interno".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": mensaje }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        // Violaciones de unicidad llegan al cliente como 409.
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return Self::Conflicto("registro duplicado".to_string());
            }
        }
        Self::Interno(e.into())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::Interno(e.into())
    }
}

impl From<FirmaError> for ApiError {
    fn from(e: FirmaError) -> Self {
        Self::Interno(e.into())
    }
}

impl From<ClaveError> for ApiError {
    fn from(e: ClaveError) -> Self {
        Self::Interno(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codigos_http_de_la_taxonomia() {
        assert_eq!(ApiError::Validacion("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::TokenInvalido.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::ApiKeyInvalida.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::CreditosInsuficientes.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(ApiError::NoEncontrado("factura").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflicto("dup".into()).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::CredencialExpirada.status(), StatusCode::BAD_REQUEST);
    }
}
