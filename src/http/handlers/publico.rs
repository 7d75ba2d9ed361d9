use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;

use crate::core::Contexto;
use crate::error::ApiError;
use crate::storage::StorageError;

/// Descarga publica del RIDE por clave de acceso.
pub async fn pdf(
    State(ctx): State<Contexto>,
    Path(clave): Path<String>,
) -> Result<Response, ApiError> {
    descargar(&ctx, &clave, Artefacto::Pdf).await
}

/// Descarga publica del XML (firmado o autorizado) por clave de acceso.
pub async fn xml(
    State(ctx): State<Contexto>,
    Path(clave): Path<String>,
) -> Result<Response, ApiError> {
    descargar(&ctx, &clave, Artefacto::Xml).await
}

enum Artefacto {
    Pdf,
    Xml,
}

async fn descargar(ctx: &Contexto, clave: &str, tipo: Artefacto) -> Result<Response, ApiError> {
    if clave.len() != 49 || !clave.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::Validacion("la clave de acceso debe tener 49 digitos".into()));
    }

    let ruta: Option<Option<String>> = sqlx::query_scalar(match tipo {
        Artefacto::Pdf => "SELECT pdf_path FROM facturas WHERE clave_acceso = $1",
        Artefacto::Xml => "SELECT xml_path FROM facturas WHERE clave_acceso = $1",
    })
    .bind(clave)
    .fetch_optional(&ctx.pool)
    .await?;

    let ruta = ruta.flatten().ok_or(ApiError::NoEncontrado("comprobante"))?;

    let bytes = match ctx.store.get_ruta(&ruta).await {
        Ok(bytes) => bytes,
        Err(StorageError::NoEncontrado { .. }) => return Err(ApiError::NoEncontrado("artefacto")),
        Err(e) => return Err(e.into()),
    };

    let (content_type, extension) = match tipo {
        Artefacto::Pdf => ("application/pdf", "pdf"),
        Artefacto::Xml => ("text/xml; charset=utf-8", "xml"),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{clave}.{extension}\""),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Interno(e.into()))
}
