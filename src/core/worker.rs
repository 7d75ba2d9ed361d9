//! Worker de liquidacion: tres jobs periodicos contra la misma base.
//!
//! - Firma (~20 s): completa facturas PENDIENTE con el pipeline de emision.
//! - Envio (~20 s): FIRMADO -> recepcion SOAP -> RECIBIDA | DEVUELTA.
//! - Autorizacion (~60 s): RECIBIDA -> autorizacion SOAP -> AUTORIZADO | RECHAZADO.
//!
//! Cada fila se reclama con `FOR UPDATE SKIP LOCKED` en una transaccion
//! corta propia, asi dos replicas del worker nunca envian el mismo
//! comprobante dos veces. Los errores de transporte dejan la fila intacta y
//! el siguiente tick reintenta. Repetir un tick sobre una fila ya avanzada
//! no tiene efecto: el claim re-verifica el estado.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PoliticaCredito;
use crate::models::FacturaInput;
use crate::sri::ride::{generar_ride, DatosRide};
use crate::sri::soap::{MensajeSri, RespuestaRecepcion};
use crate::storage::rutas;

use super::emision;
use super::notificar::EventoFactura;
use super::Contexto;

/// Filas procesadas por tick y job.
const LOTE: i64 = 15;

const INTERVALO_FIRMA: Duration = Duration::from_secs(20);
const INTERVALO_ENVIO: Duration = Duration::from_secs(20);
const INTERVALO_AUTORIZACION: Duration = Duration::from_secs(60);

/// Lanza los tres jobs en segundo plano. Los ticks de un mismo job nunca se
/// solapan: el loop espera a que el anterior termine.
pub fn lanzar(ctx: Contexto) {
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut reloj = interval(INTERVALO_FIRMA);
            reloj.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                reloj.tick().await;
                if let Err(e) = tick_pendientes(&ctx).await {
                    error!(error = %e, "tick de firma fallo");
                }
            }
        });
    }
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut reloj = interval(INTERVALO_ENVIO);
            reloj.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                reloj.tick().await;
                if let Err(e) = tick_envio(&ctx).await {
                    error!(error = %e, "tick de envio fallo");
                }
            }
        });
    }
    tokio::spawn(async move {
        let mut reloj = interval(INTERVALO_AUTORIZACION);
        reloj.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            reloj.tick().await;
            if let Err(e) = tick_autorizacion(&ctx).await {
                error!(error = %e, "tick de autorizacion fallo");
            }
        }
    });
}

// =====================================================================
// Job de firma: PENDIENTE -> FIRMADO
// =====================================================================

#[derive(FromRow)]
struct FilaPendiente {
    id: i64,
    emisor_id: i64,
    client_input_data: serde_json::Value,
}

pub async fn tick_pendientes(ctx: &Contexto) -> anyhow::Result<()> {
    let filas: Vec<FilaPendiente> = sqlx::query_as(
        "SELECT id, emisor_id, client_input_data FROM facturas
          WHERE estado = 'PENDIENTE' ORDER BY created_at ASC LIMIT $1",
    )
    .bind(LOTE)
    .fetch_all(&ctx.pool)
    .await?;

    for fila in filas {
        let input: FacturaInput = match serde_json::from_value(fila.client_input_data.clone()) {
            Ok(input) => input,
            Err(e) => {
                warn!(factura_id = fila.id, error = %e, "payload PENDIENTE no parseable");
                continue;
            }
        };

        match emision::emitir_factura(ctx, fila.emisor_id, &input, Some(fila.id)).await {
            Ok(resultado) => {
                debug!(factura_id = fila.id, clave = %resultado.clave_acceso, "pendiente firmada");
            }
            Err(e) => {
                // Se queda PENDIENTE y se reintenta en el proximo tick.
                warn!(factura_id = fila.id, error = %e, "no se pudo firmar pendiente");
            }
        }
    }
    Ok(())
}

// =====================================================================
// Job de envio: FIRMADO -> RECIBIDA | DEVUELTA
// =====================================================================

#[derive(FromRow)]
struct FilaEnvio {
    id: i64,
    clave_acceso: String,
    xml_path: String,
    ambiente: String,
    user_uid: Option<String>,
}

pub async fn tick_envio(ctx: &Contexto) -> anyhow::Result<()> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM facturas WHERE estado = 'FIRMADO' ORDER BY created_at ASC LIMIT $1",
    )
    .bind(LOTE)
    .fetch_all(&ctx.pool)
    .await?;

    for id in ids {
        if let Err(e) = procesar_envio(ctx, id).await {
            warn!(factura_id = id, error = %e, "envio a recepcion fallo, se reintenta");
        }
    }
    Ok(())
}

/// Procesa una fila FIRMADO: la reclama con SKIP LOCKED, envia el XML a
/// recepcion y avanza el estado segun la respuesta.
pub async fn procesar_envio(ctx: &Contexto, factura_id: i64) -> anyhow::Result<()> {
    let mut tx = ctx.pool.begin().await?;

    let fila: Option<FilaEnvio> = sqlx::query_as(
        r#"SELECT f.id, f.clave_acceso, f.xml_path, e.ambiente,
                  (SELECT p.user_uid FROM perfiles p WHERE p.emisor_id = e.id LIMIT 1) AS user_uid
             FROM facturas f
             JOIN emisores e ON e.id = f.emisor_id
            WHERE f.id = $1 AND f.estado = 'FIRMADO'
              FOR UPDATE OF f SKIP LOCKED"#,
    )
    .bind(factura_id)
    .fetch_optional(&mut *tx)
    .await?;

    // Ya avanzo o la tiene otra replica: no hay nada que hacer.
    let Some(fila) = fila else { return Ok(()) };

    let xml = ctx.store.get_ruta(&fila.xml_path).await?;
    let xml = String::from_utf8(xml)?;

    let cliente = emision::cliente_sri(ctx, &fila.ambiente)?;
    match cliente.enviar_recepcion(&xml).await {
        Ok(RespuestaRecepcion::Recibida) | Ok(RespuestaRecepcion::EnProcesamiento) => {
            sqlx::query(
                "UPDATE facturas SET estado = 'RECIBIDA', fecha_envio_sri = now(),
                        updated_at = now() WHERE id = $1",
            )
            .bind(fila.id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            info!(factura_id = fila.id, "comprobante RECIBIDA por el SRI");
        }
        Ok(RespuestaRecepcion::Devuelta { mensajes }) => {
            sqlx::query(
                "UPDATE facturas SET estado = 'DEVUELTA', mensajes_sri = $2,
                        updated_at = now() WHERE id = $1",
            )
            .bind(fila.id)
            .bind(serde_json::to_value(&mensajes)?)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            warn!(factura_id = fila.id, "comprobante DEVUELTA por recepcion");

            notificar_terminal(ctx, &fila.user_uid, fila.id, &fila.clave_acceso, "DEVUELTA", &mensajes).await;
        }
        Err(e) => {
            // Error de transporte: el estado no cambia y se reintenta.
            drop(tx);
            return Err(e.into());
        }
    }
    Ok(())
}

// =====================================================================
// Job de autorizacion: RECIBIDA -> AUTORIZADO | RECHAZADO
// =====================================================================

#[derive(FromRow)]
struct FilaAutorizacion {
    id: i64,
    emisor_id: i64,
    clave_acceso: String,
    ruc: String,
    ambiente: String,
    user_uid: Option<String>,
}

pub async fn tick_autorizacion(ctx: &Contexto) -> anyhow::Result<()> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM facturas WHERE estado = 'RECIBIDA' ORDER BY created_at ASC LIMIT $1",
    )
    .bind(LOTE)
    .fetch_all(&ctx.pool)
    .await?;

    for id in ids {
        if let Err(e) = procesar_autorizacion(ctx, id).await {
            warn!(factura_id = id, error = %e, "consulta de autorizacion fallo, se reintenta");
        }
    }
    Ok(())
}

/// Procesa una fila RECIBIDA: consulta la autorizacion y resuelve el estado
/// final, incluido el debito bajo politica lazy.
pub async fn procesar_autorizacion(ctx: &Contexto, factura_id: i64) -> anyhow::Result<()> {
    let mut tx = ctx.pool.begin().await?;

    let fila: Option<FilaAutorizacion> = sqlx::query_as(
        r#"SELECT f.id, f.emisor_id, f.clave_acceso, e.ruc, e.ambiente,
                  (SELECT p.user_uid FROM perfiles p WHERE p.emisor_id = e.id LIMIT 1) AS user_uid
             FROM facturas f
             JOIN emisores e ON e.id = f.emisor_id
            WHERE f.id = $1 AND f.estado = 'RECIBIDA'
              FOR UPDATE OF f SKIP LOCKED"#,
    )
    .bind(factura_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(fila) = fila else { return Ok(()) };

    let cliente = emision::cliente_sri(ctx, &fila.ambiente)?;
    let Some(respuesta) = cliente.consultar_autorizacion(&fila.clave_acceso).await? else {
        // El SRI aun no registra la clave; queda RECIBIDA.
        debug!(factura_id = fila.id, "autorizacion sin comprobantes todavia");
        return Ok(());
    };

    match respuesta.estado.as_str() {
        "AUTORIZADO" => {
            // El XML con el sello de autorizacion reemplaza al firmado.
            let nuevo_xml_path = match &respuesta.comprobante_xml {
                Some(xml) => {
                    let (bucket, key) = rutas::xml_autorizado(&fila.ruc, &fila.clave_acceso);
                    Some(
                        ctx.store
                            .put(bucket, &key, xml.clone().into_bytes(), "text/xml")
                            .await?,
                    )
                }
                None => None,
            };

            let fecha_autorizacion = respuesta
                .fecha_autorizacion
                .as_deref()
                .and_then(|f| DateTime::parse_from_rfc3339(f).ok())
                .map(|f| f.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            sqlx::query(
                r#"UPDATE facturas
                      SET estado = 'AUTORIZADO', fecha_autorizacion = $2,
                          xml_path = COALESCE($3, xml_path),
                          mensajes_sri = $4, updated_at = now()
                    WHERE id = $1"#,
            )
            .bind(fila.id)
            .bind(fecha_autorizacion)
            .bind(&nuevo_xml_path)
            .bind(serde_json::to_value(&respuesta.mensajes)?)
            .execute(&mut *tx)
            .await?;

            // Unico punto de debito del camino lazy.
            if ctx.config.politica_credito == PoliticaCredito::Lazy {
                sqlx::query(
                    "UPDATE creditos SET balance = balance - 1, updated_at = now()
                      WHERE emisor_id = $1 AND balance > 0",
                )
                .bind(fila.emisor_id)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            info!(factura_id = fila.id, clave = %fila.clave_acceso, "comprobante AUTORIZADO");

            // RIDE definitivo con el sello de autorizacion. Best-effort: si
            // falla queda el provisional con la leyenda de pendiente.
            if let Some(xml_autorizado) = &respuesta.comprobante_xml {
                let datos = DatosRide {
                    xml_firmado: xml_autorizado,
                    autorizado: true,
                    numero_autorizacion: respuesta.numero_autorizacion.as_deref(),
                    fecha_autorizacion: respuesta.fecha_autorizacion.as_deref(),
                };
                let mut pdf = Vec::new();
                match generar_ride(&datos, &ctx.config.fonts_dir, &mut pdf) {
                    Ok(()) => {
                        let (bucket, key) = rutas::pdf_firmado(&fila.ruc, &fila.clave_acceso);
                        if let Err(e) = ctx.store.put(bucket, &key, pdf, "application/pdf").await {
                            warn!(factura_id = fila.id, error = %e, "no se pudo subir el RIDE autorizado");
                        }
                    }
                    Err(e) => {
                        warn!(factura_id = fila.id, error = %e, "no se pudo regenerar el RIDE autorizado");
                    }
                }
            }

            notificar_terminal(ctx, &fila.user_uid, fila.id, &fila.clave_acceso, "AUTORIZADO", &respuesta.mensajes)
                .await;
        }
        "NO AUTORIZADO" | "RECHAZADO" => {
            sqlx::query(
                "UPDATE facturas SET estado = 'RECHAZADO', mensajes_sri = $2,
                        updated_at = now() WHERE id = $1",
            )
            .bind(fila.id)
            .bind(serde_json::to_value(&respuesta.mensajes)?)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            warn!(factura_id = fila.id, "comprobante RECHAZADO");

            notificar_terminal(ctx, &fila.user_uid, fila.id, &fila.clave_acceso, "RECHAZADO", &respuesta.mensajes)
                .await;
        }
        otro => {
            // Estado intermedio (EN PROCESAMIENTO, etc): se guarda tal cual
            // y la fila sigue RECIBIDA para el proximo tick.
            sqlx::query(
                "UPDATE facturas SET mensajes_sri = $2, updated_at = now() WHERE id = $1",
            )
            .bind(fila.id)
            .bind(serde_json::json!({ "estado": otro, "mensajes": respuesta.mensajes }))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            debug!(factura_id = fila.id, estado = otro, "autorizacion en proceso");
        }
    }
    Ok(())
}

async fn notificar_terminal(
    ctx: &Contexto,
    user_uid: &Option<String>,
    factura_id: i64,
    clave_acceso: &str,
    estado: &str,
    mensajes: &[MensajeSri],
) {
    let mensaje_sri = mensajes.first().map(|m| {
        let mut texto = m.mensaje.clone();
        if let Some(info) = &m.informacion_adicional {
            texto.push_str(" - ");
            texto.push_str(info);
        }
        texto
    });

    ctx.notificador
        .notificar(&EventoFactura {
            user_uid: user_uid.clone().unwrap_or_default(),
            invoice_id: factura_id,
            clave_acceso: clave_acceso.to_string(),
            estado: estado.to_string(),
            mensaje_sri,
            fecha: Utc::now(),
        })
        .await;
}
