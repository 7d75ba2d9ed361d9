//! Pipeline de emision: asignacion atomica de secuencial y clave de acceso,
//! calculo de totales, firma XAdES-BES, RIDE y persistencia.
//!
//! Toda la operacion corre dentro de una sola transaccion: los artefactos en
//! el object store deben ser visibles si y solo si la fila quedo FIRMADO.
//! Cualquier fallo posterior a las subidas dispara rollback y limpieza
//! best-effort de los blobs.

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{info, instrument};

use crate::config::PoliticaCredito;
use crate::error::ApiError;
use crate::models::FacturaInput;
use crate::sri::certificado::{cargar_credencial, Credencial};
use crate::sri::clave_acceso::generar_clave_acceso;
use crate::sri::firma::firmar_comprobante;
use crate::sri::ride::{generar_ride, DatosRide};
use crate::sri::xml::{forma_pago_sri, generar_xml_factura, CampoAdicionalXml, DatosFactura, PagoFactura};
use crate::sri::{calculos, soap};
use crate::crypto;
use crate::storage::rutas;

use super::Contexto;

/// Respuesta de una emision sincrona.
#[derive(Debug, Serialize)]
pub struct ResultadoEmision {
    pub factura_id: i64,
    pub clave_acceso: String,
    pub secuencial: String,
    pub estado: String,
    pub xml_path: String,
    pub pdf_path: String,
    pub creditos_restantes: i64,
    pub importe_total: f64,
}

#[derive(FromRow)]
struct EmisorConCredito {
    id: i64,
    ruc: String,
    razon_social: String,
    nombre_comercial: Option<String>,
    direccion_matriz: String,
    ambiente: String,
    obligado_contabilidad: String,
    p12_path: Option<String>,
    p12_password_cifrada: Option<String>,
    p12_expiracion: Option<DateTime<Utc>>,
    balance: i64,
}

/// Emite una factura para `emisor_id`. Si `factura_existente` viene, la fila
/// PENDIENTE se completa en lugar de insertar una nueva (camino asincrono
/// del worker); si no, se inserta la fila directamente en FIRMADO.
#[instrument(skip(ctx, input))]
pub async fn emitir_factura(
    ctx: &Contexto,
    emisor_id: i64,
    input: &FacturaInput,
    factura_existente: Option<i64>,
) -> Result<ResultadoEmision, ApiError> {
    input.validar()?;

    let mut tx = ctx.pool.begin().await?;

    // Lock del emisor + su saldo: serializa emisiones del mismo emisor y
    // garantiza que el saldo nunca baje de cero.
    let emisor: EmisorConCredito = sqlx::query_as(
        r#"SELECT e.id, e.ruc, e.razon_social, e.nombre_comercial, e.direccion_matriz,
                  e.ambiente, e.obligado_contabilidad, e.p12_path, e.p12_password_cifrada,
                  e.p12_expiracion, c.balance
             FROM emisores e
             JOIN creditos c ON c.emisor_id = e.id
            WHERE e.id = $1
              FOR UPDATE"#,
    )
    .bind(emisor_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ApiError::NoEncontrado("emisor"))?;

    if emisor.balance <= 0 {
        return Err(ApiError::CreditosInsuficientes);
    }
    let p12_path = emisor.p12_path.clone().ok_or(ApiError::CredencialFaltante)?;
    let p12_password_cifrada = emisor
        .p12_password_cifrada
        .clone()
        .ok_or(ApiError::CredencialFaltante)?;
    match emisor.p12_expiracion {
        Some(expira) if expira >= Utc::now() => {}
        Some(_) => return Err(ApiError::CredencialExpirada),
        None => return Err(ApiError::CredencialFaltante),
    }

    // Punto de emision del emisor.
    let punto_id: i64 = sqlx::query_scalar(
        r#"SELECT p.id
             FROM puntos_emision p
             JOIN establecimientos es ON es.id = p.establecimiento_id
            WHERE es.emisor_id = $1 AND es.codigo = $2 AND p.codigo = $3"#,
    )
    .bind(emisor_id)
    .bind(&input.establecimiento)
    .bind(&input.punto_emision)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ApiError::PuntoEmisionDesconocido)?;

    // Avance atomico del secuencial bajo lock de fila.
    let secuencial_num: i64 = sqlx::query_scalar("SELECT generar_secuencial($1)")
        .bind(punto_id)
        .fetch_one(&mut *tx)
        .await?;
    let secuencial = format!("{:09}", secuencial_num);

    // Totales e impuestos.
    let calculo = calculos::calcular(&input.items, ctx.config.iva_lenient)
        .map_err(|e| ApiError::Validacion(e.to_string()))?;

    // Fecha y codigo numerico en hora local de Guayaquil; el resto del
    // sistema persiste UTC.
    let ahora_local = Utc::now().with_timezone(&chrono_tz::America::Guayaquil);
    let fecha_emision = ahora_local.format("%d/%m/%Y").to_string();
    let codigo_numerico = format!(
        "{:02}{:02}{:02}{:02}",
        ahora_local.hour(),
        ahora_local.minute(),
        ahora_local.second(),
        ahora_local.timestamp_subsec_millis() / 10
    );

    let clave_acceso = generar_clave_acceso(
        &fecha_emision,
        "01",
        &emisor.ruc,
        &emisor.ambiente,
        &input.establecimiento,
        &input.punto_emision,
        &secuencial,
        Some(&codigo_numerico),
        "1",
    )?;

    // Credencial fresca: el P12 se abre en cada firma, sin cache de llaves
    // descifradas.
    let credencial = cargar_credencial_del_emisor(
        ctx,
        &p12_path,
        &p12_password_cifrada,
        &emisor.ruc,
    )
    .await?;

    let datos = DatosFactura {
        ambiente: emisor.ambiente.clone(),
        tipo_emision: "1".into(),
        razon_social: emisor.razon_social.clone(),
        nombre_comercial: emisor
            .nombre_comercial
            .clone()
            .unwrap_or_else(|| emisor.razon_social.clone()),
        ruc: emisor.ruc.clone(),
        clave_acceso: clave_acceso.clone(),
        cod_doc: "01".into(),
        estab: input.establecimiento.clone(),
        pto_emi: input.punto_emision.clone(),
        secuencial: secuencial.clone(),
        dir_matriz: emisor.direccion_matriz.clone(),
        fecha_emision,
        dir_establecimiento: emisor.direccion_matriz.clone(),
        obligado_contabilidad: emisor.obligado_contabilidad.clone(),
        tipo_identificacion_comprador: input.tipo_identificacion_sri().to_string(),
        razon_social_comprador: input.razon_social_comprador.clone(),
        identificacion_comprador: input.identificacion_comprador.clone(),
        direccion_comprador: input.direccion_comprador.clone(),
        total_sin_impuestos: 0.0,
        total_descuento: 0.0,
        importe_total: 0.0,
        impuestos_totales: vec![],
        pagos: vec![PagoFactura {
            forma_pago: forma_pago_sri(input.forma_pago.as_deref().unwrap_or("EFECTIVO")).to_string(),
            total: calculo.totales.importe_total,
        }],
        detalles: vec![],
        info_adicional: campos_adicionales(input),
    }
    .con_calculo(&calculo);

    let xml = generar_xml_factura(&datos);
    let xml_firmado = firmar_comprobante(&xml, &credencial)?;

    let mut pdf = Vec::new();
    generar_ride(
        &DatosRide {
            xml_firmado: &xml_firmado,
            autorizado: false,
            numero_autorizacion: None,
            fecha_autorizacion: None,
        },
        &ctx.config.fonts_dir,
        &mut pdf,
    )
    .map_err(|e| ApiError::Interno(e.into()))?;

    // Subida de artefactos bajo las rutas canonicas.
    let (bucket_xml, key_xml) = rutas::xml_firmado(&emisor.ruc, &clave_acceso);
    let xml_path = ctx
        .store
        .put(bucket_xml, &key_xml, xml_firmado.into_bytes(), "text/xml")
        .await?;

    let (bucket_pdf, key_pdf) = rutas::pdf_firmado(&emisor.ruc, &clave_acceso);
    let pdf_path = match ctx.store.put(bucket_pdf, &key_pdf, pdf, "application/pdf").await {
        Ok(ruta) => ruta,
        Err(e) => {
            ctx.store.delete_ruta_silencioso(&xml_path).await;
            return Err(e.into());
        }
    };

    // Persistencia + debito. Si algo falla de aqui en adelante la fila hace
    // rollback y los blobs recien subidos se borran.
    let persistido = persistir_firmada(
        &mut tx,
        ctx.config.politica_credito,
        &emisor,
        punto_id,
        factura_existente,
        input,
        &calculo,
        &secuencial,
        &clave_acceso,
        &xml_path,
        &pdf_path,
    )
    .await;

    let (factura_id, creditos_restantes) = match persistido {
        Ok(valores) => valores,
        Err(e) => {
            drop(tx);
            ctx.store.delete_ruta_silencioso(&xml_path).await;
            ctx.store.delete_ruta_silencioso(&pdf_path).await;
            return Err(e);
        }
    };

    if let Err(e) = tx.commit().await {
        ctx.store.delete_ruta_silencioso(&xml_path).await;
        ctx.store.delete_ruta_silencioso(&pdf_path).await;
        return Err(e.into());
    }

    info!(
        factura_id,
        clave = %clave_acceso,
        secuencial = %secuencial,
        creditos_restantes,
        "factura firmada"
    );

    Ok(ResultadoEmision {
        factura_id,
        clave_acceso,
        secuencial,
        estado: "FIRMADO".into(),
        xml_path,
        pdf_path,
        creditos_restantes,
        importe_total: calculo.totales.importe_total,
    })
}

/// Baja el P12 del store, descifra su password y arma la credencial,
/// verificando vigencia y RUC del titular.
async fn cargar_credencial_del_emisor(
    ctx: &Contexto,
    p12_path: &str,
    password_cifrada: &str,
    ruc: &str,
) -> Result<Credencial, ApiError> {
    let p12 = ctx.store.get_ruta(p12_path).await?;
    let password = crypto::descifrar_password(password_cifrada, &ctx.config.encryption_key)
        .map_err(|e| ApiError::Interno(e.into()))?;

    let credencial = cargar_credencial(&p12, &password)?;
    credencial.verificar_vigencia(Utc::now())?;
    credencial.verificar_ruc(ruc)?;
    Ok(credencial)
}

fn campos_adicionales(input: &FacturaInput) -> Vec<CampoAdicionalXml> {
    let mut campos: Vec<CampoAdicionalXml> = input
        .info_adicional
        .iter()
        .map(|c| CampoAdicionalXml {
            nombre: c.nombre.clone(),
            valor: c.valor.clone(),
        })
        .collect();
    if let Some(email) = input.email.as_deref().filter(|e| !e.is_empty()) {
        campos.push(CampoAdicionalXml {
            nombre: "email".into(),
            valor: email.to_string(),
        });
    }
    if let Some(dir) = input.direccion_comprador.as_deref().filter(|d| !d.is_empty()) {
        campos.push(CampoAdicionalXml {
            nombre: "direccion".into(),
            valor: dir.to_string(),
        });
    }
    campos
}

#[allow(clippy::too_many_arguments)]
async fn persistir_firmada(
    tx: &mut Transaction<'_, Postgres>,
    politica: PoliticaCredito,
    emisor: &EmisorConCredito,
    punto_id: i64,
    factura_existente: Option<i64>,
    input: &FacturaInput,
    calculo: &calculos::ResultadoCalculo,
    secuencial: &str,
    clave_acceso: &str,
    xml_path: &str,
    pdf_path: &str,
) -> Result<(i64, i64), ApiError> {
    let client_input = serde_json::to_value(input).map_err(|e| ApiError::Interno(e.into()))?;
    let totales = &calculo.totales;

    let factura_id = match factura_existente {
        Some(id) => {
            let filas = sqlx::query(
                r#"UPDATE facturas
                      SET punto_emision_id = $2, secuencial = $3, clave_acceso = $4,
                          identificacion_comprador = $5, razon_social_comprador = $6,
                          subtotal_sin_impuestos = $7, subtotal_0 = $8, subtotal_iva = $9,
                          valor_iva = $10, importe_total = $11, estado = 'FIRMADO',
                          xml_path = $12, pdf_path = $13, updated_at = now()
                    WHERE id = $1 AND estado = 'PENDIENTE'"#,
            )
            .bind(id)
            .bind(punto_id)
            .bind(secuencial)
            .bind(clave_acceso)
            .bind(&input.identificacion_comprador)
            .bind(&input.razon_social_comprador)
            .bind(totales.total_sin_impuestos)
            .bind(totales.subtotal_0)
            .bind(totales.subtotal_iva)
            .bind(totales.total_iva)
            .bind(totales.importe_total)
            .bind(xml_path)
            .bind(pdf_path)
            .execute(&mut **tx)
            .await?
            .rows_affected();

            if filas == 0 {
                // Otro worker ya la tomo o la fila salio de PENDIENTE.
                return Err(ApiError::Conflicto("la factura ya no esta PENDIENTE".into()));
            }
            id
        }
        None => {
            sqlx::query_scalar(
                r#"INSERT INTO facturas
                       (emisor_id, punto_emision_id, secuencial, clave_acceso,
                        identificacion_comprador, razon_social_comprador,
                        subtotal_sin_impuestos, subtotal_0, subtotal_iva, valor_iva,
                        importe_total, estado, xml_path, pdf_path, client_input_data)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'FIRMADO', $12, $13, $14)
                RETURNING id"#,
            )
            .bind(emisor.id)
            .bind(punto_id)
            .bind(secuencial)
            .bind(clave_acceso)
            .bind(&input.identificacion_comprador)
            .bind(&input.razon_social_comprador)
            .bind(totales.total_sin_impuestos)
            .bind(totales.subtotal_0)
            .bind(totales.subtotal_iva)
            .bind(totales.total_iva)
            .bind(totales.importe_total)
            .bind(xml_path)
            .bind(pdf_path)
            .bind(&client_input)
            .fetch_one(&mut **tx)
            .await?
        }
    };

    // Unico punto de debito del camino de emision: solo bajo politica eager.
    let creditos_restantes = match politica {
        PoliticaCredito::Eager => {
            sqlx::query_scalar(
                "UPDATE creditos SET balance = balance - 1, updated_at = now()
                  WHERE emisor_id = $1 RETURNING balance",
            )
            .bind(emisor.id)
            .fetch_one(&mut **tx)
            .await?
        }
        PoliticaCredito::Lazy => emisor.balance,
    };

    Ok((factura_id, creditos_restantes))
}

/// Encola una factura en PENDIENTE para que el worker la firme y envie.
pub async fn encolar_factura(
    ctx: &Contexto,
    emisor_id: i64,
    input: &FacturaInput,
    raw: &serde_json::Value,
) -> Result<i64, ApiError> {
    input.validar()?;

    let punto_id: i64 = sqlx::query_scalar(
        r#"SELECT p.id
             FROM puntos_emision p
             JOIN establecimientos es ON es.id = p.establecimiento_id
            WHERE es.emisor_id = $1 AND es.codigo = $2 AND p.codigo = $3"#,
    )
    .bind(emisor_id)
    .bind(&input.establecimiento)
    .bind(&input.punto_emision)
    .fetch_optional(&ctx.pool)
    .await?
    .ok_or(ApiError::PuntoEmisionDesconocido)?;

    let id: i64 = sqlx::query_scalar(
        r#"INSERT INTO facturas
               (emisor_id, punto_emision_id, identificacion_comprador,
                razon_social_comprador, estado, client_input_data)
           VALUES ($1, $2, $3, $4, 'PENDIENTE', $5)
        RETURNING id"#,
    )
    .bind(emisor_id)
    .bind(punto_id)
    .bind(&input.identificacion_comprador)
    .bind(&input.razon_social_comprador)
    .bind(raw)
    .fetch_one(&ctx.pool)
    .await?;

    info!(factura_id = id, emisor_id, "factura encolada PENDIENTE");
    Ok(id)
}

/// Cliente SOAP para el ambiente del emisor.
pub fn cliente_sri(ctx: &Contexto, ambiente: &str) -> Result<soap::ClienteSri, ApiError> {
    soap::ClienteSri::nuevo(&ctx.config.sri, ambiente).map_err(|e| ApiError::Interno(e.into()))
}
