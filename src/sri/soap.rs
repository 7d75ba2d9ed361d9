use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EndpointsSri;

/// Timeout de cada llamada SOAP al SRI.
const TIMEOUT_SOAP: Duration = Duration::from_secs(8);

/// Reintentos de recepcion ante errores de transporte, con su espera previa.
/// El primer intento sale inmediato; si todos fallan el estado de la fila no
/// cambia y el siguiente tick vuelve a intentar.
const ESPERAS_RECEPCION: [u64; 2] = [0, 3];

#[derive(Debug, Error)]
pub enum SoapError {
    #[error("error de transporte con el SRI: {0}")]
    Transporte(#[from] reqwest::Error),
}

/// Mensaje devuelto por el SRI dentro de una respuesta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MensajeSri {
    pub identificador: String,
    pub mensaje: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub informacion_adicional: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipo: Option<String>,
}

/// Resultado de enviar un comprobante al WS de recepcion.
#[derive(Debug)]
pub enum RespuestaRecepcion {
    Recibida,
    /// Error 70: la clave ya esta en procesamiento en el SRI. Equivale a
    /// recibida; el job de autorizacion resuelve el estado final.
    EnProcesamiento,
    Devuelta { mensajes: Vec<MensajeSri> },
}

/// Resultado de consultar el WS de autorizacion.
#[derive(Debug)]
pub struct RespuestaAutorizacion {
    /// Estado textual del SRI: AUTORIZADO, NO AUTORIZADO, u otro.
    pub estado: String,
    pub numero_autorizacion: Option<String>,
    pub fecha_autorizacion: Option<String>,
    /// XML del comprobante con el sello de autorizacion embebido.
    pub comprobante_xml: Option<String>,
    pub mensajes: Vec<MensajeSri>,
}

/// Cliente de los dos servicios SOAP del SRI para un ambiente concreto.
pub struct ClienteSri {
    http: reqwest::Client,
    url_recepcion: String,
    url_autorizacion: String,
}

impl ClienteSri {
    pub fn nuevo(endpoints: &EndpointsSri, ambiente: &str) -> Result<Self, SoapError> {
        let http = reqwest::Client::builder()
            // Solo el ambiente de pruebas del SRI usa certificados viejos.
            .danger_accept_invalid_certs(ambiente != "2")
            .timeout(TIMEOUT_SOAP)
            .build()?;

        Ok(Self {
            http,
            url_recepcion: endpoints.recepcion(ambiente).to_string(),
            url_autorizacion: endpoints.autorizacion(ambiente).to_string(),
        })
    }

    /// Envia el XML firmado (base64) al WS de recepcion y clasifica la
    /// respuesta.
    pub async fn enviar_recepcion(&self, xml_firmado: &str) -> Result<RespuestaRecepcion, SoapError> {
        let xml_base64 = BASE64.encode(xml_firmado.as_bytes());
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="http://ec.gob.sri.ws.recepcion"><soapenv:Header/><soapenv:Body><ec:validarComprobante><xml>{}</xml></ec:validarComprobante></soapenv:Body></soapenv:Envelope>"#,
            xml_base64
        );

        let mut ultimo_error: Option<SoapError> = None;
        for espera in ESPERAS_RECEPCION {
            if espera > 0 {
                tokio::time::sleep(Duration::from_secs(espera)).await;
            }
            match self.post_soap(&self.url_recepcion, &envelope).await {
                Ok(cuerpo) => return Ok(clasificar_recepcion(&cuerpo)),
                Err(e) => {
                    warn!(error = %e, "fallo de transporte en recepcion, reintentando");
                    ultimo_error = Some(e);
                }
            }
        }
        Err(ultimo_error.expect("hubo al menos un intento"))
    }

    /// Consulta la autorizacion de una clave de acceso. `Ok(None)` cuando el
    /// SRI aun no registra comprobantes para la clave.
    pub async fn consultar_autorizacion(
        &self,
        clave_acceso: &str,
    ) -> Result<Option<RespuestaAutorizacion>, SoapError> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="http://ec.gob.sri.ws.autorizacion"><soapenv:Header/><soapenv:Body><ec:autorizacionComprobante><claveAccesoComprobante>{}</claveAccesoComprobante></ec:autorizacionComprobante></soapenv:Body></soapenv:Envelope>"#,
            clave_acceso
        );

        let cuerpo = self.post_soap(&self.url_autorizacion, &envelope).await?;
        Ok(clasificar_autorizacion(&cuerpo))
    }

    async fn post_soap(&self, url: &str, envelope: &str) -> Result<String, SoapError> {
        let respuesta = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(envelope.to_string())
            .send()
            .await?;
        debug!(status = %respuesta.status(), url, "respuesta SOAP");
        Ok(respuesta.text().await?)
    }
}

fn clasificar_recepcion(cuerpo: &str) -> RespuestaRecepcion {
    let estado = extraer_tag(cuerpo, "estado").unwrap_or_default();
    if estado == "RECIBIDA" {
        return RespuestaRecepcion::Recibida;
    }

    let mensajes = extraer_mensajes(cuerpo);
    // Error 70 = clave ya en procesamiento: el comprobante existe en el SRI.
    if mensajes.iter().any(|m| m.identificador == "70") {
        return RespuestaRecepcion::EnProcesamiento;
    }

    RespuestaRecepcion::Devuelta { mensajes }
}

fn clasificar_autorizacion(cuerpo: &str) -> Option<RespuestaAutorizacion> {
    let numero: i64 = extraer_tag(cuerpo, "numeroComprobantes")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    if numero <= 0 {
        return None;
    }

    // Se considera el primer registro de autorizacion.
    let bloque = extraer_bloque(cuerpo, "autorizacion").unwrap_or(cuerpo);

    Some(RespuestaAutorizacion {
        estado: extraer_tag(bloque, "estado").unwrap_or_default(),
        numero_autorizacion: extraer_tag(bloque, "numeroAutorizacion"),
        fecha_autorizacion: extraer_tag(bloque, "fechaAutorizacion"),
        comprobante_xml: extraer_tag(bloque, "comprobante").map(sin_cdata),
        mensajes: extraer_mensajes(bloque),
    })
}

fn sin_cdata(contenido: String) -> String {
    let recortado = contenido.trim();
    recortado
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .unwrap_or(recortado)
        .to_string()
}

fn extraer_mensajes(xml: &str) -> Vec<MensajeSri> {
    let mut mensajes = Vec::new();
    let mut resto = xml;
    while let Some((inicio, fin)) = posicion_bloque(resto, "mensaje") {
        let bloque = &resto[inicio..fin];
        // El contenido sin los tags externos: dentro puede haber otro
        // <mensaje> hoja con el texto.
        let interior = bloque
            .find('>')
            .map(|i| &bloque[i + 1..bloque.rfind("</").unwrap_or(bloque.len())])
            .unwrap_or(bloque);
        if interior.contains("identificador") {
            mensajes.push(MensajeSri {
                identificador: extraer_tag(interior, "identificador").unwrap_or_default(),
                mensaje: extraer_tag(interior, "mensaje")
                    .unwrap_or_else(|| interior.trim().to_string()),
                informacion_adicional: extraer_tag(interior, "informacionAdicional"),
                tipo: extraer_tag(interior, "tipo"),
            });
        }
        resto = &resto[fin..];
    }
    mensajes
}

/// Extrae el contenido de un tag XML por nombre (busqueda simple sin parser
/// completo). Soporta tags con namespace (ej: <ns2:estado>) buscando
/// variantes.
pub fn extraer_tag(xml: &str, tag: &str) -> Option<String> {
    // Intentar sin namespace primero
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    if let Some(start) = xml.find(&open) {
        let content_start = start + open.len();
        if let Some(end) = xml[content_start..].find(&close) {
            let content = &xml[content_start..content_start + end];
            return Some(content.trim().to_string());
        }
    }

    // Intentar con cualquier namespace prefix (ej: <ns2:estado>)
    let pattern_open = format!(":{}>", tag);
    if let Some(colon_pos) = xml.find(&pattern_open) {
        // Buscar el '<' antes del namespace
        let search_back = &xml[..colon_pos];
        if let Some(lt_pos) = search_back.rfind('<') {
            let full_open_end = colon_pos + pattern_open.len();
            // Extraer el prefix (ej: "ns2")
            let prefix = &xml[lt_pos + 1..colon_pos];
            let full_close = format!("</{}:{}>", prefix, tag);
            if let Some(end) = xml[full_open_end..].find(&full_close) {
                let content = &xml[full_open_end..full_open_end + end];
                return Some(content.trim().to_string());
            }
        }
    }

    None
}

/// Extrae un bloque `<tag>...</tag>` completo incluyendo los tags. Cuenta
/// profundidad: un hijo con el mismo nombre (p.ej. el <mensaje> hoja dentro
/// de un bloque <mensaje>) no corta el bloque antes de tiempo.
pub fn extraer_bloque<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    posicion_bloque(xml, tag).map(|(inicio, fin)| &xml[inicio..fin])
}

/// Todos los bloques `<tag>...</tag>` en orden de aparicion.
pub fn extraer_bloques<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let mut bloques = Vec::new();
    let mut desde = 0usize;
    while let Some((inicio, fin)) = posicion_bloque(&xml[desde..], tag) {
        bloques.push(&xml[desde + inicio..desde + fin]);
        desde += fin;
    }
    bloques
}

fn posicion_bloque(xml: &str, tag: &str) -> Option<(usize, usize)> {
    let aperturas = [format!("<{}>", tag), format!("<{} ", tag)];
    let cierre = format!("</{}>", tag);

    let inicio = aperturas.iter().filter_map(|a| xml.find(a)).min()?;
    let mut cursor = inicio + 1;
    let mut profundidad = 1usize;

    while profundidad > 0 {
        let abre = aperturas
            .iter()
            .filter_map(|a| xml[cursor..].find(a))
            .min()
            .map(|p| cursor + p);
        let cierra = xml[cursor..].find(&cierre).map(|p| cursor + p)?;

        match abre {
            Some(a) if a < cierra => {
                profundidad += 1;
                cursor = a + 1;
            }
            _ => {
                profundidad -= 1;
                cursor = cierra + cierre.len();
            }
        }
    }
    Some((inicio, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPUESTA_RECIBIDA: &str = r#"<?xml version="1.0"?><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion"><RespuestaRecepcionComprobante><estado>RECIBIDA</estado><comprobantes/></RespuestaRecepcionComprobante></ns2:validarComprobanteResponse></soap:Body></soap:Envelope>"#;

    const RESPUESTA_DEVUELTA: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><RespuestaRecepcionComprobante><estado>DEVUELTA</estado><comprobantes><comprobante><claveAcceso>123</claveAcceso><mensajes><mensaje><identificador>35</identificador><mensaje>ARCHIVO NO CUMPLE ESTRUCTURA XML</mensaje><informacionAdicional>detalle del error</informacionAdicional><tipo>ERROR</tipo></mensaje></mensajes></comprobante></comprobantes></RespuestaRecepcionComprobante></soap:Body></soap:Envelope>"#;

    const RESPUESTA_ERROR_70: &str = r#"<RespuestaRecepcionComprobante><estado>DEVUELTA</estado><comprobantes><comprobante><mensajes><mensaje><identificador>70</identificador><mensaje>CLAVE ACCESO EN PROCESAMIENTO</mensaje></mensaje></mensajes></comprobante></comprobantes></RespuestaRecepcionComprobante>"#;

    const RESPUESTA_AUTORIZADO: &str = r#"<soap:Envelope><soap:Body><ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion"><RespuestaAutorizacionComprobante><claveAccesoConsultada>123</claveAccesoConsultada><numeroComprobantes>1</numeroComprobantes><autorizaciones><autorizacion><estado>AUTORIZADO</estado><numeroAutorizacion>1802202601179245326800110010030000000011234567816</numeroAutorizacion><fechaAutorizacion>2026-02-18T10:35:00-05:00</fechaAutorizacion><ambiente>PRUEBAS</ambiente><comprobante><![CDATA[<factura id="comprobante"><infoTributaria></infoTributaria></factura>]]></comprobante><mensajes/></autorizacion></autorizaciones></RespuestaAutorizacionComprobante></ns2:autorizacionComprobanteResponse></soap:Body></soap:Envelope>"#;

    const RESPUESTA_NO_AUTORIZADO: &str = r#"<RespuestaAutorizacionComprobante><numeroComprobantes>1</numeroComprobantes><autorizaciones><autorizacion><estado>NO AUTORIZADO</estado><mensajes><mensaje><identificador>60</identificador><mensaje>CLAVE ACCESO REGISTRADA</mensaje><tipo>ERROR</tipo></mensaje></mensajes></autorizacion></autorizaciones></RespuestaAutorizacionComprobante>"#;

    const RESPUESTA_SIN_COMPROBANTES: &str = r#"<RespuestaAutorizacionComprobante><numeroComprobantes>0</numeroComprobantes><autorizaciones/></RespuestaAutorizacionComprobante>"#;

    #[test]
    fn recepcion_recibida() {
        assert!(matches!(
            clasificar_recepcion(RESPUESTA_RECIBIDA),
            RespuestaRecepcion::Recibida
        ));
    }

    #[test]
    fn recepcion_devuelta_con_mensajes() {
        match clasificar_recepcion(RESPUESTA_DEVUELTA) {
            RespuestaRecepcion::Devuelta { mensajes } => {
                assert_eq!(mensajes.len(), 1);
                assert_eq!(mensajes[0].identificador, "35");
                assert_eq!(mensajes[0].mensaje, "ARCHIVO NO CUMPLE ESTRUCTURA XML");
                assert_eq!(
                    mensajes[0].informacion_adicional.as_deref(),
                    Some("detalle del error")
                );
            }
            otro => panic!("se esperaba DEVUELTA, llego {otro:?}"),
        }
    }

    #[test]
    fn recepcion_error_70_es_en_procesamiento() {
        assert!(matches!(
            clasificar_recepcion(RESPUESTA_ERROR_70),
            RespuestaRecepcion::EnProcesamiento
        ));
    }

    #[test]
    fn autorizacion_autorizado() {
        let r = clasificar_autorizacion(RESPUESTA_AUTORIZADO).unwrap();
        assert_eq!(r.estado, "AUTORIZADO");
        assert_eq!(
            r.numero_autorizacion.as_deref(),
            Some("1802202601179245326800110010030000000011234567816")
        );
        assert_eq!(r.fecha_autorizacion.as_deref(), Some("2026-02-18T10:35:00-05:00"));
        // El CDATA se remueve y queda el XML autorizado limpio.
        let xml = r.comprobante_xml.unwrap();
        assert!(xml.starts_with("<factura"));
        assert!(!xml.contains("CDATA"));
    }

    #[test]
    fn autorizacion_no_autorizado() {
        let r = clasificar_autorizacion(RESPUESTA_NO_AUTORIZADO).unwrap();
        assert_eq!(r.estado, "NO AUTORIZADO");
        assert!(r.numero_autorizacion.is_none());
        assert_eq!(r.mensajes.len(), 1);
        assert_eq!(r.mensajes[0].identificador, "60");
    }

    #[test]
    fn autorizacion_sin_comprobantes() {
        assert!(clasificar_autorizacion(RESPUESTA_SIN_COMPROBANTES).is_none());
    }

    #[test]
    fn extraer_tag_con_y_sin_namespace() {
        assert_eq!(
            extraer_tag("<estado>RECIBIDA</estado>", "estado").as_deref(),
            Some("RECIBIDA")
        );
        assert_eq!(
            extraer_tag("<ns2:estado>AUTORIZADO</ns2:estado>", "estado").as_deref(),
            Some("AUTORIZADO")
        );
        assert_eq!(extraer_tag("<otra>x</otra>", "estado"), None);
    }
}
