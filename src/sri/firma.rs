use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::certificado::Credencial;

pub const NS_DS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const NS_ETSI: &str = "http://uri.etsi.org/01903/v1.3.2#";

const ALG_C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const ALG_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ALG_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const TIPO_SIGNED_PROPERTIES: &str = "http://uri.etsi.org/01903#SignedProperties";

const ID_FIRMA: &str = "Signature";
const ID_SIGNED_PROPERTIES: &str = "Signature-SignedProperties";

#[derive(Debug, Error)]
pub enum FirmaError {
    #[error("el documento no tiene cierre </factura> donde insertar la firma")]
    SinRaiz,
    #[error("error firmando con RSA: {0}")]
    Rsa(#[from] rsa::Error),
}

/// Firma un comprobante con XAdES-BES segun el perfil del SRI.
///
/// La firma envuelta se inserta como ultimo hijo de `<factura>`. El perfil
/// es estricto con tres puntos que suelen causar rechazos: el atributo
/// `Type` de la referencia a SignedProperties, el nombre del emisor del
/// certificado en el orden nativo del DER, y el serial en decimal.
pub fn firmar_comprobante(xml: &str, credencial: &Credencial) -> Result<String, FirmaError> {
    firmar_comprobante_con_tiempo(xml, credencial, Utc::now())
}

/// Variante con instante de firma explicito, para pruebas deterministas.
pub fn firmar_comprobante_con_tiempo(
    xml: &str,
    credencial: &Credencial,
    ahora: DateTime<Utc>,
) -> Result<String, FirmaError> {
    // Referencia A: el documento completo sin la firma (transformacion
    // enveloped) y sin declaracion XML, que c14n excluye. El generador
    // propio emite XML canonico por construccion, asi que el resto de la
    // canonicalizacion es identidad.
    let cuerpo = canonicalizar_documento(xml);
    let digest_comprobante = sha256_b64(cuerpo.as_bytes());

    let signing_time = ahora.to_rfc3339_opts(SecondsFormat::Secs, true);
    let digest_certificado = sha256_b64(&credencial.cert_der);

    let signed_properties = signed_properties(
        &signing_time,
        &digest_certificado,
        &credencial.emisor_x509,
        &credencial.serial_decimal,
    );
    // Para el digest, SignedProperties se canonicaliza con los namespaces
    // heredados de sus ancestros (ds en Signature, etsi en
    // QualifyingProperties), ordenados por prefijo.
    let digest_signed_properties = sha256_b64(
        inyectar_ns(
            &signed_properties,
            "etsi:SignedProperties",
            &format!(r#" xmlns:ds="{NS_DS}" xmlns:etsi="{NS_ETSI}""#),
        )
        .as_bytes(),
    );

    let signed_info = signed_info(&digest_comprobante, &digest_signed_properties);
    let signed_info_canonico = inyectar_ns(
        &signed_info,
        "ds:SignedInfo",
        &format!(r#" xmlns:ds="{NS_DS}""#),
    );

    let digest = Sha256::digest(signed_info_canonico.as_bytes());
    let firma = credencial
        .clave
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;
    let firma_b64 = BASE64.encode(firma);

    let key_info = key_info(credencial);

    let firma_xml = format!(
        r##"<ds:Signature xmlns:ds="{NS_DS}" Id="{ID_FIRMA}">{signed_info}<ds:SignatureValue>{firma_b64}</ds:SignatureValue>{key_info}<ds:Object><etsi:QualifyingProperties xmlns:etsi="{NS_ETSI}" Target="#{ID_FIRMA}">{signed_properties}</etsi:QualifyingProperties></ds:Object></ds:Signature>"##
    );

    let cierre = xml.rfind("</factura>").ok_or(FirmaError::SinRaiz)?;
    let mut firmado = String::with_capacity(xml.len() + firma_xml.len());
    firmado.push_str(&xml[..cierre]);
    firmado.push_str(&firma_xml);
    firmado.push_str(&xml[cierre..]);
    Ok(firmado)
}

/// c14n del documento para la referencia envuelta: remueve la declaracion
/// XML y el espacio previo a la raiz.
pub(crate) fn canonicalizar_documento(xml: &str) -> &str {
    let sin_decl = match xml.find("?>") {
        Some(fin) if xml.trim_start().starts_with("<?xml") => &xml[fin + 2..],
        _ => xml,
    };
    sin_decl.trim_start()
}

pub(crate) fn sha256_b64(datos: &[u8]) -> String {
    BASE64.encode(Sha256::digest(datos))
}

/// Inserta declaraciones de namespace en el tag de apertura de `tag`.
/// c14n pone los namespaces antes que los demas atributos, ordenados por
/// prefijo; `decls` debe venir ya en ese orden.
pub(crate) fn inyectar_ns(fragmento: &str, tag: &str, decls: &str) -> String {
    let apertura = format!("<{tag}");
    match fragmento.find(&apertura) {
        Some(pos) => {
            let mut salida = fragmento.to_string();
            salida.insert_str(pos + apertura.len(), decls);
            salida
        }
        None => fragmento.to_string(),
    }
}

fn signed_info(digest_comprobante: &str, digest_signed_properties: &str) -> String {
    format!(
        r##"<ds:SignedInfo><ds:CanonicalizationMethod Algorithm="{ALG_C14N}"></ds:CanonicalizationMethod><ds:SignatureMethod Algorithm="{ALG_RSA_SHA256}"></ds:SignatureMethod><ds:Reference URI=""><ds:Transforms><ds:Transform Algorithm="{ALG_ENVELOPED}"></ds:Transform><ds:Transform Algorithm="{ALG_C14N}"></ds:Transform></ds:Transforms><ds:DigestMethod Algorithm="{ALG_SHA256}"></ds:DigestMethod><ds:DigestValue>{digest_comprobante}</ds:DigestValue></ds:Reference><ds:Reference Type="{TIPO_SIGNED_PROPERTIES}" URI="#{ID_SIGNED_PROPERTIES}"><ds:Transforms><ds:Transform Algorithm="{ALG_C14N}"></ds:Transform></ds:Transforms><ds:DigestMethod Algorithm="{ALG_SHA256}"></ds:DigestMethod><ds:DigestValue>{digest_signed_properties}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##
    )
}

fn signed_properties(
    signing_time: &str,
    digest_certificado: &str,
    emisor: &str,
    serial: &str,
) -> String {
    let emisor = escapar_texto(emisor);
    format!(
        r##"<etsi:SignedProperties Id="{ID_SIGNED_PROPERTIES}"><etsi:SignedSignatureProperties><etsi:SigningTime>{signing_time}</etsi:SigningTime><etsi:SigningCertificate><etsi:Cert><etsi:CertDigest><ds:DigestMethod Algorithm="{ALG_SHA256}"></ds:DigestMethod><ds:DigestValue>{digest_certificado}</ds:DigestValue></etsi:CertDigest><etsi:IssuerSerial><ds:X509IssuerName>{emisor}</ds:X509IssuerName><ds:X509SerialNumber>{serial}</ds:X509SerialNumber></etsi:IssuerSerial></etsi:Cert></etsi:SigningCertificate></etsi:SignedSignatureProperties><etsi:SignedDataObjectProperties><etsi:DataObjectFormat ObjectReference="#comprobante"><etsi:MimeType>text/xml</etsi:MimeType></etsi:DataObjectFormat></etsi:SignedDataObjectProperties></etsi:SignedProperties>"##
    )
}

fn key_info(credencial: &Credencial) -> String {
    let certificados: String = credencial
        .cadena
        .iter()
        .map(|der| format!("<ds:X509Certificate>{}</ds:X509Certificate>", BASE64.encode(der)))
        .collect();

    let publica = credencial.clave.to_public_key();
    let modulo = BASE64.encode(publica.n().to_bytes_be());
    let exponente = BASE64.encode(publica.e().to_bytes_be());

    format!(
        r#"<ds:KeyInfo><ds:X509Data>{certificados}</ds:X509Data><ds:KeyValue><ds:RSAKeyValue><ds:Modulus>{modulo}</ds:Modulus><ds:Exponent>{exponente}</ds:Exponent></ds:RSAKeyValue></ds:KeyValue></ds:KeyInfo>"#
    )
}

/// Escape minimo para contenido de texto dentro de la firma (el nombre del
/// emisor puede traer ampersands o comparadores).
fn escapar_texto(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
