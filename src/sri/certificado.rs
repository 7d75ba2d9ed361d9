use chrono::{DateTime, TimeZone, Utc};
use p12_keystore::{KeyStore, KeyStoreEntry};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use thiserror::Error;
use x509_parser::prelude::*;

/// OIDs propietarios donde las CA ecuatorianas guardan el RUC del titular.
const OID_RUC_PROPIETARIOS: [&str; 2] = ["1.3.6.1.4.1.37746.3.11", "1.3.6.1.4.1.37947.3.11"];

/// OID estandar del atributo serialNumber del sujeto.
const OID_SERIAL_NUMBER: &str = "2.5.4.5";

#[derive(Debug, Error)]
pub enum CredencialError {
    #[error("P12 invalido o password incorrecta: {0}")]
    P12Invalido(String),
    #[error("el P12 no contiene un certificado de firma utilizable")]
    SinCertificado,
    #[error("no se pudo decodificar la llave privada: {0}")]
    ClavePrivada(String),
    #[error("certificado X509 invalido: {0}")]
    X509(String),
    #[error("la firma electronica esta vencida")]
    Expirada,
    #[error("el RUC del certificado ({encontrado}) no coincide con el del emisor ({esperado})")]
    RucMismatch { esperado: String, encontrado: String },
}

/// Credencial de firma lista para usar: certificado elegido, cadena completa
/// y llave privada RSA. Se reconstruye fresca en cada firma; el material
/// descifrado nunca vive en un cache de larga duracion.
pub struct Credencial {
    /// DER del certificado de firma (primero de la cadena).
    pub cert_der: Vec<u8>,
    /// Cadena completa en DER, certificado de firma primero.
    pub cadena: Vec<Vec<u8>>,
    pub clave: RsaPrivateKey,
    /// Nombre del emisor del certificado, en el orden nativo del DER.
    pub emisor_x509: String,
    /// Serial del certificado como decimal.
    pub serial_decimal: String,
    pub sujeto: String,
    pub expira: DateTime<Utc>,
    /// RUC extraido del certificado, si la CA lo incluyo.
    pub ruc: Option<String>,
}

/// Metadata de un certificado candidato, suficiente para la seleccion.
#[derive(Debug, Clone, Copy)]
struct InfoCert {
    es_ca: bool,
    firma_digital: bool,
    no_repudio: bool,
}

/// Prioridad de seleccion; menor gana. `None` descarta (CA).
fn nivel(info: &InfoCert) -> Option<u8> {
    if info.es_ca {
        return None;
    }
    if info.firma_digital && info.no_repudio {
        Some(0)
    } else if info.firma_digital {
        Some(1)
    } else {
        Some(2)
    }
}

/// Elige el indice de la candidata ganadora.
///
/// Prioridad por KeyUsage: digitalSignature+nonRepudiation, luego solo
/// digitalSignature, luego cualquier no-CA. En empate gana el alias que
/// contiene "signing key"; si ninguno, la ultima entrada (los P12 del Banco
/// Central traen el par de cifrado primero y el de firma al final).
fn elegir_indice(infos: &[InfoCert], aliases: &[&str]) -> Option<usize> {
    let mejor = infos.iter().filter_map(nivel).min()?;
    let empatados: Vec<usize> = infos
        .iter()
        .enumerate()
        .filter(|(_, info)| nivel(info) == Some(mejor))
        .map(|(i, _)| i)
        .collect();

    empatados
        .iter()
        .copied()
        .find(|&i| aliases[i].to_lowercase().contains("signing key"))
        .or_else(|| empatados.last().copied())
}

fn inspeccionar(der: &[u8]) -> Result<InfoCert, CredencialError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| CredencialError::X509(format!("{e:?}")))?;

    let es_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);

    let (firma_digital, no_repudio) = cert
        .key_usage()
        .ok()
        .flatten()
        .map(|ku| (ku.value.digital_signature(), ku.value.non_repudiation()))
        .unwrap_or((false, false));

    Ok(InfoCert {
        es_ca,
        firma_digital,
        no_repudio,
    })
}

/// Abre un contenedor PKCS#12 y arma la credencial de firma.
pub fn cargar_credencial(p12: &[u8], password: &str) -> Result<Credencial, CredencialError> {
    let keystore = KeyStore::from_pkcs12(p12, password)
        .map_err(|e| CredencialError::P12Invalido(e.to_string()))?;

    // Candidatas: cada llave privada con su cadena ya emparejada por
    // localKeyId dentro del contenedor.
    let mut aliases: Vec<&str> = Vec::new();
    let mut cadenas = Vec::new();
    for (alias, entrada) in keystore.entries() {
        if let KeyStoreEntry::PrivateKeyChain(cadena) = entrada {
            if !cadena.chain().is_empty() {
                aliases.push(alias.as_str());
                cadenas.push(cadena);
            }
        }
    }
    if cadenas.is_empty() {
        return Err(CredencialError::SinCertificado);
    }

    let infos = cadenas
        .iter()
        .map(|c| inspeccionar(c.chain()[0].as_der()))
        .collect::<Result<Vec<_>, _>>()?;

    let idx = elegir_indice(&infos, &aliases).ok_or(CredencialError::SinCertificado)?;
    let elegida = cadenas[idx];

    let cert_der = elegida.chain()[0].as_der().to_vec();
    let cadena: Vec<Vec<u8>> = elegida.chain().iter().map(|c| c.as_der().to_vec()).collect();

    let clave = RsaPrivateKey::from_pkcs8_der(elegida.key())
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(elegida.key()))
        .map_err(|e| CredencialError::ClavePrivada(e.to_string()))?;

    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| CredencialError::X509(format!("{e:?}")))?;

    let expira = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| CredencialError::X509("notAfter fuera de rango".into()))?;

    let credencial = Credencial {
        emisor_x509: format!("{}", cert.issuer()),
        serial_decimal: cert.tbs_certificate.serial.to_string(),
        sujeto: format!("{}", cert.subject()),
        expira,
        ruc: extraer_ruc(&cert),
        cert_der: cert_der.clone(),
        cadena,
        clave,
    };

    Ok(credencial)
}

impl Credencial {
    /// Falla si el certificado ya vencio.
    pub fn verificar_vigencia(&self, ahora: DateTime<Utc>) -> Result<(), CredencialError> {
        if self.expira < ahora {
            return Err(CredencialError::Expirada);
        }
        Ok(())
    }

    /// Falla si el certificado trae un RUC y no es el del emisor.
    pub fn verificar_ruc(&self, ruc_emisor: &str) -> Result<(), CredencialError> {
        match &self.ruc {
            Some(encontrado) if encontrado != ruc_emisor => Err(CredencialError::RucMismatch {
                esperado: ruc_emisor.to_string(),
                encontrado: encontrado.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Busca el RUC del titular: primero en los OIDs propietarios de las CA,
/// luego en el serialNumber del sujeto.
fn extraer_ruc(cert: &X509Certificate<'_>) -> Option<String> {
    for ext in cert.extensions() {
        let oid = ext.oid.to_id_string();
        if OID_RUC_PROPIETARIOS.contains(&oid.as_str()) {
            if let Some(ruc) = buscar_ruc_en(&String::from_utf8_lossy(ext.value)) {
                return Some(ruc);
            }
        }
    }

    cert.subject()
        .iter_attributes()
        .filter(|attr| attr.attr_type().to_id_string() == OID_SERIAL_NUMBER)
        .find_map(|attr| attr.as_str().ok().and_then(buscar_ruc_en))
}

/// Primera corrida de exactamente 13 digitos dentro del texto.
fn buscar_ruc_en(texto: &str) -> Option<String> {
    let bytes = texto.as_bytes();
    let mut inicio = None;
    for (i, b) in bytes.iter().chain(std::iter::once(&b' ')).enumerate() {
        if b.is_ascii_digit() {
            if inicio.is_none() {
                inicio = Some(i);
            }
        } else if let Some(desde) = inicio.take() {
            if i - desde == 13 {
                return Some(texto[desde..i].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(es_ca: bool, firma_digital: bool, no_repudio: bool) -> InfoCert {
        InfoCert {
            es_ca,
            firma_digital,
            no_repudio,
        }
    }

    #[test]
    fn prioridad_de_seleccion() {
        // El par de firma (digitalSignature + nonRepudiation) gana sobre el
        // de cifrado aunque venga despues.
        let infos = [info(false, true, false), info(false, true, true)];
        assert_eq!(elegir_indice(&infos, &["cifrado", "firma"]), Some(1));

        // Sin nonRepudiation gana digitalSignature sobre el resto.
        let infos = [info(false, false, false), info(false, true, false)];
        assert_eq!(elegir_indice(&infos, &["otro", "ds"]), Some(1));

        // Solo CA: nada seleccionable.
        let infos = [info(true, true, true)];
        assert_eq!(elegir_indice(&infos, &["ca"]), None);

        // Ningun KeyUsage util: primera no-CA (unica candidata).
        let infos = [info(true, false, false), info(false, false, false)];
        assert_eq!(elegir_indice(&infos, &["ca", "plano"]), Some(1));
    }

    #[test]
    fn desempate_por_alias_y_orden() {
        // Dos pares equivalentes: gana el alias "signing key".
        let infos = [info(false, true, true), info(false, true, true)];
        assert_eq!(
            elegir_indice(&infos, &["decryption key", "Signing Key"]),
            Some(1)
        );
        assert_eq!(
            elegir_indice(&infos, &["signing key", "decryption key"]),
            Some(0)
        );

        // Sin pista en el alias: la ultima entrada (orden empirico de los
        // P12 del Banco Central: cifrado primero, firma al final).
        assert_eq!(elegir_indice(&infos, &["uno", "dos"]), Some(1));
    }

    #[test]
    fn ruc_en_texto() {
        assert_eq!(
            buscar_ruc_en("RUC 1790011674001 CIA"),
            Some("1790011674001".to_string())
        );
        assert_eq!(buscar_ruc_en("1790011674001"), Some("1790011674001".to_string()));
        // 12 o 14 digitos no son RUC.
        assert_eq!(buscar_ruc_en("179001167400"), None);
        assert_eq!(buscar_ruc_en("17900116740011"), None);
        assert_eq!(buscar_ruc_en("sin digitos"), None);
    }

    #[test]
    fn verificacion_de_ruc() {
        let mismatch = CredencialError::RucMismatch {
            esperado: "a".into(),
            encontrado: "b".into(),
        };
        // El mensaje nombra ambos RUC para el log del emisor.
        assert!(mismatch.to_string().contains("no coincide"));
    }
}
