use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Endpoints del SRI por ambiente. Sobrescribibles por variable de entorno
/// para apuntar a stubs en pruebas.
#[derive(Debug, Clone)]
pub struct EndpointsSri {
    pub recepcion_pruebas: String,
    pub recepcion_produccion: String,
    pub autorizacion_pruebas: String,
    pub autorizacion_produccion: String,
}

impl EndpointsSri {
    pub fn recepcion(&self, ambiente: &str) -> &str {
        match ambiente {
            "2" => &self.recepcion_produccion,
            _ => &self.recepcion_pruebas,
        }
    }

    pub fn autorizacion(&self, ambiente: &str) -> &str {
        match ambiente {
            "2" => &self.autorizacion_produccion,
            _ => &self.autorizacion_pruebas,
        }
    }
}

impl Default for EndpointsSri {
    fn default() -> Self {
        Self {
            recepcion_pruebas: "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline".into(),
            recepcion_produccion: "https://cel.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline".into(),
            autorizacion_pruebas: "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline".into(),
            autorizacion_produccion: "https://cel.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline".into(),
        }
    }
}

/// Momento en que se descuenta el credito del emisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoliticaCredito {
    /// Descuenta dentro de la transaccion de emision (al quedar FIRMADO).
    Eager,
    /// Descuenta cuando el SRI autoriza el comprobante.
    Lazy,
}

#[derive(Debug, Clone)]
pub struct ConfigMinio {
    pub endpoint: String,
    pub puerto: u16,
    pub use_ssl: bool,
    pub usuario: String,
    pub password: String,
}

impl ConfigMinio {
    pub fn url(&self) -> String {
        let esquema = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}", esquema, self.endpoint, self.puerto)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub puerto: u16,
    pub minio: ConfigMinio,
    /// Secreto maestro para cifrar passwords de P12 en reposo.
    pub encryption_key: String,
    pub webhook_notificaciones: Option<String>,
    pub n8n_api_key: String,
    /// Endpoint del proveedor de identidad que valida tokens bearer.
    pub identidad_url: String,
    pub politica_credito: PoliticaCredito,
    pub sri: EndpointsSri,
    pub fonts_dir: PathBuf,
    /// Tolerar tarifas de IVA desconocidas degradando a 0% en vez de fallar.
    pub iva_lenient: bool,
    /// Creditos iniciales al activar un RUC.
    pub creditos_iniciales: i64,
}

fn var_opcional(nombre: &str) -> Option<String> {
    env::var(nombre).ok().filter(|v| !v.is_empty())
}

fn var_requerida(nombre: &str) -> Result<String> {
    var_opcional(nombre).with_context(|| format!("falta la variable de entorno {nombre}"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let politica_credito = match var_opcional("CREDIT_POLICY").as_deref() {
            None | Some("eager") => PoliticaCredito::Eager,
            Some("lazy") => PoliticaCredito::Lazy,
            Some(otro) => bail!("CREDIT_POLICY invalida: {otro} (use eager o lazy)"),
        };

        let mut sri = EndpointsSri::default();
        if let Some(v) = var_opcional("SRI_RECEPCION_PRUEBAS") {
            sri.recepcion_pruebas = v;
        }
        if let Some(v) = var_opcional("SRI_RECEPCION_PRODUCCION") {
            sri.recepcion_produccion = v;
        }
        if let Some(v) = var_opcional("SRI_AUTORIZACION_PRUEBAS") {
            sri.autorizacion_pruebas = v;
        }
        if let Some(v) = var_opcional("SRI_AUTORIZACION_PRODUCCION") {
            sri.autorizacion_produccion = v;
        }

        Ok(Self {
            database_url: var_requerida("DATABASE_URL")?,
            puerto: var_opcional("PORT")
                .map(|p| p.parse::<u16>().context("PORT invalido"))
                .transpose()?
                .unwrap_or(3000),
            minio: ConfigMinio {
                endpoint: var_requerida("MINIO_ENDPOINT")?,
                puerto: var_opcional("MINIO_PORT")
                    .map(|p| p.parse::<u16>().context("MINIO_PORT invalido"))
                    .transpose()?
                    .unwrap_or(9000),
                use_ssl: var_opcional("MINIO_USE_SSL").as_deref() == Some("true"),
                usuario: var_requerida("MINIO_ROOT_USER")?,
                password: var_requerida("MINIO_ROOT_PASSWORD")?,
            },
            encryption_key: var_requerida("ENCRYPTION_KEY")?,
            webhook_notificaciones: var_opcional("WEB_HOOK_NOTIFICACIONES"),
            n8n_api_key: var_requerida("N8N_API_KEY")?,
            identidad_url: var_requerida("IDENTITY_VERIFY_URL")?,
            politica_credito,
            sri,
            fonts_dir: var_opcional("FONTS_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("fonts")),
            iva_lenient: var_opcional("IVA_LENIENT").as_deref() == Some("true"),
            creditos_iniciales: var_opcional("CREDITOS_INICIALES")
                .map(|v| v.parse::<i64>().context("CREDITOS_INICIALES invalido"))
                .transpose()?
                .unwrap_or(10),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_por_ambiente() {
        let sri = EndpointsSri::default();
        assert!(sri.recepcion("1").contains("celcer"));
        assert!(sri.recepcion("2").starts_with("https://cel.sri"));
        assert!(sri.autorizacion("2").contains("Autorizacion"));
    }

    #[test]
    fn url_minio() {
        let m = ConfigMinio {
            endpoint: "localhost".into(),
            puerto: 9000,
            use_ssl: false,
            usuario: "minio".into(),
            password: "minio123".into(),
        };
        assert_eq!(m.url(), "http://localhost:9000");
    }
}
