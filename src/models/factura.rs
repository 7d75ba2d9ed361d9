use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::ApiError;

use super::emisor::codigo_valido;

/// Estados del comprobante. Transiciones monotonas, sin aristas de regreso:
///
/// ```text
/// PENDIENTE -> FIRMADO -> RECIBIDA -> AUTORIZADO | RECHAZADO
///                      -> DEVUELTA
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstadoFactura {
    Pendiente,
    Firmado,
    Recibida,
    Devuelta,
    Autorizado,
    Rechazado,
}

impl EstadoFactura {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pendiente => "PENDIENTE",
            Self::Firmado => "FIRMADO",
            Self::Recibida => "RECIBIDA",
            Self::Devuelta => "DEVUELTA",
            Self::Autorizado => "AUTORIZADO",
            Self::Rechazado => "RECHAZADO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDIENTE" => Some(Self::Pendiente),
            "FIRMADO" => Some(Self::Firmado),
            "RECIBIDA" => Some(Self::Recibida),
            "DEVUELTA" => Some(Self::Devuelta),
            "AUTORIZADO" => Some(Self::Autorizado),
            "RECHAZADO" => Some(Self::Rechazado),
            _ => None,
        }
    }

    /// AUTORIZADO y RECHAZADO nunca se abandonan. DEVUELTA tampoco: la clave
    /// de acceso ya se consumio y una correccion es una emision nueva.
    pub fn es_terminal(&self) -> bool {
        matches!(self, Self::Autorizado | Self::Rechazado | Self::Devuelta)
    }

    /// Aristas permitidas del grafo de estados.
    pub fn puede_pasar_a(&self, destino: EstadoFactura) -> bool {
        use EstadoFactura::*;
        matches!(
            (self, destino),
            (Pendiente, Firmado)
                | (Firmado, Recibida)
                | (Firmado, Devuelta)
                | (Recibida, Autorizado)
                | (Recibida, Rechazado)
        )
    }
}

/// Fila central del comprobante. `secuencial` y `clave_acceso` quedan nulos
/// mientras la factura esta PENDIENTE (la asignacion ocurre al firmar).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Factura {
    pub id: i64,
    pub emisor_id: i64,
    pub punto_emision_id: i64,
    pub secuencial: Option<String>,
    pub clave_acceso: Option<String>,
    pub identificacion_comprador: String,
    pub razon_social_comprador: String,
    pub subtotal_sin_impuestos: f64,
    pub subtotal_0: f64,
    pub subtotal_iva: f64,
    pub valor_iva: f64,
    pub importe_total: f64,
    pub estado: String,
    pub xml_path: Option<String>,
    pub pdf_path: Option<String>,
    pub fecha_envio_sri: Option<DateTime<Utc>>,
    pub fecha_autorizacion: Option<DateTime<Utc>>,
    pub mensajes_sri: Option<serde_json::Value>,
    /// Eco opaco del request original del cliente, para auditoria.
    pub client_input_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Item de una factura tal como lo envia el cliente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemInput {
    #[serde(default)]
    pub codigo: Option<String>,
    pub descripcion: String,
    pub cantidad: f64,
    #[serde(rename = "precioUnitario")]
    pub precio_unitario: f64,
    #[serde(default)]
    pub descuento: f64,
    #[serde(rename = "tarifaIva")]
    pub tarifa_iva: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampoAdicional {
    pub nombre: String,
    pub valor: String,
}

/// Payload de emision validado en el borde HTTP. El JSON crudo se conserva
/// aparte como `client_input_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacturaInput {
    pub establecimiento: String,
    #[serde(rename = "puntoEmision")]
    pub punto_emision: String,
    #[serde(rename = "identificacionComprador")]
    pub identificacion_comprador: String,
    #[serde(rename = "razonSocialComprador")]
    pub razon_social_comprador: String,
    #[serde(rename = "tipoIdentificacionComprador", default)]
    pub tipo_identificacion_comprador: Option<String>,
    #[serde(rename = "direccionComprador", default)]
    pub direccion_comprador: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "formaPago", default)]
    pub forma_pago: Option<String>,
    pub items: Vec<ItemInput>,
    #[serde(rename = "infoAdicional", default)]
    pub info_adicional: Vec<CampoAdicional>,
}

impl FacturaInput {
    pub fn validar(&self) -> Result<(), ApiError> {
        if !codigo_valido(&self.establecimiento) {
            return Err(ApiError::Validacion("establecimiento debe ser 3 digitos".into()));
        }
        if !codigo_valido(&self.punto_emision) {
            return Err(ApiError::Validacion("puntoEmision debe ser 3 digitos".into()));
        }
        if self.identificacion_comprador.is_empty() {
            return Err(ApiError::Validacion("identificacionComprador es requerida".into()));
        }
        if self.razon_social_comprador.trim().is_empty() {
            return Err(ApiError::Validacion("razonSocialComprador es requerida".into()));
        }
        if self.items.is_empty() {
            return Err(ApiError::Validacion("la factura necesita al menos un item".into()));
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.descripcion.trim().is_empty() {
                return Err(ApiError::Validacion(format!("item {i}: descripcion vacia")));
            }
            if !item.cantidad.is_finite() || item.cantidad <= 0.0 {
                return Err(ApiError::Validacion(format!("item {i}: cantidad invalida")));
            }
            if !item.precio_unitario.is_finite() || item.precio_unitario < 0.0 {
                return Err(ApiError::Validacion(format!("item {i}: precioUnitario invalido")));
            }
            if !item.descuento.is_finite() || item.descuento < 0.0 {
                return Err(ApiError::Validacion(format!("item {i}: descuento invalido")));
            }
        }
        Ok(())
    }

    /// Codigo SRI del tipo de identificacion del comprador. Si el cliente no
    /// lo manda, se infiere: 13 digitos RUC, consumidor final 9999999999999,
    /// 10 digitos cedula, resto pasaporte.
    pub fn tipo_identificacion_sri(&self) -> &str {
        if let Some(ref t) = self.tipo_identificacion_comprador {
            return match t.as_str() {
                "RUC" | "04" => "04",
                "CEDULA" | "05" => "05",
                "PASAPORTE" | "06" => "06",
                _ => "07",
            };
        }
        let id = self.identificacion_comprador.as_str();
        if id == "9999999999999" {
            "07"
        } else if id.len() == 13 {
            "04"
        } else if id.len() == 10 {
            "05"
        } else {
            "06"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_base() -> FacturaInput {
        FacturaInput {
            establecimiento: "001".into(),
            punto_emision: "100".into(),
            identificacion_comprador: "0102030405".into(),
            razon_social_comprador: "Juan Perez".into(),
            tipo_identificacion_comprador: None,
            direccion_comprador: None,
            email: None,
            forma_pago: None,
            items: vec![ItemInput {
                codigo: None,
                descripcion: "Servicio".into(),
                cantidad: 1.0,
                precio_unitario: 100.0,
                descuento: 0.0,
                tarifa_iva: 15.0,
            }],
            info_adicional: vec![],
        }
    }

    #[test]
    fn transiciones_monotonas() {
        use EstadoFactura::*;
        assert!(Pendiente.puede_pasar_a(Firmado));
        assert!(Firmado.puede_pasar_a(Recibida));
        assert!(Firmado.puede_pasar_a(Devuelta));
        assert!(Recibida.puede_pasar_a(Autorizado));
        assert!(Recibida.puede_pasar_a(Rechazado));

        // Ningun estado terminal tiene salida.
        for terminal in [Autorizado, Rechazado, Devuelta] {
            for destino in [Pendiente, Firmado, Recibida, Devuelta, Autorizado, Rechazado] {
                assert!(!terminal.puede_pasar_a(destino), "{terminal:?} -> {destino:?}");
            }
        }
        // Sin aristas de regreso.
        assert!(!Recibida.puede_pasar_a(Firmado));
        assert!(!Firmado.puede_pasar_a(Pendiente));
    }

    #[test]
    fn estados_parse_roundtrip() {
        for e in [
            EstadoFactura::Pendiente,
            EstadoFactura::Firmado,
            EstadoFactura::Recibida,
            EstadoFactura::Devuelta,
            EstadoFactura::Autorizado,
            EstadoFactura::Rechazado,
        ] {
            assert_eq!(EstadoFactura::parse(e.as_str()), Some(e));
        }
        assert_eq!(EstadoFactura::parse("OTRO"), None);
    }

    #[test]
    fn validacion_de_input() {
        assert!(input_base().validar().is_ok());

        let mut sin_items = input_base();
        sin_items.items.clear();
        assert!(sin_items.validar().is_err());

        let mut estab_malo = input_base();
        estab_malo.establecimiento = "1".into();
        assert!(estab_malo.validar().is_err());

        let mut cantidad_mala = input_base();
        cantidad_mala.items[0].cantidad = 0.0;
        assert!(cantidad_mala.validar().is_err());
    }

    #[test]
    fn tipo_identificacion_inferido() {
        let mut input = input_base();
        assert_eq!(input.tipo_identificacion_sri(), "05");
        input.identificacion_comprador = "9999999999999".into();
        assert_eq!(input.tipo_identificacion_sri(), "07");
        input.identificacion_comprador = "1790011674001".into();
        assert_eq!(input.tipo_identificacion_sri(), "04");
        input.tipo_identificacion_comprador = Some("PASAPORTE".into());
        assert_eq!(input.tipo_identificacion_sri(), "06");
    }
}
