use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Perfil de un usuario del proveedor de identidad. Un perfil sin emisor
/// asociado todavia no completo el onboarding.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Perfil {
    pub id: i64,
    pub user_uid: String,
    pub email: Option<String>,
    pub emisor_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Identidad tributaria que origina comprobantes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Emisor {
    pub id: i64,
    pub ruc: String,
    pub razon_social: String,
    pub nombre_comercial: Option<String>,
    pub direccion_matriz: String,
    /// "1" pruebas, "2" produccion
    pub ambiente: String,
    /// "SI" o "NO"
    pub obligado_contabilidad: String,
    /// Ruta canonica "<bucket>/<key>" del P12 en el object store.
    pub p12_path: Option<String>,
    /// Password del P12 cifrado en reposo (iv_hex:ct_hex). Nunca viaja en
    /// respuestas.
    #[serde(skip_serializing)]
    pub p12_password_cifrada: Option<String>,
    pub p12_expiracion: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Local fisico de un emisor. `codigo` son 3 digitos, unico por emisor.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Establecimiento {
    pub id: i64,
    pub emisor_id: i64,
    pub codigo: String,
    pub direccion: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Caja registradora de un establecimiento. `secuencial_actual` solo avanza
/// via la funcion `generar_secuencial` bajo lock de fila.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PuntoEmision {
    pub id: i64,
    pub establecimiento_id: i64,
    pub codigo: String,
    pub secuencial_actual: i64,
    pub created_at: DateTime<Utc>,
}

/// Valida un codigo de establecimiento o punto de emision (3 digitos).
pub fn codigo_valido(codigo: &str) -> bool {
    codigo.len() == 3 && codigo.chars().all(|c| c.is_ascii_digit())
}

/// Valida un RUC ecuatoriano por forma (13 digitos).
pub fn ruc_valido(ruc: &str) -> bool {
    ruc.len() == 13 && ruc.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validaciones_de_forma() {
        assert!(codigo_valido("001"));
        assert!(!codigo_valido("1"));
        assert!(!codigo_valido("00a"));
        assert!(!codigo_valido("0001"));
        assert!(ruc_valido("1790011674001"));
        assert!(!ruc_valido("179001167400"));
        assert!(!ruc_valido("17900116740010"));
    }
}
