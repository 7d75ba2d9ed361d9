use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaveError {
    #[error("campo {campo} de la clave de acceso: se esperaban {esperado} digitos y llegaron {obtenido}")]
    Ancho {
        campo: &'static str,
        esperado: usize,
        obtenido: usize,
    },
}

/// Genera la clave de acceso de 49 digitos para comprobantes electronicos SRI.
///
/// Estructura (48 digitos + 1 digito verificador):
/// - Posiciones 1-8:   fecha emision (ddmmyyyy)
/// - Posiciones 9-10:  codigo documento (01=factura, 04=nota credito)
/// - Posiciones 11-23: RUC emisor (13 digitos)
/// - Posicion 24:      ambiente (1=pruebas, 2=produccion)
/// - Posiciones 25-27: establecimiento (3 digitos)
/// - Posiciones 28-30: punto de emision (3 digitos)
/// - Posiciones 31-39: secuencial (9 digitos)
/// - Posiciones 40-47: codigo numerico (8 digitos; aleatorio si no se pasa)
/// - Posicion 48:      tipo emision (1=normal)
/// - Posicion 49:      digito verificador (modulo 11)
///
/// Todos los campos se limpian a digitos y se rellenan con ceros a la
/// izquierda. Cualquier campo que no quepa en su ancho es un error duro: una
/// clave que no mida exactamente 49 digitos jamas sale de aqui.
#[allow(clippy::too_many_arguments)]
pub fn generar_clave_acceso(
    fecha_emision: &str, // formato dd/mm/yyyy
    cod_doc: &str,       // "01" factura
    ruc: &str,           // 13 digitos
    ambiente: &str,      // "1" o "2"
    establecimiento: &str,
    punto_emision: &str,
    secuencial: &str,
    codigo_numerico: Option<&str>,
    tipo_emision: &str, // normalmente "1"
) -> Result<String, ClaveError> {
    let codigo = match codigo_numerico {
        Some(c) => rellenar("codigo_numerico", c, 8)?,
        None => {
            let aleatorio: u32 = rand::thread_rng().gen_range(10000000..99999999);
            format!("{:08}", aleatorio)
        }
    };

    let base = format!(
        "{}{}{}{}{}{}{}{}{}",
        rellenar("fecha_emision", fecha_emision, 8)?,
        rellenar("cod_doc", cod_doc, 2)?,
        rellenar("ruc", ruc, 13)?,
        rellenar("ambiente", ambiente, 1)?,
        rellenar("establecimiento", establecimiento, 3)?,
        rellenar("punto_emision", punto_emision, 3)?,
        rellenar("secuencial", secuencial, 9)?,
        codigo,
        rellenar("tipo_emision", tipo_emision, 1)?,
    );
    debug_assert_eq!(base.len(), 48);

    let dv = digito_verificador_modulo11(&base);
    Ok(format!("{}{}", base, dv))
}

/// Limpia a digitos y rellena con ceros a la izquierda hasta `ancho`.
fn rellenar(campo: &'static str, valor: &str, ancho: usize) -> Result<String, ClaveError> {
    let digitos: String = valor.chars().filter(|c| c.is_ascii_digit()).collect();
    if digitos.len() > ancho || digitos.is_empty() {
        return Err(ClaveError::Ancho {
            campo,
            esperado: ancho,
            obtenido: digitos.len(),
        });
    }
    Ok(format!("{:0>ancho$}", digitos))
}

/// Calcula el digito verificador usando modulo 11 con pesos [2,3,4,5,6,7]
/// ciclicos desde derecha a izquierda. 11 -> 0, 10 -> 1.
pub fn digito_verificador_modulo11(cadena: &str) -> u32 {
    let pesos = [2, 3, 4, 5, 6, 7];
    let mut suma: u32 = 0;

    for (i, ch) in cadena.chars().rev().enumerate() {
        let digito = ch.to_digit(10).unwrap_or(0);
        let peso = pesos[i % pesos.len()];
        suma += digito * peso;
    }

    let residuo = suma % 11;
    match 11 - residuo {
        11 => 0,
        10 => 1,
        dv => dv,
    }
}

/// Valida la forma de una clave de acceso: 49 digitos y el verificador de
/// los primeros 48 coincide con el 49.
pub fn clave_valida(clave: &str) -> bool {
    clave.len() == 49
        && clave.chars().all(|c| c.is_ascii_digit())
        && clave
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .is_some_and(|dv| dv == digito_verificador_modulo11(&clave[..48]))
}
