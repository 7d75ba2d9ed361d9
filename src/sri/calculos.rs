use thiserror::Error;

use crate::models::ItemInput;

#[derive(Debug, Error)]
pub enum CalculoError {
    #[error("tarifa de IVA no soportada: {0}")]
    TarifaDesconocida(f64),
    #[error("item {indice}: el descuento {descuento} supera el valor de la linea {bruto}")]
    DescuentoExcesivo {
        indice: usize,
        descuento: f64,
        bruto: f64,
    },
}

/// Linea calculada lista para el XML.
#[derive(Debug, Clone)]
pub struct DetalleCalculado {
    pub codigo_principal: String,
    pub descripcion: String,
    pub cantidad: f64,
    pub precio_unitario: f64,
    pub descuento: f64,
    /// Tarifa normalizada en puntos porcentuales (0, 5, 12, 15).
    pub tarifa_iva: f64,
    pub codigo_porcentaje: &'static str,
    pub base_imponible: f64,
    pub valor_iva: f64,
}

/// Agregado de impuesto por tarifa (bloque totalImpuesto del XML).
#[derive(Debug, Clone)]
pub struct AgregadoImpuesto {
    /// "2" = IVA
    pub codigo: &'static str,
    pub codigo_porcentaje: &'static str,
    pub tarifa: f64,
    pub base_imponible: f64,
    pub valor: f64,
}

#[derive(Debug, Clone)]
pub struct TotalesFactura {
    pub total_sin_impuestos: f64,
    pub total_descuento: f64,
    pub total_iva: f64,
    pub importe_total: f64,
    pub subtotal_0: f64,
    pub subtotal_iva: f64,
}

#[derive(Debug, Clone)]
pub struct ResultadoCalculo {
    pub detalles: Vec<DetalleCalculado>,
    pub impuestos: Vec<AgregadoImpuesto>,
    pub totales: TotalesFactura,
}

/// Tabla de tarifas soportadas -> (codigo, codigoPorcentaje) del SRI.
const TARIFAS: [(u32, &str, &str); 4] = [
    (0, "2", "0"),
    (5, "2", "5"),
    (12, "2", "2"),
    (15, "2", "4"),
];

/// Una tarifa expresada como fraccion (0.15) se lleva a puntos (15).
pub fn normalizar_tarifa(tarifa: f64) -> f64 {
    if tarifa > 0.0 && tarifa < 1.0 {
        tarifa * 100.0
    } else {
        tarifa
    }
}

fn codigo_porcentaje(tarifa: f64) -> Option<(&'static str, &'static str)> {
    if !tarifa.is_finite() || tarifa < 0.0 {
        return None;
    }
    let entera = tarifa.round();
    if (tarifa - entera).abs() > 1e-9 {
        return None;
    }
    TARIFAS
        .iter()
        .find(|(t, _, _)| *t == entera as u32)
        .map(|(_, codigo, porcentaje)| (*codigo, *porcentaje))
}

/// Redondeo a 2 decimales, mitades alejandose de cero. Se aplica una sola
/// vez, al borde de formateo; la agregacion interna corre en f64 completo.
pub fn redondear2(valor: f64) -> f64 {
    // El epsilon compensa representaciones binarias tipo 1.005 -> 100.4999…
    let escalado = valor * 100.0;
    let ajustado = escalado.abs() + 1e-9;
    ((ajustado + 0.5).floor() / 100.0).copysign(valor)
}

/// Calcula detalles, agregados por tarifa y totales de una factura.
///
/// Por linea: `base = cantidad * precioUnitario - descuento` y
/// `valor = base * tarifa / 100`. Una tarifa fuera de la tabla es un error
/// duro salvo que `lenient` este activo, en cuyo caso degrada a la fila 0%.
///
/// Los totales se derivan de los agregados ya redondeados para que cuadren
/// al centavo: `importeTotal = totalSinImpuestos + totalIva` y
/// `subtotal_0 + subtotal_iva = totalSinImpuestos` siempre.
pub fn calcular(items: &[ItemInput], lenient: bool) -> Result<ResultadoCalculo, CalculoError> {
    let mut detalles = Vec::with_capacity(items.len());
    // Acumuladores por codigoPorcentaje, en orden de tabla.
    let mut bases = [0.0f64; TARIFAS.len()];
    let mut valores = [0.0f64; TARIFAS.len()];
    let mut usados = [false; TARIFAS.len()];
    let mut descuento_acum = 0.0f64;

    for (i, item) in items.iter().enumerate() {
        let tarifa = normalizar_tarifa(item.tarifa_iva);
        let (tarifa, codigo, porcentaje) = match codigo_porcentaje(tarifa) {
            Some((codigo, porcentaje)) => (tarifa, codigo, porcentaje),
            None if lenient => (0.0, "2", "0"),
            None => return Err(CalculoError::TarifaDesconocida(item.tarifa_iva)),
        };

        let bruto = item.cantidad * item.precio_unitario;
        if item.descuento > bruto + 1e-9 {
            return Err(CalculoError::DescuentoExcesivo {
                indice: i,
                descuento: item.descuento,
                bruto,
            });
        }
        let base = bruto - item.descuento;
        let valor = base * tarifa / 100.0;

        let ranura = TARIFAS
            .iter()
            .position(|(_, _, p)| *p == porcentaje)
            .expect("porcentaje fuera de tabla");
        bases[ranura] += base;
        valores[ranura] += valor;
        usados[ranura] = true;
        descuento_acum += item.descuento;

        detalles.push(DetalleCalculado {
            codigo_principal: item.codigo.clone().unwrap_or_else(|| "SIN-COD".to_string()),
            descripcion: item.descripcion.clone(),
            cantidad: item.cantidad,
            precio_unitario: item.precio_unitario,
            descuento: redondear2(item.descuento),
            tarifa_iva: tarifa,
            codigo_porcentaje: porcentaje,
            base_imponible: redondear2(base),
            valor_iva: redondear2(valor),
        });
    }

    let mut impuestos = Vec::new();
    let mut subtotal_0 = 0.0;
    let mut subtotal_iva = 0.0;
    let mut total_iva = 0.0;

    for (ranura, (tarifa, codigo, porcentaje)) in TARIFAS.iter().enumerate() {
        if !usados[ranura] {
            continue;
        }
        let base = redondear2(bases[ranura]);
        let valor = redondear2(valores[ranura]);
        if *tarifa == 0 {
            subtotal_0 += base;
        } else {
            subtotal_iva += base;
            total_iva += valor;
        }
        impuestos.push(AgregadoImpuesto {
            codigo,
            codigo_porcentaje: porcentaje,
            tarifa: f64::from(*tarifa),
            base_imponible: base,
            valor,
        });
    }

    // Derivados de los agregados redondeados: cuadran al centavo por construccion.
    let subtotal_0 = redondear2(subtotal_0);
    let subtotal_iva = redondear2(subtotal_iva);
    let total_iva = redondear2(total_iva);
    let total_sin_impuestos = redondear2(subtotal_0 + subtotal_iva);
    let importe_total = redondear2(total_sin_impuestos + total_iva);

    Ok(ResultadoCalculo {
        detalles,
        impuestos,
        totales: TotalesFactura {
            total_sin_impuestos,
            total_descuento: redondear2(descuento_acum),
            total_iva,
            importe_total,
            subtotal_0,
            subtotal_iva,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(cantidad: f64, precio: f64, descuento: f64, tarifa: f64) -> ItemInput {
        ItemInput {
            codigo: None,
            descripcion: "item".into(),
            cantidad,
            precio_unitario: precio,
            descuento,
            tarifa_iva: tarifa,
        }
    }

    fn centavos(v: f64) -> i64 {
        (v * 100.0).round() as i64
    }

    #[test]
    fn escenario_simple_iva_15() {
        // 1 x 100.00 al 15%: subtotal 100.00, IVA 15.00, total 115.00.
        let r = calcular(&[item(1.0, 100.0, 0.0, 15.0)], false).unwrap();
        assert_eq!(centavos(r.totales.total_sin_impuestos), 100_00);
        assert_eq!(centavos(r.totales.subtotal_iva), 100_00);
        assert_eq!(centavos(r.totales.subtotal_0), 0);
        assert_eq!(centavos(r.totales.total_iva), 15_00);
        assert_eq!(centavos(r.totales.importe_total), 115_00);
        assert_eq!(r.detalles[0].codigo_porcentaje, "4");
    }

    #[test]
    fn tarifa_fraccionaria_se_normaliza() {
        // 0.15 equivale a 15.
        let r = calcular(&[item(2.0, 10.0, 0.0, 0.15)], false).unwrap();
        assert_eq!(r.detalles[0].tarifa_iva, 15.0);
        assert_eq!(centavos(r.totales.total_iva), 3_00);
    }

    #[test]
    fn tarifa_desconocida_es_error_salvo_lenient() {
        let items = [item(1.0, 10.0, 0.0, 8.0)];
        assert!(matches!(
            calcular(&items, false),
            Err(CalculoError::TarifaDesconocida(_))
        ));

        // Una tarifa negativa tampoco es la fila 0%.
        assert!(matches!(
            calcular(&[item(1.0, 10.0, 0.0, -5.0)], false),
            Err(CalculoError::TarifaDesconocida(_))
        ));

        let r = calcular(&items, true).unwrap();
        assert_eq!(r.detalles[0].codigo_porcentaje, "0");
        assert_eq!(centavos(r.totales.total_iva), 0);
        assert_eq!(centavos(r.totales.subtotal_0), 10_00);
    }

    #[test]
    fn descuento_reduce_la_base() {
        let r = calcular(&[item(3.0, 4.0, 2.0, 12.0)], false).unwrap();
        assert_eq!(centavos(r.detalles[0].base_imponible), 10_00);
        assert_eq!(centavos(r.totales.total_descuento), 2_00);
        assert_eq!(centavos(r.totales.total_iva), 1_20);
    }

    #[test]
    fn descuento_mayor_al_bruto_es_error() {
        assert!(matches!(
            calcular(&[item(1.0, 5.0, 6.0, 0.0)], false),
            Err(CalculoError::DescuentoExcesivo { .. })
        ));
    }

    #[test]
    fn totales_cuadran_al_centavo() {
        // Mezcla de tarifas con valores que fuerzan redondeo.
        let items = [
            item(3.0, 0.333, 0.0, 15.0),
            item(1.0, 19.99, 0.5, 15.0),
            item(7.0, 0.15, 0.0, 0.0),
            item(2.0, 1.111, 0.0, 5.0),
        ];
        let r = calcular(&items, false).unwrap();
        let t = &r.totales;

        // importeTotal == totalSinImpuestos + suma de valores por tarifa.
        let suma_valores: i64 = r.impuestos.iter().map(|a| centavos(a.valor)).sum();
        assert_eq!(centavos(t.importe_total), centavos(t.total_sin_impuestos) + suma_valores);
        // subtotal_iva + subtotal_0 == totalSinImpuestos.
        assert_eq!(
            centavos(t.subtotal_iva) + centavos(t.subtotal_0),
            centavos(t.total_sin_impuestos)
        );
        assert_eq!(centavos(t.total_iva), suma_valores);
    }

    #[test]
    fn agregados_por_tarifa() {
        let items = [
            item(1.0, 10.0, 0.0, 15.0),
            item(1.0, 20.0, 0.0, 15.0),
            item(1.0, 5.0, 0.0, 0.0),
        ];
        let r = calcular(&items, false).unwrap();
        assert_eq!(r.impuestos.len(), 2);

        let cero = r.impuestos.iter().find(|a| a.codigo_porcentaje == "0").unwrap();
        assert_eq!(centavos(cero.base_imponible), 5_00);
        assert_eq!(centavos(cero.valor), 0);

        let quince = r.impuestos.iter().find(|a| a.codigo_porcentaje == "4").unwrap();
        assert_eq!(centavos(quince.base_imponible), 30_00);
        assert_eq!(centavos(quince.valor), 4_50);
    }

    #[test]
    fn redondeo_mitades_lejos_de_cero() {
        assert_eq!(redondear2(1.005), 1.01);
        assert_eq!(redondear2(1.004), 1.0);
        assert_eq!(redondear2(2.675), 2.68);
        assert_eq!(redondear2(-1.005), -1.01);
        assert_eq!(redondear2(0.0), 0.0);
    }
}
