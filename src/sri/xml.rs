use serde::{Deserialize, Serialize};

use super::calculos::{redondear2, ResultadoCalculo};

/// Datos necesarios para generar el XML de una factura electronica SRI v1.1.0
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatosFactura {
    // Info tributaria
    pub ambiente: String,     // "1" pruebas, "2" produccion
    pub tipo_emision: String, // "1" normal
    pub razon_social: String,
    pub nombre_comercial: String,
    pub ruc: String,
    pub clave_acceso: String,
    pub cod_doc: String, // "01" factura
    pub estab: String,
    pub pto_emi: String,
    pub secuencial: String, // 9 digitos
    pub dir_matriz: String,

    // Info factura
    pub fecha_emision: String, // dd/mm/yyyy
    pub dir_establecimiento: String,
    pub obligado_contabilidad: String, // "SI" o "NO"
    pub tipo_identificacion_comprador: String,
    pub razon_social_comprador: String,
    pub identificacion_comprador: String,
    pub direccion_comprador: Option<String>,

    // Totales
    pub total_sin_impuestos: f64,
    pub total_descuento: f64,
    pub importe_total: f64,

    // Impuestos totales agrupados
    pub impuestos_totales: Vec<ImpuestoTotal>,

    // Pagos
    pub pagos: Vec<PagoFactura>,

    // Detalles
    pub detalles: Vec<DetalleFactura>,

    // Info adicional (opcional)
    pub info_adicional: Vec<CampoAdicionalXml>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImpuestoTotal {
    pub codigo: String,            // "2" = IVA
    pub codigo_porcentaje: String, // "0"=0%, "4"=15%, etc
    pub base_imponible: f64,
    pub valor: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PagoFactura {
    pub forma_pago: String, // "01"=efectivo, "20"=otros
    pub total: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetalleFactura {
    pub codigo_principal: String,
    pub descripcion: String,
    pub cantidad: f64,
    pub precio_unitario: f64,
    pub descuento: f64,
    pub precio_total_sin_impuesto: f64,
    pub codigo_porcentaje_iva: String,
    pub tarifa_iva: f64,
    pub base_imponible: f64,
    pub valor_iva: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CampoAdicionalXml {
    pub nombre: String,
    pub valor: String,
}

/// Mapea forma de pago del cliente a codigo SRI
pub fn forma_pago_sri(forma: &str) -> &'static str {
    match forma {
        "EFECTIVO" | "01" => "01",
        "TRANSFERENCIA" | "20" => "20",
        "TARJETA" | "19" => "19",
        _ => "01",
    }
}

impl DatosFactura {
    /// Incorpora detalles, agregados y totales de un calculo.
    pub fn con_calculo(mut self, calculo: &ResultadoCalculo) -> Self {
        self.total_sin_impuestos = calculo.totales.total_sin_impuestos;
        self.total_descuento = calculo.totales.total_descuento;
        self.importe_total = calculo.totales.importe_total;
        self.impuestos_totales = calculo
            .impuestos
            .iter()
            .map(|a| ImpuestoTotal {
                codigo: a.codigo.to_string(),
                codigo_porcentaje: a.codigo_porcentaje.to_string(),
                base_imponible: a.base_imponible,
                valor: a.valor,
            })
            .collect();
        self.detalles = calculo
            .detalles
            .iter()
            .map(|d| DetalleFactura {
                codigo_principal: d.codigo_principal.clone(),
                descripcion: d.descripcion.clone(),
                cantidad: d.cantidad,
                precio_unitario: d.precio_unitario,
                descuento: d.descuento,
                precio_total_sin_impuesto: d.base_imponible,
                codigo_porcentaje_iva: d.codigo_porcentaje.to_string(),
                tarifa_iva: d.tarifa_iva,
                base_imponible: d.base_imponible,
                valor_iva: d.valor_iva,
            })
            .collect();
        self
    }
}

/// Genera el XML de factura electronica SRI v1.1.0.
///
/// El atributo `id="comprobante"` en la raiz es obligatorio: la firma lo
/// referencia via `//*[@id='comprobante']`.
///
/// IMPORTANTE: No usa self-closing tags (<tag/>) porque el SRI los rechaza.
/// Todos los tags usan formato <tag></tag>.
pub fn generar_xml_factura(datos: &DatosFactura) -> String {
    let mut xml = String::with_capacity(8192);

    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<factura id=\"comprobante\" version=\"1.1.0\">\n");

    // === infoTributaria ===
    xml.push_str("  <infoTributaria>\n");
    xml_tag(&mut xml, 4, "ambiente", &datos.ambiente);
    xml_tag(&mut xml, 4, "tipoEmision", &datos.tipo_emision);
    xml_tag(&mut xml, 4, "razonSocial", &xml_escape(&datos.razon_social));
    xml_tag(&mut xml, 4, "nombreComercial", &xml_escape(&datos.nombre_comercial));
    xml_tag(&mut xml, 4, "ruc", &datos.ruc);
    xml_tag(&mut xml, 4, "claveAcceso", &datos.clave_acceso);
    xml_tag(&mut xml, 4, "codDoc", &datos.cod_doc);
    xml_tag(&mut xml, 4, "estab", &datos.estab);
    xml_tag(&mut xml, 4, "ptoEmi", &datos.pto_emi);
    xml_tag(&mut xml, 4, "secuencial", &datos.secuencial);
    xml_tag(&mut xml, 4, "dirMatriz", &xml_escape(&datos.dir_matriz));
    xml.push_str("  </infoTributaria>\n");

    // === infoFactura ===
    xml.push_str("  <infoFactura>\n");
    xml_tag(&mut xml, 4, "fechaEmision", &datos.fecha_emision);
    xml_tag(&mut xml, 4, "dirEstablecimiento", &xml_escape(&datos.dir_establecimiento));
    xml_tag(&mut xml, 4, "obligadoContabilidad", &datos.obligado_contabilidad);
    xml_tag(&mut xml, 4, "tipoIdentificacionComprador", &datos.tipo_identificacion_comprador);
    xml_tag(&mut xml, 4, "razonSocialComprador", &xml_escape(&datos.razon_social_comprador));
    xml_tag(&mut xml, 4, "identificacionComprador", &datos.identificacion_comprador);

    if let Some(ref dir) = datos.direccion_comprador {
        if !dir.is_empty() {
            xml_tag(&mut xml, 4, "direccionComprador", &xml_escape(dir));
        }
    }

    xml_tag(&mut xml, 4, "totalSinImpuestos", &dinero(datos.total_sin_impuestos));
    xml_tag(&mut xml, 4, "totalDescuento", &dinero(datos.total_descuento));

    // totalConImpuestos
    xml.push_str("    <totalConImpuestos>\n");
    for imp in &datos.impuestos_totales {
        xml.push_str("      <totalImpuesto>\n");
        xml_tag(&mut xml, 8, "codigo", &imp.codigo);
        xml_tag(&mut xml, 8, "codigoPorcentaje", &imp.codigo_porcentaje);
        xml_tag(&mut xml, 8, "baseImponible", &dinero(imp.base_imponible));
        xml_tag(&mut xml, 8, "valor", &dinero(imp.valor));
        xml.push_str("      </totalImpuesto>\n");
    }
    xml.push_str("    </totalConImpuestos>\n");

    xml_tag(&mut xml, 4, "propina", "0.00");
    xml_tag(&mut xml, 4, "importeTotal", &dinero(datos.importe_total));
    xml_tag(&mut xml, 4, "moneda", "DOLAR");

    // pagos
    xml.push_str("    <pagos>\n");
    for pago in &datos.pagos {
        xml.push_str("      <pago>\n");
        xml_tag(&mut xml, 8, "formaPago", &pago.forma_pago);
        xml_tag(&mut xml, 8, "total", &dinero(pago.total));
        xml.push_str("      </pago>\n");
    }
    xml.push_str("    </pagos>\n");

    xml.push_str("  </infoFactura>\n");

    // === detalles ===
    xml.push_str("  <detalles>\n");
    for det in &datos.detalles {
        xml.push_str("    <detalle>\n");
        xml_tag(&mut xml, 6, "codigoPrincipal", &xml_escape(&det.codigo_principal));
        xml_tag(&mut xml, 6, "descripcion", &xml_escape(&det.descripcion));
        xml_tag(&mut xml, 6, "cantidad", &format!("{:.6}", det.cantidad));
        xml_tag(&mut xml, 6, "precioUnitario", &format!("{:.6}", det.precio_unitario));
        xml_tag(&mut xml, 6, "descuento", &dinero(det.descuento));
        xml_tag(&mut xml, 6, "precioTotalSinImpuesto", &dinero(det.precio_total_sin_impuesto));

        xml.push_str("      <impuestos>\n");
        xml.push_str("        <impuesto>\n");
        xml_tag(&mut xml, 10, "codigo", "2"); // IVA
        xml_tag(&mut xml, 10, "codigoPorcentaje", &det.codigo_porcentaje_iva);
        xml_tag(&mut xml, 10, "tarifa", &dinero(det.tarifa_iva));
        xml_tag(&mut xml, 10, "baseImponible", &dinero(det.base_imponible));
        xml_tag(&mut xml, 10, "valor", &dinero(det.valor_iva));
        xml.push_str("        </impuesto>\n");
        xml.push_str("      </impuestos>\n");

        xml.push_str("    </detalle>\n");
    }
    xml.push_str("  </detalles>\n");

    // === infoAdicional (opcional) ===
    if !datos.info_adicional.is_empty() {
        xml.push_str("  <infoAdicional>\n");
        for campo in &datos.info_adicional {
            xml.push_str(&format!(
                "    <campoAdicional nombre=\"{}\">{}</campoAdicional>\n",
                xml_escape(&campo.nombre),
                xml_escape(&campo.valor)
            ));
        }
        xml.push_str("  </infoAdicional>\n");
    }

    xml.push_str("</factura>");
    asegurar_id_comprobante(xml)
}

/// Garantiza que la raiz lleve `id="comprobante"`. El generador propio ya lo
/// emite; si el documento vino de otro serializador que lo omitio, se parcha
/// el tag de apertura.
pub fn asegurar_id_comprobante(xml: String) -> String {
    if xml.contains("id=\"comprobante\"") {
        return xml;
    }
    if let Some(pos) = xml.find("<factura") {
        let mut parchado = xml.clone();
        parchado.insert_str(pos + "<factura".len(), " id=\"comprobante\"");
        return parchado;
    }
    xml
}

fn dinero(valor: f64) -> String {
    format!("{:.2}", redondear2(valor))
}

/// Escribe un tag XML sin self-closing: <tag>value</tag>
fn xml_tag(xml: &mut String, indent: usize, tag: &str, value: &str) {
    let spaces = " ".repeat(indent);
    xml.push_str(&format!("{}<{}>{}</{}>\n", spaces, tag, value, tag));
}

/// Normaliza texto para XML del SRI Ecuador.
/// Remueve caracteres de control, normaliza Unicode problematico y espacios.
fn normalize_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());

    for ch in s.chars() {
        match ch {
            // Remover caracteres de control (excepto tab, newline, carriage return)
            '\x00'..='\x08' | '\x0B' | '\x0C' | '\x0E'..='\x1F' | '\x7F' => {}
            // Comillas simples curvas -> recta
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => result.push('\''),
            // Comillas dobles curvas -> recta
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => result.push('"'),
            // Guiones largos -> guion normal
            '\u{2013}' | '\u{2014}' | '\u{2015}' => result.push('-'),
            // Elipsis -> tres puntos
            '\u{2026}' => result.push_str("..."),
            // Non-breaking space -> espacio normal
            '\u{00A0}' => result.push(' '),
            // Soft hyphen -> remover
            '\u{00AD}' => {}
            // Cualquier otro caracter: mantener
            _ => result.push(ch),
        }
    }

    // Colapsar multiples espacios en uno y trim
    let mut collapsed = String::with_capacity(result.len());
    let mut prev_space = false;
    for ch in result.trim().chars() {
        if ch.is_whitespace() {
            if !prev_space {
                collapsed.push(' ');
            }
            prev_space = true;
        } else {
            collapsed.push(ch);
            prev_space = false;
        }
    }

    collapsed
}

/// Escapa caracteres especiales XML (con normalizacion previa)
pub fn xml_escape(s: &str) -> String {
    let normalized = normalize_text(s);
    normalized
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datos_base() -> DatosFactura {
        DatosFactura {
            ambiente: "1".to_string(),
            tipo_emision: "1".to_string(),
            razon_social: "NEGOCIO TEST".to_string(),
            nombre_comercial: "NEGOCIO TEST".to_string(),
            ruc: "0912345678001".to_string(),
            clave_acceso: "1".repeat(49),
            cod_doc: "01".to_string(),
            estab: "001".to_string(),
            pto_emi: "100".to_string(),
            secuencial: "000000001".to_string(),
            dir_matriz: "Guayaquil".to_string(),
            fecha_emision: "11/02/2026".to_string(),
            dir_establecimiento: "Guayaquil".to_string(),
            obligado_contabilidad: "NO".to_string(),
            tipo_identificacion_comprador: "07".to_string(),
            razon_social_comprador: "CONSUMIDOR FINAL".to_string(),
            identificacion_comprador: "9999999999999".to_string(),
            direccion_comprador: None,
            total_sin_impuestos: 10.0,
            total_descuento: 0.0,
            importe_total: 11.50,
            impuestos_totales: vec![ImpuestoTotal {
                codigo: "2".to_string(),
                codigo_porcentaje: "4".to_string(),
                base_imponible: 10.0,
                valor: 1.50,
            }],
            pagos: vec![PagoFactura {
                forma_pago: "01".to_string(),
                total: 11.50,
            }],
            detalles: vec![DetalleFactura {
                codigo_principal: "PROD001".to_string(),
                descripcion: "Producto Test".to_string(),
                cantidad: 1.0,
                precio_unitario: 10.0,
                descuento: 0.0,
                precio_total_sin_impuesto: 10.0,
                codigo_porcentaje_iva: "4".to_string(),
                tarifa_iva: 15.0,
                base_imponible: 10.0,
                valor_iva: 1.50,
            }],
            info_adicional: vec![],
        }
    }

    #[test]
    fn test_generar_xml_basico() {
        let xml = generar_xml_factura(&datos_base());
        assert!(xml.contains("<factura id=\"comprobante\" version=\"1.1.0\">"));
        assert!(xml.contains("<ruc>0912345678001</ruc>"));
        assert!(xml.contains("<importeTotal>11.50</importeTotal>"));
        assert!(xml.contains("<codigoPorcentaje>4</codigoPorcentaje>"));
        assert!(xml.contains("</factura>"));
        // No debe tener self-closing tags
        assert!(!xml.contains("/>"));
    }

    #[test]
    fn test_escape_de_texto() {
        let mut datos = datos_base();
        datos.razon_social = "P&P \u{201C}El Mejor\u{201D}  <Cia>".to_string();
        let xml = generar_xml_factura(&datos);
        assert!(xml.contains("P&amp;P &quot;El Mejor&quot; &lt;Cia&gt;"));
    }

    #[test]
    fn test_parche_id_comprobante() {
        let sin_id = "<factura version=\"1.1.0\">\n</factura>".to_string();
        let parchado = asegurar_id_comprobante(sin_id);
        assert!(parchado.starts_with("<factura id=\"comprobante\" version=\"1.1.0\">"));

        // Con el id presente no se toca nada.
        let con_id = "<factura id=\"comprobante\" version=\"1.1.0\"></factura>".to_string();
        assert_eq!(asegurar_id_comprobante(con_id.clone()), con_id);
    }

    #[test]
    fn test_info_adicional() {
        let mut datos = datos_base();
        datos.info_adicional = vec![CampoAdicionalXml {
            nombre: "email".into(),
            valor: "cliente@mail.com".into(),
        }];
        let xml = generar_xml_factura(&datos);
        assert!(xml.contains("<campoAdicional nombre=\"email\">cliente@mail.com</campoAdicional>"));
    }
}
