use std::io;
use std::path::Path;

use genpdf::elements::{Break, LinearLayout, PaddedElement, Paragraph, StyledElement, TableLayout};
use genpdf::style::{Color, Style};
use genpdf::{Alignment, Document, Element, Margins, SimplePageDecorator};
use thiserror::Error;

use super::soap::{extraer_bloque, extraer_bloques, extraer_tag};

/// URL publica de consulta de comprobantes del SRI, parametrizada por clave.
const URL_CONSULTA: &str = "https://srienlinea.sri.gob.ec/movil-servicios/api/v1.0/deeplink?id=";

#[derive(Debug, Error)]
pub enum RideError {
    #[error("no se pudieron cargar las fuentes desde {0}: instale LiberationSans-*.ttf")]
    Fuentes(String),
    #[error("el XML del comprobante no tiene el campo {0}")]
    CampoFaltante(&'static str),
    #[error("error componiendo el PDF: {0}")]
    Pdf(String),
}

/// Datos de entrada del RIDE: el XML firmado manda, el resto es metadata de
/// autorizacion que el XML no trae.
pub struct DatosRide<'a> {
    pub xml_firmado: &'a str,
    /// Estado actual de la fila (AUTORIZADO muestra el numero; el resto,
    /// la leyenda PENDIENTE DE AUTORIZACION en rojo).
    pub autorizado: bool,
    pub numero_autorizacion: Option<&'a str>,
    pub fecha_autorizacion: Option<&'a str>,
}

struct LineaRide {
    codigo: String,
    descripcion: String,
    cantidad: f64,
    precio_unitario: f64,
    descuento: f64,
    subtotal: f64,
}

// ============================================
// HELPERS
// ============================================

fn p_aligned(text: &str, style: Style, align: Alignment) -> impl Element {
    Paragraph::new(text).aligned(align).styled(style)
}

/// Paragraph con padding real (izquierdo 3mm) para celdas
fn pp(text: &str, style: Style) -> PaddedElement<StyledElement<Paragraph>> {
    Paragraph::new(text).styled(style).padded(Margins::trbl(1, 1, 1, 3))
}

fn pp_right(text: &str, style: Style) -> impl Element {
    Paragraph::new(text)
        .aligned(Alignment::Right)
        .styled(style)
        .padded(Margins::trbl(1, 3, 1, 1))
}

fn format_cantidad(cant: f64) -> String {
    if cant == cant.floor() {
        format!("{:.0}", cant)
    } else {
        format!("{:.2}", cant)
    }
}

fn format_dinero(val: f64) -> String {
    format!("{:.2}", val)
}

fn campo<'a>(xml: &'a str, tag: &'static str) -> Result<String, RideError> {
    extraer_tag(xml, tag).ok_or(RideError::CampoFaltante(tag))
}

fn numero(xml: &str, tag: &str) -> f64 {
    extraer_tag(xml, tag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

// ============================================
// GENERADOR RIDE PDF
// ============================================

/// Genera el RIDE (PDF A4) de una factura electronica a partir del XML
/// firmado, escribiendo directo en `salida`. Formato estandar SRI basado en
/// la representacion oficial.
pub fn generar_ride(
    datos: &DatosRide<'_>,
    fonts_dir: &Path,
    salida: &mut impl io::Write,
) -> Result<(), RideError> {
    let xml = datos.xml_firmado;

    let font_family = genpdf::fonts::from_files(
        fonts_dir.to_str().unwrap_or("fonts"),
        "LiberationSans",
        None,
    )
    .map_err(|_| RideError::Fuentes(fonts_dir.display().to_string()))?;

    let mut doc = Document::new(font_family);
    doc.set_title("RIDE - Factura Electronica");

    let mut decorator = SimplePageDecorator::new();
    decorator.set_margins(Margins::trbl(15, 15, 15, 15));
    doc.set_page_decorator(decorator);

    // Estilos
    let s_normal = Style::new().with_font_size(9);
    let s_bold = Style::new().with_font_size(9).bold();
    let s_small = Style::new().with_font_size(8);
    let s_small_bold = Style::new().with_font_size(8).bold();
    let s_title = Style::new().with_font_size(14).bold();
    let s_doc_type = Style::new().with_font_size(16).bold();
    let s_doc_no = Style::new().with_font_size(12);
    let s_ruc = Style::new().with_font_size(10).bold();
    let s_clave = Style::new().with_font_size(7);
    let s_total_bold = Style::new().with_font_size(11).bold();
    let s_pie = Style::new().with_font_size(7).with_color(Color::Greyscale(128));
    let s_pendiente = Style::new().with_font_size(9).bold().with_color(Color::Rgb(200, 0, 0));

    // --- Datos del XML firmado ---
    let razon_social = campo(xml, "razonSocial")?;
    let nombre_comercial = extraer_tag(xml, "nombreComercial").unwrap_or_else(|| razon_social.clone());
    let ruc = campo(xml, "ruc")?;
    let clave_acceso = campo(xml, "claveAcceso")?;
    let dir_matriz = extraer_tag(xml, "dirMatriz").unwrap_or_default();
    let ambiente = extraer_tag(xml, "ambiente").unwrap_or_else(|| "1".into());
    let obligado = extraer_tag(xml, "obligadoContabilidad").unwrap_or_else(|| "NO".into());
    let estab = campo(xml, "estab")?;
    let pto_emi = campo(xml, "ptoEmi")?;
    let secuencial = campo(xml, "secuencial")?;
    let fecha_emision = campo(xml, "fechaEmision")?;
    let comprador = extraer_tag(xml, "razonSocialComprador").unwrap_or_default();
    let identificacion = extraer_tag(xml, "identificacionComprador").unwrap_or_default();
    let direccion_comprador = extraer_tag(xml, "direccionComprador").unwrap_or_default();

    let numero_factura = format!("{}-{}-{}", estab, pto_emi, secuencial);
    let ambiente_label = if ambiente == "2" { "PRODUCCION" } else { "PRUEBAS" };

    let detalles = extraer_lineas(xml);

    // ===================================================================
    // SECCION 1: ENCABEZADO (dos columnas con bordes alineados)
    // ===================================================================
    let mut header_table = TableLayout::new(vec![1, 1]);
    header_table.set_cell_decorator(genpdf::elements::FrameCellDecorator::new(true, true, false));

    // --- Columna izquierda: datos del emisor ---
    let mut col_izq = LinearLayout::vertical();
    col_izq.push(Break::new(0.5));
    col_izq.push(pp(&nombre_comercial, s_title));
    col_izq.push(Break::new(0.3));
    col_izq.push(pp(&razon_social, s_normal));
    if !dir_matriz.is_empty() {
        col_izq.push(pp(&format!("Direccion Matriz: {}", dir_matriz), s_normal));
    }
    col_izq.push(Break::new(0.3));
    col_izq.push(pp(
        &format!("OBLIGADO A LLEVAR CONTABILIDAD: {}", obligado),
        s_bold,
    ));
    col_izq.push(Break::new(0.5));

    // --- Columna derecha: RUC, numero y autorizacion ---
    let mut col_der = LinearLayout::vertical();
    col_der.push(Break::new(0.3));
    col_der.push(pp(&format!("R.U.C.:  {}", ruc), s_ruc));
    col_der.push(Break::new(0.3));
    col_der.push(pp("FACTURA", s_doc_type));
    col_der.push(pp(&format!("No. {}", numero_factura), s_doc_no));
    col_der.push(Break::new(0.3));

    if datos.autorizado {
        col_der.push(pp("NUMERO DE AUTORIZACION", s_bold));
        col_der.push(pp(datos.numero_autorizacion.unwrap_or(&clave_acceso), s_clave));
        col_der.push(Break::new(0.3));
        col_der.push(pp("FECHA Y HORA DE AUTORIZACION", s_bold));
        col_der.push(pp(datos.fecha_autorizacion.unwrap_or("-"), s_normal));
    } else {
        col_der.push(pp("PENDIENTE DE AUTORIZACION", s_pendiente));
    }
    col_der.push(Break::new(0.3));
    col_der.push(pp(&format!("AMBIENTE:    {}", ambiente_label), s_normal));
    col_der.push(pp("EMISION:     NORMAL", s_normal));
    col_der.push(Break::new(0.3));

    // Clave de acceso + codigo de barras
    col_der.push(pp("CLAVE DE ACCESO:", s_bold));
    col_der.push(Break::new(0.3));
    if let Ok(barcode_path) = generar_barcode128_image(&clave_acceso) {
        if let Ok(mut barcode_img) = genpdf::elements::Image::from_path(&barcode_path) {
            barcode_img = barcode_img.with_alignment(Alignment::Center);
            barcode_img = barcode_img.with_scale(genpdf::Scale::new(1.8, 2.0));
            col_der.push(barcode_img);
        }
        let _ = std::fs::remove_file(&barcode_path);
    }
    col_der.push(Break::new(0.3));
    col_der.push(p_aligned(&clave_acceso, s_clave, Alignment::Center));
    col_der.push(Break::new(0.3));

    header_table
        .row()
        .element(col_izq.padded(Margins::trbl(2, 3, 2, 3)))
        .element(col_der.padded(Margins::trbl(2, 3, 2, 3)))
        .push()
        .map_err(|e| RideError::Pdf(format!("tabla header: {}", e)))?;

    doc.push(header_table);
    doc.push(Break::new(1.0));

    // ===================================================================
    // SECCION 2: DATOS DEL COMPRADOR
    // ===================================================================
    let tipo_id_label = if identificacion == "9999999999999" {
        "Consumidor Final"
    } else if identificacion.len() == 13 {
        "RUC"
    } else if identificacion.len() == 10 {
        "Cedula"
    } else {
        "Identificacion"
    };

    let mut comprador_section = LinearLayout::vertical();
    let mut fila1 = TableLayout::new(vec![3, 2]);
    fila1
        .row()
        .element(pp(
            &format!("Razon Social / Nombres Apellidos: {}", comprador),
            s_normal,
        ))
        .element(pp(&format!("{}: {}", tipo_id_label, identificacion), s_normal))
        .push()
        .map_err(|e| RideError::Pdf(format!("fila comprador: {}", e)))?;
    comprador_section.push(fila1);

    let mut fila2 = TableLayout::new(vec![3, 2]);
    let dir_text = if direccion_comprador.is_empty() {
        String::new()
    } else {
        format!("Direccion: {}", direccion_comprador)
    };
    fila2
        .row()
        .element(pp(&format!("Fecha de emision: {}", fecha_emision), s_bold))
        .element(pp(&dir_text, s_normal))
        .push()
        .map_err(|e| RideError::Pdf(format!("fila comprador 2: {}", e)))?;
    comprador_section.push(fila2);

    doc.push(comprador_section.padded(Margins::trbl(3, 2, 3, 2)).framed());
    doc.push(Break::new(1.0));

    // ===================================================================
    // SECCION 3: TABLA DE PRODUCTOS
    // ===================================================================
    let mut table = TableLayout::new(vec![2, 1, 6, 2, 1, 2]);
    table.set_cell_decorator(genpdf::elements::FrameCellDecorator::new(true, true, false));

    table
        .row()
        .element(pp("Codigo", s_small_bold))
        .element(pp("Cant.", s_small_bold))
        .element(pp("Descripcion", s_small_bold))
        .element(pp_right("P. Unit.", s_small_bold))
        .element(pp_right("Desc.", s_small_bold))
        .element(pp_right("Subtotal", s_small_bold))
        .push()
        .map_err(|e| RideError::Pdf(format!("tabla detalle header: {}", e)))?;

    for det in &detalles {
        table
            .row()
            .element(pp(&det.codigo, s_small))
            .element(pp(&format_cantidad(det.cantidad), s_small))
            .element(pp(&det.descripcion, s_small))
            .element(pp_right(&format_dinero(det.precio_unitario), s_small))
            .element(pp_right(&format_dinero(det.descuento), s_small))
            .element(pp_right(&format_dinero(det.subtotal), s_small))
            .push()
            .map_err(|e| RideError::Pdf(format!("tabla detalle fila: {}", e)))?;
    }

    doc.push(table);
    doc.push(Break::new(1.5));

    // ===================================================================
    // SECCION 4: INFO ADICIONAL + TOTALES
    // ===================================================================
    let mut bottom_table = TableLayout::new(vec![12, 8]);

    let mut info_col = LinearLayout::vertical();
    info_col.push(Break::new(0.8));
    info_col.push(pp("Informacion Adicional", s_bold));
    info_col.push(Break::new(1.0));
    if let Some(info_adicional) = extraer_bloque(xml, "infoAdicional") {
        for bloque in extraer_bloques(info_adicional, "campoAdicional") {
            if let (Some(inicio), Some(fin)) = (bloque.find('>'), bloque.rfind("</")) {
                info_col.push(pp(&bloque[inicio + 1..fin], s_small));
                info_col.push(Break::new(0.3));
            }
        }
    }
    info_col.push(Break::new(1.0));

    // QR con la URL publica de consulta del comprobante.
    if let Ok(qr_path) = generar_qr_image(&format!("{}{}", URL_CONSULTA, clave_acceso), &clave_acceso) {
        if let Ok(mut qr_img) = genpdf::elements::Image::from_path(&qr_path) {
            qr_img = qr_img.with_scale(genpdf::Scale::new(0.3, 0.3));
            info_col.push(qr_img);
        }
        let _ = std::fs::remove_file(&qr_path);
    }

    // --- Totales desglosados desde los agregados del XML ---
    let mut totales_col = LinearLayout::vertical();
    let mut totales_table = TableLayout::new(vec![4, 2]);
    totales_table.set_cell_decorator(genpdf::elements::FrameCellDecorator::new(true, true, false));

    let mut sub_0 = 0.0;
    let mut sub_5 = 0.0;
    let mut sub_iva = 0.0;
    let mut iva_5 = 0.0;
    let mut iva_mayor = 0.0;
    let mut tarifa_mayor = 15.0;
    if let Some(con_impuestos) = extraer_bloque(xml, "totalConImpuestos") {
        for agregado in extraer_bloques(con_impuestos, "totalImpuesto") {
            let porcentaje = extraer_tag(agregado, "codigoPorcentaje").unwrap_or_default();
            let base = numero(agregado, "baseImponible");
            let valor = numero(agregado, "valor");
            match porcentaje.as_str() {
                "0" => sub_0 += base,
                "5" => {
                    sub_5 += base;
                    iva_5 += valor;
                }
                "2" => {
                    sub_iva += base;
                    iva_mayor += valor;
                    tarifa_mayor = 12.0;
                }
                _ => {
                    sub_iva += base;
                    iva_mayor += valor;
                }
            }
        }
    }

    let total_sin_impuestos = numero(xml, "totalSinImpuestos");
    let total_descuento = numero(xml, "totalDescuento");
    let importe_total = numero(xml, "importeTotal");

    let etiqueta_iva = if tarifa_mayor >= 15.0 { "15%" } else { "12%" };
    let totales_lines: Vec<(String, f64)> = vec![
        (format!("SUBTOTAL {}", etiqueta_iva), sub_iva),
        ("SUBTOTAL 5%".into(), sub_5),
        ("SUBTOTAL IVA 0%".into(), sub_0),
        ("SUBTOTAL SIN IMPUESTO".into(), total_sin_impuestos),
        ("DESCUENTO".into(), total_descuento),
        ("IVA 5%".into(), iva_5),
        (format!("IVA {}", etiqueta_iva), iva_mayor),
        ("PROPINA".into(), 0.0),
    ];

    for (label, valor) in &totales_lines {
        totales_table
            .row()
            .element(pp(label, s_small))
            .element(pp_right(&format_dinero(*valor), s_small))
            .push()
            .map_err(|e| RideError::Pdf(format!("totales fila: {}", e)))?;
    }

    totales_table
        .row()
        .element(pp("VALOR TOTAL", s_total_bold))
        .element(pp_right(&format_dinero(importe_total), s_total_bold))
        .push()
        .map_err(|e| RideError::Pdf(format!("totales valor total: {}", e)))?;

    totales_col.push(totales_table);

    bottom_table
        .row()
        .element(info_col.padded(Margins::trbl(2, 2, 2, 2)).framed())
        .element(totales_col.padded(Margins::trbl(0, 0, 0, 2)))
        .push()
        .map_err(|e| RideError::Pdf(format!("tabla bottom: {}", e)))?;

    doc.push(bottom_table);
    doc.push(Break::new(2.5));

    doc.push(p_aligned(
        "Representacion Impresa de Documento Electronico - SRI Ecuador",
        s_pie,
        Alignment::Center,
    ));

    doc.render(salida)
        .map_err(|e| RideError::Pdf(format!("render: {}", e)))?;

    Ok(())
}

fn extraer_lineas(xml: &str) -> Vec<LineaRide> {
    let Some(detalles) = extraer_bloque(xml, "detalles") else {
        return Vec::new();
    };
    extraer_bloques(detalles, "detalle")
        .into_iter()
        .map(|bloque| LineaRide {
            codigo: extraer_tag(bloque, "codigoPrincipal").unwrap_or_default(),
            descripcion: extraer_tag(bloque, "descripcion").unwrap_or_default(),
            cantidad: numero(bloque, "cantidad"),
            precio_unitario: numero(bloque, "precioUnitario"),
            descuento: numero(bloque, "descuento"),
            subtotal: numero(bloque, "precioTotalSinImpuesto"),
        })
        .collect()
}

// ============================================
// QR CODE GENERATOR
// ============================================

/// Genera un QR code como imagen PNG en archivo temporal.
fn generar_qr_image(data: &str, sufijo: &str) -> Result<String, String> {
    use qrcode::QrCode;

    let code = QrCode::new(data.as_bytes()).map_err(|e| format!("Error creando QR: {}", e))?;

    let modules = code.to_colors();
    let width = code.width() as u32;
    let scale = 4_u32;
    let border = 4_u32;
    let img_size = (width + border * 2) * scale;

    let mut img_buf = vec![255u8; (img_size * img_size) as usize];

    for (i, color) in modules.iter().enumerate() {
        let x = (i as u32) % width;
        let y = (i as u32) / width;
        if *color == qrcode::types::Color::Dark {
            let px = (x + border) * scale;
            let py = (y + border) * scale;
            for dy in 0..scale {
                for dx in 0..scale {
                    let idx = ((py + dy) * img_size + (px + dx)) as usize;
                    if idx < img_buf.len() {
                        img_buf[idx] = 0;
                    }
                }
            }
        }
    }

    let gray_img = image::GrayImage::from_raw(img_size, img_size, img_buf)
        .ok_or("Error creando imagen QR")?;

    let qr_path = std::env::temp_dir().join(format!("facturador_qr_{}.png", sufijo));
    gray_img
        .save(&qr_path)
        .map_err(|e| format!("Error guardando QR: {}", e))?;

    Ok(qr_path.to_string_lossy().to_string())
}

// ============================================
// CODE128 BARCODE GENERATOR
// ============================================

/// Genera un codigo de barras Code128 como imagen PNG en archivo temporal.
/// Intenta Code128-C (numerico) primero, luego Code128-B como fallback.
fn generar_barcode128_image(data: &str) -> Result<String, String> {
    use barcoders::sym::code128::Code128;

    // Code128-C (Ć = U+0106): optimo para datos numericos puros
    // Code128-B (Ɓ = U+0181): alfanumerico general (fallback)
    let data_c = format!("\u{0106}{}", data);
    let barcode = Code128::new(&data_c)
        .or_else(|_| {
            let data_b = format!("\u{0181}{}", data);
            Code128::new(&data_b)
        })
        .map_err(|e| format!("Error creando Code128: {}", e))?;
    let encoded: Vec<u8> = barcode.encode();

    let height = 80_u32;
    let quiet_zone = 5_u32;
    let width = (encoded.len() as u32) + quiet_zone * 2;

    let mut img_buf = vec![255u8; (width * height) as usize];

    for (i, &bar) in encoded.iter().enumerate() {
        if bar == 1 {
            let px = quiet_zone + (i as u32);
            for y in 0..height {
                let idx = (y * width + px) as usize;
                if idx < img_buf.len() {
                    img_buf[idx] = 0;
                }
            }
        }
    }

    let gray_img = image::GrayImage::from_raw(width, height, img_buf)
        .ok_or("Error creando imagen barcode")?;

    let temp_path = std::env::temp_dir().join(format!("facturador_barcode_{}.png", data));
    gray_img
        .save(&temp_path)
        .map_err(|e| format!("Error guardando barcode: {}", e))?;

    Ok(temp_path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xml_prueba() -> String {
        r#"<?xml version="1.0" encoding="UTF-8"?>
<factura id="comprobante" version="1.1.0">
  <infoTributaria>
    <ambiente>1</ambiente>
    <razonSocial>ABARROTES DON PEPE</razonSocial>
    <nombreComercial>DON PEPE</nombreComercial>
    <ruc>1792453268001</ruc>
    <claveAcceso>1802202601179245326800110010030000000011234567816</claveAcceso>
    <codDoc>01</codDoc>
    <estab>001</estab>
    <ptoEmi>100</ptoEmi>
    <secuencial>000000019</secuencial>
    <dirMatriz>Calle Sucre 123</dirMatriz>
  </infoTributaria>
  <infoFactura>
    <fechaEmision>18/02/2026</fechaEmision>
    <obligadoContabilidad>NO</obligadoContabilidad>
    <tipoIdentificacionComprador>05</tipoIdentificacionComprador>
    <razonSocialComprador>Juan Perez</razonSocialComprador>
    <identificacionComprador>0102030405</identificacionComprador>
    <totalSinImpuestos>3.25</totalSinImpuestos>
    <totalDescuento>0.00</totalDescuento>
    <totalConImpuestos>
      <totalImpuesto>
        <codigo>2</codigo>
        <codigoPorcentaje>4</codigoPorcentaje>
        <baseImponible>2.50</baseImponible>
        <valor>0.38</valor>
      </totalImpuesto>
      <totalImpuesto>
        <codigo>2</codigo>
        <codigoPorcentaje>0</codigoPorcentaje>
        <baseImponible>0.75</baseImponible>
        <valor>0.00</valor>
      </totalImpuesto>
    </totalConImpuestos>
    <importeTotal>3.63</importeTotal>
  </infoFactura>
  <detalles>
    <detalle>
      <codigoPrincipal>001</codigoPrincipal>
      <descripcion>Coca Cola 500ml</descripcion>
      <cantidad>2.000000</cantidad>
      <precioUnitario>1.250000</precioUnitario>
      <descuento>0.00</descuento>
      <precioTotalSinImpuesto>2.50</precioTotalSinImpuesto>
    </detalle>
    <detalle>
      <codigoPrincipal>002</codigoPrincipal>
      <descripcion>Pan de agua</descripcion>
      <cantidad>5.000000</cantidad>
      <precioUnitario>0.150000</precioUnitario>
      <descuento>0.00</descuento>
      <precioTotalSinImpuesto>0.75</precioTotalSinImpuesto>
    </detalle>
  </detalles>
</factura>"#
            .to_string()
    }

    #[test]
    fn extrae_lineas_del_xml() {
        let xml = xml_prueba();
        let lineas = extraer_lineas(&xml);
        assert_eq!(lineas.len(), 2);
        assert_eq!(lineas[0].descripcion, "Coca Cola 500ml");
        assert_eq!(lineas[0].cantidad, 2.0);
        assert_eq!(lineas[1].subtotal, 0.75);
    }

    #[test]
    fn genera_pdf_si_hay_fuentes() {
        // Solo corre donde esten instaladas las fuentes del RIDE.
        let fonts_dir = std::path::PathBuf::from("fonts");
        if !fonts_dir.join("LiberationSans-Regular.ttf").exists() {
            return;
        }

        let xml = xml_prueba();
        let datos = DatosRide {
            xml_firmado: &xml,
            autorizado: false,
            numero_autorizacion: None,
            fecha_autorizacion: None,
        };
        let mut buffer = Vec::new();
        generar_ride(&datos, &fonts_dir, &mut buffer).unwrap();
        assert!(buffer.starts_with(b"%PDF"));
    }
}
