mod api_key;
mod emisor;
mod factura;

pub use api_key::{ApiKey, TransaccionLog};
pub use emisor::{codigo_valido, ruc_valido, Emisor, Establecimiento, Perfil, PuntoEmision};
pub use factura::{CampoAdicional, EstadoFactura, Factura, FacturaInput, ItemInput};
