//! Todo lo especifico del SRI: clave de acceso, calculo de impuestos,
//! generacion del XML de factura, credenciales P12, firma XAdES-BES,
//! servicios SOAP de recepcion/autorizacion y RIDE.

pub mod calculos;
pub mod certificado;
pub mod clave_acceso;
pub mod firma;
pub mod ride;
pub mod soap;
pub mod xml;
