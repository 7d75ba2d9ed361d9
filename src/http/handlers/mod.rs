pub mod admin;
pub mod auth;
pub mod claves;
pub mod emisor;
pub mod estructura;
pub mod facturas;
pub mod integraciones;
pub mod publico;
