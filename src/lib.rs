//! Backend de facturacion electronica para el SRI de Ecuador: emision con
//! secuenciales y creditos atomicos, firma XAdES-BES, recepcion y
//! autorizacion via SOAP, RIDE en PDF y artefactos en un object store.

pub mod config;
pub mod core;
pub mod crypto;
pub mod db;
pub mod error;
pub mod http;
pub mod models;
pub mod sri;
pub mod storage;
