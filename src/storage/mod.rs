//! Adaptador del object store (MinIO via API S3). Interfaz por bucket y
//! llave; `put` devuelve la ruta canonica `"<bucket>/<key>"` y crea el
//! bucket en el primer uso si no existe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;

use crate::config::ConfigMinio;

pub const BUCKET_FACTURAS: &str = "invoices";
pub const BUCKET_CERTIFICADOS: &str = "certificates";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store: {0}")]
    S3(String),
    #[error("objeto no encontrado: {bucket}/{key}")]
    NoEncontrado { bucket: String, key: String },
}

/// Rutas canonicas dentro de los buckets.
pub mod rutas {
    use super::{BUCKET_CERTIFICADOS, BUCKET_FACTURAS};

    pub fn xml_firmado(ruc: &str, clave: &str) -> (&'static str, String) {
        (BUCKET_FACTURAS, format!("signed/{ruc}/{clave}.xml"))
    }

    pub fn pdf_firmado(ruc: &str, clave: &str) -> (&'static str, String) {
        (BUCKET_FACTURAS, format!("signed/{ruc}/{clave}.pdf"))
    }

    pub fn xml_autorizado(ruc: &str, clave: &str) -> (&'static str, String) {
        (BUCKET_FACTURAS, format!("authorized/{ruc}/{clave}.xml"))
    }

    pub fn certificado(ruc: &str, epoch: i64) -> (&'static str, String) {
        (BUCKET_CERTIFICADOS, format!("{ruc}/certificate_{epoch}.p12"))
    }

    /// Separa una ruta canonica `"<bucket>/<key>"` en sus partes.
    pub fn partir(ruta: &str) -> Option<(&str, &str)> {
        ruta.split_once('/')
    }
}

/// Store de artefactos: S3/MinIO en produccion, memoria en pruebas.
#[derive(Clone)]
pub enum ArtifactStore {
    S3(S3Store),
    Memoria(MemoryStore),
}

impl ArtifactStore {
    pub fn s3(config: &ConfigMinio) -> Self {
        Self::S3(S3Store::nuevo(config))
    }

    pub fn memoria() -> Self {
        Self::Memoria(MemoryStore::default())
    }

    /// Sube un blob y devuelve la ruta canonica `"<bucket>/<key>"`.
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        match self {
            Self::S3(s3) => s3.put(bucket, key, bytes, content_type).await,
            Self::Memoria(mem) => mem.put(bucket, key, bytes, content_type),
        }
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        match self {
            Self::S3(s3) => s3.get(bucket, key).await,
            Self::Memoria(mem) => mem.get(bucket, key),
        }
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        match self {
            Self::S3(s3) => s3.delete(bucket, key).await,
            Self::Memoria(mem) => mem.delete(bucket, key),
        }
    }

    /// URL pre-firmada de lectura con vigencia `ttl`.
    pub async fn presign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        match self {
            Self::S3(s3) => s3.presign(bucket, key, ttl).await,
            Self::Memoria(_) => Ok(format!("memory://{bucket}/{key}")),
        }
    }

    /// `get` sobre una ruta canonica `"<bucket>/<key>"`.
    pub async fn get_ruta(&self, ruta: &str) -> Result<Vec<u8>, StorageError> {
        let (bucket, key) = rutas::partir(ruta).ok_or_else(|| StorageError::S3(format!("ruta invalida: {ruta}")))?;
        self.get(bucket, key).await
    }

    /// `delete` tolerante para limpieza best-effort de rollback.
    pub async fn delete_ruta_silencioso(&self, ruta: &str) {
        if let Some((bucket, key)) = rutas::partir(ruta) {
            if let Err(e) = self.delete(bucket, key).await {
                tracing::warn!(ruta, error = %e, "no se pudo limpiar artefacto");
            }
        }
    }
}

#[derive(Clone)]
pub struct S3Store {
    cliente: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn nuevo(config: &ConfigMinio) -> Self {
        let credenciales = Credentials::new(
            config.usuario.clone(),
            config.password.clone(),
            None,
            None,
            "minio",
        );
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.url())
            .credentials_provider(credenciales)
            .region(Region::new("us-east-1"))
            .force_path_style(true)
            .build();
        Self {
            cliente: aws_sdk_s3::Client::from_conf(conf),
        }
    }

    async fn asegurar_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if self.cliente.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }
        match self.cliente.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            // Otro proceso pudo crearlo entre el head y el create.
            Err(e) => {
                let servicio = e.into_service_error();
                if servicio.is_bucket_already_owned_by_you() || servicio.is_bucket_already_exists() {
                    Ok(())
                } else {
                    Err(StorageError::S3(servicio.to_string()))
                }
            }
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.asegurar_bucket(bucket).await?;
        self.cliente
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(format!("{bucket}/{key}"))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let salida = self
            .cliente
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let servicio = e.into_service_error();
                if servicio.is_no_such_key() {
                    StorageError::NoEncontrado {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::S3(servicio.to_string())
                }
            })?;
        let datos = salida
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(datos.into_bytes().to_vec())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.cliente
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(())
    }

    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| StorageError::S3(e.to_string()))?;
        let pedido = self
            .cliente
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(pedido.uri().to_string())
    }
}

/// Store en memoria para pruebas del pipeline de emision.
#[derive(Clone, Default)]
pub struct MemoryStore {
    objetos: Arc<Mutex<HashMap<(String, String), (Vec<u8>, String)>>>,
}

impl MemoryStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.objetos
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), (bytes, content_type.to_string()));
        Ok(format!("{bucket}/{key}"))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objetos
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NoEncontrado {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objetos
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    /// Cantidad de objetos guardados; para asertos de limpieza en pruebas.
    pub fn cantidad(&self) -> usize {
        self.objetos.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memoria_roundtrip_y_ruta_canonica() {
        let store = ArtifactStore::memoria();
        let ruta = store
            .put("invoices", "signed/179/clave.xml", b"<xml/>".to_vec(), "text/xml")
            .await
            .unwrap();
        assert_eq!(ruta, "invoices/signed/179/clave.xml");

        let datos = store.get_ruta(&ruta).await.unwrap();
        assert_eq!(datos, b"<xml/>");

        store.delete("invoices", "signed/179/clave.xml").await.unwrap();
        assert!(matches!(
            store.get("invoices", "signed/179/clave.xml").await,
            Err(StorageError::NoEncontrado { .. })
        ));
    }

    #[test]
    fn rutas_canonicas() {
        let (bucket, key) = rutas::xml_firmado("1790011674001", "123");
        assert_eq!(bucket, "invoices");
        assert_eq!(key, "signed/1790011674001/123.xml");

        let (bucket, key) = rutas::xml_autorizado("1790011674001", "123");
        assert_eq!(bucket, "invoices");
        assert_eq!(key, "authorized/1790011674001/123.xml");

        let (bucket, key) = rutas::certificado("1790011674001", 1750000000);
        assert_eq!(bucket, "certificates");
        assert_eq!(key, "1790011674001/certificate_1750000000.p12");

        assert_eq!(rutas::partir("invoices/signed/a.xml"), Some(("invoices", "signed/a.xml")));
        assert_eq!(rutas::partir("sinbarra"), None);
    }
}
