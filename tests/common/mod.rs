//! Utilidades compartidas de las pruebas de integracion. Todas las pruebas
//! que tocan PostgreSQL se saltan silenciosamente si DATABASE_URL no esta
//! definida.
#![allow(dead_code)]

use std::sync::Arc;

use rand::Rng;
use sqlx::PgPool;

use facturador::config::{Config, ConfigMinio, EndpointsSri, PoliticaCredito};
use facturador::core::Contexto;
use facturador::models::{FacturaInput, ItemInput};
use facturador::storage::{rutas, ArtifactStore};

pub async fn pool_de_prueba() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = facturador::db::conectar(&url).await.ok()?;
    facturador::db::migrar(&pool).await.ok()?;
    Some(pool)
}

pub fn config_de_prueba(politica: PoliticaCredito, sri_url: Option<&str>) -> Config {
    let mut sri = EndpointsSri::default();
    if let Some(url) = sri_url {
        sri.recepcion_pruebas = url.to_string();
        sri.recepcion_produccion = url.to_string();
        sri.autorizacion_pruebas = url.to_string();
        sri.autorizacion_produccion = url.to_string();
    }
    Config {
        database_url: String::new(),
        puerto: 0,
        minio: ConfigMinio {
            endpoint: "localhost".into(),
            puerto: 9000,
            use_ssl: false,
            usuario: "pruebas".into(),
            password: "pruebas".into(),
        },
        encryption_key: "secreto-maestro-de-pruebas".into(),
        webhook_notificaciones: None,
        n8n_api_key: "llave-n8n".into(),
        identidad_url: "http://127.0.0.1:1/identidad".into(),
        politica_credito: politica,
        sri,
        fonts_dir: "fonts".into(),
        iva_lenient: false,
        creditos_iniciales: 10,
    }
}

pub fn contexto(pool: PgPool, config: Config) -> Contexto {
    Contexto::nuevo(pool, ArtifactStore::memoria(), Arc::new(config))
}

pub fn ruc_aleatorio() -> String {
    let mut rng = rand::thread_rng();
    let base: u64 = rng.gen_range(100_000_000..999_999_999);
    format!("17{:09}001", base)
}

/// Crea emisor + establecimiento 001 + punto 100 + saldo, y un perfil ligado.
/// Devuelve (emisor_id, punto_id, ruc).
pub async fn crear_emisor(pool: &PgPool, balance: i64) -> (i64, i64, String) {
    let ruc = ruc_aleatorio();
    let emisor_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO emisores (ruc, razon_social, direccion_matriz, ambiente)
           VALUES ($1, 'EMPRESA DE PRUEBA', 'Av. Principal 456, Guayaquil', '1') RETURNING id"#,
    )
    .bind(&ruc)
    .fetch_one(pool)
    .await
    .unwrap();

    let establecimiento_id: i64 = sqlx::query_scalar(
        "INSERT INTO establecimientos (emisor_id, codigo, direccion) VALUES ($1, '001', 'Matriz') RETURNING id",
    )
    .bind(emisor_id)
    .fetch_one(pool)
    .await
    .unwrap();

    let punto_id: i64 = sqlx::query_scalar(
        "INSERT INTO puntos_emision (establecimiento_id, codigo) VALUES ($1, '100') RETURNING id",
    )
    .bind(establecimiento_id)
    .fetch_one(pool)
    .await
    .unwrap();

    sqlx::query("INSERT INTO creditos (emisor_id, balance) VALUES ($1, $2)")
        .bind(emisor_id)
        .bind(balance)
        .execute(pool)
        .await
        .unwrap();

    sqlx::query("INSERT INTO perfiles (user_uid, email, emisor_id) VALUES ($1, 'prueba@mail.com', $2)")
        .bind(format!("uid-{ruc}"))
        .bind(emisor_id)
        .execute(pool)
        .await
        .unwrap();

    (emisor_id, punto_id, ruc)
}

/// Construye un P12 real (llave RSA + certificado autofirmado), lo sube al
/// store y deja al emisor listo para firmar.
pub async fn cargar_p12(ctx: &Contexto, emisor_id: i64, ruc: &str) -> anyhow::Result<()> {
    use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
    use rsa::pkcs8::EncodePrivateKey;

    let clave = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)?;
    let pkcs8 = clave.to_pkcs8_der()?;

    let key_pair = rcgen::KeyPair::try_from(pkcs8.as_bytes())?;
    let mut params = rcgen::CertificateParams::default();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "FIRMA DE PRUEBA");
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::ContentCommitment,
    ];
    let cert = params.self_signed(&key_pair)?;

    let certificado = Certificate::from_der(cert.der().as_ref())?;
    let cadena = PrivateKeyChain::new(
        pkcs8.as_bytes().to_vec(),
        vec![1u8, 2, 3, 4],
        vec![certificado],
    );
    let mut keystore = KeyStore::new();
    keystore.add_entry("signing key", KeyStoreEntry::PrivateKeyChain(cadena));
    let p12 = keystore.writer("clave-p12").write()?;

    let (bucket, key) = rutas::certificado(ruc, 1);
    let p12_path = ctx.store.put(bucket, &key, p12, "application/x-pkcs12").await?;

    let password_cifrada =
        facturador::crypto::cifrar_password("clave-p12", &ctx.config.encryption_key);

    sqlx::query(
        r#"UPDATE emisores
              SET p12_path = $2, p12_password_cifrada = $3,
                  p12_expiracion = now() + interval '365 days'
            WHERE id = $1"#,
    )
    .bind(emisor_id)
    .bind(&p12_path)
    .bind(&password_cifrada)
    .execute(&ctx.pool)
    .await?;

    Ok(())
}

pub fn input_simple() -> FacturaInput {
    FacturaInput {
        establecimiento: "001".into(),
        punto_emision: "100".into(),
        identificacion_comprador: "0102030405".into(),
        razon_social_comprador: "Juan Perez".into(),
        tipo_identificacion_comprador: None,
        direccion_comprador: None,
        email: None,
        forma_pago: None,
        items: vec![ItemInput {
            codigo: Some("SRV-001".into()),
            descripcion: "Servicio profesional".into(),
            cantidad: 1.0,
            precio_unitario: 100.0,
            descuento: 0.0,
            tarifa_iva: 15.0,
        }],
        info_adicional: vec![],
    }
}

pub fn hay_fuentes() -> bool {
    std::path::Path::new("fonts/LiberationSans-Regular.ttf").exists()
}
