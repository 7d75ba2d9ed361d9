//! Pruebas de integracion del nucleo de emision contra PostgreSQL.
//!
//! Requieren DATABASE_URL; sin ella cada prueba retorna sin hacer nada.
//! Las que firman y renderizan el RIDE ademas necesitan las fuentes
//! LiberationSans en fonts/.

mod common;

use std::collections::HashSet;

use facturador::config::PoliticaCredito;
use facturador::core::emision::emitir_factura;
use facturador::error::ApiError;
use facturador::sri::clave_acceso::clave_valida;
use facturador::storage::ArtifactStore;

use common::*;

/// Propiedad: N avances concurrentes del secuencial producen exactamente
/// {1..N}, sin huecos ni duplicados.
#[tokio::test]
async fn secuenciales_concurrentes_sin_duplicados() {
    let Some(pool) = pool_de_prueba().await else { return };
    let (_, punto_id, _) = crear_emisor(&pool, 0).await;

    let mut tareas = Vec::new();
    for _ in 0..50 {
        let pool = pool.clone();
        tareas.push(tokio::spawn(async move {
            sqlx::query_scalar::<_, i64>("SELECT generar_secuencial($1)")
                .bind(punto_id)
                .fetch_one(&pool)
                .await
                .unwrap()
        }));
    }

    let mut vistos = HashSet::new();
    for tarea in tareas {
        assert!(vistos.insert(tarea.await.unwrap()), "secuencial duplicado");
    }
    assert_eq!(vistos, (1..=50).collect::<HashSet<i64>>());

    let actual: i64 = sqlx::query_scalar("SELECT secuencial_actual FROM puntos_emision WHERE id = $1")
        .bind(punto_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(actual, 50);
}

/// S2: sin saldo la emision falla con 402 y no queda fila ni artefacto.
#[tokio::test]
async fn sin_creditos_no_emite() {
    let Some(pool) = pool_de_prueba().await else { return };
    let (emisor_id, _, _) = crear_emisor(&pool, 0).await;
    let ctx = contexto(pool.clone(), config_de_prueba(PoliticaCredito::Eager, None));

    let err = emitir_factura(&ctx, emisor_id, &input_simple(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::CreditosInsuficientes));

    let filas: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facturas WHERE emisor_id = $1")
        .bind(emisor_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(filas, 0);

    if let ArtifactStore::Memoria(mem) = &ctx.store {
        assert_eq!(mem.cantidad(), 0);
    }
}

/// S3: firma vencida bloquea la emision con 400 antes de asignar nada.
#[tokio::test]
async fn firma_expirada_no_emite() {
    let Some(pool) = pool_de_prueba().await else { return };
    let (emisor_id, punto_id, _) = crear_emisor(&pool, 10).await;

    sqlx::query(
        r#"UPDATE emisores SET p12_path = 'certificates/x/cert.p12',
               p12_password_cifrada = 'aa:bb',
               p12_expiracion = now() - interval '1 day' WHERE id = $1"#,
    )
    .bind(emisor_id)
    .execute(&pool)
    .await
    .unwrap();

    let ctx = contexto(pool.clone(), config_de_prueba(PoliticaCredito::Eager, None));
    let err = emitir_factura(&ctx, emisor_id, &input_simple(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::CredencialExpirada));

    // Ni fila ni avance de secuencial.
    let filas: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facturas WHERE emisor_id = $1")
        .bind(emisor_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(filas, 0);
    let secuencial: i64 = sqlx::query_scalar("SELECT secuencial_actual FROM puntos_emision WHERE id = $1")
        .bind(punto_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(secuencial, 0);
}

/// S1: camino feliz completo con firma real y RIDE.
#[tokio::test]
async fn emision_camino_feliz() {
    let Some(pool) = pool_de_prueba().await else { return };
    if !hay_fuentes() {
        return;
    }
    let (emisor_id, _, ruc) = crear_emisor(&pool, 10).await;
    let ctx = contexto(pool.clone(), config_de_prueba(PoliticaCredito::Eager, None));
    cargar_p12(&ctx, emisor_id, &ruc).await.unwrap();

    let resultado = emitir_factura(&ctx, emisor_id, &input_simple(), None)
        .await
        .unwrap();

    assert_eq!(resultado.estado, "FIRMADO");
    assert_eq!(resultado.secuencial, "000000001");
    assert!(clave_valida(&resultado.clave_acceso));
    assert_eq!(resultado.creditos_restantes, 9);
    assert!((resultado.importe_total - 115.0).abs() < 0.005);

    // Fila en FIRMADO con los totales del escenario.
    let (estado, subtotal, iva, total): (String, f64, f64, f64) = sqlx::query_as(
        "SELECT estado, subtotal_sin_impuestos, valor_iva, importe_total FROM facturas WHERE id = $1",
    )
    .bind(resultado.factura_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(estado, "FIRMADO");
    assert!((subtotal - 100.0).abs() < 0.005);
    assert!((iva - 15.0).abs() < 0.005);
    assert!((total - 115.0).abs() < 0.005);

    // Ambos artefactos presentes bajo las rutas canonicas.
    let xml = ctx.store.get_ruta(&resultado.xml_path).await.unwrap();
    let xml = String::from_utf8(xml).unwrap();
    assert!(xml.contains("<factura id=\"comprobante\""));
    assert!(xml.contains("<ds:Signature"));
    assert!(xml.contains(&resultado.clave_acceso));

    let pdf = ctx.store.get_ruta(&resultado.pdf_path).await.unwrap();
    assert!(pdf.starts_with(b"%PDF"));

    // Saldo debitado exactamente una vez.
    let balance: i64 = sqlx::query_scalar("SELECT balance FROM creditos WHERE emisor_id = $1")
        .bind(emisor_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(balance, 9);
}

/// S4 + propiedades 2 y 3: emisiones concurrentes sobre el mismo punto.
#[tokio::test]
async fn emision_concurrente_sobre_un_punto() {
    let Some(pool) = pool_de_prueba().await else { return };
    if !hay_fuentes() {
        return;
    }
    let (emisor_id, _, ruc) = crear_emisor(&pool, 1000).await;
    let ctx = contexto(pool.clone(), config_de_prueba(PoliticaCredito::Eager, None));
    cargar_p12(&ctx, emisor_id, &ruc).await.unwrap();

    let mut tareas = Vec::new();
    for _ in 0..50 {
        let ctx = ctx.clone();
        tareas.push(tokio::spawn(async move {
            emitir_factura(&ctx, emisor_id, &input_simple(), None).await
        }));
    }

    let mut exitos = 0;
    let mut secuenciales = HashSet::new();
    let mut claves = HashSet::new();
    for tarea in tareas {
        let resultado = tarea.await.unwrap().expect("toda emision debe firmar");
        exitos += 1;
        assert!(secuenciales.insert(resultado.secuencial.clone()));
        assert!(claves.insert(resultado.clave_acceso.clone()));
    }
    assert_eq!(exitos, 50);
    assert_eq!(
        secuenciales,
        (1..=50).map(|n| format!("{:09}", n)).collect::<HashSet<_>>()
    );

    let balance: i64 = sqlx::query_scalar("SELECT balance FROM creditos WHERE emisor_id = $1")
        .bind(emisor_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(balance, 950);
}

/// Propiedad 8: si la persistencia falla tras subir artefactos, no queda ni
/// fila ni blob.
#[tokio::test]
async fn rollback_limpia_artefactos() {
    let Some(pool) = pool_de_prueba().await else { return };
    if !hay_fuentes() {
        return;
    }
    let (emisor_id, _, ruc) = crear_emisor(&pool, 10).await;
    let ctx = contexto(pool.clone(), config_de_prueba(PoliticaCredito::Eager, None));
    cargar_p12(&ctx, emisor_id, &ruc).await.unwrap();

    let objetos_antes = match &ctx.store {
        ArtifactStore::Memoria(mem) => mem.cantidad(),
        _ => unreachable!(),
    };

    // Una "pendiente" inexistente fuerza el fallo despues de las subidas.
    let err = emitir_factura(&ctx, emisor_id, &input_simple(), Some(999_999_999))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflicto(_)));

    // Sin fila nueva y sin blobs: la limpieza revirtio las subidas.
    let filas: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facturas WHERE emisor_id = $1")
        .bind(emisor_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(filas, 0);

    if let ArtifactStore::Memoria(mem) = &ctx.store {
        assert_eq!(mem.cantidad(), objetos_antes);
    }

    // El saldo tampoco se movio.
    let balance: i64 = sqlx::query_scalar("SELECT balance FROM creditos WHERE emisor_id = $1")
        .bind(emisor_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(balance, 10);
}
