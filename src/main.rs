use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use facturador::config::Config;
use facturador::core::{worker, Contexto};
use facturador::storage::ArtifactStore;
use facturador::{db, http};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::conectar(&config.database_url)
        .await
        .context("conectando a PostgreSQL")?;
    db::migrar(&pool).await.context("aplicando esquema")?;

    let store = ArtifactStore::s3(&config.minio);

    let ctx = Contexto::nuevo(pool, store, config.clone());

    // Worker de liquidacion en segundo plano.
    worker::lanzar(ctx.clone());

    let app = http::router(ctx);
    let direccion = SocketAddr::from(([0, 0, 0, 0], config.puerto));
    let listener = tokio::net::TcpListener::bind(direccion)
        .await
        .with_context(|| format!("escuchando en {direccion}"))?;

    info!(%direccion, politica = ?config.politica_credito, "facturador escuchando");

    axum::serve(listener, app).await.context("servidor HTTP")?;
    Ok(())
}
