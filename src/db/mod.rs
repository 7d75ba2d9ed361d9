pub mod schema;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Pool acotado contra PostgreSQL.
pub async fn conectar(url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(10).connect(url).await
}

/// Crea tablas, indices y funciones si no existen. Idempotente: se ejecuta
/// en cada arranque, igual que las migraciones incrementales del resto del
/// esquema.
pub async fn migrar(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(schema::DDL).execute(pool).await?;
    Ok(())
}
