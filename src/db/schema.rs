/// DDL completo del backend. Todas las sentencias son idempotentes.
///
/// Invariantes que el esquema garantiza por si mismo:
/// - `creditos.balance >= 0` (CHECK);
/// - codigos unicos por emisor/establecimiento;
/// - `(punto_emision_id, secuencial)` unico: un secuencial duplicado es
///   imposible, un hueco (PENDIENTE que nunca avanza) es legal;
/// - `clave_acceso` unica.
pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS emisores (
    id                   BIGSERIAL PRIMARY KEY,
    ruc                  TEXT NOT NULL UNIQUE CHECK (ruc ~ '^[0-9]{13}$'),
    razon_social         TEXT NOT NULL,
    nombre_comercial     TEXT,
    direccion_matriz     TEXT NOT NULL,
    ambiente             TEXT NOT NULL DEFAULT '1' CHECK (ambiente IN ('1', '2')),
    obligado_contabilidad TEXT NOT NULL DEFAULT 'NO' CHECK (obligado_contabilidad IN ('SI', 'NO')),
    p12_path             TEXT,
    p12_password_cifrada TEXT,
    p12_expiracion       TIMESTAMPTZ,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS perfiles (
    id         BIGSERIAL PRIMARY KEY,
    user_uid   TEXT NOT NULL UNIQUE,
    email      TEXT,
    emisor_id  BIGINT REFERENCES emisores(id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS establecimientos (
    id         BIGSERIAL PRIMARY KEY,
    emisor_id  BIGINT NOT NULL REFERENCES emisores(id),
    codigo     TEXT NOT NULL CHECK (codigo ~ '^[0-9]{3}$'),
    direccion  TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (emisor_id, codigo)
);

CREATE TABLE IF NOT EXISTS puntos_emision (
    id                 BIGSERIAL PRIMARY KEY,
    establecimiento_id BIGINT NOT NULL REFERENCES establecimientos(id),
    codigo             TEXT NOT NULL CHECK (codigo ~ '^[0-9]{3}$'),
    secuencial_actual  BIGINT NOT NULL DEFAULT 0 CHECK (secuencial_actual >= 0),
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (establecimiento_id, codigo)
);

CREATE TABLE IF NOT EXISTS creditos (
    emisor_id  BIGINT PRIMARY KEY REFERENCES emisores(id),
    balance    BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS facturas (
    id                       BIGSERIAL PRIMARY KEY,
    emisor_id                BIGINT NOT NULL REFERENCES emisores(id),
    punto_emision_id         BIGINT NOT NULL REFERENCES puntos_emision(id),
    secuencial               TEXT CHECK (secuencial ~ '^[0-9]{9}$'),
    clave_acceso             TEXT UNIQUE CHECK (clave_acceso ~ '^[0-9]{49}$'),
    identificacion_comprador TEXT NOT NULL,
    razon_social_comprador   TEXT NOT NULL,
    subtotal_sin_impuestos   DOUBLE PRECISION NOT NULL DEFAULT 0,
    subtotal_0               DOUBLE PRECISION NOT NULL DEFAULT 0,
    subtotal_iva             DOUBLE PRECISION NOT NULL DEFAULT 0,
    valor_iva                DOUBLE PRECISION NOT NULL DEFAULT 0,
    importe_total            DOUBLE PRECISION NOT NULL DEFAULT 0,
    estado                   TEXT NOT NULL DEFAULT 'PENDIENTE'
        CHECK (estado IN ('PENDIENTE', 'FIRMADO', 'RECIBIDA', 'DEVUELTA', 'AUTORIZADO', 'RECHAZADO')),
    xml_path                 TEXT,
    pdf_path                 TEXT,
    fecha_envio_sri          TIMESTAMPTZ,
    fecha_autorizacion       TIMESTAMPTZ,
    mensajes_sri             JSONB,
    client_input_data        JSONB NOT NULL,
    created_at               TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at               TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (punto_emision_id, secuencial)
);

CREATE INDEX IF NOT EXISTS idx_facturas_estado ON facturas(estado, created_at);
CREATE INDEX IF NOT EXISTS idx_facturas_emisor ON facturas(emisor_id, created_at DESC);

CREATE TABLE IF NOT EXISTS api_keys (
    id           BIGSERIAL PRIMARY KEY,
    emisor_id    BIGINT NOT NULL REFERENCES emisores(id),
    key_hash     TEXT NOT NULL UNIQUE,
    key_prefix   TEXT NOT NULL,
    nombre       TEXT NOT NULL,
    revocada     BOOLEAN NOT NULL DEFAULT FALSE,
    last_used_at TIMESTAMPTZ,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS transacciones_log (
    id         BIGSERIAL PRIMARY KEY,
    emisor_id  BIGINT NOT NULL REFERENCES emisores(id),
    tipo       TEXT NOT NULL,
    cantidad   BIGINT NOT NULL,
    detalle    TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Avance atomico del secuencial de un punto de emision. El UPDATE toma el
-- lock de fila, por lo que emisiones concurrentes sobre el mismo punto se
-- serializan y cada una recibe exactamente secuencial_anterior + 1.
CREATE OR REPLACE FUNCTION generar_secuencial(punto_id BIGINT) RETURNS BIGINT AS $fn$
    UPDATE puntos_emision
       SET secuencial_actual = secuencial_actual + 1
     WHERE id = punto_id
 RETURNING secuencial_actual;
$fn$ LANGUAGE sql;
"#;
