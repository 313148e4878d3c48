//! elspeth-persistence
//!
//! Backend durable del landscape: implementación Postgres (Diesel) del trait
//! `Landscape` del core, con paridad 1:1 respecto al backend in-memory, más
//! el payload store en filesystem.
//!
//! Módulos:
//! - `pg`: `PgLandscape` sobre Diesel/r2d2; transacciones por mutación
//!   compuesta e índice único parcial para el outcome terminal.
//! - `payload`: store `store/<hash[:2]>/<hash>` direccionado por contenido.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel declaradas para compilar queries.

pub mod config;
pub mod error;
pub mod migrations;
pub mod payload;
pub mod pg;
pub mod schema;

pub use config::init_dotenv;
pub use error::PersistenceError;
pub use payload::FsPayloadStore;
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgLandscape, PgPool, PoolProvider};
