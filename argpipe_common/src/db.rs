//! Database utilities.
//!
//! The job store is a single SQLite file. WAL mode plus a busy timeout
//! keeps the short write transactions from the supervisor and the HTTP
//! handlers from tripping over each other.

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection};
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::prelude::*;

/// Our migrations, embedded directly into the executable.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// A database connection pool.
pub type Pool = diesel::r2d2::Pool<ConnectionManager<SqliteConnection>>;

/// A connection using our connection pool.
pub type PooledConnection =
    diesel::r2d2::PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas for safe concurrent use of a single file.
#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA busy_timeout = 5000; \
             PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Connect to the job store directly, outside the pool.
pub fn connect(database_url: &str) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("error connecting to {}", database_url))
        .map_err(Error::Other)?;
    conn.batch_execute("PRAGMA busy_timeout = 5000;")
        .context("could not configure connection")
        .map_err(Error::Other)?;
    Ok(conn)
}

/// Create a connection pool for the given store.
pub fn pool(database_url: &str, pool_size: u32) -> Result<Pool> {
    let manager = ConnectionManager::new(database_url);
    let pool = diesel::r2d2::Pool::builder()
        .max_size(pool_size)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .context("could not create database pool")
        .map_err(Error::Other)?;
    Ok(pool)
}

/// Run any pending migrations.
pub fn run_pending_migrations(conn: &mut SqliteConnection) -> Result<()> {
    debug!("running pending migrations");
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("could not run migrations: {}", err))?;
    Ok(())
}
