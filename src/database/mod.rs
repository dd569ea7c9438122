#![allow(clippy::cast_possible_wrap)]

use std::cmp::Ordering;
use std::ops::Deref;

use anyhow::{anyhow, Context};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::{Executor, Pool, Postgres, Row};
use tracing::{error, info, instrument, warn};

pub mod methods;
pub mod types;

pub use methods::DbMethods;

// Statically link in migration files.
static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

use crate::config::DatabaseConfig;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid hex in stored column: {0}")]
    InvalidHex(String),
}

pub struct Database {
    pool: Pool<Postgres>,
}

impl Deref for Database {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        info!(url = %config.url, "Connecting to database");

        if config.migrate && !Postgres::database_exists(config.url.expose()).await? {
            warn!(url = %config.url, "Database does not exist, creating database");
            Postgres::create_database(config.url.expose()).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .connect(config.url.expose())
            .await
            .context("error connecting to database")?;

        let version = pool
            .fetch_one("SELECT version()")
            .await
            .context("error getting database version")?
            .get::<String, _>(0);
        info!(url = %config.url, ?version, "Connected to database");

        let latest = MIGRATOR
            .migrations
            .last()
            .expect("no migrations compiled in")
            .version;

        if config.migrate {
            info!(url = %config.url, "Running migrations");
            MIGRATOR.run(&pool).await?;
        }

        let mut conn = pool.acquire().await?;

        if conn.dirty_version().await?.is_some() {
            error!(url = %config.url, "Database is in an incomplete migration state");
            return Err(anyhow!("database is in an incomplete migration state"));
        }

        let version = conn
            .list_applied_migrations()
            .await?
            .last()
            .expect("no migrations applied")
            .version;

        match version.cmp(&latest) {
            Ordering::Less => {
                return Err(anyhow!(
                    "database schema is behind (at {version}, expected {latest}); rerun with migrations enabled"
                ));
            }
            Ordering::Greater => {
                return Err(anyhow!(
                    "database schema ({version}) is newer than this binary expects ({latest}); please update"
                ));
            }
            Ordering::Equal => {
                info!(version, "Database schema is up to date");
            }
        }

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}
