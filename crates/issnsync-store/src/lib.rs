//! Postgres persistence: the tracked-identifier registry and the append-only
//! metadata fact table.

use anyhow::{Context, Result};
use issnsync_core::{FactRow, Issn};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, QueryBuilder};
use tracing::debug;

pub const CRATE_NAME: &str = "issnsync-store";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Connection parameters, sourced from the environment once at startup.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

impl DbConfig {
    /// Reads `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`, `DB_PASSWORD`.
    /// Name and user are required; host defaults to localhost, port to 5432,
    /// password to empty.
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("DB_PORT") {
            Ok(raw) => raw.parse().context("parsing DB_PORT")?,
            Err(_) => 5432,
        };
        Ok(Self {
            host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port,
            dbname: std::env::var("DB_NAME").context("DB_NAME is not set")?,
            user: std::env::var("DB_USER").context("DB_USER is not set")?,
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user)
            .password(&self.password)
    }
}

/// Opens the single shared connection. The pipeline has exactly one worker,
/// so the pool is capped at one connection.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(1)
        .connect_with(config.connect_options())
        .await
        .with_context(|| {
            format!(
                "connecting to postgres at {}:{}/{}",
                config.host, config.port, config.dbname
            )
        })
}

/// Read/append access to the registry and fact tables.
#[derive(Debug, Clone)]
pub struct FactStore {
    pool: PgPool,
}

impl FactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Loads the complete ordered set of tracked identifiers. A malformed
    /// row in the registry is a fatal error, not something to skip past.
    pub async fn load_issns(&self) -> Result<Vec<Issn>> {
        let raw: Vec<String> = sqlx::query_scalar("SELECT issn FROM issn_master ORDER BY issn")
            .fetch_all(&self.pool)
            .await
            .context("loading issn_master")?;
        raw.into_iter()
            .map(|value| {
                Issn::parse(&value)
                    .with_context(|| format!("malformed identifier in issn_master: {value:?}"))
            })
            .collect()
    }

    /// Filters one batch down to unseen (issn, fingerprint) pairs and inserts
    /// them with a single statement. The existence checks and the insert
    /// share one transaction so the novelty contract holds even if this is
    /// ever called concurrently. Returns the number of rows inserted.
    pub async fn insert_novel(&self, rows: &[FactRow]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("opening batch transaction")?;

        let mut novel: Vec<&FactRow> = Vec::new();
        for row in rows {
            let seen: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM issn_metadata_fact WHERE issn = $1 AND record_hash = $2)",
            )
            .bind(row.record.issn.as_str())
            .bind(&row.fingerprint)
            .fetch_one(&mut *tx)
            .await
            .context("checking fact table for existing fingerprint")?;
            if !seen {
                novel.push(row);
            }
        }

        if !novel.is_empty() {
            let mut builder = QueryBuilder::new(
                "INSERT INTO issn_metadata_fact (issn, journal_title, publisher, subjects, \
                 country, open_access, doi_prefix, source, fetch_date, record_hash) ",
            );
            builder.push_values(novel.iter(), |mut b, row| {
                b.push_bind(row.record.issn.as_str())
                    .push_bind(&row.record.title)
                    .push_bind(&row.record.publisher)
                    .push_bind(&row.record.subjects)
                    .push_bind(&row.record.country)
                    .push_bind(row.record.open_access)
                    .push_bind(&row.record.doi_prefix)
                    .push_bind(&row.record.source)
                    .push_bind(row.record.fetch_date)
                    .push_bind(&row.fingerprint);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("bulk inserting fact rows")?;
        }

        tx.commit().await.context("committing batch transaction")?;
        debug!(checked = rows.len(), inserted = novel.len(), "batch committed");
        Ok(novel.len())
    }
}
