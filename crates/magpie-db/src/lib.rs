//! The catalog: sole owner of persistent state.
//!
//! Every entity row lives in Postgres; all multi-row mutations happen inside
//! one transaction here. Hot-path operations (transfer transitions, queue
//! claims) are single guarded statements so contending callers observe
//! `StaleState` instead of lost updates.

use magpie_core::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

mod corrupt;
mod files;
mod instances;
mod librarians;
mod queue;
mod remote;
mod stores;
mod transfers;

pub use files::NewInstance;
pub use transfers::NewIncomingTransfer;

pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        let catalog = Self { pool };
        catalog.run_migrations().await?;

        Ok(catalog)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS librarians (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                auth_token TEXT NOT NULL,
                transports TEXT NOT NULL,
                last_seen TIMESTAMPTZ,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                disabled_since TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stores (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                backend TEXT NOT NULL,
                root TEXT NOT NULL,
                capacity_bytes BIGINT NOT NULL,
                used_bytes BIGINT NOT NULL DEFAULT 0,
                ingestable BOOLEAN NOT NULL,
                enabled BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                id BIGINT PRIMARY KEY,
                julian_date DOUBLE PRECISION NOT NULL,
                polarization TEXT NOT NULL,
                length_seconds DOUBLE PRECISION NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                name TEXT PRIMARY KEY,
                origin_librarian TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                checksum TEXT NOT NULL,
                uploaded_at TIMESTAMPTZ NOT NULL,
                observation_id BIGINT REFERENCES observations(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id BIGSERIAL PRIMARY KEY,
                file_name TEXT NOT NULL REFERENCES files(name),
                store_name TEXT NOT NULL,
                path TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                available BOOLEAN NOT NULL DEFAULT TRUE,
                deletion_policy TEXT NOT NULL,
                UNIQUE (store_name, path)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS remote_instances (
                id BIGSERIAL PRIMARY KEY,
                file_name TEXT NOT NULL REFERENCES files(name),
                librarian TEXT NOT NULL,
                copy_time TIMESTAMPTZ NOT NULL,
                last_verified_at TIMESTAMPTZ,
                verified_checksum TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outgoing_transfers (
                id BIGSERIAL PRIMARY KEY,
                file_name TEXT NOT NULL REFERENCES files(name),
                destination TEXT NOT NULL,
                source_store TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                remote_id BIGINT,
                attempts INTEGER NOT NULL DEFAULT 0,
                transport TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS incoming_transfers (
                id BIGSERIAL PRIMARY KEY,
                file_name TEXT NOT NULL,
                source_librarian TEXT NOT NULL,
                origin_librarian TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                checksum TEXT NOT NULL,
                destination_store TEXT,
                staging_path TEXT,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                source_id BIGINT,
                observation_id BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS incoming_transfers_source
            ON incoming_transfers (source_librarian, source_id)
            WHERE source_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS send_queue (
                id BIGSERIAL PRIMARY KEY,
                transfer_id BIGINT NOT NULL REFERENCES outgoing_transfers(id),
                priority INTEGER NOT NULL DEFAULT 0,
                enqueued_at TIMESTAMPTZ NOT NULL,
                claimed_by UUID,
                claim_deadline TIMESTAMPTZ,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS corrupt_files (
                id BIGSERIAL PRIMARY KEY,
                file_name TEXT NOT NULL UNIQUE,
                store_name TEXT,
                detected_at TIMESTAMPTZ NOT NULL,
                detector TEXT NOT NULL,
                remediation TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS instances_file ON instances (file_name)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS remote_instances_pair ON remote_instances (file_name, librarian)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS outgoing_transfers_status ON outgoing_transfers (status, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS send_queue_status ON send_queue (status, priority, enqueued_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Postgres unique violations map to `Conflict` rather than surfacing raw.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}
