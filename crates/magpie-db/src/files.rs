use chrono::{DateTime, Utc};
use magpie_core::{DeletionPolicy, FileRecord, MagpieError, Observation, Result};

use crate::{Catalog, is_unique_violation};

/// Instance to create alongside a file row, before it has an id.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub store_name: String,
    pub path: String,
    pub deletion_policy: DeletionPolicy,
}

impl Catalog {
    /// Idempotent on id when all fields match; conflicting re-creation is an
    /// error since observations are immutable.
    pub async fn create_observation(&self, obs: &Observation) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO observations (id, julian_date, polarization, length_seconds)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(obs.id)
        .bind(obs.julian_date)
        .bind(&obs.polarization)
        .bind(obs.length_seconds)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            let existing = self
                .get_observation(obs.id)
                .await?
                .ok_or_else(|| MagpieError::Conflict(format!("observation {} vanished", obs.id)))?;
            if existing.julian_date != obs.julian_date
                || existing.polarization != obs.polarization
                || existing.length_seconds != obs.length_seconds
            {
                return Err(MagpieError::Conflict(format!(
                    "observation {} already exists with different fields",
                    obs.id
                )));
            }
        }

        Ok(())
    }

    pub async fn get_observation(&self, id: i64) -> Result<Option<Observation>> {
        let row = sqlx::query_as::<_, ObservationRow>("SELECT * FROM observations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Create a file and optionally its first instance in one transaction.
    ///
    /// Re-creating an existing file with a matching checksum is a no-op for
    /// the file row; a different checksum is a `Conflict`. The store's
    /// `used_bytes` moves with the instance insert.
    pub async fn create_file(
        &self,
        file: &FileRecord,
        instance: Option<&NewInstance>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = $1 FOR UPDATE")
            .bind(&file.name)
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            Some(row) if row.checksum != file.checksum => {
                return Err(MagpieError::Conflict(format!(
                    "file {} already exists with checksum {}",
                    file.name, row.checksum
                )));
            }
            Some(_) => {}
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO files (name, origin_librarian, size_bytes, checksum, uploaded_at, observation_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&file.name)
                .bind(&file.origin_librarian)
                .bind(file.size_bytes)
                .bind(&file.checksum)
                .bind(file.uploaded_at)
                .bind(file.observation_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(inst) = instance {
            let result = sqlx::query(
                r#"
                INSERT INTO instances (file_name, store_name, path, created_at, available, deletion_policy)
                VALUES ($1, $2, $3, NOW(), TRUE, $4)
                "#,
            )
            .bind(&file.name)
            .bind(&inst.store_name)
            .bind(&inst.path)
            .bind(inst.deletion_policy.to_string())
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(MagpieError::Conflict(format!(
                        "instance already exists at {}:{}",
                        inst.store_name, inst.path
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            sqlx::query("UPDATE stores SET used_bytes = used_bytes + $1 WHERE name = $2")
                .bind(file.size_bytes)
                .bind(&inst.store_name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_file(&self, name: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list_files(&self, limit: i64) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files ORDER BY uploaded_at DESC, name LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Candidates for `send_clone`: recently uploaded files with local bytes
    /// but no copy (and no live transfer) at the destination. Oldest first.
    pub async fn files_lacking_remote_copy(
        &self,
        destination: &str,
        max_age_days: i32,
        limit: i64,
    ) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT f.* FROM files f
            WHERE f.uploaded_at >= NOW() - make_interval(days => $2)
              AND EXISTS (
                  SELECT 1 FROM instances i
                  WHERE i.file_name = f.name AND i.available
              )
              AND NOT EXISTS (
                  SELECT 1 FROM remote_instances r
                  WHERE r.file_name = f.name AND r.librarian = $1
              )
              AND NOT EXISTS (
                  SELECT 1 FROM outgoing_transfers t
                  WHERE t.file_name = f.name
                    AND t.destination = $1
                    AND t.status NOT IN ('completed', 'failed', 'cancelled')
              )
            ORDER BY f.uploaded_at ASC, f.name ASC
            LIMIT $3
            "#,
        )
        .bind(destination)
        .bind(max_age_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Candidates for `create_local_clone`: recently uploaded files whose
    /// only available instances live on the given store. Oldest first.
    pub async fn files_single_copy_on(
        &self,
        store: &str,
        max_age_days: i32,
        limit: i64,
    ) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT f.* FROM files f
            WHERE f.uploaded_at >= NOW() - make_interval(days => $2)
              AND EXISTS (
                  SELECT 1 FROM instances i
                  WHERE i.file_name = f.name AND i.available AND i.store_name = $1
              )
              AND NOT EXISTS (
                  SELECT 1 FROM instances i
                  WHERE i.file_name = f.name AND i.available AND i.store_name <> $1
              )
            ORDER BY f.uploaded_at ASC, f.name ASC
            LIMIT $3
            "#,
        )
        .bind(store)
        .bind(max_age_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ObservationRow {
    id: i64,
    julian_date: f64,
    polarization: String,
    length_seconds: f64,
}

impl From<ObservationRow> for Observation {
    fn from(row: ObservationRow) -> Self {
        Observation {
            id: row.id,
            julian_date: row.julian_date,
            polarization: row.polarization,
            length_seconds: row.length_seconds,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    name: String,
    origin_librarian: String,
    size_bytes: i64,
    checksum: String,
    uploaded_at: DateTime<Utc>,
    observation_id: Option<i64>,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        FileRecord {
            name: row.name,
            origin_librarian: row.origin_librarian,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            uploaded_at: row.uploaded_at,
            observation_id: row.observation_id,
        }
    }
}
