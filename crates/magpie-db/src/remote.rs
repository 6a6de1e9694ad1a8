use chrono::{DateTime, Utc};
use magpie_core::{MagpieError, RemoteInstance, Result};

use crate::Catalog;

impl Catalog {
    /// Record that a peer holds a verified copy of a file.
    ///
    /// Upsert keyed by (file, librarian). A checksum that disagrees with the
    /// file's is refused: the remote side is claiming different bytes and
    /// must be reconciled before we count it as a copy.
    pub async fn register_remote_instance(
        &self,
        file_name: &str,
        librarian: &str,
        verified_checksum: &str,
        copy_time: DateTime<Utc>,
    ) -> Result<RemoteInstance> {
        let file = self
            .get_file(file_name)
            .await?
            .ok_or_else(|| MagpieError::FileNotFound(file_name.to_string()))?;

        if file.checksum != verified_checksum {
            return Err(MagpieError::RemoteCorrupt(format!(
                "{librarian} reports checksum {verified_checksum} for {file_name}, catalog has {}",
                file.checksum
            )));
        }

        let existing = sqlx::query_as::<_, RemoteInstanceRow>(
            r#"
            SELECT * FROM remote_instances
            WHERE file_name = $1 AND librarian = $2
            ORDER BY copy_time DESC
            LIMIT 1
            "#,
        )
        .bind(file_name)
        .bind(librarian)
        .fetch_optional(&self.pool)
        .await?;

        let row = match existing {
            Some(existing) => {
                sqlx::query_as::<_, RemoteInstanceRow>(
                    r#"
                    UPDATE remote_instances
                    SET copy_time = $2, last_verified_at = $2, verified_checksum = $3
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(existing.id)
                .bind(copy_time)
                .bind(verified_checksum)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RemoteInstanceRow>(
                    r#"
                    INSERT INTO remote_instances
                        (file_name, librarian, copy_time, last_verified_at, verified_checksum)
                    VALUES ($1, $2, $3, $3, $4)
                    RETURNING *
                    "#,
                )
                .bind(file_name)
                .bind(librarian)
                .bind(copy_time)
                .bind(verified_checksum)
                .fetch_one(&self.pool)
                .await?
            }
        };

        Ok(row.into())
    }

    pub async fn remote_instances_for_file(&self, file_name: &str) -> Result<Vec<RemoteInstance>> {
        let rows = sqlx::query_as::<_, RemoteInstanceRow>(
            "SELECT * FROM remote_instances WHERE file_name = $1 ORDER BY copy_time DESC",
        )
        .bind(file_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn update_remote_verification(
        &self,
        id: i64,
        digest: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE remote_instances SET last_verified_at = $2, verified_checksum = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(verified_at)
        .bind(digest)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// (file, librarian) pairs holding more than one row.
    pub async fn duplicate_remote_instance_pairs(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT file_name, librarian FROM remote_instances
            GROUP BY file_name, librarian
            HAVING count(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn remote_instances_for_pair(
        &self,
        file_name: &str,
        librarian: &str,
    ) -> Result<Vec<RemoteInstance>> {
        let rows = sqlx::query_as::<_, RemoteInstanceRow>(
            "SELECT * FROM remote_instances WHERE file_name = $1 AND librarian = $2",
        )
        .bind(file_name)
        .bind(librarian)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn delete_remote_instance(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM remote_instances WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct RemoteInstanceRow {
    id: i64,
    file_name: String,
    librarian: String,
    copy_time: DateTime<Utc>,
    last_verified_at: Option<DateTime<Utc>>,
    verified_checksum: Option<String>,
}

impl From<RemoteInstanceRow> for RemoteInstance {
    fn from(row: RemoteInstanceRow) -> Self {
        RemoteInstance {
            id: row.id,
            file_name: row.file_name,
            librarian: row.librarian,
            copy_time: row.copy_time,
            last_verified_at: row.last_verified_at,
            verified_checksum: row.verified_checksum,
        }
    }
}
