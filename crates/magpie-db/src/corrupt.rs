use chrono::{DateTime, Utc};
use magpie_core::{CorruptFile, CorruptionDetector, MagpieError, RemediationStatus, Result};

use crate::Catalog;

impl Catalog {
    /// Flag a file as corrupt. One row per file; re-detection refreshes the
    /// row and reopens it if it had been resolved.
    pub async fn record_corrupt_file(
        &self,
        file_name: &str,
        store_name: Option<&str>,
        detector: CorruptionDetector,
    ) -> Result<CorruptFile> {
        let row = sqlx::query_as::<_, CorruptRow>(
            r#"
            INSERT INTO corrupt_files (file_name, store_name, detected_at, detector, remediation)
            VALUES ($1, $2, NOW(), $3, 'pending')
            ON CONFLICT (file_name) DO UPDATE SET
                store_name = EXCLUDED.store_name,
                detected_at = EXCLUDED.detected_at,
                detector = EXCLUDED.detector,
                remediation = CASE
                    WHEN corrupt_files.remediation = 'resolved' THEN 'pending'
                    ELSE corrupt_files.remediation
                END
            RETURNING *
            "#,
        )
        .bind(file_name)
        .bind(store_name)
        .bind(detector.to_string())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    /// Corrupt files still awaiting or undergoing remediation, oldest first.
    pub async fn corrupt_files_needing_remediation(&self, limit: i64) -> Result<Vec<CorruptFile>> {
        let rows = sqlx::query_as::<_, CorruptRow>(
            r#"
            SELECT * FROM corrupt_files
            WHERE remediation IN ('pending', 'requested')
            ORDER BY detected_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn set_corrupt_remediation(
        &self,
        id: i64,
        remediation: RemediationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE corrupt_files SET remediation = $2 WHERE id = $1")
            .bind(id)
            .bind(remediation.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CorruptRow {
    id: i64,
    file_name: String,
    store_name: Option<String>,
    detected_at: DateTime<Utc>,
    detector: String,
    remediation: String,
}

impl TryFrom<CorruptRow> for CorruptFile {
    type Error = MagpieError;

    fn try_from(row: CorruptRow) -> Result<Self> {
        Ok(CorruptFile {
            id: row.id,
            file_name: row.file_name,
            store_name: row.store_name,
            detected_at: row.detected_at,
            detector: row.detector.parse()?,
            remediation: row.remediation.parse()?,
        })
    }
}
