use chrono::{DateTime, Utc};
use magpie_core::{DeletionPolicy, Instance, MagpieError, Result};

use crate::{Catalog, is_unique_violation};

impl Catalog {
    /// Create an instance for an existing file and bump the store's usage in
    /// the same transaction.
    pub async fn create_instance(
        &self,
        file_name: &str,
        store_name: &str,
        path: &str,
        deletion_policy: DeletionPolicy,
    ) -> Result<Instance> {
        let mut tx = self.pool.begin().await?;

        let size: Option<i64> =
            sqlx::query_scalar("SELECT size_bytes FROM files WHERE name = $1")
                .bind(file_name)
                .fetch_optional(&mut *tx)
                .await?;
        let size = size.ok_or_else(|| MagpieError::FileNotFound(file_name.to_string()))?;

        let result = sqlx::query_as::<_, InstanceRow>(
            r#"
            INSERT INTO instances (file_name, store_name, path, created_at, available, deletion_policy)
            VALUES ($1, $2, $3, NOW(), TRUE, $4)
            RETURNING *
            "#,
        )
        .bind(file_name)
        .bind(store_name)
        .bind(path)
        .bind(deletion_policy.to_string())
        .fetch_one(&mut *tx)
        .await;

        let row = match result {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                return Err(MagpieError::Conflict(format!(
                    "instance already exists at {store_name}:{path}"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query("UPDATE stores SET used_bytes = used_bytes + $1 WHERE name = $2")
            .bind(size)
            .bind(store_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into()
    }

    pub async fn instance_by_id(&self, id: i64) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn instances_for_file(&self, file_name: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE file_name = $1 ORDER BY created_at",
        )
        .bind(file_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// The available instance of a file on one specific store, if any.
    pub async fn available_instance_on(
        &self,
        file_name: &str,
        store_name: &str,
    ) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT * FROM instances
            WHERE file_name = $1 AND store_name = $2 AND available
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(file_name)
        .bind(store_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn any_available_instance(&self, file_name: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT * FROM instances
            WHERE file_name = $1 AND available
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn count_available_instances(&self, file_name: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM instances WHERE file_name = $1 AND available")
                .bind(file_name)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Available instances on a store created within the last `max_age_days`,
    /// oldest upload first. Used by the integrity sweep.
    pub async fn instances_on_store_within(
        &self,
        store_name: &str,
        max_age_days: i32,
        limit: i64,
    ) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT i.* FROM instances i
            JOIN files f ON f.name = i.file_name
            WHERE i.store_name = $1
              AND i.available
              AND i.created_at >= NOW() - make_interval(days => $2)
            ORDER BY f.uploaded_at ASC, f.name ASC
            LIMIT $3
            "#,
        )
        .bind(store_name)
        .bind(max_age_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Available instances on a store at least `min_age_days` old, oldest
    /// upload first. Used by rolling deletion.
    pub async fn deletion_candidates(
        &self,
        store_name: &str,
        min_age_days: i32,
        limit: i64,
    ) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT i.* FROM instances i
            JOIN files f ON f.name = i.file_name
            WHERE i.store_name = $1
              AND i.available
              AND i.created_at <= NOW() - make_interval(days => $2)
            ORDER BY f.uploaded_at ASC, f.name ASC
            LIMIT $3
            "#,
        )
        .bind(store_name)
        .bind(min_age_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Soft delete. Bytes stay on disk, so store usage is unchanged.
    pub async fn mark_instance_unavailable(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE instances SET available = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Hard delete: remove the row and release the store's usage in one
    /// transaction. The caller deletes the bytes via the store manager.
    pub async fn delete_instance(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // idempotent
            return Ok(());
        };

        let size: i64 = sqlx::query_scalar("SELECT size_bytes FROM files WHERE name = $1")
            .bind(&row.file_name)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE stores SET used_bytes = GREATEST(used_bytes - $1, 0) WHERE name = $2",
        )
        .bind(size)
        .bind(&row.store_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: i64,
    file_name: String,
    store_name: String,
    path: String,
    created_at: DateTime<Utc>,
    available: bool,
    deletion_policy: String,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = MagpieError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Instance {
            id: row.id,
            file_name: row.file_name,
            store_name: row.store_name,
            path: row.path,
            created_at: row.created_at,
            available: row.available,
            deletion_policy: row.deletion_policy.parse()?,
        })
    }
}
