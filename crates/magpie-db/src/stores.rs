use magpie_core::{MagpieError, Result, StoreBackendKind, StoreRecord};

use crate::Catalog;

impl Catalog {
    /// Register or refresh a store row from configuration. `used_bytes`
    /// survives restarts; instance transactions keep it current.
    pub async fn register_store(
        &self,
        name: &str,
        backend: StoreBackendKind,
        root: &str,
        capacity_bytes: i64,
        ingestable: bool,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stores (name, backend, root, capacity_bytes, ingestable, enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE SET
                backend = EXCLUDED.backend,
                root = EXCLUDED.root,
                capacity_bytes = EXCLUDED.capacity_bytes,
                ingestable = EXCLUDED.ingestable,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(name)
        .bind(backend.to_string())
        .bind(root)
        .bind(capacity_bytes)
        .bind(ingestable)
        .bind(enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_store(&self, name: &str) -> Result<Option<StoreRecord>> {
        let row = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_stores(&self) -> Result<Vec<StoreRecord>> {
        let rows = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn set_store_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE stores SET enabled = $2 WHERE name = $1")
            .bind(name)
            .bind(enabled)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct StoreRow {
    id: i64,
    name: String,
    backend: String,
    root: String,
    capacity_bytes: i64,
    used_bytes: i64,
    ingestable: bool,
    enabled: bool,
}

impl TryFrom<StoreRow> for StoreRecord {
    type Error = MagpieError;

    fn try_from(row: StoreRow) -> Result<Self> {
        Ok(StoreRecord {
            id: row.id,
            name: row.name,
            backend: row.backend.parse()?,
            root: row.root,
            capacity_bytes: row.capacity_bytes,
            used_bytes: row.used_bytes,
            ingestable: row.ingestable,
            enabled: row.enabled,
        })
    }
}
