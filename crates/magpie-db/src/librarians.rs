use chrono::{DateTime, Utc};
use magpie_core::{Librarian, MagpieError, Result, Transport};

use crate::Catalog;

impl Catalog {
    /// Register or refresh a peer row from configuration. Runtime state
    /// (enabled, last-seen) is preserved across restarts.
    pub async fn upsert_librarian(
        &self,
        name: &str,
        url: &str,
        auth_token: &str,
        transports: &[Transport],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO librarians (name, url, auth_token, transports, enabled)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (name) DO UPDATE SET
                url = EXCLUDED.url,
                auth_token = EXCLUDED.auth_token,
                transports = EXCLUDED.transports
            "#,
        )
        .bind(name)
        .bind(url)
        .bind(auth_token)
        .bind(join_transports(transports))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_librarian(&self, name: &str) -> Result<Option<Librarian>> {
        let row = sqlx::query_as::<_, LibrarianRow>("SELECT * FROM librarians WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_librarians(&self) -> Result<Vec<Librarian>> {
        let rows = sqlx::query_as::<_, LibrarianRow>("SELECT * FROM librarians ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Match an incoming bearer token to a peer. Used by the HTTP layer.
    pub async fn librarian_by_token(&self, token: &str) -> Result<Option<Librarian>> {
        let row = sqlx::query_as::<_, LibrarianRow>("SELECT * FROM librarians WHERE auth_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Record a successful interaction with a peer, in either direction.
    pub async fn touch_librarian(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE librarians SET last_seen = NOW() WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_librarian_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE librarians
            SET enabled = $2,
                disabled_since = CASE
                    WHEN $2 THEN NULL
                    WHEN disabled_since IS NULL THEN NOW()
                    ELSE disabled_since
                END
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn join_transports(transports: &[Transport]) -> String {
    transports
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(sqlx::FromRow)]
struct LibrarianRow {
    id: i64,
    name: String,
    url: String,
    auth_token: String,
    transports: String,
    last_seen: Option<DateTime<Utc>>,
    enabled: bool,
    disabled_since: Option<DateTime<Utc>>,
}

impl TryFrom<LibrarianRow> for Librarian {
    type Error = MagpieError;

    fn try_from(row: LibrarianRow) -> Result<Self> {
        let transports = row
            .transports
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Transport>>>()?;

        Ok(Librarian {
            id: row.id,
            name: row.name,
            url: row.url,
            auth_token: row.auth_token,
            transports,
            last_seen: row.last_seen,
            enabled: row.enabled,
            disabled_since: row.disabled_since,
        })
    }
}
