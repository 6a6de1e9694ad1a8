use chrono::{DateTime, Utc};
use magpie_core::{
    IncomingStatus, IncomingTransfer, MagpieError, OutgoingStatus, OutgoingTransfer, Result,
    Transport,
};

use crate::Catalog;

/// Fields for a new incoming transfer row, created on `prepare_transfer` or
/// a direct upload stage.
#[derive(Debug, Clone)]
pub struct NewIncomingTransfer {
    pub file_name: String,
    pub source_librarian: String,
    pub origin_librarian: String,
    pub size_bytes: i64,
    pub checksum: String,
    /// The source's outgoing transfer id; None for direct ingest.
    pub source_id: Option<i64>,
    pub observation_id: Option<i64>,
}

impl Catalog {
    /// Create an outgoing transfer in INITIATED.
    ///
    /// A live transfer for the same file+destination is a conflict; the
    /// duplicate hypervisor collapses any that slip through the race window.
    pub async fn create_outgoing_transfer(
        &self,
        file_name: &str,
        destination: &str,
        source_store: &str,
        transport: Transport,
    ) -> Result<OutgoingTransfer> {
        if let Some(live) = self.live_outgoing_for(file_name, destination).await? {
            return Err(MagpieError::Conflict(format!(
                "transfer {} already {} for {file_name} -> {destination}",
                live.id, live.status
            )));
        }

        let row = sqlx::query_as::<_, OutgoingRow>(
            r#"
            INSERT INTO outgoing_transfers
                (file_name, destination, source_store, status, created_at, updated_at, attempts, transport)
            VALUES ($1, $2, $3, 'initiated', NOW(), NOW(), 0, $4)
            RETURNING *
            "#,
        )
        .bind(file_name)
        .bind(destination)
        .bind(source_store)
        .bind(transport.to_string())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    pub async fn outgoing_by_id(&self, id: i64) -> Result<Option<OutgoingTransfer>> {
        let row = sqlx::query_as::<_, OutgoingRow>("SELECT * FROM outgoing_transfers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn live_outgoing_for(
        &self,
        file_name: &str,
        destination: &str,
    ) -> Result<Option<OutgoingTransfer>> {
        let row = sqlx::query_as::<_, OutgoingRow>(
            r#"
            SELECT * FROM outgoing_transfers
            WHERE file_name = $1 AND destination = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            LIMIT 1
            "#,
        )
        .bind(file_name)
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Compare-and-set status change: the only way outgoing state moves.
    /// Fails with `StaleState` when the row is no longer in `from`.
    pub async fn transition_outgoing(
        &self,
        id: i64,
        from: OutgoingStatus,
        to: OutgoingStatus,
        remote_id: Option<i64>,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(MagpieError::StaleState(format!(
                "outgoing transfer {id}: illegal transition {from} -> {to}"
            )));
        }

        let affected = sqlx::query(
            r#"
            UPDATE outgoing_transfers
            SET status = $3, updated_at = NOW(), remote_id = COALESCE($4, remote_id)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .bind(remote_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(MagpieError::StaleState(format!(
                "outgoing transfer {id} is no longer {from}"
            )));
        }

        Ok(())
    }

    pub async fn bump_outgoing_attempts(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outgoing_transfers SET attempts = attempts + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Non-terminal outgoing transfers untouched for at least `min_age_days`.
    pub async fn stale_outgoing_transfers(
        &self,
        min_age_days: i32,
        limit: i64,
    ) -> Result<Vec<OutgoingTransfer>> {
        let rows = sqlx::query_as::<_, OutgoingRow>(
            r#"
            SELECT * FROM outgoing_transfers
            WHERE status NOT IN ('completed', 'failed', 'cancelled')
              AND updated_at <= NOW() - make_interval(days => $1)
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(min_age_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Create an incoming transfer in INITIATED. Idempotent by the source's
    /// (librarian, outgoing id): re-preparing returns the existing row.
    pub async fn create_incoming_transfer(
        &self,
        new: &NewIncomingTransfer,
    ) -> Result<IncomingTransfer> {
        if let Some(source_id) = new.source_id {
            if let Some(existing) = self
                .incoming_by_source(&new.source_librarian, source_id)
                .await?
            {
                return Ok(existing);
            }
        }

        let result = sqlx::query_as::<_, IncomingRow>(
            r#"
            INSERT INTO incoming_transfers
                (file_name, source_librarian, origin_librarian, size_bytes, checksum,
                 status, created_at, updated_at, source_id, observation_id)
            VALUES ($1, $2, $3, $4, $5, 'initiated', NOW(), NOW(), $6, $7)
            RETURNING *
            "#,
        )
        .bind(&new.file_name)
        .bind(&new.source_librarian)
        .bind(&new.origin_librarian)
        .bind(new.size_bytes)
        .bind(&new.checksum)
        .bind(new.source_id)
        .bind(new.observation_id)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.try_into(),
            // Concurrent prepare for the same source transfer: hand back the
            // row the other caller created.
            Err(e) if crate::is_unique_violation(&e) => {
                let source_id = new.source_id.ok_or(MagpieError::Database(e))?;
                self.incoming_by_source(&new.source_librarian, source_id)
                    .await?
                    .ok_or_else(|| {
                        MagpieError::Conflict(format!(
                            "incoming transfer for {}/{source_id} vanished",
                            new.source_librarian
                        ))
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn incoming_by_id(&self, id: i64) -> Result<Option<IncomingTransfer>> {
        let row = sqlx::query_as::<_, IncomingRow>("SELECT * FROM incoming_transfers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn incoming_by_source(
        &self,
        source_librarian: &str,
        source_id: i64,
    ) -> Result<Option<IncomingTransfer>> {
        let row = sqlx::query_as::<_, IncomingRow>(
            "SELECT * FROM incoming_transfers WHERE source_librarian = $1 AND source_id = $2",
        )
        .bind(source_librarian)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// The most recent committed incoming transfer for a file, if any. Lets
    /// idempotent commit answer for re-sent requests.
    pub async fn committed_incoming_for_file(
        &self,
        file_name: &str,
        source_librarian: &str,
    ) -> Result<Option<IncomingTransfer>> {
        let row = sqlx::query_as::<_, IncomingRow>(
            r#"
            SELECT * FROM incoming_transfers
            WHERE file_name = $1 AND source_librarian = $2 AND status = 'committed'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(file_name)
        .bind(source_librarian)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Record where an incoming transfer is being staged.
    pub async fn set_incoming_staging(
        &self,
        id: i64,
        destination_store: &str,
        staging_path: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE incoming_transfers
            SET destination_store = $2, staging_path = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(destination_store)
        .bind(staging_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Compare-and-set for the incoming machine; mirror of
    /// [`Catalog::transition_outgoing`].
    pub async fn transition_incoming(
        &self,
        id: i64,
        from: IncomingStatus,
        to: IncomingStatus,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(MagpieError::StaleState(format!(
                "incoming transfer {id}: illegal transition {from} -> {to}"
            )));
        }

        let affected = sqlx::query(
            r#"
            UPDATE incoming_transfers
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(MagpieError::StaleState(format!(
                "incoming transfer {id} is no longer {from}"
            )));
        }

        Ok(())
    }

    pub async fn stale_incoming_transfers(
        &self,
        min_age_days: i32,
        limit: i64,
    ) -> Result<Vec<IncomingTransfer>> {
        let rows = sqlx::query_as::<_, IncomingRow>(
            r#"
            SELECT * FROM incoming_transfers
            WHERE status NOT IN ('committed', 'failed', 'cancelled')
              AND updated_at <= NOW() - make_interval(days => $1)
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(min_age_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Live incoming transfers for a file, any source. Used by the
    /// corruption fixer to avoid double-requesting a repair copy.
    pub async fn live_incoming_for_file(&self, file_name: &str) -> Result<Vec<IncomingTransfer>> {
        let rows = sqlx::query_as::<_, IncomingRow>(
            r#"
            SELECT * FROM incoming_transfers
            WHERE file_name = $1
              AND status NOT IN ('committed', 'failed', 'cancelled')
            "#,
        )
        .bind(file_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct OutgoingRow {
    id: i64,
    file_name: String,
    destination: String,
    source_store: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    remote_id: Option<i64>,
    attempts: i32,
    transport: String,
}

impl TryFrom<OutgoingRow> for OutgoingTransfer {
    type Error = MagpieError;

    fn try_from(row: OutgoingRow) -> Result<Self> {
        Ok(OutgoingTransfer {
            id: row.id,
            file_name: row.file_name,
            destination: row.destination,
            source_store: row.source_store,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            remote_id: row.remote_id,
            attempts: row.attempts,
            transport: row.transport.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IncomingRow {
    id: i64,
    file_name: String,
    source_librarian: String,
    origin_librarian: String,
    size_bytes: i64,
    checksum: String,
    destination_store: Option<String>,
    staging_path: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    source_id: Option<i64>,
    observation_id: Option<i64>,
}

impl TryFrom<IncomingRow> for IncomingTransfer {
    type Error = MagpieError;

    fn try_from(row: IncomingRow) -> Result<Self> {
        Ok(IncomingTransfer {
            id: row.id,
            file_name: row.file_name,
            source_librarian: row.source_librarian,
            origin_librarian: row.origin_librarian,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            destination_store: row.destination_store,
            staging_path: row.staging_path,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            source_id: row.source_id,
            observation_id: row.observation_id,
        })
    }
}
