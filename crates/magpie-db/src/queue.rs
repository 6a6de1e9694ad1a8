use chrono::{DateTime, Utc};
use magpie_core::{MagpieError, QueueItemStatus, Result, SendQueueItem};
use std::time::Duration;
use uuid::Uuid;

use crate::Catalog;

impl Catalog {
    pub async fn enqueue_send(&self, transfer_id: i64, priority: i32) -> Result<SendQueueItem> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            INSERT INTO send_queue (transfer_id, priority, enqueued_at, status)
            VALUES ($1, $2, NOW(), 'pending')
            RETURNING *
            "#,
        )
        .bind(transfer_id)
        .bind(priority)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    /// Atomically claim up to `limit` pending items for `claim_id`.
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps contending claimants from blocking on
    /// or double-claiming the same rows.
    pub async fn claim_queue_items(
        &self,
        limit: i64,
        claim_id: Uuid,
        ttl: Duration,
    ) -> Result<Vec<SendQueueItem>> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| MagpieError::Parse(format!("claim ttl out of range: {e}")))?;

        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE send_queue
            SET status = 'claimed', claimed_by = $1, claim_deadline = $2
            WHERE id IN (
                SELECT id FROM send_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, enqueued_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(claim_id)
        .bind(deadline)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Finish a claimed item. Only the claim holder may do this; anyone else
    /// observes `StaleState` and skips.
    pub async fn complete_queue_item(
        &self,
        id: i64,
        claim_id: Uuid,
        status: QueueItemStatus,
    ) -> Result<()> {
        debug_assert!(matches!(
            status,
            QueueItemStatus::Done | QueueItemStatus::Failed
        ));

        let affected = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = $3, claimed_by = NULL, claim_deadline = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .bind(claim_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(MagpieError::StaleState(format!(
                "queue item {id} is not claimed by {claim_id}"
            )));
        }

        Ok(())
    }

    /// Return a claimed item to PENDING before the claim expires, e.g. when
    /// the consumer ran out of deadline mid-transfer.
    pub async fn release_queue_item(&self, id: i64, claim_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'pending', claimed_by = NULL, claim_deadline = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .bind(claim_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Revert expired claims to PENDING. The guarded UPDATE makes each
    /// expired claim return exactly once no matter how many janitors run.
    pub async fn release_expired_claims(&self) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE send_queue
            SET status = 'pending', claimed_by = NULL, claim_deadline = NULL
            WHERE status = 'claimed' AND claim_deadline < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    /// Settle queue items whose transfer already reached a terminal state,
    /// e.g. after a hypervisor resolved it behind the consumer's back.
    /// Returns (done, failed) counts.
    pub async fn settle_queue_items(&self) -> Result<(u64, u64)> {
        let done = sqlx::query(
            r#"
            UPDATE send_queue q
            SET status = 'done', claimed_by = NULL, claim_deadline = NULL
            FROM outgoing_transfers t
            WHERE t.id = q.transfer_id
              AND q.status IN ('pending', 'claimed')
              AND t.status = 'completed'
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE send_queue q
            SET status = 'failed', claimed_by = NULL, claim_deadline = NULL
            FROM outgoing_transfers t
            WHERE t.id = q.transfer_id
              AND q.status IN ('pending', 'claimed')
              AND t.status IN ('failed', 'cancelled')
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok((done, failed))
    }

    pub async fn queue_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM send_queue GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows)
    }

    pub async fn queue_item_for_transfer(&self, transfer_id: i64) -> Result<Option<SendQueueItem>> {
        let row = sqlx::query_as::<_, QueueRow>(
            "SELECT * FROM send_queue WHERE transfer_id = $1 ORDER BY enqueued_at DESC LIMIT 1",
        )
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    transfer_id: i64,
    priority: i32,
    enqueued_at: DateTime<Utc>,
    claimed_by: Option<Uuid>,
    claim_deadline: Option<DateTime<Utc>>,
    status: String,
}

impl TryFrom<QueueRow> for SendQueueItem {
    type Error = MagpieError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(SendQueueItem {
            id: row.id,
            transfer_id: row.transfer_id,
            priority: row.priority,
            enqueued_at: row.enqueued_at,
            claimed_by: row.claimed_by,
            claim_deadline: row.claim_deadline,
            status: row.status.parse()?,
        })
    }
}
