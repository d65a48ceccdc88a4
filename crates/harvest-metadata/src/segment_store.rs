use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::{
    Collection, CollectionId, CollectionType, CoreError, CoreResult, Segment, SegmentId,
    SegmentStatus, SegmentStore, SegmentUpdate,
};
use sqlx::{query, Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::rows::{
    fetch_collection, format_date, format_ts, insert_segment, map_segment_row, map_sqlx_error,
    refresh_statistics, to_i64, SEGMENT_COLUMNS,
};

/// Row condition for a conditional segment write.
enum Guard<'a> {
    /// Stored status is one of these.
    Statuses(&'a [SegmentStatus]),
    /// Segment is due for dispatch at `now` and its collection is
    /// `pending` or `running`.
    Due {
        now: DateTime<Utc>,
        max_attempts: u32,
    },
}

/// SQLite-backed table of collection segments.
///
/// Every status write is a single conditional `UPDATE`, so concurrent
/// claimers race on the row itself and the loser sees `StaleState`.
#[derive(Clone)]
pub struct SqliteSegmentStore {
    pool: SqlitePool,
}

impl SqliteSegmentStore {
    /// Creates a new store backed by the provided pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_segment(
        conn: &mut SqliteConnection,
        segment_id: SegmentId,
    ) -> CoreResult<Option<Segment>> {
        let sql = format!("SELECT {SEGMENT_COLUMNS} FROM collection_segments WHERE segment_id = ?1");
        let row = query(&sql)
            .bind(segment_id.to_bytes().to_vec())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;

        row.map(map_segment_row).transpose()
    }

    /// Applies `update` in one statement when `guard` holds, then recounts
    /// the owning collection's statistics in the same transaction.
    async fn conditional_update(
        &self,
        segment_id: SegmentId,
        update: &SegmentUpdate,
        guard: Guard<'_>,
        now: DateTime<Utc>,
    ) -> CoreResult<Segment> {
        let (guard_mode, expected, due_at, max_attempts) = match guard {
            Guard::Statuses(expected) => (0_i64, expected, String::new(), 0_i64),
            Guard::Due {
                now: due,
                max_attempts,
            } => (1, &[][..], format_ts(due), i64::from(max_attempts)),
        };
        let expected_json = serde_json::to_string(
            &expected.iter().map(SegmentStatus::as_str).collect::<Vec<_>>(),
        )
        .map_err(|err| CoreError::SerializationError(err.to_string()))?;
        let record_count = update
            .record_count
            .value()
            .map(|value| to_i64("record_count", *value))
            .transpose()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;

        // Field modes: 0 keeps the column, 1 writes the bound value, 2 clears it.
        let result = query(
            r#"
            UPDATE collection_segments
               SET status = ?2,
                   attempt_count = CASE ?3 WHEN 1 THEN attempt_count + 1
                                           WHEN 2 THEN 0
                                           ELSE attempt_count END,
                   execution_id = CASE ?4 WHEN 0 THEN execution_id WHEN 1 THEN ?5 ELSE NULL END,
                   execution_attempt = CASE ?6 WHEN 0 THEN execution_attempt WHEN 1 THEN ?7 ELSE NULL END,
                   record_count = CASE ?8 WHEN 0 THEN record_count WHEN 1 THEN ?9 ELSE NULL END,
                   error_message = CASE ?10 WHEN 0 THEN error_message WHEN 1 THEN ?11 ELSE NULL END,
                   next_attempt_at = CASE ?12 WHEN 0 THEN next_attempt_at WHEN 1 THEN ?13 ELSE NULL END,
                   started_at = CASE ?14 WHEN 0 THEN started_at WHEN 1 THEN ?15 ELSE NULL END,
                   completed_at = CASE ?16 WHEN 0 THEN completed_at WHEN 1 THEN ?17 ELSE NULL END,
                   updated_at = ?18
             WHERE segment_id = ?1
               AND CASE ?19
                       WHEN 0 THEN status IN (SELECT value FROM json_each(?20))
                       ELSE (status = 'pending'
                             OR (status = 'failed'
                                 AND attempt_count < ?21
                                 AND next_attempt_at IS NOT NULL
                                 AND next_attempt_at <= ?22))
                            AND EXISTS (
                                SELECT 1 FROM collections c
                                 WHERE c.collection_id = collection_segments.collection_id
                                   AND c.status IN ('pending', 'running'))
                   END
            "#,
        )
        .bind(segment_id.to_bytes().to_vec())
        .bind(update.status.as_str())
        .bind(update.attempt.mode())
        .bind(update.execution_id.mode())
        .bind(update.execution_id.value().map(|id| id.as_str().to_string()))
        .bind(update.execution_attempt.mode())
        .bind(update.execution_attempt.value().map(|value| i64::from(*value)))
        .bind(update.record_count.mode())
        .bind(record_count)
        .bind(update.error_message.mode())
        .bind(update.error_message.value().cloned())
        .bind(update.next_attempt_at.mode())
        .bind(update.next_attempt_at.value().map(|ts| format_ts(*ts)))
        .bind(update.started_at.mode())
        .bind(update.started_at.value().map(|ts| format_ts(*ts)))
        .bind(update.completed_at.mode())
        .bind(update.completed_at.value().map(|ts| format_ts(*ts)))
        .bind(format_ts(now))
        .bind(guard_mode)
        .bind(expected_json)
        .bind(max_attempts)
        .bind(due_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_sqlx_error("segment", segment_id.to_string(), err))?;

        if result.rows_affected() == 0 {
            let current = query("SELECT status FROM collection_segments WHERE segment_id = ?1")
                .bind(segment_id.to_bytes().to_vec())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|err| CoreError::internal(err.to_string()))?
                .map(|row| row.get::<String, _>("status"));
            return Err(match current {
                Some(status) => {
                    debug!(%segment_id, %status, next = %update.status, "conditional segment write lost");
                    CoreError::stale("segment", segment_id.to_string())
                }
                None => CoreError::not_found("segment", segment_id.to_string()),
            });
        }

        let segment = Self::fetch_segment(&mut tx, segment_id)
            .await?
            .ok_or_else(|| CoreError::not_found("segment", segment_id.to_string()))?;
        refresh_statistics(&mut tx, segment.collection_id, now).await?;

        tx.commit()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;
        Ok(segment)
    }
}

#[async_trait]
impl SegmentStore for SqliteSegmentStore {
    async fn get(&self, segment_id: SegmentId) -> CoreResult<Option<Segment>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;
        Self::fetch_segment(&mut conn, segment_id).await
    }

    async fn list_by_collection(&self, collection_id: CollectionId) -> CoreResult<Vec<Segment>> {
        let sql = format!(
            r#"
            SELECT {SEGMENT_COLUMNS}
              FROM collection_segments
             WHERE collection_id = ?1
          ORDER BY window_start ASC
            "#
        );
        let rows = query(&sql)
            .bind(collection_id.to_bytes().to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;

        rows.into_iter().map(map_segment_row).collect()
    }

    async fn list_due(
        &self,
        collection_id: CollectionId,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> CoreResult<Vec<Segment>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {SEGMENT_COLUMNS}
              FROM collection_segments
             WHERE collection_id = ?1
               AND (status = 'pending'
                    OR (status = 'failed'
                        AND attempt_count < ?2
                        AND next_attempt_at IS NOT NULL
                        AND next_attempt_at <= ?3))
          ORDER BY window_start ASC
             LIMIT ?4
            "#
        );
        let rows = query(&sql)
            .bind(collection_id.to_bytes().to_vec())
            .bind(i64::from(max_attempts))
            .bind(format_ts(now))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;

        rows.into_iter().map(map_segment_row).collect()
    }

    async fn claim(
        &self,
        segment_id: SegmentId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> CoreResult<Segment> {
        self.conditional_update(
            segment_id,
            &SegmentUpdate::claim(now),
            Guard::Due { now, max_attempts },
            now,
        )
        .await
    }

    async fn update(
        &self,
        segment_id: SegmentId,
        update: &SegmentUpdate,
        expected: &[SegmentStatus],
        now: DateTime<Utc>,
    ) -> CoreResult<Segment> {
        self.conditional_update(segment_id, update, Guard::Statuses(expected), now)
            .await
    }

    async fn append(
        &self,
        collection_id: CollectionId,
        segments: &[Segment],
        new_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> CoreResult<Collection> {
        if let Some(stray) = segments
            .iter()
            .find(|segment| segment.collection_id != collection_id || segment.window_end > new_end)
        {
            return Err(CoreError::invalid_state(format!(
                "segment {} does not fit collection {collection_id} ending {new_end}",
                stray.segment_id
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;

        let result = query(
            r#"
            UPDATE collections
               SET end_date = ?2,
                   updated_at = ?3
             WHERE collection_id = ?1
               AND collection_type = ?4
               AND end_date <= ?2
            "#,
        )
        .bind(collection_id.to_bytes().to_vec())
        .bind(format_date(new_end))
        .bind(format_ts(now))
        .bind(CollectionType::RollingUpdate.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|err| map_sqlx_error("collection", collection_id.to_string(), err))?;

        if result.rows_affected() == 0 {
            return Err(match fetch_collection(&mut tx, collection_id).await? {
                Some(_) => CoreError::invalid_state(format!(
                    "collection {collection_id} cannot be extended to {new_end}"
                )),
                None => CoreError::not_found("collection", collection_id.to_string()),
            });
        }

        for segment in segments {
            insert_segment(&mut tx, segment).await?;
        }
        refresh_statistics(&mut tx, collection_id, now).await?;

        let collection = fetch_collection(&mut tx, collection_id)
            .await?
            .ok_or_else(|| CoreError::not_found("collection", collection_id.to_string()))?;
        tx.commit()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;
        Ok(collection)
    }
}
