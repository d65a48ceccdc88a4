use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    Collection, CollectionId, CollectionStatus, CollectionStore, CoreError, CoreResult, Segment,
};
use sqlx::{query, Row, SqlitePool};

use crate::rows::{
    fetch_collection, format_date, format_ts, insert_segment, map_collection_row, map_sqlx_error,
    refresh_statistics, COLLECTION_COLUMNS,
};

/// SQLite-backed table of collection jobs.
#[derive(Clone)]
pub struct SqliteCollectionStore {
    pool: SqlitePool,
}

impl SqliteCollectionStore {
    /// Creates a new store backed by the provided pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool (useful for composing with other stores).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CollectionStore for SqliteCollectionStore {
    async fn create(&self, collection: &Collection, segments: &[Segment]) -> CoreResult<()> {
        if let Some(stray) = segments
            .iter()
            .find(|segment| segment.collection_id != collection.collection_id)
        {
            return Err(CoreError::invalid_state(format!(
                "segment {} belongs to collection {}",
                stray.segment_id, stray.collection_id
            )));
        }

        let parameters = serde_json::to_string(&collection.parameters)
            .map_err(|err| CoreError::SerializationError(err.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;

        query(
            r#"
            INSERT INTO collections (
                collection_id,
                workflow_id,
                instance_id,
                collection_type,
                start_date,
                end_date,
                segment_width_days,
                parameters,
                status,
                created_at,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(collection.collection_id.to_bytes().to_vec())
        .bind(&collection.workflow_id)
        .bind(&collection.instance_id)
        .bind(collection.collection_type.as_str())
        .bind(format_date(collection.date_range.start))
        .bind(format_date(collection.date_range.end))
        .bind(i64::from(collection.segment_width_days))
        .bind(parameters)
        .bind(collection.status.as_str())
        .bind(format_ts(collection.created_at))
        .bind(format_ts(collection.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|err| map_sqlx_error("collection", collection.collection_id.to_string(), err))?;

        for segment in segments {
            insert_segment(&mut tx, segment).await?;
        }
        refresh_statistics(&mut tx, collection.collection_id, collection.updated_at).await?;

        tx.commit()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))
    }

    async fn get(&self, collection_id: CollectionId) -> CoreResult<Option<Collection>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;
        fetch_collection(&mut conn, collection_id).await
    }

    async fn list(&self, statuses: &[CollectionStatus]) -> CoreResult<Vec<Collection>> {
        let sql = format!(
            r#"
            SELECT {COLLECTION_COLUMNS}
              FROM collections
             WHERE ?1 = 0 OR status IN (SELECT value FROM json_each(?2))
          ORDER BY created_at ASC, collection_id ASC
            "#
        );
        let filter: Vec<&str> = statuses.iter().map(CollectionStatus::as_str).collect();
        let filter = serde_json::to_string(&filter)
            .map_err(|err| CoreError::SerializationError(err.to_string()))?;

        let rows = query(&sql)
            .bind(i64::from(!statuses.is_empty()))
            .bind(filter)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;

        rows.into_iter().map(map_collection_row).collect()
    }

    async fn update_status(
        &self,
        collection_id: CollectionId,
        expected: CollectionStatus,
        next: CollectionStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Collection> {
        if !expected.can_transition_to(next) {
            return Err(CoreError::invalid_state(format!(
                "collection cannot move from {expected} to {next}"
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
               SET status = ?3,
                   updated_at = ?4
             WHERE collection_id = ?1
               AND status = ?2
            "#,
        )
        .bind(collection_id.to_bytes().to_vec())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(format_ts(now))
        .execute(&mut *tx)
        .await
        .map_err(|err| map_sqlx_error("collection", collection_id.to_string(), err))?;

        if result.rows_affected() == 0 {
            let exists = query("SELECT 1 AS present FROM collections WHERE collection_id = ?1")
                .bind(collection_id.to_bytes().to_vec())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|err| CoreError::internal(err.to_string()))?
                .map(|row| row.get::<i64, _>("present"));
            return Err(match exists {
                Some(_) => CoreError::stale("collection", collection_id.to_string()),
                None => CoreError::not_found("collection", collection_id.to_string()),
            });
        }

        let collection = fetch_collection(&mut tx, collection_id)
            .await?
            .ok_or_else(|| CoreError::not_found("collection", collection_id.to_string()))?;
        tx.commit()
            .await
            .map_err(|err| CoreError::internal(err.to_string()))?;
        Ok(collection)
    }

    async fn delete(&self, collection_id: CollectionId) -> CoreResult<()> {
        let result = query("DELETE FROM collections WHERE collection_id = ?1")
            .bind(collection_id.to_bytes().to_vec())
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_error("collection", collection_id.to_string(), err))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("collection", collection_id.to_string()));
        }
        Ok(())
    }
}
