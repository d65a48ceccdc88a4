//! Row mapping and statement helpers shared by the SQLite stores.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use harvest_core::{
    Collection, CollectionId, CollectionStatistics, CollectionStatus, CollectionType, CoreError,
    CoreResult, DateRange, ExecutionId, Segment, SegmentId, SegmentStatus,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{query, Row, SqliteConnection};

pub(crate) const COLLECTION_COLUMNS: &str = r#"
    collection_id,
    workflow_id,
    instance_id,
    collection_type,
    start_date,
    end_date,
    segment_width_days,
    parameters,
    status,
    total_segments,
    pending_segments,
    running_segments,
    completed_segments,
    failed_segments,
    exhausted_segments,
    records_collected,
    created_at,
    updated_at
"#;

pub(crate) const SEGMENT_COLUMNS: &str = r#"
    segment_id,
    collection_id,
    window_start,
    window_end,
    status,
    attempt_count,
    execution_id,
    execution_attempt,
    record_count,
    error_message,
    next_attempt_at,
    started_at,
    completed_at,
    created_at,
    updated_at
"#;

pub(crate) fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(column: &str, value: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| CoreError::internal(format!("invalid {column}: {err}")))
}

fn parse_optional_ts(column: &str, value: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    value.map(|raw| parse_ts(column, &raw)).transpose()
}

pub(crate) fn format_date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn parse_date(column: &str, value: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|err| CoreError::internal(format!("invalid {column}: {err}")))
}

fn to_u32(column: &str, value: i64) -> CoreResult<u32> {
    u32::try_from(value)
        .map_err(|_| CoreError::invalid_state(format!("{column} stored out-of-range value")))
}

fn to_u64(column: &str, value: i64) -> CoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| CoreError::invalid_state(format!("{column} stored negative value")))
}

pub(crate) fn to_i64(column: &str, value: u64) -> CoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| CoreError::invalid_state(format!("{column} exceeds 63-bit range")))
}

pub(crate) fn map_collection_row(row: SqliteRow) -> CoreResult<Collection> {
    let id_bytes: Vec<u8> = row.get("collection_id");
    let collection_id =
        CollectionId::from_bytes(&id_bytes).map_err(|err| CoreError::internal(err.to_string()))?;
    let collection_type: String = row.get("collection_type");
    let status: String = row.get("status");
    let start_date: String = row.get("start_date");
    let end_date: String = row.get("end_date");
    let parameters: String = row.get("parameters");
    let parameters: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&parameters)
            .map_err(|err| CoreError::DeserializationError(err.to_string()))?;
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let statistics = CollectionStatistics {
        total_segments: to_u32("total_segments", row.get("total_segments"))?,
        pending: to_u32("pending_segments", row.get("pending_segments"))?,
        running: to_u32("running_segments", row.get("running_segments"))?,
        completed: to_u32("completed_segments", row.get("completed_segments"))?,
        failed: to_u32("failed_segments", row.get("failed_segments"))?,
        exhausted: to_u32("exhausted_segments", row.get("exhausted_segments"))?,
        records_collected: to_u64("records_collected", row.get("records_collected"))?,
    };

    Ok(Collection {
        collection_id,
        workflow_id: row.get("workflow_id"),
        instance_id: row.get("instance_id"),
        collection_type: CollectionType::from_str(&collection_type)?,
        date_range: DateRange::new(
            parse_date("start_date", &start_date)?,
            parse_date("end_date", &end_date)?,
        ),
        segment_width_days: to_u32("segment_width_days", row.get("segment_width_days"))?,
        parameters,
        status: CollectionStatus::from_str(&status)?,
        statistics,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

pub(crate) fn map_segment_row(row: SqliteRow) -> CoreResult<Segment> {
    let segment_bytes: Vec<u8> = row.get("segment_id");
    let collection_bytes: Vec<u8> = row.get("collection_id");
    let segment_id =
        SegmentId::from_bytes(&segment_bytes).map_err(|err| CoreError::internal(err.to_string()))?;
    let collection_id = CollectionId::from_bytes(&collection_bytes)
        .map_err(|err| CoreError::internal(err.to_string()))?;
    let window_start: String = row.get("window_start");
    let window_end: String = row.get("window_end");
    let status: String = row.get("status");
    let execution_attempt: Option<i64> = row.get("execution_attempt");
    let record_count: Option<i64> = row.get("record_count");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Segment {
        segment_id,
        collection_id,
        window_start: parse_date("window_start", &window_start)?,
        window_end: parse_date("window_end", &window_end)?,
        status: SegmentStatus::from_str(&status)?,
        attempt_count: to_u32("attempt_count", row.get("attempt_count"))?,
        execution_id: row
            .get::<Option<String>, _>("execution_id")
            .map(ExecutionId::from),
        execution_attempt: execution_attempt
            .map(|value| to_u32("execution_attempt", value))
            .transpose()?,
        record_count: record_count
            .map(|value| to_u64("record_count", value))
            .transpose()?,
        error_message: row.get("error_message"),
        next_attempt_at: parse_optional_ts("next_attempt_at", row.get("next_attempt_at"))?,
        started_at: parse_optional_ts("started_at", row.get("started_at"))?,
        completed_at: parse_optional_ts("completed_at", row.get("completed_at"))?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

pub(crate) async fn insert_segment(conn: &mut SqliteConnection, segment: &Segment) -> CoreResult<()> {
    let record_count = segment
        .record_count
        .map(|value| to_i64("record_count", value))
        .transpose()?;

    query(
        r#"
        INSERT INTO collection_segments (
            segment_id,
            collection_id,
            window_start,
            window_end,
            status,
            attempt_count,
            execution_id,
            execution_attempt,
            record_count,
            error_message,
            next_attempt_at,
            started_at,
            completed_at,
            created_at,
            updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )
    .bind(segment.segment_id.to_bytes().to_vec())
    .bind(segment.collection_id.to_bytes().to_vec())
    .bind(format_date(segment.window_start))
    .bind(format_date(segment.window_end))
    .bind(segment.status.as_str())
    .bind(i64::from(segment.attempt_count))
    .bind(segment.execution_id.as_ref().map(|id| id.as_str().to_string()))
    .bind(segment.execution_attempt.map(i64::from))
    .bind(record_count)
    .bind(segment.error_message.as_deref())
    .bind(segment.next_attempt_at.map(format_ts))
    .bind(segment.started_at.map(format_ts))
    .bind(segment.completed_at.map(format_ts))
    .bind(format_ts(segment.created_at))
    .bind(format_ts(segment.updated_at))
    .execute(&mut *conn)
    .await
    .map(|_| ())
    .map_err(|err| map_sqlx_error("segment", segment.segment_id.to_string(), err))
}

/// Recounts the statistics columns of a collection from its segments.
pub(crate) async fn refresh_statistics(
    conn: &mut SqliteConnection,
    collection_id: CollectionId,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    query(
        r#"
        UPDATE collections
           SET total_segments = (
                   SELECT COUNT(*) FROM collection_segments WHERE collection_id = ?1),
               pending_segments = (
                   SELECT COUNT(*) FROM collection_segments
                    WHERE collection_id = ?1 AND status = 'pending'),
               running_segments = (
                   SELECT COUNT(*) FROM collection_segments
                    WHERE collection_id = ?1 AND status = 'running'),
               completed_segments = (
                   SELECT COUNT(*) FROM collection_segments
                    WHERE collection_id = ?1 AND status = 'completed'),
               failed_segments = (
                   SELECT COUNT(*) FROM collection_segments
                    WHERE collection_id = ?1 AND status = 'failed'),
               exhausted_segments = (
                   SELECT COUNT(*) FROM collection_segments
                    WHERE collection_id = ?1 AND status = 'failed' AND next_attempt_at IS NULL),
               records_collected = (
                   SELECT COALESCE(SUM(record_count), 0) FROM collection_segments
                    WHERE collection_id = ?1 AND status = 'completed'),
               updated_at = ?2
         WHERE collection_id = ?1
        "#,
    )
    .bind(collection_id.to_bytes().to_vec())
    .bind(format_ts(now))
    .execute(&mut *conn)
    .await
    .map(|_| ())
    .map_err(|err| map_sqlx_error("collection", collection_id.to_string(), err))
}

pub(crate) async fn fetch_collection(
    conn: &mut SqliteConnection,
    collection_id: CollectionId,
) -> CoreResult<Option<Collection>> {
    let sql = format!("SELECT {COLLECTION_COLUMNS} FROM collections WHERE collection_id = ?1");
    let row = query(&sql)
        .bind(collection_id.to_bytes().to_vec())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| CoreError::internal(err.to_string()))?;

    row.map(map_collection_row).transpose()
}

pub(crate) fn map_sqlx_error(entity: &'static str, id: String, err: sqlx::Error) -> CoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            if message.contains("UNIQUE constraint failed") {
                CoreError::already_exists(entity, id)
            } else if message.contains("FOREIGN KEY constraint failed") {
                CoreError::invalid_state("foreign key constraint failed".to_string())
            } else if message.contains("CHECK constraint failed") {
                CoreError::invalid_state(format!("check constraint failed: {message}"))
            } else {
                CoreError::internal(message)
            }
        }
        other => CoreError::internal(other.to_string()),
    }
}
