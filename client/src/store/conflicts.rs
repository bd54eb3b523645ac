//! Rows of the `conflicts` table.

use chartsync_engine::{ClinicalRecord, ConflictRecord, ConflictStatus, ResolutionPolicy, Timestamp};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, FromRow, Row, Sqlite};

const CONFLICT_COLUMNS: &str =
    "id, collection, record_id, local_version, remote_version, detected_at, status";

struct StoredConflict(ConflictRecord);

impl<'r> FromRow<'r, SqliteRow> for StoredConflict {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let decode = |column: &'static str| -> Result<ClinicalRecord, sqlx::Error> {
            let raw: String = row.try_get(column)?;
            serde_json::from_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
                index: column.into(),
                source: Box::new(e),
            })
        };
        let status: String = row.try_get("status")?;

        Ok(StoredConflict(ConflictRecord {
            id: row.try_get("id")?,
            collection: row.try_get("collection")?,
            record_id: row.try_get("record_id")?,
            local: decode("local_version")?,
            remote: decode("remote_version")?,
            detected_at: row.try_get::<i64, _>("detected_at")? as Timestamp,
            status: ConflictStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: format!("unknown conflict status {status}").into(),
            })?,
        }))
    }
}

fn encode(record: &ClinicalRecord) -> Result<String, sqlx::Error> {
    serde_json::to_string(record).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

/// The open conflict for a record, if any.
pub async fn fetch_open_for_record<'e, E>(
    executor: E,
    record_id: &str,
) -> Result<Option<ConflictRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE record_id = ? AND status = 'open'"
    );
    let row = sqlx::query_as::<_, StoredConflict>(&sql)
        .bind(record_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|c| c.0))
}

/// An open conflict by id.
pub async fn fetch_open<'e, E>(executor: E, id: &str) -> Result<Option<ConflictRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ? AND status = 'open'");
    let row = sqlx::query_as::<_, StoredConflict>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|c| c.0))
}

/// All open conflicts, oldest first.
pub async fn fetch_all_open<'e, E>(executor: E) -> Result<Vec<ConflictRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE status = 'open' ORDER BY detected_at, id"
    );
    let rows = sqlx::query_as::<_, StoredConflict>(&sql)
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(|c| c.0).collect())
}

/// Insert a new conflict.
pub async fn insert<'e, E>(executor: E, conflict: &ConflictRecord) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO conflicts (id, collection, record_id, local_version, remote_version, detected_at, status)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&conflict.id)
    .bind(&conflict.collection)
    .bind(&conflict.record_id)
    .bind(encode(&conflict.local)?)
    .bind(encode(&conflict.remote)?)
    .bind(conflict.detected_at as i64)
    .bind(conflict.status.as_str())
    .execute(executor)
    .await?;
    Ok(())
}

/// Refresh the snapshots of an open conflict after re-detection.
pub async fn update_versions<'e, E>(executor: E, conflict: &ConflictRecord) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE conflicts SET local_version = ?, remote_version = ?, detected_at = ? WHERE id = ?",
    )
    .bind(encode(&conflict.local)?)
    .bind(encode(&conflict.remote)?)
    .bind(conflict.detected_at as i64)
    .bind(&conflict.id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Close a conflict.
pub async fn mark_resolved<'e, E>(
    executor: E,
    id: &str,
    policy: ResolutionPolicy,
    at: Timestamp,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE conflicts SET status = 'resolved', resolved_at = ?, policy = ? WHERE id = ?")
        .bind(at as i64)
        .bind(policy.to_string())
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}
