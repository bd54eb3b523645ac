//! Checkpoints and field history.

use chartsync_engine::{Checkpoint, FieldHistoryEntry, Timestamp};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, FromRow, Row, Sqlite};

/// Stored pull cursor for an identity key.
pub async fn fetch_checkpoint<'e, E>(executor: E, identity: &str) -> Result<Option<Checkpoint>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sequence: Option<i64> =
        sqlx::query_scalar("SELECT sequence FROM checkpoints WHERE identity = ?")
            .bind(identity)
            .fetch_optional(executor)
            .await?;
    Ok(sequence.map(|s| Checkpoint(s as u64)))
}

pub async fn save_checkpoint<'e, E>(
    executor: E,
    identity: &str,
    checkpoint: Checkpoint,
    now: Timestamp,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO checkpoints (identity, sequence, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT (identity) DO UPDATE SET sequence = ?2, updated_at = ?3
        "#,
    )
    .bind(identity)
    .bind(checkpoint.0 as i64)
    .bind(now as i64)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_checkpoint<'e, E>(executor: E, identity: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM checkpoints WHERE identity = ?")
        .bind(identity)
        .execute(executor)
        .await?;
    Ok(())
}

struct StoredHistory(FieldHistoryEntry);

impl<'r> FromRow<'r, SqliteRow> for StoredHistory {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredHistory(FieldHistoryEntry {
            record_id: row.try_get("record_id")?,
            field: row.try_get("field")?,
            old_value: row.try_get("old_value")?,
            new_value: row.try_get("new_value")?,
            actor_id: row.try_get("actor_id")?,
            at: row.try_get::<i64, _>("at")? as Timestamp,
        }))
    }
}

/// Append one audit entry.
pub async fn append_history<'e, E>(executor: E, entry: &FieldHistoryEntry) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO field_history (record_id, field, old_value, new_value, actor_id, at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.record_id)
    .bind(&entry.field)
    .bind(&entry.old_value)
    .bind(&entry.new_value)
    .bind(&entry.actor_id)
    .bind(entry.at as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// History of a record, optionally restricted to one field, in write order.
pub async fn fetch_history<'e, E>(
    executor: E,
    record_id: &str,
    field: Option<&str>,
) -> Result<Vec<FieldHistoryEntry>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, StoredHistory>(
        r#"
        SELECT record_id, field, old_value, new_value, actor_id, at
        FROM field_history
        WHERE record_id = ?1 AND (?2 IS NULL OR field = ?2)
        ORDER BY at, id
        "#,
    )
    .bind(record_id)
    .bind(field)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|h| h.0).collect())
}
