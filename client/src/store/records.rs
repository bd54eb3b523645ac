//! Rows of the `records` and `record_sync` tables.

use chartsync_engine::{
    ClinicalRecord, ClinicalSystems, Medications, Modified, PendingWrite, Timestamp,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, FromRow, Row, Sqlite};

const RECORD_COLUMNS: &str = "id, owner_id, sort_order, name, clinical_summary, interval_events, \
    imaging, labs, sys_neuro, sys_cardiovascular, sys_respiratory, sys_gastrointestinal, \
    sys_renal, sys_endocrine, sys_hematology, sys_infectious_disease, sys_skin, sys_lines, \
    med_infusions, med_scheduled, med_prn, field_timestamps, collapsed, created_at, \
    last_modified, modified, deleted";

/// A stored record row.
#[derive(Debug)]
pub struct StoredRecord(pub ClinicalRecord);

impl<'r> FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let stamps: String = row.try_get("field_timestamps")?;
        let field_timestamps = serde_json::from_str(&stamps).map_err(|e| {
            sqlx::Error::ColumnDecode {
                index: "field_timestamps".into(),
                source: Box::new(e),
            }
        })?;
        let last_modified: Option<i64> = row.try_get("last_modified")?;

        Ok(StoredRecord(ClinicalRecord {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            order: row.try_get("sort_order")?,
            name: row.try_get("name")?,
            clinical_summary: row.try_get("clinical_summary")?,
            interval_events: row.try_get("interval_events")?,
            imaging: row.try_get("imaging")?,
            labs: row.try_get("labs")?,
            systems: ClinicalSystems {
                neuro: row.try_get("sys_neuro")?,
                cardiovascular: row.try_get("sys_cardiovascular")?,
                respiratory: row.try_get("sys_respiratory")?,
                gastrointestinal: row.try_get("sys_gastrointestinal")?,
                renal: row.try_get("sys_renal")?,
                endocrine: row.try_get("sys_endocrine")?,
                hematology: row.try_get("sys_hematology")?,
                infectious_disease: row.try_get("sys_infectious_disease")?,
                skin: row.try_get("sys_skin")?,
                lines: row.try_get("sys_lines")?,
            },
            medications: Medications {
                infusions: row.try_get("med_infusions")?,
                scheduled: row.try_get("med_scheduled")?,
                prn: row.try_get("med_prn")?,
            },
            field_timestamps,
            collapsed: row.try_get("collapsed")?,
            created_at: row.try_get::<i64, _>("created_at")? as Timestamp,
            last_modified: last_modified.map(|v| v as Timestamp),
            modified: row.try_get::<i64, _>("modified")? as Modified,
            deleted: row.try_get("deleted")?,
        }))
    }
}

/// Outbound state of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRow {
    pub record_id: String,
    pub dirty: bool,
    pub force_push: bool,
    pub remote_modified: Option<Modified>,
}

impl<'r> FromRow<'r, SqliteRow> for SyncRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let remote_modified: Option<i64> = row.try_get("remote_modified")?;
        Ok(SyncRow {
            record_id: row.try_get("record_id")?,
            dirty: row.try_get("dirty")?,
            force_push: row.try_get("force_push")?,
            remote_modified: remote_modified.map(|v| v as Modified),
        })
    }
}

impl SyncRow {
    /// The pending write, if the record is dirty.
    pub fn pending(&self) -> Option<PendingWrite> {
        self.dirty.then_some(PendingWrite {
            base_modified: self.remote_modified,
            force: self.force_push,
        })
    }
}

/// Get a record by id.
pub async fn fetch_record<'e, E>(executor: E, id: &str) -> Result<Option<ClinicalRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?");
    let row = sqlx::query_as::<_, StoredRecord>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|r| r.0))
}

/// Get records, optionally for one owner, ordered by (`order`, `id`).
pub async fn fetch_records<'e, E>(
    executor: E,
    owner: Option<&str>,
    include_deleted: bool,
) -> Result<Vec<ClinicalRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM records \
         WHERE (?1 IS NULL OR owner_id = ?1) AND (?2 OR deleted = 0) \
         ORDER BY sort_order, id"
    );
    let rows = sqlx::query_as::<_, StoredRecord>(&sql)
        .bind(owner)
        .bind(include_deleted)
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Insert or replace a record.
pub async fn upsert_record<'e, E>(executor: E, record: &ClinicalRecord) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let stamps = serde_json::to_string(&record.field_timestamps)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let sql = format!(
        "INSERT INTO records ({RECORD_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET \
            owner_id = excluded.owner_id, sort_order = excluded.sort_order, name = excluded.name, \
            clinical_summary = excluded.clinical_summary, interval_events = excluded.interval_events, \
            imaging = excluded.imaging, labs = excluded.labs, \
            sys_neuro = excluded.sys_neuro, sys_cardiovascular = excluded.sys_cardiovascular, \
            sys_respiratory = excluded.sys_respiratory, sys_gastrointestinal = excluded.sys_gastrointestinal, \
            sys_renal = excluded.sys_renal, sys_endocrine = excluded.sys_endocrine, \
            sys_hematology = excluded.sys_hematology, sys_infectious_disease = excluded.sys_infectious_disease, \
            sys_skin = excluded.sys_skin, sys_lines = excluded.sys_lines, \
            med_infusions = excluded.med_infusions, med_scheduled = excluded.med_scheduled, \
            med_prn = excluded.med_prn, field_timestamps = excluded.field_timestamps, \
            collapsed = excluded.collapsed, created_at = excluded.created_at, \
            last_modified = excluded.last_modified, modified = excluded.modified, \
            deleted = excluded.deleted"
    );
    let s = &record.systems;
    let m = &record.medications;
    sqlx::query(&sql)
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(record.order)
        .bind(&record.name)
        .bind(&record.clinical_summary)
        .bind(&record.interval_events)
        .bind(&record.imaging)
        .bind(&record.labs)
        .bind(&s.neuro)
        .bind(&s.cardiovascular)
        .bind(&s.respiratory)
        .bind(&s.gastrointestinal)
        .bind(&s.renal)
        .bind(&s.endocrine)
        .bind(&s.hematology)
        .bind(&s.infectious_disease)
        .bind(&s.skin)
        .bind(&s.lines)
        .bind(&m.infusions)
        .bind(&m.scheduled)
        .bind(&m.prn)
        .bind(stamps)
        .bind(record.collapsed)
        .bind(record.created_at as i64)
        .bind(record.last_modified.map(|v| v as i64))
        .bind(record.modified as i64)
        .bind(record.deleted)
        .execute(executor)
        .await?;
    Ok(())
}

/// Get the outbound state of a record.
pub async fn fetch_sync_row<'e, E>(executor: E, id: &str) -> Result<Option<SyncRow>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, SyncRow>(
        "SELECT record_id, dirty, force_push, remote_modified FROM record_sync WHERE record_id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Mark a record clean at a known remote counter.
pub async fn mark_clean<'e, E>(executor: E, id: &str, remote_modified: Modified) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO record_sync (record_id, dirty, force_push, remote_modified, dirty_since)
        VALUES (?1, 0, 0, ?2, NULL)
        ON CONFLICT (record_id) DO UPDATE SET
            dirty = 0, force_push = 0, remote_modified = ?2, dirty_since = NULL
        "#,
    )
    .bind(id)
    .bind(remote_modified as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// Mark a record dirty, keeping its remote base and force flag.
pub async fn mark_dirty<'e, E>(executor: E, id: &str, now: Timestamp) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO record_sync (record_id, dirty, force_push, remote_modified, dirty_since)
        VALUES (?1, 1, 0, NULL, ?2)
        ON CONFLICT (record_id) DO UPDATE SET
            dirty = 1, dirty_since = COALESCE(record_sync.dirty_since, ?2)
        "#,
    )
    .bind(id)
    .bind(now as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// Replace the outbound state of a record.
pub async fn set_pending<'e, E>(
    executor: E,
    id: &str,
    pending: Option<PendingWrite>,
    remote_modified: Modified,
    now: Timestamp,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (dirty, force) = match pending {
        Some(p) => (true, p.force),
        None => (false, false),
    };
    sqlx::query(
        r#"
        INSERT INTO record_sync (record_id, dirty, force_push, remote_modified, dirty_since)
        VALUES (?1, ?2, ?3, ?4, CASE WHEN ?2 THEN ?5 ELSE NULL END)
        ON CONFLICT (record_id) DO UPDATE SET
            dirty = ?2, force_push = ?3, remote_modified = ?4,
            dirty_since = CASE WHEN ?2 THEN ?5 ELSE NULL END
        "#,
    )
    .bind(id)
    .bind(dirty)
    .bind(force)
    .bind(remote_modified as i64)
    .bind(now as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// Dirty records not held back by an open conflict, oldest first.
pub async fn fetch_outbound<'e, E>(
    executor: E,
    owner: &str,
    limit: usize,
) -> Result<Vec<(ClinicalRecord, SyncRow)>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let columns = RECORD_COLUMNS
        .split(", ")
        .map(|c| format!("r.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {columns}, s.record_id, s.dirty, s.force_push, s.remote_modified \
         FROM records r JOIN record_sync s ON s.record_id = r.id \
         WHERE s.dirty = 1 AND r.owner_id = ? \
           AND NOT EXISTS (SELECT 1 FROM conflicts c WHERE c.record_id = r.id AND c.status = 'open') \
         ORDER BY s.dirty_since, r.id \
         LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(owner)
        .bind(limit as i64)
        .fetch_all(executor)
        .await?;

    rows.iter()
        .map(|row| {
            let StoredRecord(record) = StoredRecord::from_row(row)?;
            Ok((record, SyncRow::from_row(row)?))
        })
        .collect()
}

/// Number of dirty records.
pub async fn count_dirty<'e, E>(executor: E) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM record_sync WHERE dirty = 1")
        .fetch_one(executor)
        .await?;
    Ok(count as u64)
}

/// Delete tombstones that are clean and not under conflict; returns their ids.
pub async fn purge_tombstones<'e, E>(executor: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar(
        r#"
        DELETE FROM records
        WHERE deleted = 1
          AND NOT EXISTS (SELECT 1 FROM record_sync s WHERE s.record_id = records.id AND s.dirty = 1)
          AND NOT EXISTS (SELECT 1 FROM conflicts c WHERE c.record_id = records.id AND c.status = 'open')
        RETURNING id
        "#,
    )
    .fetch_all(executor)
    .await
}

/// Record a push acknowledgement for `modified`.
///
/// The remote base always advances. The record only becomes clean if no
/// local write landed after the pushed version. Returns whether it did.
pub async fn acknowledge<'e, E>(executor: E, id: &str, modified: Modified) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let cleared: Option<bool> = sqlx::query_scalar(
        r#"
        UPDATE record_sync SET
            remote_modified = ?2,
            force_push = 0,
            dirty = CASE WHEN (SELECT modified FROM records WHERE id = ?1) = ?2 THEN 0 ELSE dirty END,
            dirty_since = CASE WHEN (SELECT modified FROM records WHERE id = ?1) = ?2 THEN NULL ELSE dirty_since END
        WHERE record_id = ?1
        RETURNING dirty = 0
        "#,
    )
    .bind(id)
    .bind(modified as i64)
    .fetch_optional(executor)
    .await?;
    Ok(cleared.unwrap_or(false))
}

/// Forget the outbound state of a purged record.
pub async fn delete_sync_row<'e, E>(executor: E, id: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM record_sync WHERE record_id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}
