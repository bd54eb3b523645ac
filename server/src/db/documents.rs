//! Queries for the documents table.
//!
//! Every write takes the next value of the `document_changes` sequence, so
//! `seq` orders all changes of a collection and doubles as the pull cursor.
//! Writers hold the collection lock from before `nextval` until commit, so
//! within a collection sequence order is commit order and a pull never
//! passes a change that has yet to commit.

use chartsync_engine::ClinicalRecord;
use sqlx::{PgConnection, PgPool, Row};

/// A stored document row.
#[derive(Debug)]
pub struct StoredDocument {
    pub record_id: String,
    pub document: serde_json::Value,
    pub modified: i64,
    pub seq: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredDocument {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredDocument {
            record_id: row.try_get("record_id")?,
            document: row.try_get("document")?,
            modified: row.try_get("modified")?,
            seq: row.try_get("seq")?,
        })
    }
}

impl StoredDocument {
    /// Parse the stored body. `None` if it no longer validates.
    pub fn to_record(&self) -> Option<ClinicalRecord> {
        match ClinicalRecord::from_document(self.document.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    record_id = %self.record_id,
                    modified = self.modified,
                    error = %e,
                    "stored document does not validate"
                );
                None
            }
        }
    }
}

/// Documents of one owner changed after `since`, oldest change first.
pub async fn documents_since(
    pool: &PgPool,
    collection: &str,
    owner_id: &str,
    since: i64,
    limit: i64,
) -> Result<Vec<StoredDocument>, sqlx::Error> {
    sqlx::query_as::<_, StoredDocument>(
        r#"
        SELECT record_id, document, modified, seq
        FROM documents
        WHERE collection = $1 AND owner_id = $2 AND seq > $3
        ORDER BY seq ASC
        LIMIT $4
        "#,
    )
    .bind(collection)
    .bind(owner_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Serialize writers of one collection until the transaction ends.
pub async fn lock_collection(conn: &mut PgConnection, collection: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(collection)
        .execute(conn)
        .await?;
    Ok(())
}

/// Fetch a document and lock its row until the transaction ends.
pub async fn lock_document(
    conn: &mut PgConnection,
    collection: &str,
    record_id: &str,
) -> Result<Option<StoredDocument>, sqlx::Error> {
    sqlx::query_as::<_, StoredDocument>(
        r#"
        SELECT record_id, document, modified, seq
        FROM documents
        WHERE collection = $1 AND record_id = $2
        FOR UPDATE
        "#,
    )
    .bind(collection)
    .bind(record_id)
    .fetch_optional(conn)
    .await
}

/// Insert a new document.
///
/// Returns `None` when another writer inserted the same id first.
pub async fn insert_document(
    conn: &mut PgConnection,
    collection: &str,
    record: &ClinicalRecord,
) -> Result<Option<i64>, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO documents (collection, record_id, owner_id, document, modified, deleted)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (collection, record_id) DO NOTHING
        RETURNING seq
        "#,
    )
    .bind(collection)
    .bind(&record.id)
    .bind(&record.owner_id)
    .bind(record.to_document())
    .bind(record.modified as i64)
    .bind(record.deleted)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|(seq,)| seq))
}

/// Replace a locked document and advance its change sequence.
pub async fn update_document(
    conn: &mut PgConnection,
    collection: &str,
    record: &ClinicalRecord,
) -> Result<i64, sqlx::Error> {
    let (seq,): (i64,) = sqlx::query_as(
        r#"
        UPDATE documents SET
            owner_id = $3,
            document = $4,
            modified = $5,
            deleted = $6,
            seq = nextval('document_changes'),
            updated_at = NOW()
        WHERE collection = $1 AND record_id = $2
        RETURNING seq
        "#,
    )
    .bind(collection)
    .bind(&record.id)
    .bind(&record.owner_id)
    .bind(record.to_document())
    .bind(record.modified as i64)
    .bind(record.deleted)
    .fetch_one(conn)
    .await?;

    Ok(seq)
}
