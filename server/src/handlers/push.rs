//! Push handler - applies client documents to the authoritative store.
//!
//! Documents are decided one by one, each in its own transaction with the
//! stored row locked, so a bad or conflicting document never fails the
//! others. Each transaction also holds the collection lock, which keeps
//! change sequence numbers in commit order.

use crate::db;
use crate::error::{AppError, Result};
use chartsync_engine::protocol::PushRequest;
use chartsync_engine::{
    decide_push, Checkpoint, PushDecision, PushDocument, PushResult, RecordSchema, RejectReason,
    RejectedDocument,
};
use sqlx::PgPool;

/// Result of a push plus the newest change sequence it produced.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub result: PushResult,
    /// `None` when nothing was written
    pub checkpoint: Option<Checkpoint>,
}

/// Process a push request from a client.
pub async fn handle_push(
    pool: &PgPool,
    collection: &str,
    request: PushRequest,
) -> Result<PushOutcome> {
    if request.owner_id.is_empty() {
        return Err(AppError::BadRequest("ownerId is required".to_string()));
    }
    let schema = RecordSchema::clinical();
    let mut outcome = PushOutcome::default();

    for raw in request.documents {
        let document = match parse_document(&schema, &request.owner_id, raw) {
            Ok(document) => document,
            Err(rejected) => {
                tracing::warn!(
                    record_id = %rejected.id,
                    message = rejected.message.as_deref().unwrap_or_default(),
                    "invalid document in push"
                );
                outcome.result.rejected.push(rejected);
                continue;
            }
        };

        let id = document.record.id.clone();
        match apply_document(pool, collection, &document).await? {
            Applied::Written(seq) => {
                let seq = Checkpoint(seq as u64);
                outcome.checkpoint = outcome.checkpoint.max(Some(seq));
                outcome.result.accepted.push(id);
            }
            Applied::Unchanged => outcome.result.accepted.push(id),
            Applied::Rejected(rejected) => outcome.result.rejected.push(rejected),
        }
    }

    tracing::debug!(
        %collection,
        owner = %request.owner_id,
        accepted = outcome.result.accepted.len(),
        rejected = outcome.result.rejected.len(),
        "push"
    );
    Ok(outcome)
}

/// Decode and validate one pushed document.
pub fn parse_document(
    schema: &RecordSchema,
    owner_id: &str,
    raw: serde_json::Value,
) -> std::result::Result<PushDocument, RejectedDocument> {
    let id = raw
        .pointer("/record/id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let invalid = |message: String| RejectedDocument {
        id: id.clone(),
        reason: RejectReason::Invalid,
        message: Some(message),
        current: None,
    };

    if let Some(record) = raw.get("record") {
        schema
            .validate_document(record)
            .map_err(|e| invalid(e.to_string()))?;
    }
    let document: PushDocument =
        serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
    if document.record.owner_id != owner_id {
        return Err(invalid("owner mismatch".to_string()));
    }
    Ok(document)
}

enum Applied {
    Written(i64),
    Unchanged,
    Rejected(RejectedDocument),
}

async fn apply_document(
    pool: &PgPool,
    collection: &str,
    document: &PushDocument,
) -> Result<Applied> {
    let record = &document.record;
    let mut tx = pool.begin().await?;
    db::lock_collection(&mut tx, collection).await?;

    // a concurrent first insert sends us around once more
    for _ in 0..2 {
        let stored = db::lock_document(&mut tx, collection, &record.id).await?;
        let current = stored.as_ref().and_then(|s| s.to_record());

        let applied = match decide_push(current.as_ref(), document) {
            PushDecision::Accept if stored.is_some() => {
                Applied::Written(db::update_document(&mut tx, collection, record).await?)
            }
            PushDecision::Accept => match db::insert_document(&mut tx, collection, record).await? {
                Some(seq) => Applied::Written(seq),
                None => continue,
            },
            PushDecision::AlreadyApplied => Applied::Unchanged,
            PushDecision::Reject => {
                tracing::info!(
                    record_id = %record.id,
                    base = ?document.base_modified,
                    stored = current.as_ref().map(|c| c.modified),
                    "push rejected, remote moved on"
                );
                Applied::Rejected(RejectedDocument {
                    id: record.id.clone(),
                    reason: RejectReason::Conflict,
                    message: None,
                    current,
                })
            }
        };
        tx.commit().await?;
        return Ok(applied);
    }

    Err(AppError::BadRequest(format!(
        "document {} is being written concurrently",
        record.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartsync_engine::ClinicalRecord;
    use serde_json::json;

    fn raw(owner: &str) -> serde_json::Value {
        let record = ClinicalRecord::new("p1", owner, "Bed 1", 0, 0);
        json!({ "record": record.to_document(), "baseModified": null })
    }

    #[test]
    fn test_parse_valid_document() {
        let schema = RecordSchema::clinical();
        let document = parse_document(&schema, "u1", raw("u1")).unwrap();
        assert_eq!(document.record.id, "p1");
        assert!(!document.force);
    }

    #[test]
    fn test_parse_rejects_owner_mismatch() {
        let schema = RecordSchema::clinical();
        let rejected = parse_document(&schema, "u2", raw("u1")).unwrap_err();
        assert_eq!(rejected.id, "p1");
        assert_eq!(rejected.reason, RejectReason::Invalid);
    }

    #[test]
    fn test_parse_rejects_invalid_record_with_id() {
        let schema = RecordSchema::clinical();
        let body = json!({ "record": { "id": "p7", "ownerId": "u1", "order": "first" } });
        let rejected = parse_document(&schema, "u1", body).unwrap_err();
        assert_eq!(rejected.id, "p7");
        assert!(rejected.message.unwrap().contains("order"));
    }

    #[test]
    fn test_parse_rejects_garbage_without_id() {
        let schema = RecordSchema::clinical();
        let rejected = parse_document(&schema, "u1", json!(42)).unwrap_err();
        assert_eq!(rejected.id, "");
    }

    fn push_doc(id: &str) -> PushDocument {
        PushDocument {
            record: ClinicalRecord::new(id, "u1", "Bed 1", 0, 1),
            base_modified: None,
            force: false,
        }
    }

    /// Needs a database; set `TEST_DATABASE_URL` to run it.
    #[tokio::test]
    async fn test_pull_cursor_never_passes_uncommitted_write() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let pool = db::create_pool(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let collection = format!("seq-{}", uuid::Uuid::new_v4());

        // first writer takes its sequence number and has not committed yet
        let mut first = pool.begin().await.unwrap();
        db::lock_collection(&mut first, &collection).await.unwrap();
        let first_seq = db::insert_document(&mut first, &collection, &push_doc("p1").record)
            .await
            .unwrap()
            .unwrap();

        let second = tokio::spawn({
            let pool = pool.clone();
            let collection = collection.clone();
            async move { apply_document(&pool, &collection, &push_doc("p2")).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!second.is_finished());
        let visible = db::documents_since(&pool, &collection, "u1", 0, 10).await.unwrap();
        assert!(visible.is_empty());

        first.commit().await.unwrap();
        let Applied::Written(second_seq) = second.await.unwrap().unwrap() else {
            panic!("second document was not written");
        };
        assert!(second_seq > first_seq);

        let ids: Vec<String> = db::documents_since(&pool, &collection, "u1", 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.record_id)
            .collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }
}
