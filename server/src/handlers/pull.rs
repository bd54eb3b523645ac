//! Pull handler - serves changed documents to clients.

use crate::config::DEFAULT_PULL_LIMIT;
use crate::db;
use crate::error::{AppError, Result};
use chartsync_engine::protocol::PullQuery;
use chartsync_engine::{Checkpoint, PullBatch};
use sqlx::PgPool;

/// Effective page size for a requested limit.
pub fn effective_limit(requested: Option<usize>, max: i64) -> i64 {
    match requested {
        Some(n) => (n.min(i64::MAX as usize) as i64).clamp(1, max),
        None => DEFAULT_PULL_LIMIT.min(max),
    }
}

/// Process a pull request from a client.
pub async fn handle_pull(
    pool: &PgPool,
    collection: &str,
    query: PullQuery,
    max_limit: i64,
) -> Result<PullBatch> {
    if query.owner.is_empty() {
        return Err(AppError::BadRequest("owner is required".to_string()));
    }
    let limit = effective_limit(query.limit, max_limit);
    let since = query.since.map_or(0, |s| s.min(i64::MAX as u64) as i64);

    // Fetch one more than requested to check if there are more
    let mut stored =
        db::documents_since(pool, collection, &query.owner, since, limit + 1).await?;
    let has_more = stored.len() as i64 > limit;
    stored.truncate(limit as usize);

    let checkpoint = stored.last().map(|d| Checkpoint(d.seq as u64));
    tracing::debug!(
        %collection,
        owner = %query.owner,
        since,
        count = stored.len(),
        has_more,
        "pull"
    );

    Ok(PullBatch {
        documents: stored.into_iter().map(|d| d.document).collect(),
        checkpoint,
        has_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_defaults_and_clamps() {
        assert_eq!(effective_limit(None, 1000), 100);
        assert_eq!(effective_limit(None, 50), 50);
        assert_eq!(effective_limit(Some(0), 1000), 1);
        assert_eq!(effective_limit(Some(250), 1000), 250);
        assert_eq!(effective_limit(Some(5000), 1000), 1000);
    }
}
