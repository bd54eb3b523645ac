//! Replication endpoint routes.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    response::Response,
    routing::get,
    Json, Router,
};
use chartsync_engine::protocol::{PullQuery, PushRequest};
use chartsync_engine::{LiveMessage, PullBatch, PushResult};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::{handle_pull, handle_push, handle_websocket_connection};
use crate::AppState;

/// Create replication routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/{collection}", get(pull_handler).post(push_handler))
        .route("/ws/{collection}", get(live_handler))
}

/// GET /sync/{collection} - Documents changed since a checkpoint.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullBatch>> {
    let batch = handle_pull(&state.pool, &collection, query, state.config.max_pull_limit).await?;
    Ok(Json(batch))
}

/// POST /sync/{collection} - Offer documents to the authoritative store.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResult>> {
    let owner_id = request.owner_id.clone();
    let outcome = handle_push(&state.pool, &collection, request).await?;

    if let Some(checkpoint) = outcome.checkpoint {
        state.conn_manager.notify(
            &collection,
            &owner_id,
            LiveMessage::ChangesAvailable {
                collection: collection.clone(),
                checkpoint,
            },
        );
    }
    Ok(Json(outcome.result))
}

#[derive(Debug, Deserialize)]
struct LiveQuery {
    owner: String,
}

/// GET /ws/{collection}?owner= - Live change notifications.
async fn live_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    Query(query): Query<LiveQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    if query.owner.is_empty() {
        return Err(AppError::BadRequest("owner is required".to_string()));
    }
    let manager = state.conn_manager.clone();
    Ok(ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, manager, collection, query.owner)
    }))
}
