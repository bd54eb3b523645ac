//! HTTP route definitions.

mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new().merge(health::routes()).merge(sync::routes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::websocket::ConnectionManager;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Router over a pool that is never connected; requests that reach the
    /// database would fail, so these tests cover everything before it.
    fn app(auth_token: Option<&str>) -> Router {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "postgres://localhost/chartsync_test".into(),
            auth_token: auth_token.map(String::from),
            max_pull_limit: 1000,
        };
        let state = AppState {
            pool: db::lazy_pool(&config.database_url).unwrap(),
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        };
        create_routes().with_state(state)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_pull_requires_token_when_configured() {
        let response = app(Some("s3cret"))
            .oneshot(
                Request::get("/sync/records?owner=u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"],
            "Missing authorization header"
        );
    }

    #[tokio::test]
    async fn test_push_with_wrong_token_rejected() {
        let response = app(Some("s3cret"))
            .oneshot(
                Request::post("/sync/records")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"ownerId":"u1","documents":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_pull_without_owner_is_bad_request() {
        let response = app(None)
            .oneshot(Request::get("/sync/records").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_with_empty_owner_is_bad_request() {
        let response = app(None)
            .oneshot(
                Request::post("/sync/records")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"ownerId":"","documents":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "ownerId is required");
    }
}
