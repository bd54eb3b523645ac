//! Bearer token authentication.
//!
//! When `AUTH_TOKEN` is configured every sync request must present it as a
//! bearer token. Without it the server accepts anonymous clients, which is
//! only meant for local development.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Caller that passed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// Presented the configured token
    Token,
    /// No token configured on the server
    Anonymous,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        authorize(state.config.auth_token.as_deref(), header)
    }
}

/// Check an `Authorization` header against the configured token.
pub fn authorize(expected: Option<&str>, header: Option<&str>) -> Result<AuthUser, AppError> {
    let Some(expected) = expected else {
        return Ok(AuthUser::Anonymous);
    };

    match header {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(token) if token.is_empty() => Err(AppError::Unauthorized("Empty bearer token")),
            Some(token) if token == expected => Ok(AuthUser::Token),
            Some(_) => Err(AppError::Unauthorized("Invalid bearer token")),
            None => Err(AppError::Unauthorized(
                "Invalid authorization header format",
            )),
        },
        None => Err(AppError::Unauthorized("Missing authorization header")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_without_configured_token() {
        assert_eq!(authorize(None, None).unwrap(), AuthUser::Anonymous);
        assert_eq!(
            authorize(None, Some("Bearer whatever")).unwrap(),
            AuthUser::Anonymous
        );
    }

    #[test]
    fn test_matching_token_accepted() {
        assert_eq!(
            authorize(Some("s3cret"), Some("Bearer s3cret")).unwrap(),
            AuthUser::Token
        );
    }

    #[test]
    fn test_rejections() {
        for header in [None, Some("Bearer "), Some("Bearer nope"), Some("Basic s3cret")] {
            assert!(matches!(
                authorize(Some("s3cret"), header),
                Err(AppError::Unauthorized(_))
            ));
        }
    }
}
