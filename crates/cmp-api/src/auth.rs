//! Caller identity extraction.
//!
//! Authentication itself happens upstream (gateway middleware); by the time
//! a request reaches this service the verified identity rides in the
//! `X-User-ID` header, with an optional `X-Workspace-ID` scope. A request
//! without a user is rejected with 401 before any SSE state is created.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::errors::ApiError;

pub const USER_HEADER: &str = "x-user-id";
pub const WORKSPACE_HEADER: &str = "x-workspace-id";

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub workspace_id: Option<String>,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthenticated {
                message: "missing user identity".to_string(),
            })?
            .to_string();

        let workspace_id = parts
            .headers
            .get(WORKSPACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);

        Ok(AuthUser {
            user_id,
            workspace_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<AuthUser, ApiError> {
        let (mut parts, _) = request.into_parts();
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_extracts_user_and_workspace() {
        let request = Request::builder()
            .header("X-User-ID", "u1")
            .header("X-Workspace-ID", "ws-1")
            .body(())
            .unwrap();

        let user = extract(request).await.unwrap();
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.workspace_id.as_deref(), Some("ws-1"));
    }

    #[tokio::test]
    async fn test_missing_user_rejected() {
        let request = Request::builder().body(()).unwrap();
        let err = extract(request).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated { .. }));
    }

    #[tokio::test]
    async fn test_blank_user_rejected() {
        let request = Request::builder()
            .header("X-User-ID", "   ")
            .body(())
            .unwrap();
        assert!(extract(request).await.is_err());
    }
}
