//! HTTP surface of the API process: the OAuth redirect target and a health check.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use doorman_core::VerificationState;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::state_machine::{Engine, Notice};

pub struct ApiState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/oauth_callback", get(oauth_callback))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "doorman",
        "version": crate::get_version(),
    }))
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn oauth_callback(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return bad_request("code is required");
    };
    let Some(raw_state) = params.state.filter(|s| !s.is_empty()) else {
        return bad_request("state is required");
    };
    let verification = match VerificationState::decode(&raw_state) {
        Ok(verification) => verification,
        Err(e) => {
            warn!(error = %e, "Rejecting callback with malformed state");
            return bad_request("state is malformed");
        }
    };

    info!(state = %verification, "Received OAuth callback");

    match state.engine.handle_verification(&verification, code).await {
        Ok(outcome) => match outcome.notice() {
            Some(notice @ Notice::Verified) => (StatusCode::OK, notice.text()).into_response(),
            Some(notice @ Notice::UnexpectedStatus { .. }) => {
                (StatusCode::CONFLICT, notice.text()).into_response()
            }
            Some(notice) => (StatusCode::INTERNAL_SERVER_ERROR, notice.text()).into_response(),
            None => {
                error!(state = %verification, "Verification produced no outcome");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(e) if e.is_not_found() => bad_request("state does not match a pending member"),
        Err(e) => {
            error!(state = %verification, error = %e, "Verification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::repository::{IdentityStore, InMemoryRepository};
    use crate::state_machine::{MemberKey, MemberStatus};
    use crate::testing::{test_services, user, FakeMessenger, FakeProvider};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const GROUP: i64 = -100;

    async fn setup(provider: FakeProvider) -> (Router, Arc<InMemoryRepository>, String) {
        let repo = Arc::new(InMemoryRepository::new());
        let messenger = Arc::new(FakeMessenger::default());
        let engine = Arc::new(Engine::new(test_services(
            repo.clone(),
            messenger,
            Some(provider),
        )));
        engine
            .handle_join(GROUP, &user(42, "Ann"), None)
            .await
            .unwrap();
        let member = repo.get_member(MemberKey::new(GROUP, 42)).await.unwrap();
        let state = VerificationState::new(member.id.to_string(), GROUP).encode();
        (api_router(Arc::new(ApiState { engine })), repo, state)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_successful_callback_activates_member() {
        let (router, repo, state) = setup(FakeProvider::succeeding(1337)).await;

        let (status, body) = get(router, &format!("/oauth_callback?code=abc&state={}", state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Notice::Verified.text());
        let member = repo.get_member(MemberKey::new(GROUP, 42)).await.unwrap();
        assert_eq!(member.status, MemberStatus::Active);
        assert_eq!(member.provider_id, Some(1337));
    }

    #[tokio::test]
    async fn test_repeated_callback_conflicts() {
        let (router, _, state) = setup(FakeProvider::succeeding(1337)).await;
        let uri = format!("/oauth_callback?code=abc&state={}", state);

        let (first, _) = get(router.clone(), &uri).await;
        let (second, body) = get(router, &uri).await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::CONFLICT);
        assert!(body.contains("unexpected status"));
    }

    #[tokio::test]
    async fn test_provider_failure_is_server_error() {
        let (router, repo, state) = setup(FakeProvider::failing("token endpoint down")).await;

        let (status, _) = get(router, &format!("/oauth_callback?code=abc&state={}", state)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let member = repo.get_member(MemberKey::new(GROUP, 42)).await.unwrap();
        assert_eq!(member.status, MemberStatus::JustJoined);
    }

    #[tokio::test]
    async fn test_missing_or_malformed_params_are_bad_requests() {
        let (router, _, state) = setup(FakeProvider::succeeding(1)).await;

        let (status, _) = get(router.clone(), &format!("/oauth_callback?state={}", state)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(router.clone(), "/oauth_callback?code=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(router.clone(), "/oauth_callback?code=abc&state=!!!").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("malformed"));

        let stranger = VerificationState::new(crate::state_machine::MemberId::new().to_string(), GROUP);
        let (status, _) = get(
            router,
            &format!("/oauth_callback?code=abc&state={}", stranger.encode()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (router, _, _) = setup(FakeProvider::succeeding(1)).await;
        let (status, body) = get(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("healthy"));
    }
}
