use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::handlers::{get_task, healthz, readyz};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/task", get(get_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::tests::{harness, ScriptedHeights, TestObfuscator};
    use crate::rotation::TickOutcome;
    use crate::store::tests::seeded;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn task_endpoint_follows_rotation() {
        let h = harness(
            seeded(&["A"]).await,
            ScriptedHeights::heights(&[7]),
            TestObfuscator::gated(),
        );
        let router = build_router(AppState {
            publisher: h.publisher.clone(),
            rotation: h.state.clone(),
        });

        let (status, body) = get(&router, "/task?validator_id=v1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "no_task");

        let tick = tokio::spawn({
            let poller = h.poller.clone();
            async move { poller.tick().await }
        });
        h.obfuscator.wait_until_entered().await;

        let (status, _) = get(&router, "/task?validator_id=").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = get(&router, "/task").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = get(&router, "/task?validator_id=v1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "refreshing");
        let (status, _) = get(&router, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        h.obfuscator.release();
        assert!(matches!(
            tick.await.unwrap(),
            TickOutcome::Refreshed { height: 7, .. }
        ));

        let (status, body) = get(&router, "/task?validator_id=v1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["problem_statement"], "PROBLEM A");
        assert_eq!(body["repo"], "octo/widgets");
        assert_eq!(body["repo_download_url"], "https://github.com/octo/widgets.git");
        assert_eq!(body["base_commit"], "rev-A");
        let (status, _) = get(&router, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get(&router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }
}
