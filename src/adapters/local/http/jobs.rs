use crate::application::orchestrator::OrchestratorHandle;
use crate::domain::jobs::{JobId, StartJobRequest};
use axum::{
    extract::State,
    http::{header, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
struct JobsApi {
    orchestrator: OrchestratorHandle,
    next_id: Arc<AtomicI64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJob {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobAccepted {
    pub job_id: JobId,
}

/// `POST /api/job` and `GET /health`. Job ids start at 1.
pub fn router(orchestrator: OrchestratorHandle) -> Router {
    let api = JobsApi {
        orchestrator,
        next_id: Arc::new(AtomicI64::new(1)),
    };

    Router::new()
        .route("/api/job", post(submit_job))
        .route("/health", get(health))
        .with_state(api)
}

async fn submit_job(
    State(api): State<JobsApi>,
    Json(body): Json<SubmitJob>,
) -> Result<(StatusCode, [(header::HeaderName, String); 1], Json<JobAccepted>), (StatusCode, String)>
{
    let url = body.url.trim();
    if url.is_empty() {
        return Err((StatusCode::BAD_REQUEST, String::from("url must not be empty")));
    }

    let job_id = JobId(api.next_id.fetch_add(1, Ordering::SeqCst));
    let accepted = api.orchestrator.start_job(StartJobRequest {
        job_id,
        url: url.to_string(),
    });
    if !accepted {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            String::from("orchestrator is not running"),
        ));
    }

    tracing::info!(%job_id, %url, "job accepted");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/job/{job_id}"))],
        Json(JobAccepted { job_id }),
    ))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dead_letters::DeadLetters;
    use crate::application::mailbox::mailbox;
    use crate::application::orchestrator::OrchestratorMessage;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn post_job(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/job")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_assigns_increasing_ids() {
        let (recipient, mut inbox) = mailbox::<OrchestratorMessage>("orchestrator", DeadLetters::new());
        let app = router(OrchestratorHandle::detached(recipient));

        for expected in 1..=2 {
            let response = app
                .clone()
                .oneshot(post_job(r#"{"url":"http://x/video.mp4"}"#))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::CREATED);
            assert_eq!(
                response.headers()[header::LOCATION],
                format!("/job/{expected}").as_str()
            );
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let accepted: JobAccepted = serde_json::from_slice(&body).unwrap();
            assert_eq!(accepted.job_id, JobId(expected));

            match inbox.recv().await {
                Some(OrchestratorMessage::NewJob(request)) => {
                    assert_eq!(request.job_id, JobId(expected));
                    assert_eq!(request.url, "http://x/video.mp4");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_url_is_rejected() {
        let (recipient, mut inbox) = mailbox::<OrchestratorMessage>("orchestrator", DeadLetters::new());
        let app = router(OrchestratorHandle::detached(recipient));

        let response = app.oneshot(post_job(r#"{"url":"  "}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stopped_orchestrator_is_unavailable() {
        let (recipient, inbox) = mailbox::<OrchestratorMessage>("orchestrator", DeadLetters::new());
        drop(inbox);
        let app = router(OrchestratorHandle::detached(recipient));

        let response = app
            .oneshot(post_job(r#"{"url":"http://x/v.mp4"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health() {
        let (recipient, _inbox) = mailbox::<OrchestratorMessage>("orchestrator", DeadLetters::new());
        let app = router(OrchestratorHandle::detached(recipient));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
