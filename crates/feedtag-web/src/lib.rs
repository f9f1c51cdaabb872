//! JSON control surface for the cycle scheduler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use feedtag_sync::{Scheduler, SchedulerState, TriggerOutcome};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "feedtag-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scheduler/status", get(status_handler))
        .route("/scheduler/start", post(start_handler))
        .route("/scheduler/stop", post(stop_handler))
        .route("/scheduler/trigger", post(trigger_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "control api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.get_status().await).into_response()
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.start().await {
        Ok(s) => state_response(s),
        Err(err) => server_error(err),
    }
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.stop().await {
        Ok(s) => state_response(s),
        Err(err) => server_error(err),
    }
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.trigger_refresh().await {
        TriggerOutcome::Completed(report) => {
            Json(json!({ "status": "completed", "report": report })).into_response()
        }
        TriggerOutcome::AlreadyRunning => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running" })),
        )
            .into_response(),
        TriggerOutcome::Failed(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "failed", "error": error })),
        )
            .into_response(),
    }
}

fn state_response(state: SchedulerState) -> Response {
    Json(json!({ "state": state })).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "scheduler control failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use feedtag_adapters::{
        ClassifyError, ClassifyInput, Classifier, IngestError, IngestReport, Ingestor,
        NoopIngestor,
    };
    use feedtag_core::{AutoTaggingConfig, Tag, TagId};
    use feedtag_storage::MemoryStore;
    use feedtag_sync::{BatchRunner, CyclePipeline};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    struct EmptyClassifier;

    #[async_trait]
    impl Classifier for EmptyClassifier {
        async fn classify(
            &self,
            _input: ClassifyInput<'_>,
            _tags: &[Tag],
        ) -> Result<Vec<TagId>, ClassifyError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct GatedIngestor {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Ingestor for GatedIngestor {
        async fn ingest(&self) -> Result<IngestReport, IngestError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(IngestReport::default())
        }
    }

    fn scheduler(ingestor: Arc<dyn Ingestor>) -> Scheduler {
        let runner = BatchRunner::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyClassifier),
            AutoTaggingConfig::default(),
        );
        let pipeline = CyclePipeline::new(ingestor, Arc::new(runner), 20);
        Scheduler::new(Arc::new(pipeline), Duration::from_secs(3600))
    }

    fn request(method: &str, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn status_reports_stopped_scheduler() {
        let app = app(AppState::new(scheduler(Arc::new(NoopIngestor))));
        let resp = app.oneshot(request("GET", "/scheduler/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["state"], "stopped");
        assert_eq!(body["interval_secs"], 3600);
        assert_eq!(body["in_flight"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_stop_toggles_state() {
        let state = AppState::new(scheduler(Arc::new(NoopIngestor)));
        let app = app(state.clone());

        let resp = app.clone().oneshot(request("POST", "/scheduler/start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["state"], "running");
        assert_eq!(state.scheduler.state().await, SchedulerState::Running);

        let resp = app.oneshot(request("POST", "/scheduler/stop")).await.unwrap();
        assert_eq!(json_body(resp).await["state"], "stopped");
        assert_eq!(state.scheduler.state().await, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn trigger_returns_cycle_report() {
        let app = app(AppState::new(scheduler(Arc::new(NoopIngestor))));
        let resp = app.oneshot(request("POST", "/scheduler/trigger")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["report"]["trigger"], "manual");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_trigger_is_a_conflict() {
        let ingestor = Arc::new(GatedIngestor::default());
        let app = app(AppState::new(scheduler(ingestor.clone())));

        let first = tokio::spawn(app.clone().oneshot(request("POST", "/scheduler/trigger")));
        ingestor.entered.notified().await;

        let resp = app.oneshot(request("POST", "/scheduler/trigger")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["status"], "already_running");

        ingestor.release.notify_one();
        let resp = first.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
