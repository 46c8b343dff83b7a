use crate::pipeline::batch::{self, new_job_id, spawn_batch, BatchJob};
use crate::run_context::{collect_inputs, list_history, History};
use crate::web::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub preview: bool,
}

type ApiError = (StatusCode, String);

pub async fn get_history(State(state): State<Arc<AppState>>) -> Result<Json<History>, ApiError> {
    list_history(&state.output_dir)
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(config) = state.ensemble.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "no detector model configured".to_string(),
        ));
    };

    let inputs = collect_inputs(&payload.paths);
    if inputs.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "no supported images or videos in request".to_string(),
        ));
    }

    let job = BatchJob {
        job_id: new_job_id(),
        inputs,
        output_dir: state.output_dir.clone(),
        settings: config.settings.clone(),
        mode: config.mode.as_str().to_string(),
        preview: payload.preview,
    };

    let (progress, _handle) = spawn_batch(
        job,
        move || config.build(),
        |done, name: &str| tracing::debug!("Job progress: {} ({})", done, name),
        |report| {
            tracing::info!(
                "Job finished with {} outputs, {} failures",
                report.outputs.len(),
                report.failures.len()
            )
        },
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;

    Ok(Json(progress.to_progress_json()))
}

pub async fn get_job(Path(job_id): Path<String>) -> Result<Json<serde_json::Value>, StatusCode> {
    batch::get_job(&job_id)
        .map(|state| Json(state.to_progress_json()))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn cancel_job(
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !batch::cancel_job(&job_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    get_job(Path(job_id)).await
}

/// Progress document every 500ms until the job completes.
pub async fn job_events(
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let state = batch::get_job(&job_id).ok_or(StatusCode::NOT_FOUND)?;

    let stream = async_stream::stream! {
        let mut ticks = IntervalStream::new(tokio::time::interval(Duration::from_millis(500)));
        while ticks.next().await.is_some() {
            let done = state.is_complete.load(Ordering::Relaxed);
            yield Ok(Event::default().data(state.to_progress_json().to_string()));
            if done {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::server::router;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(output_dir: &std::path::Path, with_models: bool) -> axum::Router {
        let ensemble = with_models.then(|| crate::pipeline::ensemble::EnsembleConfig {
            yolo_model: "yolo.onnx".to_string(),
            rtdetr_model: None,
            mode: crate::pipeline::ensemble::DetectorMode::Single,
            settings: Default::default(),
        });
        router(Arc::new(AppState {
            output_dir: output_dir.to_path_buf(),
            ensemble,
        }))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_history_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("street_result.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("clip_result.avi"), b"x").unwrap();

        let response = app(dir.path(), false)
            .oneshot(Request::builder().uri("/api/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["images"][0]["name"], "street_result.jpg");
        assert_eq!(json["videos"][0]["kind"], "video");
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let dir = tempfile::tempdir().unwrap();
        for uri in ["/api/jobs/nope", "/api/jobs/nope/events"] {
            let response = app(dir.path(), false)
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        let response = app(dir.path(), false)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs/nope/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_job_requests_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let post = |body: &str| {
            Request::builder()
                .method("POST")
                .uri("/api/jobs")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = app(dir.path(), false)
            .oneshot(post(r#"{"paths": ["a.jpg"]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app(dir.path(), true)
            .oneshot(post(r#"{"paths": ["notes.txt"]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_registered_job() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = new_job_id();
        let (state, handle) = spawn_batch(
            BatchJob {
                job_id: job_id.clone(),
                inputs: Default::default(),
                output_dir: dir.path().to_path_buf(),
                settings: Default::default(),
                mode: "single".to_string(),
                preview: false,
            },
            || {
                Ok(crate::pipeline::ensemble::Ensemble::new(Box::new(
                    crate::pipeline::fusion::Passthrough,
                )))
            },
            |_, _: &str| {},
            |_| {},
        )
        .unwrap();
        handle.join().unwrap();
        assert!(state.is_complete.load(Ordering::Relaxed));

        let response = app(dir.path(), false)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/jobs/{}/cancel", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["job_id"], job_id.as_str());
        assert_eq!(json["is_active"], false);
        assert_eq!(json["is_complete"], true);
    }
}
