#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use webui::health::{MODELS_PATH, OPTIONS_PATH, PROGRESS_PATH};

/// Fake WebUI API served from its own tokio runtime on an ephemeral port.
pub struct StubBackend {
    pub base_url: String,
    pub port: u16,
    _runtime: Runtime,
}

impl StubBackend {
    pub fn serve(router: Router) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .expect("bind stub backend");
        let port = listener.local_addr().expect("local addr").port();
        runtime.spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            port,
            _runtime: runtime,
        }
    }

    pub fn ready() -> Self {
        Self::serve(
            Router::new()
                .route(MODELS_PATH, get(models))
                .route(OPTIONS_PATH, get(options))
                .route(PROGRESS_PATH, get(progress)),
        )
    }

    pub fn unavailable() -> Self {
        Self::serve(Router::new().fallback(|| async { StatusCode::SERVICE_UNAVAILABLE }))
    }

    /// Process up, models not loaded: only the progress endpoint answers.
    pub fn loading() -> Self {
        Self::serve(
            Router::new()
                .route(PROGRESS_PATH, get(progress))
                .fallback(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
    }

    /// Answers ready only once `up` is set.
    pub fn gated(up: Arc<AtomicBool>) -> Self {
        Self::serve(Router::new().route(
            MODELS_PATH,
            get(move || {
                let up = Arc::clone(&up);
                async move {
                    if up.load(Ordering::SeqCst) {
                        models().await.into_response()
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    }
                }
            }),
        ))
    }
}

async fn models() -> Json<Value> {
    Json(json!([{ "title": "v1-5-pruned-emaonly.safetensors", "model_name": "v1-5-pruned-emaonly" }]))
}

async fn options() -> Json<Value> {
    Json(json!({ "sd_model_checkpoint": "v1-5-pruned-emaonly.safetensors" }))
}

async fn progress() -> Json<Value> {
    Json(json!({ "progress": 0.0, "eta_relative": 0.0, "state": { "job_count": 0 } }))
}

/// A port nothing is listening on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}
