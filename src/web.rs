use crate::{
    app::{AppContext, AppError, IndexStatus},
    similarity::Neighbor,
    storage::CorpusError,
};
use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt::Debug, sync::Arc};
use tokio::signal;

/// Response header set when the placeholder stands in for a missing image
pub const PLACEHOLDER_HEADER: &str = "x-placeholder";

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
struct SharedState {
    app: Arc<AppContext>,
}

pub fn router(app: Arc<AppContext>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/search", post(search))
        .route("/api/images/*name", get(image))
        .route("/api/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(app: AppContext, listen_addr: &str) -> anyhow::Result<()> {
    let app = router(Arc::new(app));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    log::info!("listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

pub fn start_daemon(app: AppContext, listen_addr: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(app, listen_addr).await })
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = if self.0.is_bad_input() {
            log::warn!("{self:?}");
            StatusCode::BAD_REQUEST
        } else if matches!(self.0, AppError::Corpus(CorpusError::NotFound(_))) {
            StatusCode::NOT_FOUND
        } else {
            log::error!("{self:?}");
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"error": self.0.to_string()}).to_string(),
        )
            .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Deserialize, Serialize)]
pub struct SearchRequest {
    /// Query image, base64 encoded
    pub image_b64: String,

    /// Number of results, defaults to `default_k` and is capped at `max_k`
    pub k: Option<usize>,
}

impl Debug for SearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SearchRequest {{ image_b64: [REDACTED {} chars], k: {:?} }}",
            self.image_b64.len(),
            self.k
        )
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<Neighbor>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let app = state.app.clone();

    tokio::task::block_in_place(move || -> Result<Json<SearchResponse>, HttpError> {
        let image = STANDARD.decode(payload.image_b64.trim())?;
        let results = app.search(&image, payload.k)?;
        Ok(SearchResponse { results }.into())
    })
}

async fn image(
    State(state): State<Arc<SharedState>>,
    Path(name): Path<String>,
) -> Result<Response, HttpError> {
    let app = state.app.clone();

    let image = tokio::task::block_in_place(move || app.display_image(&name))?;

    let mut response = (
        [(header::CONTENT_TYPE, image.content_type)],
        image.bytes,
    )
        .into_response();
    if image.is_placeholder {
        response
            .headers_mut()
            .insert(PLACEHOLDER_HEADER, HeaderValue::from_static("true"));
    }
    Ok(response)
}

async fn status(State(state): State<Arc<SharedState>>) -> Result<Json<IndexStatus>, HttpError> {
    Ok(state.app.status()?.into())
}
