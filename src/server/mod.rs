//! HTTPサーバ
//!
//! - `GET /` アップロードフォーム
//! - `POST /predict` 分類して結果ページを返す
//! - `GET /uploads/:filename` 保存済みのアップロード
//! - `GET /health` 稼働状態（JSON）

pub mod handlers;
pub mod pages;
pub mod state;
pub mod uploads;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

pub use state::{AppState, PredictionCounter};
pub use uploads::UploadStore;

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/predict", post(handlers::predict))
        .route("/uploads/:filename", get(handlers::uploaded_file))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// `shutdown` が完了するまで待ち受ける
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {}", addr))?
        .serve(router.into_make_service());
    tracing::info!("listening on http://{}", server.local_addr());

    server
        .with_graceful_shutdown(shutdown)
        .await
        .context("failed to run http server")
}
