use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::ledger::record_best_effort;
use crate::ml::ClassifyError;
use crate::server::pages::{self, ResultView};
use crate::server::state::AppState;

/// アップロードフォームのフィールド名
pub const FILE_FIELD: &str = "file";

pub async fn index() -> Html<String> {
    Html(pages::upload_form())
}

pub async fn predict(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Html<String>, ApiError> {
    // モデルが無ければ何も保存しない
    let Some(classifier) = state.classifier.clone() else {
        return Err(ApiError::ModelNotLoaded);
    };

    let (original_name, bytes) = read_file_field(&mut multipart).await?;
    let filename = state
        .uploads
        .persist(&original_name, &bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;

    let prediction = tokio::task::spawn_blocking(move || classifier.classify(&bytes))
        .await
        .map_err(|e| ApiError::Internal(format!("inference task failed: {}", e)))?
        .map_err(|e| match e {
            ClassifyError::Decode(e) => ApiError::UnreadableImage(e.to_string()),
            ClassifyError::Inference(message) => ApiError::Internal(message),
        })?;

    let ledger = record_best_effort(state.ledger.as_deref(), &filename, &prediction.label).await;
    let impact_count = state.counter.increment();

    tracing::info!(
        filename = %filename,
        label = %prediction.label,
        class_index = prediction.class_index,
        impact_count,
        "予測を返しました"
    );

    Ok(Html(pages::result_page(&ResultView {
        filename: &filename,
        label: &prediction.label,
        ledger: &ledger,
        impact_count,
    })))
}

/// `file` フィールドの元ファイル名と中身を取り出す
async fn read_file_field(multipart: &mut Multipart) -> Result<(String, Bytes), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("invalid multipart body", e))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error("failed to read upload", e))?;
        return Ok((original_name, bytes));
    }
    Err(ApiError::BadRequest(format!("missing '{}' field", FILE_FIELD)))
}

/// 上限超過は413、それ以外は400
fn multipart_error(context: &str, e: MultipartError) -> ApiError {
    let message = format!("{}: {}", context, e);
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(message)
    } else {
        ApiError::BadRequest(message)
    }
}

pub async fn uploaded_file(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Response {
    let Some(path) = state.uploads.resolve(&filename) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = image::ImageFormat::from_path(&path)
                .map(|format| format.to_mime_type())
                .unwrap_or("application/octet-stream");
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(e) => ApiError::Internal(format!("failed to read upload {}: {}", path.display(), e)).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model_loaded: bool,
    pub ledger_enabled: bool,
    pub predictions_served: u64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let model_loaded = state.classifier.is_some();
    Json(HealthReport {
        status: if model_loaded { "ok" } else { "degraded" },
        model_loaded,
        ledger_enabled: state.ledger.is_some(),
        predictions_served: state.counter.served(),
    })
}
