//! Multipart upload intake.
//!
//! The master is never buffered whole: the `file` part is pumped chunk by chunk into the
//! storage writer while the coordinator stores it, so memory use stays flat regardless of the
//! upload size. Form fields must therefore precede the `file` part.

use axum::extract::multipart::{Field, Multipart, MultipartError};
use bytes::Bytes;
use mise_core::models::{BitrateLadder, BitrateRung, RecipeVideo};
use mise_core::AppError;
use mise_services::{IngestCoordinator, MasterUpload};
use mise_storage::ByteReader;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use uuid::Uuid;

/// Chunks in flight between the request body and the storage writer.
const PIPE_DEPTH: usize = 8;

#[derive(Default)]
struct UploadFields {
    recipe_id: Option<Uuid>,
    ordinal: Option<i32>,
    ladder: Option<BitrateLadder>,
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == axum::http::StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::InvalidInput(format!("Failed to read multipart: {}", e.body_text()))
    }
}

fn parse_ladder(text: &str) -> Result<BitrateLadder, AppError> {
    let rungs: Vec<BitrateRung> = serde_json::from_str(text)
        .map_err(|e| AppError::InvalidInput(format!("Invalid ladder JSON: {}", e)))?;
    BitrateLadder::new(rungs).map_err(|e| AppError::InvalidInput(e.to_string()))
}

/// Read `recipe_id`, `ordinal`, optional `ladder` and then stream `file` into `ingest`.
pub async fn submit_multipart(
    ingest: &IngestCoordinator,
    mut multipart: Multipart,
    max_bytes: u64,
) -> Result<RecipeVideo, AppError> {
    let mut fields = UploadFields::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "recipe_id" => {
                let text = field.text().await.map_err(multipart_error)?;
                fields.recipe_id = Some(text.trim().parse().map_err(|_| {
                    AppError::InvalidInput("recipe_id must be a UUID".to_string())
                })?);
            }
            "ordinal" => {
                let text = field.text().await.map_err(multipart_error)?;
                fields.ordinal = Some(text.trim().parse().map_err(|_| {
                    AppError::InvalidInput("ordinal must be an integer".to_string())
                })?);
            }
            "ladder" => {
                let text = field.text().await.map_err(multipart_error)?;
                fields.ladder = Some(parse_ladder(&text)?);
            }
            "file" => return stream_master(ingest, fields, field, max_bytes).await,
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    Err(AppError::InvalidInput("No file provided".to_string()))
}

async fn stream_master(
    ingest: &IngestCoordinator,
    fields: UploadFields,
    field: Field<'_>,
    max_bytes: u64,
) -> Result<RecipeVideo, AppError> {
    let recipe_id = fields.recipe_id.ok_or_else(|| {
        AppError::InvalidInput("recipe_id must be sent before file".to_string())
    })?;
    let ordinal = fields
        .ordinal
        .ok_or_else(|| AppError::InvalidInput("ordinal must be sent before file".to_string()))?;
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(PIPE_DEPTH);
    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let body: ByteReader = Box::pin(StreamReader::new(Box::pin(chunks)));

    let upload = MasterUpload {
        recipe_id,
        ordinal,
        ladder: fields.ladder,
        content_type,
        body,
    };
    let (pumped, submitted) = tokio::join!(pump(field, tx, max_bytes), ingest.submit(upload));
    // A body error also fails the storage write; report the body error, it is the cause.
    pumped?;
    submitted
}

/// Forward the part's chunks to `tx`, failing the reader when the part exceeds `max_bytes`.
/// Returns early without error if the reader went away (the submission failed first).
async fn pump(
    mut field: Field<'_>,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    max_bytes: u64,
) -> Result<u64, AppError> {
    let mut total: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(total),
            Err(e) => {
                let _ = tx
                    .send(Err(std::io::Error::other("upload body interrupted")))
                    .await;
                return Err(multipart_error(e));
            }
        };
        total += chunk.len() as u64;
        if total > max_bytes {
            let _ = tx
                .send(Err(std::io::Error::other("upload exceeds size limit")))
                .await;
            return Err(AppError::PayloadTooLarge(format!(
                "Upload exceeds the maximum of {} bytes",
                max_bytes
            )));
        }
        if tx.send(Ok(chunk)).await.is_err() {
            return Ok(total);
        }
    }
}
