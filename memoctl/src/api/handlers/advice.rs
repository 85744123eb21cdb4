//! Handler for one-off note advice.

use crate::AppState;
use crate::analysis::{Advice, planner::FALLBACK_MIME_TYPE};
use crate::errors::{Error, Result};
use crate::generative::BinaryPart;
use axum::{
    Json,
    extract::{Multipart, State},
};

/// A note as submitted in the multipart form.
#[derive(Debug, Default)]
struct NoteForm {
    title: String,
    body: String,
    files: Vec<(String, BinaryPart)>,
}

fn multipart_error(e: impl std::fmt::Display) -> Error {
    Error::BadRequest {
        message: format!("Failed to parse multipart data: {e}"),
    }
}

async fn read_note(mut multipart: Multipart) -> Result<NoteForm> {
    let mut form = NoteForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name().unwrap_or("") {
            "title" => form.title = field.text().await.map_err(multipart_error)?,
            "body" => form.body = field.text().await.map_err(multipart_error)?,
            "files" | "files[]" => {
                let name = field.file_name().unwrap_or("attachment").to_string();
                let mime_type = field
                    .content_type()
                    .filter(|ct| *ct != "application/octet-stream")
                    .map(str::to_string)
                    .or_else(|| mime_guess::from_path(&name).first_raw().map(str::to_string))
                    .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string());
                let data = field.bytes().await.map_err(multipart_error)?;
                form.files.push((name, BinaryPart { mime_type, data }));
            }
            other => tracing::debug!(field = other, "Ignoring unknown multipart field"),
        }
    }
    Ok(form)
}

#[utoipa::path(
    post,
    path = "/advice",
    tag = "advice",
    summary = "Advise on a note",
    description = "Summarises a note and its attachments and gives advice about it. Charges one call \
to the key pool. When the model call fails the response still succeeds, with a subject of \
`Analysis failed` and the reason as the advice.",
    request_body(content_type = "multipart/form-data", description = "Fields `title`, `body` and any number of `files`"),
    responses(
        (status = 200, description = "Advice generated", body = Advice),
        (status = 400, description = "Malformed form"),
        (status = 429, description = "Every key is at capacity"),
        (status = 503, description = "No keys are configured"),
        (status = 500, description = "Internal server error")
    )
)]
#[tracing::instrument(skip_all)]
pub async fn advise(State(state): State<AppState>, multipart: Multipart) -> Result<Json<Advice>> {
    let note = read_note(multipart).await?;
    if note.title.trim().is_empty() && note.body.trim().is_empty() && note.files.is_empty() {
        return Err(Error::BadRequest {
            message: "A title, body or file is required".to_string(),
        });
    }
    let advice = state.analyzer.advise(&note.title, &note.body, &note.files).await?;
    Ok(Json(advice))
}
