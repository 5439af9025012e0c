use crate::{prediction::PredictionError, server::SharedState};
use axum::{
    body::Bytes,
    extract::{
        multipart::{Multipart, MultipartError},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::instrument;

const FILE_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum PredictImageError {
    #[error("Invalid multipart upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Upload contains no file")]
    MissingFile,
    #[error("Prediction failed: {0}")]
    Prediction(#[from] PredictionError),
}

impl IntoResponse for PredictImageError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictImageError::Multipart(e) => e.status(),
            PredictImageError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            PredictImageError::Prediction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!("Prediction request failed: {}", self);
        (status, format!("Something went wrong: {}", self)).into_response()
    }
}

#[derive(Serialize)]
pub struct DigitResponse {
    digit: String,
}

#[instrument(skip(state, multipart))]
pub async fn predict(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Result<Json<DigitResponse>, PredictImageError> {
    let client_ip = addr.ip().to_string();
    let image_data = read_upload(&mut multipart).await?;

    let prediction = state
        .prediction_service
        .handle(&client_ip, image_data)
        .await?;

    Ok(Json(DigitResponse {
        digit: prediction.label,
    }))
}

/// Returns the `file` field, or the first field when none is named `file`.
async fn read_upload(multipart: &mut Multipart) -> Result<Bytes, PredictImageError> {
    let mut first = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?);
        }
        let data = field.bytes().await?;
        if first.is_none() {
            first = Some(data);
        }
    }
    first.ok_or(PredictImageError::MissingFile)
}
