use axum::{extract::Multipart, Json};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::config,
    db,
    error::ApiError,
    ingest::{self, IngestStats},
};

const ALLOWED_EXTENSIONS: &[&str] = &["xls", "xlsx"];

const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub stats: IngestStats,
}

/// Spreadsheet container detected from the leading bytes.
fn detect_spreadsheet(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        // XLSX: zip local file header
        [0x50, 0x4B, 0x03, 0x04, ..] => Some("xlsx"),
        // XLS: OLE2 compound document
        [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, ..] => Some("xls"),
        _ => None,
    }
}

fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// POST /api/upload - import a spreadsheet export
pub async fn upload_spreadsheet(mut multipart: Multipart) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::error!("Multipart error: {}", e);
        ApiError::validation("Caricamento non valido.")
    })? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|e| {
            tracing::error!("Failed to read upload bytes: {}", e);
            ApiError::validation("Impossibile leggere il file caricato.")
        })?;
        upload = Some((original_name, bytes));
        break;
    }

    let Some((original_name, bytes)) = upload else {
        return Err(ApiError::validation("Nessun file caricato."));
    };
    if bytes.is_empty() {
        return Err(ApiError::validation("Il file caricato è vuoto."));
    }
    let ext = extension_of(&original_name)
        .ok_or_else(|| ApiError::validation("Formato non supportato. Carica un file .xls o .xlsx."))?;
    if detect_spreadsheet(&bytes).is_none() {
        return Err(ApiError::validation(
            "Il contenuto del file non corrisponde a un foglio di calcolo.",
        ));
    }

    let pool = db::pool()?;

    let upload_dir = config().upload_dir.clone();
    tokio::fs::create_dir_all(&upload_dir).await.map_err(|e| {
        tracing::error!("Failed to create upload directory: {}", e);
        ApiError::Internal("upload directory unavailable".to_string())
    })?;

    // Calamine picks the reader from the extension.
    let file_path = upload_dir.join(format!("{}.{}", Uuid::new_v4(), ext));
    tokio::fs::write(&file_path, &bytes).await.map_err(|e| {
        tracing::error!("Failed to write upload file: {}", e);
        ApiError::Internal("failed to store upload".to_string())
    })?;

    tracing::info!(
        original = %original_name,
        size = bytes.len(),
        "Spreadsheet uploaded"
    );

    let stats = ingest::ingest_file(&pool, &file_path).await?;

    Ok(Json(UploadResponse {
        message: "File caricato e dati importati correttamente.".to_string(),
        stats,
    }))
}
