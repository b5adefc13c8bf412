//! Profile pictures as `data:` URLs.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::path::{Component, Path};

use crate::error::ApiError;

pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/pjpeg",
    "image/gif",
    "image/webp",
];

/// Detect the image type from the leading bytes.
pub fn detect_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 4 {
        return None;
    }
    match bytes {
        // JPEG: FF D8 FF
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        // PNG: 89 50 4E 47
        [0x89, 0x50, 0x4E, 0x47, ..] => Some("image/png"),
        // GIF: 47 49 46 38
        [0x47, 0x49, 0x46, 0x38, ..] => Some("image/gif"),
        // WebP: 52 49 46 46 ... 57 45 42 50
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50, ..] => Some("image/webp"),
        _ => None,
    }
}

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Decoded `data:` URL: raw bytes and mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAvatar {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Parse and validate a `data:<mime>;base64,<payload>` avatar.
pub fn parse_data_url(value: &str, max_size: usize) -> Result<DecodedAvatar, ApiError> {
    let invalid = || ApiError::validation("Formato immagine non valido.");

    let rest = value.trim().strip_prefix("data:").ok_or_else(invalid)?;
    let (meta, payload) = rest.split_once(',').ok_or_else(invalid)?;
    let mime = meta
        .strip_suffix(";base64")
        .ok_or_else(invalid)?
        .trim()
        .to_ascii_lowercase();

    if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
        return Err(ApiError::validation(
            "Formato immagine non supportato. Usa PNG, JPEG, GIF o WEBP.",
        ));
    }

    let bytes = STANDARD
        .decode(payload.trim().as_bytes())
        .map_err(|_| invalid())?;
    if bytes.is_empty() {
        return Err(invalid());
    }
    if bytes.len() > max_size {
        return Err(too_large(max_size));
    }

    Ok(DecodedAvatar { mime, bytes })
}

pub fn too_large(max_size: usize) -> ApiError {
    ApiError::validation(format!(
        "L'immagine supera la dimensione massima di {} MB.",
        (max_size as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0
    ))
}

/// Relative, traversal-free path below the upload directory.
fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_)))
}

/// Load a legacy file-based avatar (`avatar_url` column) as a data URL.
pub async fn load_legacy(upload_dir: &Path, avatar_url: &str) -> Option<String> {
    let relative = Path::new(avatar_url.trim_start_matches('/'));
    let relative = relative.strip_prefix("uploads").unwrap_or(relative);
    if relative.as_os_str().is_empty() || !is_safe_relative(relative) {
        tracing::warn!(avatar_url, "Ignoring unsafe legacy avatar path");
        return None;
    }

    let path = upload_dir.join(relative);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = detect_image_mime(&bytes).or_else(|| mime_from_extension(&path))?;
            Some(to_data_url(mime, &bytes))
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Legacy avatar not readable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_detect_image_mime() {
        assert_eq!(detect_image_mime(PNG_HEADER), Some("image/png"));
        assert_eq!(detect_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(detect_image_mime(b"GIF89a"), Some("image/gif"));
        assert_eq!(detect_image_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(detect_image_mime(b"%PDF-1.4"), None);
        assert_eq!(detect_image_mime(b"ab"), None);
    }

    #[test]
    fn test_data_url_round_trip() {
        let url = to_data_url("image/png", PNG_HEADER);
        let decoded = parse_data_url(&url, 1024).unwrap();
        assert_eq!(decoded.mime, "image/png");
        assert_eq!(decoded.bytes, PNG_HEADER);
    }

    #[test]
    fn test_parse_data_url_rejections() {
        assert!(parse_data_url("https://example.com/a.png", 1024).is_err());
        assert!(parse_data_url("data:image/svg+xml;base64,PHN2Zz4=", 1024).is_err());
        assert!(parse_data_url("data:image/png;base64,***", 1024).is_err());

        let big = to_data_url("image/png", &[0u8; 64]);
        let err = parse_data_url(&big, 32).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_pjpeg_is_accepted() {
        let url = to_data_url("image/pjpeg", &[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(parse_data_url(&url, 1024).unwrap().mime, "image/pjpeg");
    }

    #[tokio::test]
    async fn test_load_legacy_reads_from_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("avatars")).await.unwrap();
        tokio::fs::write(dir.path().join("avatars/me.png"), PNG_HEADER)
            .await
            .unwrap();

        let url = load_legacy(dir.path(), "/uploads/avatars/me.png").await.unwrap();
        assert!(url.starts_with("data:image/png;base64,"));

        assert!(load_legacy(dir.path(), "../etc/passwd").await.is_none());
        assert!(load_legacy(dir.path(), "avatars/missing.png").await.is_none());
    }
}
