use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;

pub fn encode_data_uri(media_type: &str, bytes: &[u8]) -> String {
    format!("data:{media_type};base64,{}", BASE64.encode(bytes))
}

/// Split a base64 data URI into its media type and decoded bytes.
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>)> {
    let Some(rest) = uri.trim().strip_prefix("data:") else {
        bail!("not a data URI");
    };
    let Some((header, payload)) = rest.split_once(',') else {
        bail!("data URI has no payload separator");
    };
    let mut parts = header.split(';');
    let media_type = parts
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("text/plain")
        .to_string();
    if !parts.any(|part| part.trim().eq_ignore_ascii_case("base64")) {
        bail!("data URI is not base64 encoded");
    }
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .context("data URI base64 decode failed")?;
    Ok((media_type, bytes))
}

/// Turn an image reference (data URI, http(s) URL or `file://` URL) into raw bytes.
pub fn materialize(reference: &str, http: &HttpClient) -> Result<Vec<u8>> {
    let trimmed = reference.trim();
    if trimmed.starts_with("data:") {
        let (_, bytes) = decode_data_uri(trimmed)?;
        return Ok(bytes);
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let response = http
            .get(trimmed)
            .send()
            .with_context(|| format!("image download failed ({trimmed})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let bytes = response
            .bytes()
            .context("failed reading downloaded image bytes")?
            .to_vec();
        return Ok(bytes);
    }
    if trimmed.starts_with("file://") {
        let path = reqwest::Url::parse(trimmed)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .with_context(|| format!("invalid file URL ({trimmed})"))?;
        return fs::read(&path).with_context(|| format!("failed to read {}", path.display()));
    }
    bail!("unsupported image reference (expected data URI, http(s) or file URL)")
}

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.trim().to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// Lower-cased extension of a file name, without the dot.
pub fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|value| value.to_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}
