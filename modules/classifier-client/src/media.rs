// Media download and validation.
//
// Downloads land in a named temp file inside the configured temp directory.
// The file is deleted when `DownloadedMedia` drops, so every return path
// cleans up. Files that outlive a crashed process are swept by the
// moderation pipeline's temp cleanup, which matches on `TEMP_PREFIX`.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ClassifierError, Result};

/// File name prefix of every temp file this crate creates.
pub const TEMP_PREFIX: &str = "vigil-media-";

/// Bytes read from the head of a file for magic-byte sniffing.
const SNIFF_LEN: usize = 8192;

pub(crate) struct DownloadedMedia {
    file: NamedTempFile,
    pub declared_type: Option<String>,
}

impl DownloadedMedia {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Stream `url` into a temp file in `dir`.
///
/// Transport failures and non-2xx responses are `ClassifierError::Download`;
/// a body larger than `max_bytes` is `InvalidMedia`.
pub(crate) async fn download(
    client: &reqwest::Client,
    url: &str,
    dir: &Path,
    max_bytes: u64,
    timeout: Duration,
) -> Result<DownloadedMedia> {
    tokio::fs::create_dir_all(dir).await?;

    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ClassifierError::Download(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(ClassifierError::Download(format!(
            "HTTP {} fetching {url}",
            status.as_u16()
        )));
    }

    if let Some(len) = resp.content_length() {
        if len > max_bytes {
            return Err(ClassifierError::InvalidMedia(format!(
                "{len} bytes exceeds limit of {max_bytes}"
            )));
        }
    }

    let declared_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .or_else(|| guess_from_path(url));

    let file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)?;
    let mut out = tokio::fs::File::from_std(file.reopen()?);

    let mut written: u64 = 0;
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ClassifierError::Download(e.to_string()))?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(ClassifierError::InvalidMedia(format!(
                "body exceeds limit of {max_bytes} bytes"
            )));
        }
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    tracing::debug!(url, bytes = written, path = %file.path().display(), "Downloaded media");

    Ok(DownloadedMedia {
        file,
        declared_type,
    })
}

/// Media type implied by a URL or path extension.
pub(crate) fn guess_from_path(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
}

/// Check the file is non-empty media whose magic bytes agree with the declared
/// type. Returns the sniffed media type.
pub(crate) async fn validate(path: &Path, declared: Option<&str>) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Err(ClassifierError::InvalidMedia("empty file".to_string()));
    }

    let mut head = vec![0u8; SNIFF_LEN.min(len as usize)];
    file.read_exact(&mut head).await?;

    let sniffed = infer::get(&head)
        .map(|t| t.mime_type().to_string())
        .ok_or_else(|| ClassifierError::InvalidMedia("unrecognized file format".to_string()))?;

    let sniffed_class = media_class(&sniffed)
        .ok_or_else(|| ClassifierError::InvalidMedia(format!("{sniffed} is not image or video")))?;

    if let Some(declared) = declared.filter(|d| !is_generic(d)) {
        if media_class(declared) != Some(sniffed_class) {
            return Err(ClassifierError::InvalidMedia(format!(
                "declared {declared} but content is {sniffed}"
            )));
        }
    }

    Ok(sniffed)
}

fn media_class(mime: &str) -> Option<&'static str> {
    if mime.starts_with("image/") {
        Some("image")
    } else if mime.starts_with("video/") {
        Some("video")
    } else {
        None
    }
}

fn is_generic(mime: &str) -> bool {
    matches!(mime, "application/octet-stream" | "binary/octet-stream")
}
