use anyhow::{Context, Result};
use base64::{Engine, prelude::BASE64_STANDARD};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Fetch a link or subscription blob.
///
/// `source` may be `-` (stdin), a `file://` URL, an `http(s)://` URL, a path
/// to an existing file, or the blob itself (typically a single share link).
pub async fn fetch_subscription(source: &str) -> Result<String> {
    if source == "-" {
        let mut content = String::new();
        tokio::io::stdin()
            .read_to_string(&mut content)
            .await
            .context("failed to read subscription from stdin")?;
        return Ok(content);
    }

    if let Some(file_path) = source.strip_prefix("file://") {
        let content = tokio::fs::read_to_string(file_path)
            .await
            .with_context(|| format!("failed to read {}", file_path))?;
        return Ok(content);
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        debug!("Fetching subscription over HTTP: {}", source);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let response = client.get(source).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Failed to fetch subscription: {}", response.status()));
        }

        let content = response.text().await?;
        return Ok(content);
    }

    if Path::new(source).is_file() {
        let content = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read {}", source))?;
        return Ok(content);
    }

    Ok(source.to_string())
}

/// Base64 decoding that also accepts the URL-safe alphabet and missing padding.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut normalized: String = input
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }
    BASE64_STANDARD.decode(normalized)
}

/// Decode to UTF-8 text, `None` if either step fails.
pub fn decode_base64_text(input: &str) -> Option<String> {
    decode_base64(input)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_url_safe_alphabet_without_padding() {
        // "??>" encodes to "Pz8+" in the standard alphabet.
        assert_eq!(decode_base64("Pz8-").unwrap(), b"??>");
        assert_eq!(decode_base64_text("YWVzLTI1Ni1nY206cGFzc3dvcmQ").unwrap(), "aes-256-gcm:password");
    }

    #[test]
    fn rejects_non_base64_text() {
        assert!(decode_base64("ss://not base64").is_err());
    }

    #[tokio::test]
    async fn inline_sources_are_returned_verbatim() {
        let link = "trojan://secret@example.com:443#inline";
        assert_eq!(fetch_subscription(link).await.unwrap(), link);
    }

    #[tokio::test]
    async fn file_urls_are_read_from_disk() {
        let path = std::env::temp_dir().join(format!("nodeprobe-sub-{}.txt", std::process::id()));
        tokio::fs::write(&path, "ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ=@example.com:8388#A\n")
            .await
            .unwrap();
        let content = fetch_subscription(&format!("file://{}", path.display()))
            .await
            .unwrap();
        assert!(content.starts_with("ss://"));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
