//! Server URL normalization for the realtime transport.
//!
//! Accepts the forms users paste into settings screens (`https://host`,
//! `host:8000`, `wss://host/v1/realtime/`) and produces the WebSocket URL the
//! transport dials.

use thiserror::Error;
use url::Url;

/// Errors that can occur during URL normalization
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlNormalizeError {
    #[error("Server URL is empty")]
    Empty,

    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL must have a host")]
    MissingHost,
}

/// Rewrite the scheme to `ws`/`wss` and make sure the path ends with `path_suffix`.
///
/// `http` maps to `ws` and `https` to `wss`; a missing scheme defaults to `ws`.
/// Query strings are preserved.
pub fn normalize_server_url(raw: &str, path_suffix: &str) -> Result<Url, UrlNormalizeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UrlNormalizeError::Empty);
    }

    let rewritten = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    };

    let mut url = Url::parse(&rewritten)?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(UrlNormalizeError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(UrlNormalizeError::MissingHost);
    }

    let suffix = path_suffix.trim_end_matches('/');
    if !suffix.is_empty() {
        let path = url.path().trim_end_matches('/').to_string();
        if !path.ends_with(suffix) {
            let suffix = if suffix.starts_with('/') {
                suffix.to_string()
            } else {
                format!("/{suffix}")
            };
            url.set_path(&format!("{path}{suffix}"));
        } else if url.path() != path {
            url.set_path(&path);
        }
    }

    Ok(url)
}
