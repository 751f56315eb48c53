//! Media resolver collaborator.
//!
//! Turns a user query into something a worker can play. Extraction from
//! third-party sites is not done here; [`DirectUrlResolver`] only accepts
//! queries that already are playable `http(s)` URLs.

use crate::errors::CnError;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// A resolved track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackInfo {
    pub playable_url: String,
    pub title: String,
    /// Unknown for live streams and direct URLs.
    pub duration: Option<Duration>,
    pub uploader: Option<String>,
    pub is_live: bool,
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<TrackInfo, CnError>;
}

/// Accepts `http://` and `https://` URLs as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectUrlResolver;

#[async_trait]
impl MediaResolver for DirectUrlResolver {
    async fn resolve(&self, query: &str) -> Result<TrackInfo, CnError> {
        let query = query.trim();
        let rest = query
            .strip_prefix("https://")
            .or_else(|| query.strip_prefix("http://"))
            .ok_or_else(|| CnError::Media("Only http(s) URLs can be played".to_string()))?;

        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() || query.chars().any(char::is_whitespace) {
            return Err(CnError::Media("That does not look like a URL".to_string()));
        }

        let path = path.split(['?', '#']).next().unwrap_or_default();
        let title = path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(host)
            .to_string();

        Ok(TrackInfo {
            playable_url: query.to_string(),
            title,
            duration: None,
            uploader: Some(host.to_string()),
            is_live: false,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_url_title_from_last_segment() {
        let track = DirectUrlResolver
            .resolve("https://cdn.example.com/music/song.ogg?sig=abc")
            .await
            .unwrap();

        assert_eq!(track.playable_url, "https://cdn.example.com/music/song.ogg?sig=abc");
        assert_eq!(track.title, "song.ogg");
        assert_eq!(track.uploader.as_deref(), Some("cdn.example.com"));
        assert!(!track.is_live);
    }

    #[tokio::test]
    async fn test_bare_host_uses_host_as_title() {
        let track = DirectUrlResolver
            .resolve("http://radio.example/")
            .await
            .unwrap();
        assert_eq!(track.title, "radio.example");
    }

    #[tokio::test]
    async fn test_search_terms_rejected() {
        let err = DirectUrlResolver
            .resolve("never gonna give you up")
            .await
            .unwrap_err();
        assert!(matches!(err, CnError::Media(_)));

        assert!(DirectUrlResolver.resolve("ftp://host/file").await.is_err());
        assert!(DirectUrlResolver.resolve("https:///nohost").await.is_err());
    }
}
