//! Video URL parsing and host whitelist enforcement (spec.md §4.8 C5).

use crate::error::PipelineError;

/// A parsed, supported video URL: host plus the stable video identifier
/// extracted from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVideoUrl {
    pub host: String,
    pub video_id: String,
}

/// Extracts the stable video id from a YouTube-family URL. Unsupported
/// hosts fail with `Unsupported` (modeled here as `Validation`, since the
/// pipeline's error taxonomy has no dedicated variant and the spec treats
/// it as a non-retryable rejection same as any other validation failure).
pub fn parse(url: &str) -> Result<ParsedVideoUrl, PipelineError> {
    let parsed = url::Url::parse(url).map_err(|e| PipelineError::Validation(format!("invalid URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| PipelineError::Validation("URL has no host".to_string()))?
        .to_lowercase();

    let video_id = match host.as_str() {
        "youtube.com" | "www.youtube.com" | "m.youtube.com" => parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.to_string())
            .or_else(|| {
                parsed
                    .path_segments()
                    .and_then(|mut segs| segs.find(|s| !s.is_empty() && *s != "shorts" && *s != "live"))
                    .map(|s| s.to_string())
            }),
        "youtu.be" => parsed
            .path_segments()
            .and_then(|mut segs| segs.next())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        _ => None,
    }
    .ok_or_else(|| PipelineError::Validation(format!("unsupported video host: {host}")))?;

    Ok(ParsedVideoUrl { host, video_id })
}

pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}
