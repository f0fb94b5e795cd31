//! Video-platform client: view-count probing and clip creation (spec.md
//! §4.8 C5).

pub mod client;
pub mod url;

use async_trait::async_trait;

use crate::error::PipelineResult;

/// §4.8: both operations are idempotent from the caller's point of view —
/// probing never mutates state, and creating a clip against the same
/// `(url, account)` pair is expected to be safe to retry by the caller's
/// retry policy (the video platform itself dedupes on its side).
#[async_trait]
pub trait VideoClient: Send + Sync {
    async fn probe_view_count(&self, url: &str) -> PipelineResult<u64>;

    async fn create_clip(&self, url: &str, account_credential_ref: &str) -> PipelineResult<String>;
}
