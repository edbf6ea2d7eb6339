//! Content fetching from the remote source
//!
//! A [`ContentSource`] turns an object ID into a stream of bounded chunks.
//! Transport failures surface as [`StageError::FetchFailed`](crate::error::StageError);
//! a normal end of stream simply ends the chunk sequence.

pub mod chunker;
pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::ObjectId;

pub use chunker::fixed_chunks;
pub use http::HttpFetcher;

/// Stream of payload chunks, in source order
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// An opened fetch: the advertised size, if any, and the body
pub struct FetchedContent {
    /// Length announced by the source before streaming
    pub content_length: Option<u64>,
    pub chunks: ChunkStream,
}

impl std::fmt::Debug for FetchedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedContent")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Trait for remote sources the pipeline can stream from
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Open a stream of chunks for `id`.
    async fn fetch(&self, id: &ObjectId) -> Result<FetchedContent>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}
