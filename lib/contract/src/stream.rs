//! The chunked byte streamer contract.
//!
//! A stream is a named, ordered byte channel with one logical writer
//! frontier and any number of readers. Writers append chunks and finally an
//! EOF marker; readers get a lazy sequence that replays history and then
//! follows the stream in real time until EOF.

use crate::run::WorkflowRun;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use worldkit_core::{ChunkId, RunId, WorldError};

/// A single append unit of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Chunk id (`chnk_` prefixed); strictly increasing within a stream.
    pub chunk_id: ChunkId,
    /// Stream the chunk belongs to.
    pub stream_name: String,
    /// Run the bytes originate from.
    pub run_id: RunId,
    /// Byte payload; empty for the EOF marker.
    pub payload: Vec<u8>,
    /// True for the terminal chunk; at most one per stream.
    pub eof: bool,
    /// When the chunk was appended.
    pub created_at: DateTime<Utc>,
}

/// Bytes accepted by the writer: text is encoded as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPayload {
    Text(String),
    Bytes(Vec<u8>),
}

impl StreamPayload {
    /// Returns the payload as raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for StreamPayload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for StreamPayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for StreamPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for StreamPayload {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

/// A run id that may still be in flight.
///
/// The writer awaits resolution before appending, which guarantees the
/// stream's first chunk never precedes the run's creation. Callers holding
/// a plain id pass it directly; callers racing run creation pass the
/// pending future.
#[derive(Clone)]
pub enum RunIdHandle {
    /// Already resolved.
    Ready(RunId),
    /// Resolves once the run exists.
    Deferred(Shared<BoxFuture<'static, RunId>>),
}

impl RunIdHandle {
    /// Wraps a future that yields the run id once the run exists.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = RunId> + Send + 'static,
    {
        Self::Deferred(future.boxed().shared())
    }

    /// Waits for the run id.
    pub async fn resolve(&self) -> RunId {
        match self {
            Self::Ready(run_id) => *run_id,
            Self::Deferred(future) => future.clone().await,
        }
    }
}

impl From<RunId> for RunIdHandle {
    fn from(run_id: RunId) -> Self {
        Self::Ready(run_id)
    }
}

impl From<&WorkflowRun> for RunIdHandle {
    fn from(run: &WorkflowRun) -> Self {
        Self::Ready(run.run_id)
    }
}

impl fmt::Debug for RunIdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(run_id) => f.debug_tuple("Ready").field(run_id).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// The lazy chunk sequence handed to readers. Dropping it cancels the read
/// and releases all reader-side resources.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, WorldError>>;

/// Options for [`Streamer::read_from_stream`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStreamOptions {
    /// Number of leading data chunks to skip (offset-based resume).
    pub start_index: Option<usize>,
}

/// Chunked byte transport between writers and readers.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Appends a chunk to the named stream, awaiting `run_id` resolution
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the stream is already closed.
    async fn write_to_stream(
        &self,
        name: &str,
        run_id: RunIdHandle,
        payload: StreamPayload,
    ) -> Result<(), WorldError>;

    /// Appends the terminal EOF chunk.
    async fn close_stream(&self, name: &str, run_id: RunIdHandle) -> Result<(), WorldError>;

    /// Opens a reader over the named stream: history first, then live
    /// chunks, closed by EOF.
    async fn read_from_stream(
        &self,
        name: &str,
        options: ReadStreamOptions,
    ) -> Result<ByteStream, WorldError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_encodes_utf8() {
        let payload: StreamPayload = "héllo".into();
        assert_eq!(payload.into_bytes(), "héllo".as_bytes());
    }

    #[test]
    fn byte_payload_passes_through() {
        let payload: StreamPayload = vec![0u8, 159, 146, 150].into();
        assert_eq!(payload.into_bytes(), vec![0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn ready_handle_resolves_immediately() {
        let ids = worldkit_core::IdGenerator::new();
        let run_id = ids.run_id();
        let handle = RunIdHandle::from(run_id);
        assert_eq!(handle.resolve().await, run_id);
    }

    #[tokio::test]
    async fn deferred_handle_waits_for_resolution() {
        let ids = worldkit_core::IdGenerator::new();
        let run_id = ids.run_id();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = RunIdHandle::deferred(async move { rx.await.expect("sender kept") });

        // The handle is cloneable and every clone observes the same value.
        let clone = handle.clone();
        tx.send(run_id).expect("receiver alive");
        assert_eq!(handle.resolve().await, run_id);
        assert_eq!(clone.resolve().await, run_id);
    }
}
