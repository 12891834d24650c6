//! In-memory chunked byte streamer.
//!
//! Appends go into a per-stream chunk vector and fan out over a broadcast
//! channel. Readers subscribe *before* replaying history so appends racing
//! the replay are buffered, then follow notifications with an
//! already-delivered guard; a refcounted per-stream mutex serializes the
//! notified-read-emit critical section.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use worldkit_contract::{
    ByteStream, ReadStreamOptions, RunIdHandle, StreamChunk, StreamPayload, Streamer,
};
use worldkit_core::{ChunkId, IdGenerator, WorldError};

/// Buffered notifications per stream before a lagging reader falls back to
/// a catch-up read.
const NOTIFY_BUFFER: usize = 256;

/// Chunks buffered towards one reader before the writer side backpressures.
const READER_BUFFER: usize = 32;

struct StreamState {
    chunks: Vec<StreamChunk>,
    closed: bool,
    notify: broadcast::Sender<ChunkId>,
}

impl StreamState {
    fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_BUFFER);
        Self {
            chunks: Vec::new(),
            closed: false,
            notify,
        }
    }
}

/// Refcounted per-stream reader locks. Entries disappear when the last
/// reader of a stream finishes, so the map does not grow unboundedly.
#[derive(Clone, Default)]
struct ReaderRegistry {
    entries: Arc<StdMutex<HashMap<String, ReaderEntry>>>,
}

struct ReaderEntry {
    lock: Arc<AsyncMutex<()>>,
    readers: usize,
}

impl ReaderRegistry {
    fn acquire(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(name.to_string()).or_insert_with(|| ReaderEntry {
            lock: Arc::new(AsyncMutex::new(())),
            readers: 0,
        });
        entry.readers += 1;
        Arc::clone(&entry.lock)
    }

    fn release(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(name) {
            entry.readers -= 1;
            if entry.readers == 0 {
                entries.remove(name);
            }
        }
    }

    #[cfg(test)]
    fn active_readers(&self, name: &str) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map_or(0, |entry| entry.readers)
    }
}

/// Byte streamer backed by process memory.
#[derive(Clone)]
pub struct MemoryStreamer {
    ids: Arc<IdGenerator>,
    streams: Arc<RwLock<HashMap<String, StreamState>>>,
    readers: ReaderRegistry,
}

impl MemoryStreamer {
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        Self {
            ids,
            streams: Arc::new(RwLock::new(HashMap::new())),
            readers: ReaderRegistry::default(),
        }
    }

    async fn append(
        &self,
        name: &str,
        run_id: RunIdHandle,
        payload: Vec<u8>,
        eof: bool,
    ) -> Result<(), WorldError> {
        // Awaiting resolution orders the append after the run's creation.
        let run_id = run_id.resolve().await;

        let mut streams = self.streams.write().await;
        let state = streams
            .entry(name.to_string())
            .or_insert_with(StreamState::new);
        if state.closed {
            return Err(WorldError::invalid_state(format!(
                "stream '{name}' is already closed"
            )));
        }

        let chunk = StreamChunk {
            chunk_id: self.ids.chunk_id(),
            stream_name: name.to_string(),
            run_id,
            payload,
            eof,
            created_at: Utc::now(),
        };
        let chunk_id = chunk.chunk_id;
        state.chunks.push(chunk);
        if eof {
            state.closed = true;
        }
        // Fire-and-forget: readers that lag catch up from the chunk vector.
        let _ = state.notify.send(chunk_id);
        Ok(())
    }
}

#[async_trait]
impl Streamer for MemoryStreamer {
    async fn write_to_stream(
        &self,
        name: &str,
        run_id: RunIdHandle,
        payload: StreamPayload,
    ) -> Result<(), WorldError> {
        self.append(name, run_id, payload.into_bytes(), false).await
    }

    async fn close_stream(&self, name: &str, run_id: RunIdHandle) -> Result<(), WorldError> {
        self.append(name, run_id, Vec::new(), true).await
    }

    async fn read_from_stream(
        &self,
        name: &str,
        options: ReadStreamOptions,
    ) -> Result<ByteStream, WorldError> {
        // Subscribe before snapshotting history, so appends racing this call
        // are buffered in the notification channel and the guard below
        // deduplicates the overlap.
        let (notifications, historical) = {
            let mut streams = self.streams.write().await;
            let state = streams
                .entry(name.to_string())
                .or_insert_with(StreamState::new);
            (state.notify.subscribe(), state.chunks.clone())
        };

        let (tx, rx) = mpsc::channel(READER_BUFFER);
        let reader = StreamReader {
            stream_name: name.to_string(),
            streams: Arc::clone(&self.streams),
            registry: self.readers.clone(),
            lock: self.readers.acquire(name),
            tx,
            remaining_skip: options.start_index.unwrap_or(0),
            last_delivered: None,
        };
        tokio::spawn(reader.run(historical, notifications));
        Ok(ReceiverStream::new(rx).boxed())
    }
}

enum Delivered {
    Continue,
    Eof,
    Cancelled,
}

struct StreamReader {
    stream_name: String,
    streams: Arc<RwLock<HashMap<String, StreamState>>>,
    registry: ReaderRegistry,
    lock: Arc<AsyncMutex<()>>,
    tx: mpsc::Sender<Result<Vec<u8>, WorldError>>,
    remaining_skip: usize,
    last_delivered: Option<ChunkId>,
}

impl StreamReader {
    async fn run(mut self, historical: Vec<StreamChunk>, mut notifications: broadcast::Receiver<ChunkId>) {
        for chunk in &historical {
            match self.deliver(chunk).await {
                Delivered::Continue => {}
                Delivered::Eof | Delivered::Cancelled => {
                    self.finish();
                    return;
                }
            }
        }

        loop {
            let received = tokio::select! {
                () = self.tx.closed() => None,
                result = notifications.recv() => Some(result),
            };
            let Some(result) = received else {
                break;
            };

            let done = match result {
                Ok(chunk_id) => self.deliver_notified(chunk_id).await,
                // The channel overflowed; re-read everything past the last
                // delivered chunk instead of dropping notifications.
                Err(broadcast::error::RecvError::Lagged(_)) => self.catch_up().await,
                Err(broadcast::error::RecvError::Closed) => true,
            };
            if done {
                break;
            }
        }
        self.finish();
    }

    /// Handles one notification: read the chunk, then emit. The per-stream
    /// lock keeps concurrent notifications from interleaving mid-emit, since
    /// the chunk read is not atomic with the delivery.
    async fn deliver_notified(&mut self, chunk_id: ChunkId) -> bool {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        let chunk = {
            let streams = self.streams.read().await;
            streams.get(&self.stream_name).and_then(|state| {
                state
                    .chunks
                    .binary_search_by_key(&chunk_id, |chunk| chunk.chunk_id)
                    .ok()
                    .map(|index| state.chunks[index].clone())
            })
        };
        let Some(chunk) = chunk else {
            return false;
        };
        !matches!(self.deliver(&chunk).await, Delivered::Continue)
    }

    async fn catch_up(&mut self) -> bool {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        let pending: Vec<StreamChunk> = {
            let streams = self.streams.read().await;
            streams.get(&self.stream_name).map_or_else(Vec::new, |state| {
                state
                    .chunks
                    .iter()
                    .filter(|chunk| {
                        self.last_delivered
                            .is_none_or(|last| chunk.chunk_id > last)
                    })
                    .cloned()
                    .collect()
            })
        };
        for chunk in &pending {
            if !matches!(self.deliver(chunk).await, Delivered::Continue) {
                return true;
            }
        }
        false
    }

    async fn deliver(&mut self, chunk: &StreamChunk) -> Delivered {
        // Out-of-order or duplicate notification: already delivered.
        if self.last_delivered.is_some_and(|last| last >= chunk.chunk_id) {
            return Delivered::Continue;
        }
        self.last_delivered = Some(chunk.chunk_id);

        if chunk.eof {
            return Delivered::Eof;
        }
        if self.remaining_skip > 0 {
            self.remaining_skip -= 1;
            return Delivered::Continue;
        }
        match self.tx.send(Ok(chunk.payload.clone())).await {
            Ok(()) => Delivered::Continue,
            Err(_) => Delivered::Cancelled,
        }
    }

    fn finish(self) {
        self.registry.release(&self.stream_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, sleep, timeout};
    use worldkit_core::RunId;

    fn streamer() -> MemoryStreamer {
        MemoryStreamer::new(Arc::new(IdGenerator::new()))
    }

    fn run_id() -> RunId {
        IdGenerator::new().run_id()
    }

    async fn collect(mut stream: ByteStream) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(item) = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream should terminate")
        {
            chunks.push(item.expect("chunk"));
        }
        chunks
    }

    #[tokio::test]
    async fn write_write_close_yields_exactly_two_chunks() {
        let streamer = streamer();
        let run = run_id();
        streamer.write_to_stream("s", run.into(), "one".into()).await.expect("write");
        streamer.write_to_stream("s", run.into(), "two".into()).await.expect("write");
        streamer.close_stream("s", run.into()).await.expect("close");

        let chunks = collect(
            streamer
                .read_from_stream("s", ReadStreamOptions::default())
                .await
                .expect("read"),
        )
        .await;
        assert_eq!(chunks, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn late_reader_replays_full_history() {
        let streamer = streamer();
        let run = run_id();
        for text in ["Chunk 1\n", "Chunk 2\n", "Chunk 3\n"] {
            streamer.write_to_stream("s", run.into(), text.into()).await.expect("write");
        }
        streamer.close_stream("s", run.into()).await.expect("close");

        for _ in 0..2 {
            let chunks = collect(
                streamer
                    .read_from_stream("s", ReadStreamOptions::default())
                    .await
                    .expect("read"),
            )
            .await;
            let joined: Vec<u8> = chunks.concat();
            assert_eq!(joined, b"Chunk 1\nChunk 2\nChunk 3\n".to_vec());
        }
    }

    #[tokio::test]
    async fn live_reader_sees_chunks_written_after_subscribe() {
        let streamer = streamer();
        let run = run_id();
        streamer.write_to_stream("s", run.into(), "early".into()).await.expect("write");

        let stream = streamer
            .read_from_stream("s", ReadStreamOptions::default())
            .await
            .expect("read");

        let writer = streamer.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            writer.write_to_stream("s", run.into(), "late".into()).await.expect("write");
            writer.close_stream("s", run.into()).await.expect("close");
        });

        let chunks = collect(stream).await;
        assert_eq!(chunks, vec![b"early".to_vec(), b"late".to_vec()]);
    }

    #[tokio::test]
    async fn start_index_skips_leading_data_chunks() {
        let streamer = streamer();
        let run = run_id();
        for text in ["a", "b", "c"] {
            streamer.write_to_stream("s", run.into(), text.into()).await.expect("write");
        }
        streamer.close_stream("s", run.into()).await.expect("close");

        let chunks = collect(
            streamer
                .read_from_stream(
                    "s",
                    ReadStreamOptions {
                        start_index: Some(2),
                    },
                )
                .await
                .expect("read"),
        )
        .await;
        assert_eq!(chunks, vec![b"c".to_vec()]);
    }

    #[tokio::test]
    async fn write_after_close_is_invalid_state() {
        let streamer = streamer();
        let run = run_id();
        streamer.close_stream("s", run.into()).await.expect("close");
        let err = streamer
            .write_to_stream("s", run.into(), "late".into())
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn deferred_run_id_orders_write_after_resolution() {
        let streamer = streamer();
        let run = run_id();
        let (resolve, pending) = tokio::sync::oneshot::channel();
        let handle = RunIdHandle::deferred(async move { pending.await.expect("resolved") });

        let writer = streamer.clone();
        let write = tokio::spawn(async move {
            writer.write_to_stream("s", handle, "gated".into()).await
        });

        // The write is parked until the run id resolves.
        sleep(Duration::from_millis(20)).await;
        assert!(!write.is_finished());

        resolve.send(run).expect("receiver alive");
        write.await.expect("join").expect("write");
        streamer.close_stream("s", run.into()).await.expect("close");

        let chunks = collect(
            streamer
                .read_from_stream("s", ReadStreamOptions::default())
                .await
                .expect("read"),
        )
        .await;
        assert_eq!(chunks, vec![b"gated".to_vec()]);
    }

    #[tokio::test]
    async fn dropping_the_reader_releases_its_registry_entry() {
        let streamer = streamer();
        let run = run_id();
        streamer.write_to_stream("s", run.into(), "x".into()).await.expect("write");

        let stream = streamer
            .read_from_stream("s", ReadStreamOptions::default())
            .await
            .expect("read");
        assert_eq!(streamer.readers.active_readers("s"), 1);

        drop(stream);
        let mut released = false;
        for _ in 0..50 {
            if streamer.readers.active_readers("s") == 0 {
                released = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "reader registry entry should be released");
    }

    #[tokio::test]
    async fn concurrent_readers_each_see_the_full_sequence() {
        let streamer = streamer();
        let run = run_id();

        let first = streamer
            .read_from_stream("s", ReadStreamOptions::default())
            .await
            .expect("read");
        let second = streamer
            .read_from_stream("s", ReadStreamOptions::default())
            .await
            .expect("read");

        let writer = streamer.clone();
        tokio::spawn(async move {
            for text in ["1", "2", "3"] {
                writer.write_to_stream("s", run.into(), text.into()).await.expect("write");
            }
            writer.close_stream("s", run.into()).await.expect("close");
        });

        let (a, b) = tokio::join!(collect(first), collect(second));
        let expected = vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()];
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }
}
