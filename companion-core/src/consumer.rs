// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-stream consumers.
//!
//! A [`DataConsumer`] is the sink half of every byte stream in the
//! companion: process output, video frames, channel transcripts and log
//! tails all drain through one. Consumers are internally synchronised;
//! callers may write from any task without locking. End-of-file may be
//! signalled at most once, and a consumer's [`completed`](DataConsumer::completed)
//! future resolves only after every downstream sink has drained.

use crate::{
    errors::CompanionError,
    fut::{Deferred, Resolver},
};
use bstr::ByteSlice;
use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use tokio::{io::AsyncWriteExt, sync::mpsc};

/// A sink for a stream of bytes.
pub trait DataConsumer: Send + Sync + 'static {
    /// Consumes one chunk. Fails if end-of-file has already been signalled.
    fn consume(&self, chunk: Bytes) -> Result<(), CompanionError>;

    /// Signals that no further chunks will arrive. At most once.
    fn end_of_file(&self) -> Result<(), CompanionError>;

    /// Resolves once end-of-file has been propagated to every downstream
    /// sink and all buffered writes have drained.
    fn completed(&self) -> Deferred<()>;

    /// True if the consumer can accept another chunk without queuing
    /// excessively. Producers that can drop data (e.g. the video stream)
    /// consult this for backpressure.
    fn is_ready(&self) -> bool {
        true
    }
}

fn write_after_eof() -> CompanionError {
    CompanionError::InvalidArgument("consumer received data after end-of-file".to_owned())
}

fn eof_twice() -> CompanionError {
    CompanionError::InvalidArgument("end-of-file signalled twice".to_owned())
}

/// Tracks the EOF flag and completion future shared by the simple
/// consumers.
struct Lifecycle {
    resolver: Arc<Resolver<()>>,
    done: Deferred<()>,
    eof: bool,
}

impl Lifecycle {
    fn new() -> Mutex<Self> {
        let (resolver, done) = Deferred::new();
        Mutex::new(Self {
            resolver: Arc::new(resolver),
            done,
            eof: false,
        })
    }
}

/// A consumer that discards everything.
pub struct NullConsumer {
    lifecycle: Mutex<Lifecycle>,
}

impl NullConsumer {
    /// Creates a new null consumer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Lifecycle::new(),
        })
    }
}

impl DataConsumer for NullConsumer {
    fn consume(&self, _chunk: Bytes) -> Result<(), CompanionError> {
        let lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        if lifecycle.eof {
            return Err(write_after_eof());
        }
        Ok(())
    }

    fn end_of_file(&self) -> Result<(), CompanionError> {
        let resolver = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if lifecycle.eof {
                return Err(eof_twice());
            }
            lifecycle.eof = true;
            Arc::clone(&lifecycle.resolver)
        };
        // Observers run outside the lifecycle lock.
        resolver.resolve(());
        Ok(())
    }

    fn completed(&self) -> Deferred<()> {
        self.lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .done
            .clone()
    }
}

/// A consumer that hands each chunk to a closure.
pub struct FnConsumer {
    callback: Mutex<Box<dyn FnMut(Bytes) + Send>>,
    lifecycle: Mutex<Lifecycle>,
}

impl FnConsumer {
    /// Creates a consumer from a chunk callback.
    pub fn new(callback: impl FnMut(Bytes) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Box::new(callback)),
            lifecycle: Lifecycle::new(),
        })
    }
}

impl DataConsumer for FnConsumer {
    fn consume(&self, chunk: Bytes) -> Result<(), CompanionError> {
        {
            let lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if lifecycle.eof {
                return Err(write_after_eof());
            }
        }
        (self.callback.lock().expect("callback lock poisoned"))(chunk);
        Ok(())
    }

    fn end_of_file(&self) -> Result<(), CompanionError> {
        let resolver = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if lifecycle.eof {
                return Err(eof_twice());
            }
            lifecycle.eof = true;
            Arc::clone(&lifecycle.resolver)
        };
        // Observers run outside the lifecycle lock.
        resolver.resolve(());
        Ok(())
    }

    fn completed(&self) -> Deferred<()> {
        self.lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .done
            .clone()
    }
}

/// A consumer that buffers bytes until a delimiter and emits whole lines.
///
/// The delimiter is not included in emitted lines. Any unterminated
/// remainder is flushed when end-of-file is signalled.
pub struct LineBufferConsumer {
    inner: Mutex<LineBufferInner>,
    lifecycle: Mutex<Lifecycle>,
}

struct LineBufferInner {
    buffer: BytesMut,
    delimiter: u8,
    callback: Box<dyn FnMut(&[u8]) + Send>,
}

impl LineBufferConsumer {
    /// Creates a newline-delimited line consumer.
    pub fn new(callback: impl FnMut(&[u8]) + Send + 'static) -> Arc<Self> {
        Self::with_delimiter(b'\n', callback)
    }

    /// Creates a line consumer with a custom delimiter byte.
    pub fn with_delimiter(
        delimiter: u8,
        callback: impl FnMut(&[u8]) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LineBufferInner {
                buffer: BytesMut::new(),
                delimiter,
                callback: Box::new(callback),
            }),
            lifecycle: Lifecycle::new(),
        })
    }
}

impl DataConsumer for LineBufferConsumer {
    fn consume(&self, chunk: Bytes) -> Result<(), CompanionError> {
        {
            let lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if lifecycle.eof {
                return Err(write_after_eof());
            }
        }
        let mut inner = self.inner.lock().expect("line buffer lock poisoned");
        inner.buffer.extend_from_slice(&chunk);
        loop {
            let Some(pos) = inner.buffer.find_byte(inner.delimiter) else {
                break;
            };
            let line = inner.buffer.split_to(pos + 1);
            (inner.callback)(&line[..line.len() - 1]);
        }
        Ok(())
    }

    fn end_of_file(&self) -> Result<(), CompanionError> {
        {
            let mut inner = self.inner.lock().expect("line buffer lock poisoned");
            if !inner.buffer.is_empty() {
                let rest = inner.buffer.split();
                (inner.callback)(&rest);
            }
        }
        let resolver = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if lifecycle.eof {
                return Err(eof_twice());
            }
            lifecycle.eof = true;
            Arc::clone(&lifecycle.resolver)
        };
        // Observers run outside the lifecycle lock.
        resolver.resolve(());
        Ok(())
    }

    fn completed(&self) -> Deferred<()> {
        self.lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .done
            .clone()
    }
}

/// Fans each chunk out to several consumers; failures are aggregated.
pub struct CompositeConsumer {
    sinks: Vec<Arc<dyn DataConsumer>>,
}

impl CompositeConsumer {
    /// Creates a fan-out over the given sinks.
    pub fn new(sinks: Vec<Arc<dyn DataConsumer>>) -> Arc<Self> {
        Arc::new(Self { sinks })
    }
}

impl DataConsumer for CompositeConsumer {
    fn consume(&self, chunk: Bytes) -> Result<(), CompanionError> {
        let errors: Vec<CompanionError> = self
            .sinks
            .iter()
            .filter_map(|sink| sink.consume(chunk.clone()).err())
            .collect();
        CompanionError::aggregate(errors)
    }

    fn end_of_file(&self) -> Result<(), CompanionError> {
        let errors: Vec<CompanionError> = self
            .sinks
            .iter()
            .filter_map(|sink| sink.end_of_file().err())
            .collect();
        CompanionError::aggregate(errors)
    }

    fn completed(&self) -> Deferred<()> {
        // Resolves only after every downstream sink has drained.
        let mut all = Deferred::resolved(());
        for sink in &self.sinks {
            let next = sink.completed();
            all = all.flat_then(move |()| next);
        }
        all
    }

    fn is_ready(&self) -> bool {
        self.sinks.iter().all(|sink| sink.is_ready())
    }
}

/// Chunks queued beyond this mark report the consumer as not ready.
const FILE_CONSUMER_HIGH_WATER: usize = 256;

enum FileMessage {
    Chunk(Bytes),
    Eof,
}

/// A consumer backed by a file, written by a dedicated task.
///
/// Writes are queued and flushed asynchronously; `completed` resolves after
/// the final flush that follows end-of-file.
pub struct FileConsumer {
    tx: mpsc::UnboundedSender<FileMessage>,
    queued: Arc<AtomicUsize>,
    eof: Mutex<bool>,
    done: Deferred<()>,
    path: Utf8PathBuf,
}

impl FileConsumer {
    /// Opens (creating or truncating) the file and starts the writer task.
    pub async fn create(path: impl AsRef<Utf8Path>) -> Result<Arc<Self>, CompanionError> {
        let path = path.as_ref().to_owned();
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|error| CompanionError::io_at(path.clone(), error))?;
        Ok(Self::start(path, file))
    }

    fn start(path: Utf8PathBuf, mut file: tokio::fs::File) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FileMessage>();
        let (resolver, done) = Deferred::new();
        let queued = Arc::new(AtomicUsize::new(0));
        tokio::spawn({
            let queued = Arc::clone(&queued);
            let path = path.clone();
            async move {
                while let Some(message) = rx.recv().await {
                    match message {
                        FileMessage::Chunk(chunk) => {
                            queued.fetch_sub(1, Ordering::Relaxed);
                            if let Err(err) = file.write_all(&chunk).await {
                                tracing::warn!("file consumer write to `{path}` failed: {err}");
                            }
                        }
                        FileMessage::Eof => {
                            if let Err(err) = file.flush().await {
                                tracing::warn!("file consumer flush of `{path}` failed: {err}");
                            }
                            break;
                        }
                    }
                }
                resolver.resolve(());
            }
        });
        Arc::new(Self {
            tx,
            queued,
            eof: Mutex::new(false),
            done,
            path,
        })
    }

    /// The path this consumer writes to.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl DataConsumer for FileConsumer {
    fn consume(&self, chunk: Bytes) -> Result<(), CompanionError> {
        if *self.eof.lock().expect("eof flag lock poisoned") {
            return Err(write_after_eof());
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(FileMessage::Chunk(chunk))
            .map_err(|_| CompanionError::io(std::io::Error::other("file writer task gone")))
    }

    fn end_of_file(&self) -> Result<(), CompanionError> {
        let mut eof = self.eof.lock().expect("eof flag lock poisoned");
        if *eof {
            return Err(eof_twice());
        }
        *eof = true;
        self.tx
            .send(FileMessage::Eof)
            .map_err(|_| CompanionError::io(std::io::Error::other("file writer task gone")))
    }

    fn completed(&self) -> Deferred<()> {
        self.done.clone()
    }

    fn is_ready(&self) -> bool {
        self.queued.load(Ordering::Relaxed) < FILE_CONSUMER_HIGH_WATER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collecting_consumer() -> (Arc<FnConsumer>, Arc<Mutex<Vec<u8>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let collected = Arc::clone(&collected);
            FnConsumer::new(move |chunk| {
                collected.lock().expect("lock").extend_from_slice(&chunk);
            })
        };
        (consumer, collected)
    }

    #[tokio::test]
    async fn bytes_delivered_in_order() {
        let (consumer, collected) = collecting_consumer();
        consumer.consume(Bytes::from_static(b"hello ")).expect("write");
        consumer.consume(Bytes::from_static(b"world")).expect("write");
        consumer.end_of_file().expect("eof");
        assert_eq!(&*collected.lock().expect("lock"), b"hello world");
    }

    #[tokio::test]
    async fn eof_at_most_once() {
        let consumer = NullConsumer::new();
        consumer.end_of_file().expect("first eof");
        assert!(consumer.end_of_file().is_err());
        assert!(consumer.consume(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn completed_resolves_after_eof() {
        let consumer = NullConsumer::new();
        let completed = consumer.completed();
        assert!(!completed.is_done());
        consumer.end_of_file().expect("eof");
        completed.value().await.expect("completed");
    }

    #[tokio::test]
    async fn line_buffer_emits_on_delimiter() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let lines = Arc::clone(&lines);
            LineBufferConsumer::new(move |line| {
                lines
                    .lock()
                    .expect("lock")
                    .push(String::from_utf8_lossy(line).into_owned());
            })
        };
        consumer
            .consume(Bytes::from_static(b"one\ntwo\nthr"))
            .expect("write");
        consumer.consume(Bytes::from_static(b"ee")).expect("write");
        assert_eq!(*lines.lock().expect("lock"), vec!["one", "two"]);
        consumer.end_of_file().expect("eof");
        assert_eq!(*lines.lock().expect("lock"), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn composite_fans_out_and_aggregates_failures() {
        let (a, collected_a) = collecting_consumer();
        let (b, collected_b) = collecting_consumer();
        let composite = CompositeConsumer::new(vec![a.clone(), b]);
        composite.consume(Bytes::from_static(b"x")).expect("write");
        assert_eq!(&*collected_a.lock().expect("lock"), b"x");
        assert_eq!(&*collected_b.lock().expect("lock"), b"x");

        // Pre-close one sink; the composite surfaces the failure but still
        // writes to the healthy sink.
        a.end_of_file().expect("eof");
        assert!(composite.consume(Bytes::from_static(b"y")).is_err());
        assert_eq!(&*collected_b.lock().expect("lock"), b"xy");
    }

    #[tokio::test]
    async fn composite_completed_waits_for_all() {
        let a = NullConsumer::new();
        let b = NullConsumer::new();
        let composite = CompositeConsumer::new(vec![a.clone(), b.clone()]);
        let completed = composite.completed();
        a.end_of_file().expect("eof a");
        assert!(!completed.is_done());
        b.end_of_file().expect("eof b");
        completed.value().await.expect("all drained");
    }

    #[tokio::test]
    async fn file_consumer_writes_and_drains() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.log");
        let consumer = FileConsumer::create(&path).await.expect("create");
        consumer
            .consume(Bytes::from_static(b"first\n"))
            .expect("write");
        consumer
            .consume(Bytes::from_static(b"second\n"))
            .expect("write");
        consumer.end_of_file().expect("eof");
        consumer.completed().value().await.expect("drained");
        let contents = tokio::fs::read_to_string(&path).await.expect("read back");
        assert_eq!(contents, "first\nsecond\n");
    }
}
