use super::ExportError;
use crate::notification::RetrievalLocator;
use async_trait::async_trait;
use pin_project::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, instrument};

/// Counters shared between an [`ObjectStream`] and whoever observes it.
#[derive(Debug, Default)]
pub struct StreamStats {
	bytes: AtomicU64,
	failed: AtomicBool,
}

impl StreamStats {
	/// Number of bytes read from the source so far.
	pub fn bytes_read(&self) -> u64 {
		self.bytes.load(Ordering::Acquire)
	}

	/// Whether the source reported a read error.
	pub fn source_failed(&self) -> bool {
		self.failed.load(Ordering::Acquire)
	}
}

/// Wraps a reader and counts every byte passing through it.
#[pin_project]
pub struct CountingReader<R> {
	#[pin]
	inner: R,
	stats: Arc<StreamStats>,
}

impl<R: AsyncRead> AsyncRead for CountingReader<R> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.project();
		let filled = buf.filled().len();
		match this.inner.poll_read(cx, buf) {
			Poll::Ready(Ok(())) => {
				let read = (buf.filled().len() - filled) as u64;
				this.stats.bytes.fetch_add(read, Ordering::AcqRel);
				Poll::Ready(Ok(()))
			}
			Poll::Ready(Err(err)) => {
				this.stats.failed.store(true, Ordering::Release);
				Poll::Ready(Err(err))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Byte stream of a single instance as delivered by the retrieval service.
/// The stream is closed when dropped.
pub struct ObjectStream {
	reader: CountingReader<Pin<Box<dyn AsyncRead + Send>>>,
}

impl ObjectStream {
	pub fn new(reader: impl AsyncRead + Send + 'static) -> Self {
		Self {
			reader: CountingReader {
				inner: Box::pin(reader),
				stats: Arc::default(),
			},
		}
	}

	/// Handle to the byte counter that outlives the stream.
	pub fn stats(&self) -> Arc<StreamStats> {
		Arc::clone(&self.reader.stats)
	}
}

impl AsyncRead for ObjectStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.reader).poll_read(cx, buf)
	}
}

/// Source of instance bytes (WADO-RS).
#[async_trait]
pub trait RetrievalService: Send + Sync {
	async fn open(&self, locator: &RetrievalLocator) -> anyhow::Result<ObjectStream>;
}

pub struct ObjectFetcher {
	service: Arc<dyn RetrievalService>,
}

impl ObjectFetcher {
	pub fn new(service: Arc<dyn RetrievalService>) -> Self {
		Self { service }
	}

	#[instrument(skip_all, fields(locator = %locator))]
	pub async fn open(&self, locator: &RetrievalLocator) -> Result<ObjectStream, ExportError> {
		let stream = self
			.service
			.open(locator)
			.await
			.map_err(|source| ExportError::Retrieval {
				locator: locator.to_string(),
				source,
			})?;
		debug!("Opened instance stream");
		Ok(stream)
	}
}
