use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Media type of a single part in a STOW-RS request.
pub const DICOM_MEDIA_TYPE: &str = "application/dicom";

/// Content-Type header value of a `multipart/related` request with DICOM parts.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.5.html>
pub fn content_type(boundary: &str) -> String {
	format!("multipart/related; type=\"{DICOM_MEDIA_TYPE}\"; boundary={boundary}")
}

/// Encodes a single DICOM file as `multipart/related` body.
///
/// The part is copied from the reader chunk by chunk, so the body never holds the whole file.
/// Read errors end the stream with that error.
pub fn related_body<R>(boundary: String, part: R) -> impl Stream<Item = std::io::Result<Bytes>>
where
	R: AsyncRead + Send + 'static,
{
	try_stream! {
		yield Bytes::from(format!(
			"--{boundary}\r\nContent-Type: {DICOM_MEDIA_TYPE}\r\n\r\n"
		));

		let chunks = ReaderStream::new(part);
		tokio::pin!(chunks);
		while let Some(chunk) = chunks.next().await {
			yield chunk?;
		}

		yield Bytes::from(format!("\r\n--{boundary}--\r\n"));
	}
}
