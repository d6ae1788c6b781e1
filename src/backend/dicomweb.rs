//! This module contains the DICOMweb backend.
//! - QIDO-RS resolves instance metadata.
//! - WADO-RS streams instances from the source.
//! - STOW-RS streams instances to a DICOMweb peer.

use crate::config::DicomWebConfig;
use crate::export::fetch::{ObjectStream, RetrievalService};
use crate::export::resolver::{MetadataQuery, MetadataRecord, MetadataService};
use crate::export::stow::StowClient;
use crate::notification::RetrievalLocator;
use crate::utils::multipart::{self, DICOM_MEDIA_TYPE};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

/// Media type of QIDO-RS responses.
pub const DICOM_JSON: &str = "application/dicom+json";
/// Requests the instance in whatever transfer syntax it is stored in.
pub const WADO_ACCEPT: &str = "application/dicom; transfer-syntax=*";

const USER_AGENT: &str = concat!("dicom-export/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum DicomWebError {
	#[error("Invalid DICOMweb address '{address}': {source}")]
	InvalidAddress {
		address: String,
		source: url::ParseError,
	},
	#[error("HTTP client error: {0}")]
	Client(#[from] reqwest::Error),
	#[error("{method} {url} failed with {status}")]
	Status {
		method: Method,
		url: String,
		status: StatusCode,
	},
	#[error("Invalid DICOM JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("{url} returned '{content_type}' instead of application/dicom")]
	UnexpectedMediaType { url: String, content_type: String },
}

/// Checks that a WADO-RS response carries a bare DICOM file. A missing header is accepted.
fn check_media_type(response: &Response) -> Result<(), DicomWebError> {
	let Some(content_type) = response.headers().get(CONTENT_TYPE) else {
		return Ok(());
	};
	let content_type = String::from_utf8_lossy(content_type.as_bytes());
	let essence = content_type.split(';').next().unwrap_or_default().trim();
	if essence.eq_ignore_ascii_case(DICOM_MEDIA_TYPE) {
		Ok(())
	} else {
		Err(DicomWebError::UnexpectedMediaType {
			url: response.url().to_string(),
			content_type: content_type.into_owned(),
		})
	}
}

/// Resolves a resource path against a base address. Absolute URLs are returned as they are.
pub fn join_path(base: &str, path: &str) -> String {
	if path.starts_with("http://") || path.starts_with("https://") {
		return path.to_owned();
	}
	format!(
		"{}/{}",
		base.trim_end_matches('/'),
		path.trim_start_matches('/')
	)
}

/// HTTP client of a DICOMweb service.
///
/// The same client serves as metadata service and retrieval service for the source and as
/// STOW-RS client for a DICOMweb peer. `reqwest::Client` pools connections internally, so one
/// instance is shared by all exports.
#[derive(Debug, Clone)]
pub struct DicomWebClient {
	http: reqwest::Client,
	address: String,
	token: Option<String>,
}

impl DicomWebClient {
	pub fn new(config: &DicomWebConfig) -> Result<Self, DicomWebError> {
		Url::parse(&config.address).map_err(|source| DicomWebError::InvalidAddress {
			address: config.address.clone(),
			source,
		})?;

		let http = reqwest::Client::builder()
			.connect_timeout(Duration::from_millis(config.connect_timeout))
			.user_agent(USER_AGENT)
			.build()?;

		Ok(Self {
			http,
			address: config.address.clone(),
			token: config.token.clone(),
		})
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	fn request(&self, method: Method, url: &str) -> RequestBuilder {
		let request = self.http.request(method, url);
		match &self.token {
			Some(token) => request.bearer_auth(token),
			None => request,
		}
	}

	async fn execute(&self, request: RequestBuilder) -> Result<Response, DicomWebError> {
		let request = request.build()?;
		let method = request.method().clone();
		let url = request.url().to_string();

		let response = self.http.execute(request).await?;
		let status = response.status();
		if status.is_success() {
			Ok(response)
		} else {
			Err(DicomWebError::Status {
				method,
				url,
				status,
			})
		}
	}
}

#[async_trait]
impl MetadataService for DicomWebClient {
	#[instrument(skip_all, fields(query = %query))]
	async fn query(&self, query: &MetadataQuery) -> anyhow::Result<Vec<MetadataRecord>> {
		let url = join_path(&self.address, &query.to_string());
		let request = self.request(Method::GET, &url).header(ACCEPT, DICOM_JSON);
		let response = self.execute(request).await?;

		// 204 No Content is the regular answer for an empty result.
		let body = response.bytes().await.map_err(DicomWebError::from)?;
		if body.is_empty() {
			return Ok(Vec::new());
		}
		let records: Vec<MetadataRecord> =
			serde_json::from_slice(&body).map_err(DicomWebError::from)?;
		debug!(count = records.len(), "Received metadata records");
		Ok(records)
	}
}

#[async_trait]
impl RetrievalService for DicomWebClient {
	#[instrument(skip_all, fields(locator = %locator))]
	async fn open(&self, locator: &RetrievalLocator) -> anyhow::Result<ObjectStream> {
		let url = join_path(&self.address, locator.as_str());
		let request = self.request(Method::GET, &url).header(ACCEPT, WADO_ACCEPT);
		let response = self.execute(request).await?;
		check_media_type(&response)?;

		let body = response.bytes_stream().map_err(std::io::Error::other);
		Ok(ObjectStream::new(StreamReader::new(body)))
	}
}

#[async_trait]
impl StowClient for DicomWebClient {
	#[instrument(skip_all, fields(destination = %self.address))]
	async fn upload(&self, stream: ObjectStream) -> anyhow::Result<()> {
		let boundary = Uuid::new_v4().to_string();
		let content_type = multipart::content_type(&boundary);
		let body = reqwest::Body::wrap_stream(multipart::related_body(boundary, stream));

		let request = self
			.request(Method::POST, &self.address)
			.header(CONTENT_TYPE, content_type)
			.header(ACCEPT, DICOM_JSON)
			.body(body);
		let response = self.execute(request).await?;
		debug!(status = %response.status(), "Upload accepted");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use axum::extract::{Request, State};
	use axum::http::HeaderMap;
	use axum::routing::{get, post};
	use axum::Router;
	use dicom::dictionary_std::tags;
	use reqwest::header::AUTHORIZATION;
	use std::sync::{Arc, Mutex};
	use tokio::io::AsyncReadExt;
	use tokio::net::TcpListener;

	async fn serve(router: Router) -> String {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
		format!("http://{addr}/dicom-web")
	}

	fn client(address: String) -> DicomWebClient {
		DicomWebClient::new(&DicomWebConfig {
			address,
			token: Some(String::from("secret")),
			connect_timeout: 1_000,
		})
		.unwrap()
	}

	#[test]
	fn joins_paths() {
		assert_eq!(
			join_path("http://host/dicom-web/", "/studies/1"),
			"http://host/dicom-web/studies/1"
		);
		assert_eq!(
			join_path("http://host/dicom-web", "https://other/studies/1"),
			"https://other/studies/1"
		);
	}

	#[test]
	fn rejects_invalid_address() {
		let result = DicomWebClient::new(&DicomWebConfig {
			address: String::from("not a url"),
			token: None,
			connect_timeout: 1_000,
		});
		assert!(matches!(result, Err(DicomWebError::InvalidAddress { .. })));
	}

	#[tokio::test]
	async fn queries_metadata() {
		let seen = Arc::new(Mutex::new(None));
		let router = Router::new()
			.route(
				"/dicom-web/studies/1/series/2/instances",
				get(|State(seen): State<Arc<Mutex<Option<String>>>>, request: Request| async move {
					let query = request.uri().query().map(str::to_owned);
					let auth = request.headers()[AUTHORIZATION].clone();
					assert_eq!(auth, "Bearer secret");
					*seen.lock().unwrap() = query;
					(
						[(CONTENT_TYPE, DICOM_JSON)],
						r#"[{"00080016":{"vr":"UI","Value":["1.2.840.10008.5.1.4.1.1.2"]},"00080018":{"vr":"UI","Value":["3"]}}]"#,
					)
				}),
			)
			.with_state(seen.clone());
		let client = client(serve(router).await);

		let query = MetadataQuery {
			target: String::from("studies/1/series/2"),
			sop_instance_uid: String::from("3"),
		};
		let records = client.query(&query).await.unwrap();

		assert_eq!(seen.lock().unwrap().as_deref(), Some("00080018=3"));
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].value(tags::SOP_INSTANCE_UID), Some("3"));
	}

	#[tokio::test]
	async fn no_content_means_no_records() {
		let router = Router::new().route(
			"/dicom-web/studies/1/series/2/instances",
			get(|| async { StatusCode::NO_CONTENT }),
		);
		let client = client(serve(router).await);

		let query = MetadataQuery {
			target: String::from("studies/1/series/2"),
			sop_instance_uid: String::from("3"),
		};
		assert!(client.query(&query).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn streams_instance() {
		let router = Router::new().route(
			"/dicom-web/studies/1/series/2/instances/3",
			get(|headers: HeaderMap| async move {
				assert_eq!(headers[ACCEPT], WADO_ACCEPT);
				let chunks = (0..8).map(|_| Ok::<_, std::io::Error>(vec![9u8; 1024]));
				(
					[(CONTENT_TYPE, "application/dicom; transfer-syntax=1.2.840.10008.1.2.1")],
					Body::from_stream(futures::stream::iter(chunks)),
				)
			}),
		);
		let client = client(serve(router).await);

		let mut stream = client
			.open(&RetrievalLocator::new("studies/1/series/2/instances/3"))
			.await
			.unwrap();
		let stats = stream.stats();
		let mut data = Vec::new();
		stream.read_to_end(&mut data).await.unwrap();

		assert_eq!(data.len(), 8 * 1024);
		assert_eq!(stats.bytes_read(), 8 * 1024);
	}

	#[tokio::test]
	async fn multipart_instance_fails_to_open() {
		let router = Router::new().route(
			"/dicom-web/studies/1/series/2/instances/3",
			get(|| async {
				(
					[(CONTENT_TYPE, "multipart/related; type=\"application/dicom\"; boundary=b")],
					"--b\r\n\r\n--b--",
				)
			}),
		);
		let client = client(serve(router).await);

		let result = client
			.open(&RetrievalLocator::new("studies/1/series/2/instances/3"))
			.await;

		let err = result.err().unwrap();
		assert!(matches!(
			err.downcast_ref::<DicomWebError>(),
			Some(DicomWebError::UnexpectedMediaType { content_type, .. })
				if content_type.starts_with("multipart/related")
		));
	}

	#[tokio::test]
	async fn missing_instance_fails_to_open() {
		let router = Router::new();
		let client = client(serve(router).await);

		let result = client
			.open(&RetrievalLocator::new("studies/1/series/2/instances/3"))
			.await;

		let err = result.err().unwrap();
		assert!(matches!(
			err.downcast_ref::<DicomWebError>(),
			Some(DicomWebError::Status { status, .. }) if *status == StatusCode::NOT_FOUND
		));
	}

	#[tokio::test]
	async fn uploads_multipart_related() {
		let received = Arc::new(Mutex::new(Vec::new()));
		let router = Router::new()
			.route(
				"/dicom-web/studies",
				post(|State(received): State<Arc<Mutex<Vec<u8>>>>, request: Request| async move {
					let content_type = request.headers()[CONTENT_TYPE]
						.to_str()
						.unwrap()
						.parse::<mime::Mime>()
						.unwrap();
					assert_eq!(content_type.subtype().as_str(), "related");
					let boundary = content_type.get_param(mime::BOUNDARY).unwrap().to_string();

					let mut multipart =
						multer::Multipart::new(request.into_body().into_data_stream(), boundary);
					let field = multipart.next_field().await.unwrap().unwrap();
					let bytes = field.bytes().await.unwrap();
					received.lock().unwrap().extend_from_slice(&bytes);
					StatusCode::OK
				}),
			)
			.with_state(received.clone());
		let client = client(format!("{}/studies", serve(router).await));

		let payload = vec![0x5Au8; 100_000];
		client
			.upload(ObjectStream::new(std::io::Cursor::new(payload.clone())))
			.await
			.unwrap();

		assert_eq!(*received.lock().unwrap(), payload);
	}

	#[tokio::test]
	async fn rejected_upload_fails() {
		let router = Router::new().route("/dicom-web/studies", post(|| async { StatusCode::CONFLICT }));
		let client = client(format!("{}/studies", serve(router).await));

		let result = client
			.upload(ObjectStream::new(std::io::Cursor::new(vec![0u8; 16])))
			.await;

		let err = result.err().unwrap();
		assert!(matches!(
			err.downcast_ref::<DicomWebError>(),
			Some(DicomWebError::Status { method, status, .. })
				if *method == Method::POST && *status == StatusCode::CONFLICT
		));
	}
}
