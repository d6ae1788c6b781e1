use crate::types::{Priority, AE};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: HttpServerConfig,
	/// The DICOMweb service that notified instances are read from.
	pub source: DicomWebConfig,
	#[serde(default)]
	pub export: ExportConfig,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("DICOM_EXPORT").separator("__"))
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Configurable logging level. Also configurable via env vars RUST_LOG and DICOM_EXPORT__TELEMETRY__LEVEL
	pub level: String,
	/// Whether export events (started, request, bytes, error) are recorded.
	pub events: bool,
	/// Sentry DSN. Sentry is disabled if absent.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	// The interface the push endpoint will be listening on
	pub interface: IpAddr,
	// The port for the push endpoint
	pub port: u16,
	/// Upper bound of notifications that are exported at the same time.
	pub max_concurrency: usize,
	pub graceful_shutdown: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DicomWebConfig {
	/// Base address of the DICOMweb service, e.g. `http://localhost:8042/dicom-web`
	pub address: String,
	/// Optional bearer token sent with every request.
	pub token: Option<String>,
	/// Connect timeout in milliseconds.
	pub connect_timeout: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportConfig {
	/// Export via C-STORE to a DIMSE peer.
	pub dimse: Option<DimsePeerConfig>,
	/// Export via STOW-RS to a DICOMweb peer.
	pub dicomweb: Option<StowPeerConfig>,
	/// Folder for per-message diagnostic dumps of the DIMSE exporter.
	pub shared_folder: Option<PathBuf>,
	/// Exports a single locator and exits instead of listening for notifications.
	pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimsePeerConfig {
	/// The application entity title of the peer.
	pub aet: AE,
	pub host: String,
	pub port: u16,
	/// Our own application entity title.
	#[serde(default = "default_calling_aet")]
	pub calling_aet: AE,
	/// Read and write timeout of the association in milliseconds.
	#[serde(default = "default_dimse_timeout")]
	pub timeout: u64,
	/// Priority requested in every C-STORE-RQ.
	#[serde(default)]
	pub priority: Priority,
}

fn default_calling_aet() -> AE {
	AE::from(crate::DEFAULT_AET)
}

const fn default_dimse_timeout() -> u64 {
	30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StowPeerConfig {
	/// Base address of the DICOMweb peer.
	pub address: String,
	/// Path of the STOW-RS resource, relative to `address`.
	#[serde(default = "default_stow_path")]
	pub stow_path: String,
	pub token: Option<String>,
	#[serde(default = "default_connect_timeout")]
	pub connect_timeout: u64,
}

fn default_stow_path() -> String {
	String::from("studies")
}

const fn default_connect_timeout() -> u64 {
	5_000
}

impl From<&StowPeerConfig> for DicomWebConfig {
	fn from(peer: &StowPeerConfig) -> Self {
		Self {
			address: format!(
				"{}/{}",
				peer.address.trim_end_matches('/'),
				peer.stow_path.trim_start_matches('/')
			),
			token: peer.token.clone(),
			connect_timeout: peer.connect_timeout,
		}
	}
}
