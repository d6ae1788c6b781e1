pub(crate) mod api;
pub(crate) mod backend;
pub(crate) mod config;
pub(crate) mod export;
pub(crate) mod notification;
pub(crate) mod pipeline;
pub(crate) mod receiver;
pub(crate) mod telemetry;
pub(crate) mod types;
pub(crate) mod utils;

use crate::config::{AppConfig, HttpServerConfig};
use crate::notification::{Decision, Notification, RetrievalLocator};
use crate::receiver::NotificationHandler;
use crate::telemetry::{Event, Telemetry};
use anyhow::Context;
use axum::extract::Request;
use axum::response::Response;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// The application entity title used when calling DIMSE peers, unless configured otherwise.
pub const DEFAULT_AET: &str = "DICOM-EXPORT";

fn init_logger(level: &str) {
	let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(level.into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

#[derive(Clone)]
pub struct AppState {
	pub handler: NotificationHandler,
	pub telemetry: Arc<dyn Telemetry>,
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(&config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let exit_code = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			run(config).await.unwrap_or_else(|error| {
				error!("Failed to start application due to error: {error:#}");
				ExitCode::FAILURE
			})
		});
	Ok(exit_code)
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
	let telemetry = telemetry::from_config(config.telemetry.events);
	let forwarder = pipeline::assemble(&config, Arc::clone(&telemetry))
		.context("Invalid export configuration")?;
	let handler = NotificationHandler::new(forwarder, Arc::clone(&telemetry));
	telemetry.emit(Event::Started);

	if let Some(message) = &config.export.message {
		return export_once(&handler, message).await;
	}

	let app = api::routes()
		.layer(axum::middleware::from_fn(add_common_headers))
		.layer(
			tower_http::trace::TraceLayer::new_for_http()
				.make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
				.on_request(trace::DefaultOnRequest::new().level(Level::INFO))
				.on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
		)
		.layer(ConcurrencyLimitLayer::new(config.server.max_concurrency))
		.with_state(AppState {
			handler,
			telemetry: Arc::clone(&telemetry),
		});

	let HttpServerConfig {
		interface: host,
		port,
		graceful_shutdown,
		..
	} = config.server;
	let addr = SocketAddr::from((host, port));
	let listener = TcpListener::bind(addr).await?;

	info!("Listening for notifications on http://{addr}/push");
	if graceful_shutdown {
		axum::serve(listener, app)
			.with_graceful_shutdown(shutdown_signal())
			.await?;
	} else {
		axum::serve(listener, app).await?;
	}

	if let Some(totals) = telemetry.totals() {
		info!(
			requests = totals.requests,
			errors = totals.errors,
			bytes = totals.bytes,
			"Stopped after exporting notifications"
		);
	}
	Ok(ExitCode::SUCCESS)
}

/// Exports a single locator without a notification transport.
async fn export_once(handler: &NotificationHandler, locator: &str) -> anyhow::Result<ExitCode> {
	let notification = Notification {
		locator: RetrievalLocator::new(locator),
		attributes: HashMap::new(),
		delivery_id: format!("local-{}", Uuid::new_v4()),
	};
	info!(delivery_id = notification.delivery_id, "Exporting single message");

	let (reply, settled) = oneshot::channel();
	handler.handle(&notification, reply).await;

	Ok(match settled.await? {
		Decision::Ack => ExitCode::SUCCESS,
		Decision::Nack => ExitCode::FAILURE,
	})
}

async fn shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
	info!("Shutting down");
}

async fn add_common_headers(req: Request, next: axum::middleware::Next) -> Response {
	let mut response = next.run(req).await;
	let server_name = concat!("dicom-export/", env!("CARGO_PKG_VERSION"));
	let headers = response.headers_mut();
	headers.insert("Server", axum::http::HeaderValue::from_static(server_name));
	response
}
