use crate::notification::{Decision, Notification, RetrievalLocator};
use crate::telemetry::Event;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

/// HTTP Router for push deliveries of the notification transport.
pub fn routes() -> Router<AppState> {
	Router::new().route("/push", post(push))
}

/// Body of a Pub/Sub push delivery.
/// <https://cloud.google.com/pubsub/docs/push#receive_push>
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
	pub message: PushMessage,
	#[serde(default)]
	pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
	/// Base64 encoded payload, the retrieval locator.
	#[serde(default)]
	pub data: String,
	#[serde(default)]
	pub attributes: HashMap<String, String>,
	#[serde(alias = "message_id")]
	pub message_id: String,
}

#[derive(Debug, Error)]
pub enum PushError {
	#[error("Invalid push envelope: {0}")]
	Envelope(#[from] JsonRejection),
	#[error("Message data is not valid base64: {0}")]
	Base64(#[from] base64::DecodeError),
	#[error("Message data is not valid UTF-8: {0}")]
	Utf8(#[from] std::string::FromUtf8Error),
	#[error("Message data is empty")]
	EmptyLocator,
}

impl IntoResponse for PushError {
	fn into_response(self) -> Response {
		(StatusCode::BAD_REQUEST, self.to_string()).into_response()
	}
}

impl TryFrom<PushEnvelope> for Notification {
	type Error = PushError;

	fn try_from(envelope: PushEnvelope) -> Result<Self, Self::Error> {
		let PushMessage {
			data,
			attributes,
			message_id,
		} = envelope.message;

		let data = String::from_utf8(general_purpose::STANDARD.decode(data.trim())?)?;
		let locator = RetrievalLocator::new(data);
		if locator.as_str().is_empty() {
			return Err(PushError::EmptyLocator);
		}

		Ok(Self {
			locator,
			attributes,
			delivery_id: message_id,
		})
	}
}

/// Acknowledges a delivery with `204 No Content` and rejects it with `503 Service Unavailable`,
/// which makes the transport redeliver it later.
#[instrument(skip_all)]
async fn push(
	State(state): State<AppState>,
	envelope: Result<Json<PushEnvelope>, JsonRejection>,
) -> Response {
	let notification = match envelope.map_err(PushError::from).and_then(|Json(envelope)| {
		debug!(subscription = envelope.subscription.as_deref(), "Received delivery");
		Notification::try_from(envelope)
	}) {
		Ok(notification) => notification,
		Err(err) => {
			state.telemetry.emit(Event::Error);
			warn!("Rejected undecodable delivery: {err}");
			return err.into_response();
		}
	};

	let (reply, settled) = oneshot::channel();
	state.handler.handle(&notification, reply).await;

	match settled.await {
		Ok(Decision::Ack) => StatusCode::NO_CONTENT.into_response(),
		Ok(Decision::Nack) | Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::export::{ExportError, Forwarder};
	use crate::receiver::NotificationHandler;
	use crate::telemetry::RecordingTelemetry;
	use async_trait::async_trait;
	use axum::body::Body;
	use axum::http::header::CONTENT_TYPE;
	use axum::http::Request;
	use std::sync::{Arc, Mutex};
	use tower::ServiceExt;

	/// Succeeds for every locator except `fail`, and remembers what it was asked to send.
	#[derive(Default)]
	struct StubForwarder(Mutex<Vec<Notification>>);

	#[async_trait]
	impl Forwarder for StubForwarder {
		async fn send(&self, notification: &Notification) -> Result<(), ExportError> {
			self.0.lock().unwrap().push(notification.clone());
			if notification.locator.as_str() == "fail" {
				return Err(ExportError::Forwarding {
					destination: String::from("PACS@pacs.local:104"),
					source: anyhow::anyhow!("association rejected"),
				});
			}
			Ok(())
		}
	}

	struct Fixture {
		forwarder: Arc<StubForwarder>,
		telemetry: Arc<RecordingTelemetry>,
		app: Router,
	}

	fn fixture() -> Fixture {
		let forwarder = Arc::new(StubForwarder::default());
		let telemetry = Arc::new(RecordingTelemetry::default());
		let state = AppState {
			handler: NotificationHandler::new(forwarder.clone(), telemetry.clone()),
			telemetry: telemetry.clone(),
		};
		Fixture {
			forwarder,
			telemetry,
			app: routes().with_state(state),
		}
	}

	fn delivery(body: String) -> Request<Body> {
		Request::builder()
			.method("POST")
			.uri("/push")
			.header(CONTENT_TYPE, "application/json")
			.body(Body::from(body))
			.unwrap()
	}

	fn envelope(data: &str) -> String {
		serde_json::json!({
			"message": {
				"data": general_purpose::STANDARD.encode(data),
				"attributes": { "origin": "test" },
				"messageId": "1234",
			},
			"subscription": "projects/p/subscriptions/export",
		})
		.to_string()
	}

	#[test]
	fn decodes_envelope() {
		let envelope: PushEnvelope = serde_json::from_str(&envelope(
			" studies/1/series/2/instances/3\n",
		))
		.unwrap();
		let notification = Notification::try_from(envelope).unwrap();

		assert_eq!(notification.locator.as_str(), "studies/1/series/2/instances/3");
		assert_eq!(notification.delivery_id, "1234");
		assert_eq!(notification.attributes["origin"], "test");
	}

	#[test]
	fn accepts_snake_case_message_id() {
		let envelope: PushEnvelope = serde_json::from_str(
			r#"{"message": {"data": "Mw==", "message_id": "99"}}"#,
		)
		.unwrap();
		let notification = Notification::try_from(envelope).unwrap();

		assert_eq!(notification.delivery_id, "99");
		assert_eq!(notification.locator.as_str(), "3");
	}

	#[test]
	fn rejects_empty_data() {
		let envelope: PushEnvelope =
			serde_json::from_str(r#"{"message": {"data": "", "messageId": "1"}}"#).unwrap();

		assert!(matches!(
			Notification::try_from(envelope),
			Err(PushError::EmptyLocator)
		));
	}

	#[tokio::test]
	async fn acknowledges_with_no_content() {
		let fixture = fixture();

		let response = fixture
			.app
			.oneshot(delivery(envelope("studies/1/series/2/instances/3")))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		let sent = fixture.forwarder.0.lock().unwrap();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].delivery_id, "1234");
		assert_eq!(fixture.telemetry.events(), vec![Event::Request]);
	}

	#[tokio::test]
	async fn rejects_with_service_unavailable() {
		let fixture = fixture();

		let response = fixture.app.oneshot(delivery(envelope("fail"))).await.unwrap();

		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(
			fixture.telemetry.events(),
			vec![Event::Request, Event::Error]
		);
	}

	#[tokio::test]
	async fn undecodable_delivery_is_bad_request() {
		let fixture = fixture();
		let body = String::from(r#"{"message": {"data": "%%%", "messageId": "1"}}"#);

		let response = fixture.app.oneshot(delivery(body)).await.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		assert!(fixture.forwarder.0.lock().unwrap().is_empty());
		assert_eq!(fixture.telemetry.events(), vec![Event::Error]);
	}

	#[tokio::test]
	async fn malformed_json_is_bad_request() {
		let fixture = fixture();

		let response = fixture
			.app
			.oneshot(delivery(String::from("not json")))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		assert_eq!(fixture.telemetry.events(), vec![Event::Error]);
	}
}
