use crate::notification::Notification;
use crate::types::US;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key of the delivery id in the dump, as read by existing consumers of the shared folder.
const DELIVERY_ID_KEY: &str = "pubsubMessageId";

/// Writes the notification of every C-STORE to `{folder}/{message_id}.json`, so that
/// operators can correlate DIMSE message ids with notifications.
#[derive(Debug, Clone)]
pub struct MessageDump {
	folder: PathBuf,
}

impl MessageDump {
	pub const fn new(folder: PathBuf) -> Self {
		Self { folder }
	}

	pub fn path(&self, message_id: US) -> PathBuf {
		self.folder.join(format!("{message_id}.json"))
	}

	/// Writes the dump in the background. Failures are only logged.
	pub fn spawn(&self, message_id: US, notification: &Notification) {
		let dump = self.clone();
		let notification = notification.clone();
		tokio::spawn(async move { dump.write(message_id, &notification).await });
	}

	pub async fn write(&self, message_id: US, notification: &Notification) {
		let path = self.path(message_id);
		if let Err(err) = write_json(&path, notification).await {
			warn!(path = %path.display(), "Failed to write message dump: {err}");
		} else {
			debug!(path = %path.display(), "Wrote message dump");
		}
	}
}

async fn write_json(path: &Path, notification: &Notification) -> anyhow::Result<()> {
	let mut content: BTreeMap<&str, &str> = notification
		.attributes
		.iter()
		.map(|(key, value)| (key.as_str(), value.as_str()))
		.collect();
	content.insert(DELIVERY_ID_KEY, &notification.delivery_id);
	content.insert("data", notification.locator.as_str());

	let json = serde_json::to_string_pretty(&content)?;
	tokio::fs::write(path, json).await?;
	Ok(())
}
