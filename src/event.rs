//! JSON `resource_change` purge events.
//!
//! Only the fields the dispatcher consumes are modeled; everything else in
//! the payload is ignored. Timestamps are auxiliary information: a badly
//! formatted date is logged and replaced with the current time rather than
//! failing the whole event, so purges are never dropped over formatting
//! alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("the message did not contain a valid URL")]
    MissingUri,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Wire timestamp with lenient decoding.
#[derive(Debug, Clone, Copy)]
pub struct EventTime(pub DateTime<Utc>);

impl Default for EventTime {
    fn default() -> Self {
        EventTime(Utc::now())
    }
}

impl<'de> Deserialize<'de> for EventTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // 'date-time' in the event schema is the RFC 3339 internet-time.
        // Timestamps are auxiliary, so a wrong type or a bad format decodes
        // as the current time instead of failing the event.
        let raw = serde_json::Value::deserialize(deserializer)?;
        if let serde_json::Value::String(text) = &raw {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Ok(EventTime(parsed.with_timezone(&Utc)));
            }
        }
        warn!("invalid timestamp found: {raw}");
        Ok(EventTime(Utc::now()))
    }
}

#[derive(Debug, Deserialize)]
struct EventMeta {
    /// UTC event datetime.
    #[serde(default)]
    dt: EventTime,
    /// Unique URI identifying the changed entity.
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootEvent {
    /// Timestamp of the root event that triggered this one.
    #[serde(default)]
    dt: EventTime,
}

/// A change in a resource tied to the specified URI.
#[derive(Debug, Deserialize)]
pub struct ResourceChange {
    meta: EventMeta,
    #[serde(default)]
    root_event: Option<RootEvent>,
    #[serde(default)]
    tags: Vec<String>,
}

impl ResourceChange {
    /// Decode one event. Events without a URI are rejected.
    pub fn from_json(data: &[u8]) -> Result<Self, EventError> {
        let change: ResourceChange = serde_json::from_slice(data)?;
        if change.meta.uri.is_none() {
            return Err(EventError::MissingUri);
        }
        Ok(change)
    }

    /// The URL to purge.
    pub fn url(&self) -> &str {
        self.meta.uri.as_deref().unwrap_or_default()
    }

    /// When the change originated: the root event if defined, else the event
    /// itself.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.root_event
            .as_ref()
            .map_or(self.meta.dt.0, |root| root.dt.0)
    }

    /// First tag, used as a metric label.
    pub fn tag(&self) -> Option<&str> {
        self.tags.first().map(String::as_str)
    }
}
