use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Result;

/// Event metadata.
///
/// Field names on the wire (`event_uuid`, `cid`, `producer`) are shared with
/// producers and consumers written in other languages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(rename = "event_uuid")]
    pub event_id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(rename = "cid")]
    pub correlation_id: String,
    #[serde(rename = "producer")]
    pub producer_id: String,
    pub created_at: DateTime<Utc>,
}

/// An emitted event: opaque payload plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub payload: Value,
    pub meta: EventMeta,
}

impl Event {
    /// Build a fresh event, generating ids that were not supplied.
    pub fn new(
        name: impl Into<String>,
        payload: Value,
        version: Option<u32>,
        correlation_id: Option<String>,
        producer_id: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            meta: EventMeta {
                event_id: new_token(),
                name: name.into(),
                version,
                correlation_id: correlation_id.unwrap_or_else(new_token),
                producer_id: producer_id.into(),
                created_at: Utc::now(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn version(&self) -> Option<u32> {
        self.meta.version
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// 32 hex characters, no dashes.
fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}
