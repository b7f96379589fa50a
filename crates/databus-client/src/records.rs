//! Record wire shapes and payload codec.
//!
//! Records cross the wire inside a JSON envelope whose `payload` field is
//! a base64-encoded JSON document:
//!
//! ```text
//! {"records": [{"routingData": {"topic": "...", "shardingKey": "..."},
//!               "partition": 0, "offset": 0,
//!               "message": {"headers": {...}, "payload": "<base64>"}}]}
//! ```
//!
//! The consume side decodes pages of that shape into [`ConsumerRecord`]s;
//! the produce side builds the same envelope (minus partition/offset)
//! through [`ProduceRecord`] / [`ProduceRecords`].

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Content type for record payloads on the produce route.
pub const RECORDS_CONTENT_TYPE: &str = "application/vnd.dxl.intel.records.v1+json";

/// Topic routing information attached to every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingData {
    pub topic: String,
    #[serde(rename = "shardingKey", default)]
    pub sharding_key: String,
}

/// Record envelope: headers plus the base64-encoded payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMessage {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub payload: String,
}

/// One record as returned by the records route.
#[derive(Debug, Deserialize)]
pub(crate) struct ConsumedRecord {
    #[serde(rename = "routingData")]
    pub routing_data: RoutingData,
    #[serde(default)]
    pub partition: u32,
    #[serde(default)]
    pub offset: u64,
    pub message: RecordMessage,
}

/// One page of records as returned by the records route.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RecordsPage {
    #[serde(default)]
    pub records: Vec<ConsumedRecord>,
}

/// A consumed record with its payload decoded into structured data.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub sharding_key: String,
    pub partition: u32,
    pub offset: u64,
    pub headers: HashMap<String, String>,
    pub payload: serde_json::Value,
}

impl ConsumedRecord {
    /// Decode the base64 payload and parse it as JSON.
    ///
    /// A malformed payload is a permanent error: retrying the fetch
    /// returns the same bytes.
    pub(crate) fn decode(self) -> Result<ConsumerRecord> {
        let bytes = STANDARD.decode(self.message.payload.as_bytes()).map_err(|e| {
            Error::Permanent(format!(
                "record payload at {}/{}/{} is not valid base64: {e}",
                self.routing_data.topic, self.partition, self.offset
            ))
        })?;
        let payload = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Permanent(format!(
                "record payload at {}/{}/{} is not valid JSON: {e}",
                self.routing_data.topic, self.partition, self.offset
            ))
        })?;
        Ok(ConsumerRecord {
            topic: self.routing_data.topic,
            sharding_key: self.routing_data.sharding_key,
            partition: self.partition,
            offset: self.offset,
            headers: self.message.headers,
            payload,
        })
    }
}

/// A record to publish on the produce route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProduceRecord {
    #[serde(rename = "routingData")]
    pub routing_data: RoutingData,
    pub message: RecordMessage,
}

impl ProduceRecord {
    /// Build a record for `topic`, serializing and base64-encoding `payload`.
    pub fn new<P: Serialize + ?Sized>(topic: impl Into<String>, payload: &P) -> Result<Self> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| Error::Permanent(format!("payload serialization failed: {e}")))?;
        Ok(Self {
            routing_data: RoutingData {
                topic: topic.into(),
                sharding_key: String::new(),
            },
            message: RecordMessage {
                headers: HashMap::new(),
                payload: STANDARD.encode(bytes),
            },
        })
    }

    /// Set the sharding key.
    pub fn sharding_key(mut self, key: impl Into<String>) -> Self {
        self.routing_data.sharding_key = key.into();
        self
    }

    /// Attach a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.headers.insert(name.into(), value.into());
        self
    }
}

/// Payload body for the produce route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProduceRecords {
    pub records: Vec<ProduceRecord>,
}

impl ProduceRecords {
    /// A body carrying a single record.
    pub fn single(record: ProduceRecord) -> Self {
        Self {
            records: vec![record],
        }
    }
}

impl From<Vec<ProduceRecord>> for ProduceRecords {
    fn from(records: Vec<ProduceRecord>) -> Self {
        Self { records }
    }
}
