// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Realtime wire records.
//!
//! [`Message`] is what producers publish into the broadcaster; [`Chunk`] is a
//! fragment of a data stream opened by a `datastream-start` message and closed
//! by a `datastream-end` message. Both serialize to the canonical JSON shapes
//! read by SDK subscribers.

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{RealtimeError, Result};
use crate::topic::{TOPIC_NAME_RUN, TOPIC_NAME_STEP, Topic, TopicKind};

/// The kind of payload carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Step output.
    #[serde(rename = "step")]
    Step,
    /// A run's return value.
    #[serde(rename = "run")]
    Run,
    /// Arbitrary data published on a channel.
    #[serde(rename = "data")]
    Data,
    /// Opens a data stream; data is the stream id.
    #[serde(rename = "datastream-start")]
    DataStreamStart,
    /// A stream fragment. Only ever written as a [`Chunk`].
    #[serde(rename = "chunk")]
    DataStreamChunk,
    /// Closes a data stream; data is the stream id.
    #[serde(rename = "datastream-end")]
    DataStreamEnd,
    /// Event data.
    #[serde(rename = "event")]
    Event,
    /// Keepalive.
    #[serde(rename = "ping")]
    Ping,
    /// In-band subscribe request; data is a realtime token.
    #[serde(rename = "sub")]
    Subscribe,
    /// In-band unsubscribe request; data is a list of topics.
    #[serde(rename = "unsub")]
    Unsubscribe,
    /// The server is shutting down this connection.
    #[serde(rename = "closing")]
    Closing,
}

/// A message published on realtime topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// What the message carries.
    pub kind: MessageKind,
    /// Raw payload. Rendered verbatim when it is valid JSON, otherwise as a
    /// JSON string.
    #[serde(with = "raw_data", default)]
    pub data: Bytes,
    /// Optional JSON metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Creation time, millisecond precision.
    #[serde(with = "millis", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Channel the message was published on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    /// Environment the message belongs to.
    #[serde(default, skip_serializing_if = "Uuid::is_nil")]
    pub env_id: Uuid,
    /// Topic name. Rewritten to the concrete topic on delivery.
    #[serde(default)]
    pub topic: String,
    /// Function that produced the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fn_id: Option<Uuid>,
    /// Slug of the producing function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fn_slug: Option<String>,
    /// Run that produced the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Ulid>,
}

impl Message {
    /// Create a message carrying raw `data` bytes.
    pub fn new(kind: MessageKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
            metadata: None,
            created_at: Utc::now().trunc_subsecs(3),
            channel: String::new(),
            env_id: Uuid::nil(),
            topic: String::new(),
            fn_id: None,
            fn_slug: None,
            run_id: None,
        }
    }

    /// Create a message whose data is the JSON encoding of `value`.
    pub fn json<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value)?;
        Ok(Self::new(kind, data))
    }

    /// Set the channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the environment.
    pub fn with_env(mut self, env_id: Uuid) -> Self {
        self.env_id = env_id;
        self
    }

    /// Set the topic name.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Check stream messages carry a usable stream id.
    pub fn validate(&self) -> Result<()> {
        if matches!(
            self.kind,
            MessageKind::DataStreamStart | MessageKind::DataStreamEnd
        ) {
            if self.data.is_empty() {
                return Err(RealtimeError::Validation(
                    "datastream kinds must have a stream id set".to_string(),
                ));
            }
            if self.data.contains(&b':') {
                return Err(RealtimeError::Validation(
                    "datastream stream id must not contain colons (:)".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Topics this message fans out to.
    pub fn topics(&self) -> Vec<Topic> {
        let topic = |name: &str| Topic {
            kind: TopicKind::Run,
            env_id: self.env_id,
            run_id: None,
            channel: self.channel.clone(),
            name: name.to_string(),
        };

        match self.kind {
            MessageKind::Step => vec![topic(TOPIC_NAME_STEP), topic(&self.topic)],
            MessageKind::Run if self.topic.is_empty() => vec![topic(TOPIC_NAME_RUN)],
            MessageKind::Run => vec![topic(TOPIC_NAME_RUN), topic(&self.topic)],
            _ => vec![topic(&self.topic)],
        }
    }

    /// Stream id carried by a stream start/end message.
    ///
    /// Messages decoded from the wire carry the id as a JSON string; locally
    /// built ones carry the bare bytes.
    pub fn stream_id(&self) -> String {
        match serde_json::from_slice::<String>(&self.data) {
            Ok(id) => id,
            Err(_) => String::from_utf8_lossy(&self.data).into_owned(),
        }
    }

    /// JSON encoding of the message.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A fragment of a data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Always `"chunk"`.
    pub kind: String,
    /// Stream the chunk belongs to. Never contains `:`.
    pub stream_id: String,
    /// Chunk payload.
    pub data: String,
    /// Function that produced the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fn_id: Option<Uuid>,
    /// Slug of the producing function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fn_slug: Option<String>,
    /// Run that produced the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Ulid>,
}

impl Chunk {
    /// JSON encoding of the chunk.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Build a chunk belonging to the stream opened by `parent`.
pub fn chunk_from_message(parent: &Message, data: impl Into<String>) -> Chunk {
    Chunk {
        kind: "chunk".to_string(),
        stream_id: parent.stream_id(),
        data: data.into(),
        fn_id: parent.fn_id,
        fn_slug: parent.fn_slug.clone(),
        run_id: parent.run_id,
    }
}

mod raw_data {
    use super::*;

    pub fn serialize<S: Serializer>(data: &Bytes, s: S) -> std::result::Result<S::Ok, S::Error> {
        if data.is_empty() {
            return s.serialize_none();
        }
        match serde_json::from_slice::<&RawValue>(data) {
            Ok(raw) => raw.serialize(s),
            Err(_) => s.serialize_str(&String::from_utf8_lossy(data)),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Bytes, D::Error> {
        let raw: Option<Box<RawValue>> = Option::deserialize(d)?;
        Ok(match raw {
            Some(raw) if raw.get() != "null" => Bytes::copy_from_slice(raw.get().as_bytes()),
            _ => Bytes::new(),
        })
    }
}

mod millis {
    use super::*;
    use chrono::SecondsFormat;

    pub fn serialize<S: Serializer>(
        dt: &DateTime<Utc>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        DateTime::<Utc>::deserialize(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_order_and_omissions() {
        let msg = Message::new(MessageKind::Data, r#"{"a":1}"#)
            .with_channel("user:123")
            .with_topic("ai");

        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert!(json.starts_with(r#"{"kind":"data","data":{"a":1},"created_at":""#));
        assert!(json.contains(r#""channel":"user:123""#));
        assert!(json.ends_with(r#""topic":"ai"}"#));
        assert!(!json.contains("env_id"));
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn test_invalid_json_data_becomes_string() {
        let msg = Message::new(MessageKind::DataStreamStart, "stream-1");
        let value: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["data"], "stream-1");
    }

    #[test]
    fn test_created_at_millis() {
        let msg = Message::new(MessageKind::Ping, "");
        let value: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        let ts = value["created_at"].as_str().unwrap();
        // 2024-01-01T00:00:00.000Z
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_wire_roundtrip_preserves_message() {
        let env = Uuid::new_v4();
        let mut msg = Message::new(MessageKind::Step, r#""hello""#)
            .with_env(env)
            .with_channel("run-1")
            .with_topic("fetch");
        msg.fn_slug = Some("app-fn".to_string());
        msg.run_id = Some(Ulid::new());

        let decoded: Message = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_validate_stream_ids() {
        assert!(Message::new(MessageKind::DataStreamStart, "").validate().is_err());
        assert!(
            Message::new(MessageKind::DataStreamStart, "a:b")
                .validate()
                .is_err()
        );
        assert!(Message::new(MessageKind::DataStreamEnd, "").validate().is_err());
        assert!(Message::new(MessageKind::DataStreamStart, "abc").validate().is_ok());
        // Colons are only forbidden for stream kinds.
        assert!(Message::new(MessageKind::Data, r#""a:b""#).validate().is_ok());
    }

    #[test]
    fn test_step_topics() {
        let env = Uuid::new_v4();
        let msg = Message::new(MessageKind::Step, "1")
            .with_env(env)
            .with_channel("c")
            .with_topic("my-step");

        let topics = msg.topics();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].name, TOPIC_NAME_STEP);
        assert_eq!(topics[1].name, "my-step");
        assert!(topics.iter().all(|t| t.kind == TopicKind::Run && t.env_id == env));
    }

    #[test]
    fn test_run_topics() {
        let msg = Message::new(MessageKind::Run, "1").with_channel("c");
        let topics = msg.topics();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, TOPIC_NAME_RUN);

        let topics = msg.with_topic("custom").topics();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[1].name, "custom");
    }

    #[test]
    fn test_default_topics() {
        let msg = Message::new(MessageKind::Data, "1")
            .with_channel("c")
            .with_topic("t");
        let topics = msg.topics();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "t");
        assert_eq!(topics[0].channel, "c");
    }

    #[test]
    fn test_chunk_from_message() {
        let mut parent = Message::new(MessageKind::DataStreamStart, "s1");
        parent.run_id = Some(Ulid::new());

        let chunk = chunk_from_message(&parent, "hello");
        assert_eq!(chunk.kind, "chunk");
        assert_eq!(chunk.stream_id, "s1");
        assert_eq!(chunk.run_id, parent.run_id);

        // Decoded messages carry the id as a JSON string.
        let decoded: Message = serde_json::from_slice(&parent.to_json().unwrap()).unwrap();
        assert_eq!(chunk_from_message(&decoded, "x").stream_id, "s1");
    }
}
