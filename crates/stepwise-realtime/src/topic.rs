// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topic addressing.
//!
//! A topic is the `(kind, env, channel, name)` address a message is published
//! to. Two topics are the same topic when their string keys match; run topics
//! hash the channel so user supplied channels never blow up key sizes.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;
use xxhash_rust::xxh64::xxh64;

/// Built-in topic receiving every step output on a channel.
pub const TOPIC_NAME_STEP: &str = "$step";

/// Built-in topic receiving every run result on a channel.
pub const TOPIC_NAME_RUN: &str = "$run";

/// Whether a topic carries run data or events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    /// Step output, run results and custom data published on a channel.
    Run,
    /// Pusher-style subscription to all events of a name.
    Event,
}

/// A realtime topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    /// Topic kind.
    pub kind: TopicKind,
    /// Environment the topic lives in. Stamped from auth when minting tokens.
    #[serde(default)]
    pub env_id: Uuid,
    /// Optional run filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Ulid>,
    /// Channel, typically a run id or a user defined string.
    #[serde(default)]
    pub channel: String,
    /// Topic name, eg. a step name or `$step`.
    #[serde(default)]
    pub name: String,
}

impl Topic {
    /// A run topic for `channel`/`name` in `env_id`.
    pub fn run(env_id: Uuid, channel: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Run,
            env_id,
            run_id: None,
            channel: channel.into(),
            name: name.into(),
        }
    }

    /// An event topic for `name` in `env_id`.
    pub fn event(env_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            kind: TopicKind::Event,
            env_id,
            run_id: None,
            channel: String::new(),
            name: name.into(),
        }
    }

    /// Registry key for this topic. Identical to the `Display` output.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

/// Hash of a channel name as used inside topic keys.
pub fn channel_hash(channel: &str) -> String {
    format!("{:x}", xxh64(channel.as_bytes(), 0))
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TopicKind::Run => write!(
                f,
                "{}:{}:{}",
                self.env_id,
                channel_hash(&self.channel),
                self.name
            ),
            TopicKind::Event => write!(f, "{}:{}", self.env_id, self.name),
        }
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
