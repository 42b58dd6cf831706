// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generator opcodes reported by SDKs.
//!
//! Each opcode is one unit of durable progress. Sync opcodes (a step that ran,
//! a step that failed, the run finishing) can be checkpointed in place; async
//! opcodes suspend the run and are handed to the executor.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

/// Operation carried by a [`GeneratorOpcode`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Nothing to do.
    None,
    /// A step ran and returned data.
    Step,
    /// A step ran and returned data.
    StepRun,
    /// A step errored and may be retried.
    StepError,
    /// A step failed permanently.
    StepFailed,
    /// A step was planned but not run.
    StepPlanned,
    /// The function returned.
    RunComplete,
    /// Sleep until a point in time.
    Sleep,
    /// Wait for a matching event.
    WaitForEvent,
    /// Invoke another function and wait for its result.
    InvokeFunction,
    /// Call an inference provider through the gateway.
    AIGateway,
    /// Make an HTTP request through the gateway.
    Gateway,
    /// Wait for a signal.
    WaitForSignal,
    /// An opcode this version does not know.
    Unknown(String),
}

impl Opcode {
    /// Wire name of the opcode.
    pub fn as_str(&self) -> &str {
        match self {
            Opcode::None => "None",
            Opcode::Step => "Step",
            Opcode::StepRun => "StepRun",
            Opcode::StepError => "StepError",
            Opcode::StepFailed => "StepFailed",
            Opcode::StepPlanned => "StepPlanned",
            Opcode::RunComplete => "RunComplete",
            Opcode::Sleep => "Sleep",
            Opcode::WaitForEvent => "WaitForEvent",
            Opcode::InvokeFunction => "InvokeFunction",
            Opcode::AIGateway => "AIGateway",
            Opcode::Gateway => "Gateway",
            Opcode::WaitForSignal => "WaitForSignal",
            Opcode::Unknown(name) => name,
        }
    }

    /// Whether the opcode suspends the run. Unknown opcodes are async so that
    /// they reach the executor instead of being dropped.
    pub fn is_async(&self) -> bool {
        !matches!(
            self,
            Opcode::None
                | Opcode::Step
                | Opcode::StepRun
                | Opcode::StepError
                | Opcode::StepFailed
                | Opcode::StepPlanned
                | Opcode::RunComplete
        )
    }
}

impl From<&str> for Opcode {
    fn from(s: &str) -> Self {
        match s {
            "None" => Opcode::None,
            "Step" => Opcode::Step,
            "StepRun" => Opcode::StepRun,
            "StepError" => Opcode::StepError,
            "StepFailed" => Opcode::StepFailed,
            "StepPlanned" => Opcode::StepPlanned,
            "RunComplete" => Opcode::RunComplete,
            "Sleep" => Opcode::Sleep,
            "WaitForEvent" => Opcode::WaitForEvent,
            "InvokeFunction" => Opcode::InvokeFunction,
            "AIGateway" => Opcode::AIGateway,
            "Gateway" => Opcode::Gateway,
            "WaitForSignal" => Opcode::WaitForSignal,
            other => Opcode::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Opcode {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Opcode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(Opcode::from(s.as_str()))
    }
}

/// Start and end of a step, in epoch milliseconds. Serialized as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(i64, i64)", into = "(i64, i64)")]
pub struct Timing {
    /// Start, epoch milliseconds.
    pub start: i64,
    /// End, epoch milliseconds.
    pub end: i64,
}

impl Timing {
    /// Timing covering the given instants.
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: start.timestamp_millis(),
            end: end.timestamp_millis(),
        }
    }

    /// Start as a timestamp.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.start).single()
    }

    /// End as a timestamp.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.end).single()
    }
}

impl From<(i64, i64)> for Timing {
    fn from((start, end): (i64, i64)) -> Self {
        Self { start, end }
    }
}

impl From<Timing> for (i64, i64) {
    fn from(t: Timing) -> Self {
        (t.start, t.end)
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Error raised by user code in a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserError {
    /// Error class.
    #[serde(default)]
    pub name: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Stack trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Extra data attached to the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single unit of progress reported by user code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOpcode {
    /// Operation.
    pub op: Opcode,
    /// Hashed step id, stable across attempts.
    pub id: String,
    /// Step name.
    #[serde(default)]
    pub name: String,
    /// Name to show instead of `name`.
    #[serde(
        rename = "displayName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
    /// Opcode specific options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<Value>,
    /// Opaque step data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Step error, for `StepError` and `StepFailed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
    /// When the step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
}

impl GeneratorOpcode {
    /// An opcode of the given kind with no payload.
    pub fn new(op: Opcode, id: impl Into<String>) -> Self {
        Self {
            op,
            id: id.into(),
            name: String::new(),
            display_name: None,
            opts: None,
            data: None,
            error: None,
            timing: None,
        }
    }

    /// Attach step data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a step name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach timing.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Attach an error.
    pub fn with_error(mut self, error: UserError) -> Self {
        self.error = Some(error);
        self
    }

    /// Whether the opcode suspends the run.
    pub fn is_async(&self) -> bool {
        self.op.is_async()
    }

    /// Name the user gave the step.
    pub fn user_defined_name(&self) -> &str {
        match &self.display_name {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }

    /// The value stored as this step's output.
    pub fn output(&self) -> serde_json::Result<Vec<u8>> {
        match self.op {
            Opcode::Step | Opcode::StepRun => {
                serde_json::to_vec(&json!({ "data": self.data.clone().unwrap_or(Value::Null) }))
            }
            Opcode::StepError | Opcode::StepFailed => {
                serde_json::to_vec(&json!({ "error": self.error }))
            }
            _ => match &self.data {
                Some(data) => serde_json::to_vec(data),
                None => Ok(Vec::new()),
            },
        }
    }

    /// Seed for span ids of this opcode: the step id followed by its timing.
    pub fn span_seed(&self) -> Vec<u8> {
        let mut seed = self.id.clone().into_bytes();
        if let Some(timing) = &self.timing {
            seed.extend_from_slice(timing.to_string().as_bytes());
        }
        seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_names_roundtrip() {
        for name in [
            "None",
            "Step",
            "StepRun",
            "StepError",
            "StepFailed",
            "StepPlanned",
            "RunComplete",
            "Sleep",
            "WaitForEvent",
            "InvokeFunction",
            "AIGateway",
            "Gateway",
            "WaitForSignal",
        ] {
            let op = Opcode::from(name);
            assert!(!matches!(op, Opcode::Unknown(_)), "{}", name);
            assert_eq!(op.as_str(), name);
        }
    }

    #[test]
    fn test_unknown_opcodes_are_async() {
        let op: Opcode = serde_json::from_str("\"Teleport\"").unwrap();
        assert_eq!(op, Opcode::Unknown("Teleport".to_string()));
        assert!(op.is_async());
        assert_eq!(serde_json::to_string(&op).unwrap(), "\"Teleport\"");
    }

    #[test]
    fn test_async_classification() {
        assert!(!Opcode::StepRun.is_async());
        assert!(!Opcode::RunComplete.is_async());
        assert!(!Opcode::StepPlanned.is_async());
        assert!(Opcode::Sleep.is_async());
        assert!(Opcode::WaitForEvent.is_async());
        assert!(Opcode::InvokeFunction.is_async());
        assert!(Opcode::AIGateway.is_async());
    }

    #[test]
    fn test_decode_sdk_payload() {
        let op: GeneratorOpcode = serde_json::from_str(
            r#"{"op":"StepRun","id":"s1","name":"fetch","displayName":"Fetch user",
                "data":{"result":1},"timing":[1700000000000,1700000000100]}"#,
        )
        .unwrap();

        assert_eq!(op.op, Opcode::StepRun);
        assert_eq!(op.user_defined_name(), "Fetch user");
        assert_eq!(op.timing.unwrap().to_string(), "1700000000000-1700000000100");
        assert_eq!(op.output().unwrap(), br#"{"data":{"result":1}}"#.to_vec());
    }

    #[test]
    fn test_error_output() {
        let op = GeneratorOpcode::new(Opcode::StepError, "s2").with_error(UserError {
            name: "Error".to_string(),
            message: "boom".to_string(),
            stack: None,
            data: None,
        });
        let out: Value = serde_json::from_slice(&op.output().unwrap()).unwrap();
        assert_eq!(out["error"]["message"], "boom");
    }

    #[test]
    fn test_user_defined_name_falls_back_to_name() {
        let op = GeneratorOpcode::new(Opcode::Step, "s").with_name("plain");
        assert_eq!(op.user_defined_name(), "plain");
    }

    #[test]
    fn test_span_seed_includes_timing() {
        let op = GeneratorOpcode::new(Opcode::StepRun, "step-1").with_timing(Timing {
            start: 10,
            end: 20,
        });
        assert_eq!(op.span_seed(), b"step-110-20".to_vec());
    }
}
