// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch for functions hosted in the same process as the engine.
//!
//! Each function is registered with its input type. Registration stores a
//! decoder and a handler behind trait objects, so dispatch only needs the slug
//! and the raw input bytes.
//!
//! Handlers leave a step early by returning a [`StepFailure`]; the registry
//! turns every result into a [`StepOutcome`], which maps onto the opcodes the
//! checkpoint engine consumes.
//!
//! ```ignore
//! let mut registry = FunctionRegistry::new();
//! registry.register("greet", |name: String| async move {
//!     Ok::<_, StepFailure>(format!("hello {name}"))
//! });
//! let outcome = registry.invoke("greet", br#""ada""#).await?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::api_result::ApiResult;
use crate::error::{CoreError, Result};
use crate::opcode::{GeneratorOpcode, Opcode, UserError};

/// Step id used for the opcode that completes a run.
pub const COMPLETE_STEP_ID: &str = "complete";

/// Step id used for the opcode reporting a function error.
pub const ERROR_STEP_ID: &str = "error";

/// How a handler stops before returning its output.
#[derive(Debug, Clone, PartialEq)]
pub enum StepFailure {
    /// A step produced output. The function is re-entered later with it.
    Completed {
        /// Hashed step id.
        id: String,
        /// Step output.
        output: Value,
    },
    /// A step suspends the run, for example a sleep.
    Deferred(GeneratorOpcode),
    /// The function failed.
    Error(String),
}

impl StepFailure {
    /// A finished step with a serializable output.
    pub fn completed<T: Serialize>(id: impl Into<String>, output: &T) -> Self {
        match serde_json::to_value(output) {
            Ok(output) => StepFailure::Completed {
                id: id.into(),
                output,
            },
            Err(e) => StepFailure::Error(format!("error serializing step output: {}", e)),
        }
    }

    /// A function error.
    pub fn error(message: impl fmt::Display) -> Self {
        StepFailure::Error(message.to_string())
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Completed { id, .. } => write!(f, "step {} completed", id),
            StepFailure::Deferred(op) => write!(f, "step {} deferred with {}", op.id, op.op),
            StepFailure::Error(message) => f.write_str(message),
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A step finished with `output`.
    StepCompleted {
        /// Hashed step id.
        id: String,
        /// Step output.
        output: Value,
    },
    /// A step suspended the run.
    StepDeferred(GeneratorOpcode),
    /// The function returned.
    FunctionReturned(Value),
    /// The function failed.
    FunctionErrored(String),
}

impl StepOutcome {
    /// The opcode reporting this outcome to the checkpoint engine.
    pub fn into_opcode(self) -> Result<GeneratorOpcode> {
        let op = match self {
            StepOutcome::StepCompleted { id, output } => {
                GeneratorOpcode::new(Opcode::StepRun, id).with_data(output)
            }
            StepOutcome::StepDeferred(op) => op,
            StepOutcome::FunctionReturned(value) => {
                let result = ApiResult::json(&value)?;
                GeneratorOpcode::new(Opcode::RunComplete, COMPLETE_STEP_ID)
                    .with_data(json!({ "data": result }))
            }
            StepOutcome::FunctionErrored(message) => {
                GeneratorOpcode::new(Opcode::StepError, ERROR_STEP_ID).with_error(UserError {
                    name: "Error".to_string(),
                    message,
                    stack: None,
                    data: None,
                })
            }
        };
        Ok(op)
    }
}

impl From<StepFailure> for StepOutcome {
    fn from(failure: StepFailure) -> Self {
        match failure {
            StepFailure::Completed { id, output } => StepOutcome::StepCompleted { id, output },
            StepFailure::Deferred(op) => StepOutcome::StepDeferred(op),
            StepFailure::Error(message) => StepOutcome::FunctionErrored(message),
        }
    }
}

type Input = Box<dyn Any + Send>;
type Decoder = Box<dyn Fn(&[u8]) -> std::result::Result<Input, String> + Send + Sync>;
type Handler =
    Box<dyn Fn(Input) -> BoxFuture<'static, std::result::Result<Value, StepFailure>> + Send + Sync>;

struct Registered {
    decode: Decoder,
    handle: Handler,
}

/// Functions callable by slug.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<Registered>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut slugs: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("functions", &slugs)
            .finish()
    }
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `slug`, replacing any previous registration.
    pub fn register<I, O, F, Fut>(&mut self, slug: impl Into<String>, handler: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, StepFailure>> + Send + 'static,
    {
        let decode: Decoder = Box::new(|bytes: &[u8]| {
            serde_json::from_slice::<I>(bytes)
                .map(|input| Box::new(input) as Input)
                .map_err(|e| format!("error decoding function input: {}", e))
        });

        let handle: Handler = Box::new(move |input: Input| {
            let input = match input.downcast::<I>() {
                Ok(input) => *input,
                Err(_) => {
                    return futures::future::ready(Err(StepFailure::error(
                        "function input has the wrong type",
                    )))
                    .boxed();
                }
            };
            let fut = handler(input);
            async move {
                let output = fut.await?;
                serde_json::to_value(&output)
                    .map_err(|e| StepFailure::error(format!("error serializing function output: {}", e)))
            }
            .boxed()
        });

        self.functions
            .insert(slug.into(), Arc::new(Registered { decode, handle }));
        self
    }

    /// Whether `slug` is registered.
    pub fn contains(&self, slug: &str) -> bool {
        self.functions.contains_key(slug)
    }

    /// Registered slugs, sorted.
    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.functions.keys().cloned().collect();
        slugs.sort_unstable();
        slugs
    }

    /// Run the function registered under `slug` with JSON `input`.
    ///
    /// Only an unknown slug is an error. Everything the function does is
    /// reported through the returned outcome.
    pub async fn invoke(&self, slug: &str, input: &[u8]) -> Result<StepOutcome> {
        let registered = self
            .functions
            .get(slug)
            .cloned()
            .ok_or_else(|| CoreError::FunctionNotFound {
                function: slug.to_string(),
            })?;

        let input = match (registered.decode)(input) {
            Ok(input) => input,
            Err(message) => {
                debug!(slug, error = %message, "rejecting function input");
                return Ok(StepOutcome::FunctionErrored(message));
            }
        };

        let outcome = match (registered.handle)(input).await {
            Ok(value) => StepOutcome::FunctionReturned(value),
            Err(failure) => failure.into(),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Order {
        id: u32,
        paid: bool,
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry
            .register("ship", |order: Order| async move {
                if !order.paid {
                    return Err(StepFailure::completed("charge", &json!({ "order": order.id })));
                }
                Ok(json!({ "shipped": order.id }))
            })
            .register("fail", |_: Value| async move {
                Err::<Value, _>(StepFailure::error("boom"))
            })
            .register("nap", |_: Value| async move {
                Err::<Value, _>(StepFailure::Deferred(GeneratorOpcode::new(
                    Opcode::Sleep,
                    "nap",
                )))
            });
        registry
    }

    #[tokio::test]
    async fn test_function_returned() {
        let outcome = registry()
            .invoke("ship", br#"{"id":7,"paid":true}"#)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::FunctionReturned(json!({ "shipped": 7 })));
    }

    #[tokio::test]
    async fn test_step_completed() {
        let outcome = registry()
            .invoke("ship", br#"{"id":7,"paid":false}"#)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::StepCompleted {
                id: "charge".to_string(),
                output: json!({ "order": 7 }),
            }
        );
    }

    #[tokio::test]
    async fn test_errors_and_deferrals() {
        let registry = registry();
        assert_eq!(
            registry.invoke("fail", b"null").await.unwrap(),
            StepOutcome::FunctionErrored("boom".to_string())
        );
        match registry.invoke("nap", b"{}").await.unwrap() {
            StepOutcome::StepDeferred(op) => assert_eq!(op.op, Opcode::Sleep),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_input_is_a_function_error() {
        match registry().invoke("ship", b"{\"id\":\"x\"}").await.unwrap() {
            StepOutcome::FunctionErrored(message) => {
                assert!(message.starts_with("error decoding function input"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_slug() {
        let err = registry().invoke("nope", b"{}").await.unwrap_err();
        assert!(matches!(err, CoreError::FunctionNotFound { .. }));
    }

    #[test]
    fn test_into_opcode() {
        let op = StepOutcome::StepCompleted {
            id: "s1".to_string(),
            output: json!(1),
        }
        .into_opcode()
        .unwrap();
        assert_eq!(op.op, Opcode::StepRun);
        assert_eq!(op.output().unwrap(), br#"{"data":1}"#.to_vec());

        let op = StepOutcome::FunctionReturned(json!({ "ok": true }))
            .into_opcode()
            .unwrap();
        assert_eq!(op.op, Opcode::RunComplete);
        let data: crate::api_result::RunCompleteData =
            serde_json::from_value(op.data.unwrap()).unwrap();
        assert_eq!(data.data.status_code, 200);
        assert_eq!(data.data.body.unwrap(), br#"{"ok":true}"#.to_vec());

        let op = StepOutcome::FunctionErrored("boom".to_string())
            .into_opcode()
            .unwrap();
        assert_eq!(op.op, Opcode::StepError);
        assert_eq!(op.error.unwrap().message, "boom");
    }

    #[test]
    fn test_slugs_sorted() {
        assert_eq!(registry().slugs(), vec!["fail", "nap", "ship"]);
        assert!(registry().contains("ship"));
    }
}
