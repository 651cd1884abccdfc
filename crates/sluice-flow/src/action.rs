//! User actions and the process-wide registry.
//!
//! An [`Action`] is user code identified by name. Tasks reference actions by
//! [`crate::dag::Task::action_name`]; the executor resolves them through the
//! [`ActionRegistry`], which is populated during boot and read concurrently
//! (without locks) afterwards.
//!
//! The run hooks mirror the task state machine: `run_before` fires on the
//! `init` branch, `run` between `running` and `ending`, `run_after` on the
//! `ending` branch, and `retry_before` when a retry re-enters the task.
//! `retry_before` leads back to `init`, so `run_before` fires again on the
//! second pass; implementations must be idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::ExecuteContext;
use crate::error::{ActionError, Error, Result};

/// Result type for action hooks.
pub type ActionOutcome = std::result::Result<(), ActionError>;

/// User code executed by tasks.
///
/// `run` must observe the context's cancellation token: cancellation is
/// cooperative, and a `cancel` command only takes effect when the action
/// notices. Actions run at least once per task attempt and must be
/// idempotent.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry key; unique across the process.
    fn name(&self) -> &str;

    /// The task body.
    async fn run(&self, ctx: &ExecuteContext, params: &Value) -> ActionOutcome;

    /// Runs before `run` on the `init` branch. Default: no-op.
    async fn run_before(&self, _ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        Ok(())
    }

    /// Runs after `run` on the `ending` branch. Default: no-op.
    async fn run_after(&self, _ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        Ok(())
    }

    /// Runs when a retry re-enters the task, before it passes back through
    /// `init`. Default: no-op.
    async fn retry_before(&self, _ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        Ok(())
    }
}

/// Process-wide action registry.
///
/// Mutable only during boot; the engine freezes it behind an `Arc` before any
/// component starts.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action under its name, replacing any previous entry.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    /// Resolves an action by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Returns the registered action names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Decodes rendered params into an action's typed container.
///
/// Decoding is *weak*: when a direct decode fails, string leaves that parse
/// as numbers or booleans are coerced and the decode retried. This mirrors
/// how rendered placeholders turn numeric values into strings.
///
/// # Errors
///
/// Returns [`Error::Decode`] when the value does not fit the target type
/// even after coercion.
pub fn decode_params<T: DeserializeOwned>(value: &Value) -> Result<T> {
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Ok(decoded),
        Err(first_err) => {
            let coerced = coerce_strings(value);
            serde_json::from_value(coerced).map_err(|_| Error::decode(first_err.to_string()))
        }
    }
}

/// Rewrites string leaves that parse as numbers or booleans.
fn coerce_strings(value: &Value) -> Value {
    match value {
        Value::String(text) => {
            if let Ok(int) = text.parse::<i64>() {
                return Value::from(int);
            }
            if let Ok(float) = text.parse::<f64>() {
                return Value::from(float);
            }
            if let Ok(flag) = text.parse::<bool>() {
                return Value::from(flag);
            }
            value.clone()
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), coerce_strings(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(coerce_strings).collect()),
        other => other.clone(),
    }
}

/// Built-in action that sleeps for `waitMs` milliseconds, observing
/// cancellation.
///
/// Registered at boot so DAGs always have a pause primitive available.
#[derive(Debug, Default)]
pub struct Waiting;

/// Parameters of the [`Waiting`] action.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingParams {
    /// How long to wait, in milliseconds.
    #[serde(default)]
    pub wait_ms: u64,
}

#[async_trait]
impl Action for Waiting {
    fn name(&self) -> &str {
        "waiting"
    }

    async fn run(&self, ctx: &ExecuteContext, params: &Value) -> ActionOutcome {
        let params: WaitingParams = decode_params(params)?;
        let wait = std::time::Duration::from_millis(params.wait_ms);
        tokio::select! {
            () = ctx.cancellation().cancelled() => {
                Err("wait interrupted by cancellation".into())
            }
            () = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, serde::Deserialize)]
    struct DemoParams {
        url: String,
        retries: u32,
        verbose: bool,
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Waiting));

        assert!(registry.get("waiting").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["waiting".to_string()]);
    }

    #[test]
    fn decode_direct() {
        let value = json!({"url": "http://example.com", "retries": 3, "verbose": true});
        let params: DemoParams = decode_params(&value).unwrap();
        assert_eq!(params.url, "http://example.com");
        assert_eq!(params.retries, 3);
        assert!(params.verbose);
    }

    #[test]
    fn decode_coerces_stringly_typed_values() {
        let value = json!({"url": "http://example.com", "retries": "3", "verbose": "true"});
        let params: DemoParams = decode_params(&value).unwrap();
        assert_eq!(params.retries, 3);
        assert!(params.verbose);
    }

    #[test]
    fn decode_failure_is_reported() {
        let value = json!({"url": 1, "retries": "many", "verbose": "yes"});
        assert!(decode_params::<DemoParams>(&value).is_err());
    }

    #[test]
    fn waiting_params_default() {
        let params: WaitingParams = decode_params(&json!({})).unwrap();
        assert_eq!(params.wait_ms, 0);
    }
}
