//! Tool registry: maps operation names to async handlers.
//!
//! The dispatcher only relies on [`ToolRegistry::lookup`] and
//! [`ToolHandler::call`]. Registration happens before the server starts; the
//! registry is then shared read-only behind an `Arc`.

use crate::protocol::FaultCode;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a tool handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("{message}")]
    Failed { message: String },
}

impl ToolError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ToolError::Failed {
            message: message.into(),
        }
    }

    pub fn fault_code(&self) -> FaultCode {
        match self {
            ToolError::InvalidArguments { .. } => FaultCode::InvalidArguments,
            ToolError::Failed { .. } => FaultCode::HandlerError,
        }
    }

    /// Value carried by the `ok=false` result reporting this failure.
    pub fn to_value(&self) -> Value {
        json!({
            "message": self.to_string(),
            "errorType": self.fault_code().as_str(),
        })
    }
}

/// An invocable tool.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
struct FnTool<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        (self.0)(arguments).await
    }
}

/// Public description of a registered tool, as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the expected arguments.
    pub parameters: Value,
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

/// Name → handler table consulted by the dispatcher.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A tool registered under an existing name replaces it.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: impl ToolHandler,
    ) -> &mut Self {
        let name = name.into();
        let descriptor = ToolDescriptor {
            name: name.clone(),
            description: description.into(),
            parameters,
        };
        self.tools.insert(
            name,
            RegisteredTool {
                descriptor,
                handler: Arc::new(handler),
            },
        );
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.register(name, description, parameters, FnTool(f))
    }

    /// Register a synchronous, pure function as a handler.
    pub fn register_sync<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> &mut Self
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.register_fn(name, description, parameters, move |args| {
            std::future::ready(f(args))
        })
    }

    /// Find the handler for an operation.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|tool| tool.handler.clone())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors of every registered tool, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<_> = self
            .tools
            .values()
            .map(|tool| tool.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<String> {
        self.descriptors().into_iter().map(|d| d.name).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    #[async_trait::async_trait]
    impl ToolHandler for Doubler {
        async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
            let n = arguments["n"]
                .as_i64()
                .ok_or_else(|| ToolError::invalid("n must be an integer"))?;
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn test_lookup_and_call() {
        let mut registry = ToolRegistry::new();
        registry.register("double", "Doubles n", json!({"type": "object"}), Doubler);

        let handler = registry.lookup("double").unwrap();
        assert_eq!(handler.call(json!({"n": 21})).await.unwrap(), json!(42));
        assert!(registry.lookup("triple").is_none());
    }

    #[tokio::test]
    async fn test_handler_error_maps_to_invalid_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register("double", "Doubles n", json!({}), Doubler);

        let err = registry
            .lookup("double")
            .unwrap()
            .call(json!({"n": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.fault_code(), FaultCode::InvalidArguments);
        assert_eq!(err.to_value()["errorType"], "invalid-arguments");
    }

    #[tokio::test]
    async fn test_register_sync_and_fn() {
        let mut registry = ToolRegistry::new();
        registry
            .register_sync("len", "Length of a string", json!({}), |args| {
                Ok(json!(args.as_str().map(str::len).unwrap_or(0)))
            })
            .register_fn("fail", "Always fails", json!({}), |_args| async {
                Err(ToolError::failed("nope"))
            });

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.lookup("len").unwrap().call(json!("four")).await.unwrap(),
            json!(4)
        );
        let err = registry.lookup("fail").unwrap().call(Value::Null).await.unwrap_err();
        assert_eq!(err, ToolError::failed("nope"));
    }

    #[test]
    fn test_descriptors_sorted() {
        let mut registry = ToolRegistry::new();
        registry
            .register("zeta", "z", json!({}), Doubler)
            .register("alpha", "a", json!({}), Doubler);

        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert_eq!(registry.descriptors()[0].description, "a");
    }
}
