//! FACET Core - correlated request/response transport for tool servers.
//!
//! A client sends `request` envelopes naming an operation; the server looks
//! the operation up in a [`ToolRegistry`], runs it, and answers with exactly
//! one `result` or `fault` envelope carrying the same id. Envelopes travel as
//! length-prefixed JSON frames over TCP.
//!
//! # Example
//!
//! ```rust,no_run
//! use facet_core::{ClientConfig, RpcClient, RpcServer, ServerConfig, ToolRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> facet_core::Result<()> {
//!     let registry = Arc::new(ToolRegistry::builtin());
//!     let server = RpcServer::start(ServerConfig::new().with_port(0), registry).await?;
//!
//!     let client = RpcClient::connect_to(server.addr().to_string(), ClientConfig::new()).await?;
//!     let value = client.call("echo", json!({"x": 1})).await?;
//!     assert_eq!(value, json!({"x": 1}));
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod tools;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{ClientConfig, ServerConfig, TransportConfig};
pub use error::{FacetError, Result};
pub use protocol::{Body, DecodeFault, Envelope, FaultCode};
pub use registry::{ToolDescriptor, ToolError, ToolHandler, ToolRegistry};
pub use transport::{
    ConnectionState, LifecycleEvent, ReconnectPolicy, RpcClient, RpcServer, RpcServerHandle,
};
