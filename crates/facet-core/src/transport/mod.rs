//! Client transport and server dispatcher over length-prefixed TCP.
//!
//! - [`RpcClient`]: correlated calls with timeouts and reconnection
//! - [`RpcServer`]: connection admission and concurrent request dispatch

mod backoff;
mod client;
mod pending;
mod server;

pub use backoff::ReconnectPolicy;
pub use client::{ConnectionState, LifecycleEvent, RpcClient};
pub use server::{RpcServer, RpcServerHandle};
