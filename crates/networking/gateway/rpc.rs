//! Registration-based RPC dispatch.
//!
//! Upper layers register named handlers; incoming requests and broadcast
//! notifies are routed to them by name. Handler errors travel back to the
//! caller as strings; they are operational, not structural.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::Gateway;
use stratus_common::types::NetAddress;

/// Outcome of a server-side RPC handler. The error string is sent to the
/// remote caller verbatim.
pub type RpcResult = Result<Value, String>;

/// Server-side handler: (calling peer, request body) → response body.
pub type RpcHandler = Arc<dyn Fn(NetAddress, Value) -> BoxFuture<'static, RpcResult> + Send + Sync>;

/// Invoked against every new outbound peer right after the handshake.
pub type ConnectCall = Arc<dyn Fn(Gateway, NetAddress) -> BoxFuture<'static, ()> + Send + Sync>;

/// Convenience for building an [`RpcHandler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(NetAddress, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = RpcResult> + Send + 'static,
{
    Arc::new(move |peer, body| Box::pin(f(peer, body)))
}

/// Convenience for building a [`ConnectCall`] from an async closure.
pub fn connect_call<F, Fut>(f: F) -> ConnectCall
where
    F: Fn(Gateway, NetAddress) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |gateway, peer| Box::pin(f(gateway, peer)))
}
