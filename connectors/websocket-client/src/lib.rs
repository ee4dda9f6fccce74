//! Native (non-browser) WebSocket client for the Argus RPC surface.
//!
//! One connection multiplexes unary requests and any number of watch /
//! timeline / reconcile streams, correlated by request id. There is no
//! transparent reconnection: streams cannot resume, so a broken connection
//! surfaces as [`ClientError::Disconnected`] and the caller re-subscribes
//! (the watch snapshot re-seeds it).

pub mod client;

pub use client::{Client, ClientError, Subscription};
