//! Asynchronous HTTP and WebSocket bridge for an embedded scripting host.
//!
//! # Overview
//! The host cannot run threads or hold native pointers. It issues requests
//! through integer handles and receives the results later, on its own tick,
//! as plain callback arguments. JSON values live in a handle-based arena the
//! host builds and inspects through the same integer interface.
//!
//! # Design
//! - `Bridge` owns every component; the FFI crate keeps one per process.
//! - Requests are built on the host thread and executed by workers that each
//!   push exactly one `ResponseRecord` onto the shared `ResponseQueue`.
//! - `Bridge::process_tick` drains the queue and drives `ScriptHost`
//!   callbacks. It is the only place host code runs.
//! - The network sits behind the `Transport` trait so everything above it is
//!   testable without sockets.

pub mod arena;
pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod json;
pub mod pump;
pub mod queue;
pub mod registry;
pub mod transport;
pub mod websocket;

pub use arena::{JsonArena, ReleasePolicy};
pub use bridge::{Bridge, RequestTarget};
pub use client::{RequestBody, RequestClient};
pub use config::{BridgeConfig, DeliveryOrder};
pub use dispatch::ExecutionMode;
pub use error::{BridgeError, JsonError, TransportError};
pub use http::{BodyKind, HttpMethod, HttpRequest, HttpResponse};
pub use json::NodeType;
pub use pump::{CallbackArg, CallbackIndex, ScriptHost, TickReport};
pub use queue::{InstanceId, ResponseRecord};
pub use registry::{Handle, HeaderList};
pub use websocket::{ConnectionState, PayloadKind};
