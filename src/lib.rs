//! # Metaroot - Distributed User/Group Administration Bus
//!
//! Client applications issue high-level administrative requests ("create
//! group", "add user", "associate user to group"); the requests travel over
//! a durable AMQP broker to a server-side router that fans each one out to
//! an ordered list of backend manager plug-ins, aggregates the per-manager
//! results, journals every call, and triggers reactions on failures.
//!
//! ## Core components
//!
//! - **Transport**: durable [`transport::Producer`] / [`transport::Consumer`]
//!   for event-style traffic, and a correlated [`transport::RpcClient`] /
//!   [`transport::RpcServer`] pair for request/reply, all with reconnect,
//!   delivery confirmation, and timeouts
//! - **Dispatch**: [`dispatch::Dispatcher`] maps decoded envelopes onto a
//!   handler's action table with numeric failure codes
//! - **Router**: [`router::Router`] fans requests out across the configured
//!   managers, enforces the read-only gate, journals, and reacts
//! - **Clients**: [`api::EventClient`] and [`api::MethodClient`] build
//!   request envelopes from the shared action schema
//!
//! Delivery is at-least-once; managers are expected to be idempotent.

pub mod actions;
pub mod activity;
pub mod api;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod manager;
pub mod mqadmin;
pub mod reactions;
pub mod registry;
pub mod result;
pub mod router;
pub mod transport;

pub use config::{Config, ConfigFile, RoleKey};
pub use dispatch::{Dispatcher, Handler};
pub use manager::{AdminOp, Manager, Targets};
pub use registry::Registry;
pub use result::CallResult;
pub use router::Router;
