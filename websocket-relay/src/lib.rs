//! Real-time WebSocket relay: every message a client sends is broadcast to
//! every other connected client.
//!
//! - [`hub`] owns the registry of live connections and serializes joins,
//!   leaves and broadcasts through one bounded event channel.
//! - [`connection`] wraps one duplex stream with serialized writes and
//!   close-once teardown.
//! - [`ingress`] and [`keepalive`] are the per-connection read loop and ping
//!   pump; [`session`] ties them to a connection's lifetime.
//! - [`transport`] adapts upgraded axum sockets (and an in-process memory
//!   pair) to the [`frame::Frame`] sink/stream the rest of the crate uses.
//! - [`server`] hosts the upgrade endpoint; [`cli`] and [`client`] back the
//!   binary's `serve` and `connect` modes.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod hub;
pub mod ingress;
pub mod keepalive;
pub mod server;
pub mod session;
pub mod transport;
