//! # eventmesh_node
//!
//! A reusable building block that turns a host process into a node in an
//! event-driven mesh: three bounded, timestamp-keyed event pools, an
//! analyze/send/persist loop trio, a small lifecycle FSM, and the HTTP
//! ingress/egress that carries events between nodes.
//!
//! Application logic is supplied by the embedding host through the
//! [`host::Analyzer`] and [`host::LifecycleHooks`] traits; everything else
//! — queueing, overflow, retries, persistence, the wire protocol — is
//! handled by [`engine::Engine`].

pub mod config;
pub mod egress;
pub mod engine;
pub mod error;
pub mod event;
pub mod fsm;
pub mod host;
pub mod ingress;
pub mod logging;
pub mod persistence;
pub mod pool;

pub const SERVICE_NAME: &str = "eventmesh-node";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
