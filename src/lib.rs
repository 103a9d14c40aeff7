//! In-memory AMQP 1.0 message broker for testing.
//!
//! Queues are created on demand per address. Published messages are stored
//! in FIFO order and forwarded to consumer links in a credit-aware
//! round-robin. The broker core ([`controller`], [`registry`], [`queue`]) is
//! driven by discrete lifecycle events; [`server`] adapts `fe2o3-amqp`
//! connections and links into those events.

pub mod config;
pub mod console;
pub mod controller;
pub mod error;
pub mod link;
pub mod message;
pub mod queue;
pub mod reactor;
pub mod registry;
pub mod sasl;
pub mod server;
pub mod session;
pub mod settlement;
