//! Dataflow core for a user-space tunnel/UDP relay: a graph of typed
//! processing nodes connected by bounded blocking channels, fed by an
//! edge-triggered I/O readiness reactor, buffered and flushed by a timer
//! wheel, and routed per-packet by a longest-prefix-match table and a
//! flow-state tracker.
//!
//! The tunnel and UDP socket are the only I/O endpoints; the coding step
//! applied to batched payloads is an external collaborator behind the
//! [`node::codec::Encoder`]/[`node::codec::Decoder`] traits.

pub mod channel;
pub mod error;
pub mod flow;
pub mod ip;
pub mod manager;
pub mod message;
pub mod node;
pub mod queue;
pub mod reactor;
pub mod route;
pub mod settings;
pub mod timer;
pub mod wire;
