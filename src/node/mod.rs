//! The abstract runtime every concrete node (tunnel, UDP socket, collector,
//! encoder/decoder adapter) is built on — §4.4.
//!
//! Tagged variants for node kind, plus a single `Node` trait covering
//! `{handle_msg, dispatch, fd_read, fd_write}`; the relay/duplex split is a
//! trait-impl distinction, not a class hierarchy (§9 Design Notes).

pub mod codec;
pub mod collector;
pub mod tunnel;
pub mod udp;

use crate::message::Message;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Sink,
    Relay,
    FullDuplex,
}

/// Shared state every node carries: its channel sets, worker counter and
/// stop flag. Concrete nodes embed this and expose it via `Node::state`.
pub struct NodeState {
    name: String,
    kind: NodeKind,
    up_channels: RwLock<Vec<Arc<crate::channel::Channel>>>,
    down_channels: RwLock<Vec<Arc<crate::channel::Channel>>>,
    worker_count: AtomicUsize,
    is_stop: AtomicBool,
}

impl NodeState {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        NodeState {
            name: name.into(),
            kind,
            up_channels: RwLock::new(Vec::new()),
            down_channels: RwLock::new(Vec::new()),
            worker_count: AtomicUsize::new(0),
            is_stop: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn push_up_channel(&self, channel: Arc<crate::channel::Channel>) {
        self.up_channels.write().expect("poisoned").push(channel);
    }

    pub fn push_down_channel(&self, channel: Arc<crate::channel::Channel>) {
        self.down_channels
            .write()
            .expect("poisoned")
            .push(channel);
    }

    pub fn up_channels(&self) -> Vec<Arc<crate::channel::Channel>> {
        self.up_channels.read().expect("poisoned").clone()
    }

    pub fn down_channels(&self) -> Vec<Arc<crate::channel::Channel>> {
        self.down_channels.read().expect("poisoned").clone()
    }

    pub fn channel_count(&self) -> usize {
        self.up_channels.read().expect("poisoned").len()
            + self.down_channels.read().expect("poisoned").len()
    }

    pub fn is_stop(&self) -> bool {
        self.is_stop.load(Ordering::SeqCst)
    }

    /// The input channel a worker with slot `k` reads from. Both relay and
    /// full-duplex nodes read from their up-channels — for a duplex node
    /// those are the write-request queues (§4.6's direction inversion).
    pub fn input_channel(&self, k: usize) -> Option<Arc<crate::channel::Channel>> {
        let up = self.up_channels.read().expect("poisoned");
        if up.is_empty() {
            return None;
        }
        Some(up[k % up.len()].clone())
    }

    pub fn next_worker_slot(&self) -> usize {
        self.worker_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Sets the stop flag and breaks every attached channel's queue so
    /// worker threads wake up and exit after finishing their current
    /// iteration.
    pub fn stop(&self) {
        self.is_stop.store(true, Ordering::SeqCst);
        for ch in self.up_channels.read().expect("poisoned").iter() {
            ch.break_all_wait();
        }
        for ch in self.down_channels.read().expect("poisoned").iter() {
            ch.break_all_wait();
        }
    }
}

/// Unit of work in the dataflow graph.
pub trait Node: Send + Sync {
    fn state(&self) -> &NodeState;

    /// Processes one non-Stop message dequeued from this node's input
    /// channel. Relay nodes implement their business logic here.
    fn handle_msg(&self, msg: Message);

    /// Default dispatch policy: round-robin over down-channels by
    /// `msg.id() mod down_channels.len()`; drops silently when there are
    /// no down-channels. Specialized nodes (the collector) override this.
    fn dispatch(&self, msg: Message) {
        let down = self.state().down_channels();
        if down.is_empty() {
            tracing::debug!(node = self.state().name(), "dropping message: no down-channels");
            return;
        }
        let idx = (msg.id() as usize) % down.len();
        if !down[idx].enqueue_wait(msg) {
            tracing::debug!(
                node = self.state().name(),
                "dropped message during shutdown"
            );
        }
    }

    /// Writes a message to this node's owned fd. Only full-duplex nodes
    /// implement this meaningfully; the default is a no-op so relay/encoder
    /// nodes don't need to stub it out.
    fn fd_write(&self, _msg: Message) {}
}

/// Runs the standard relay work loop on channel `ch` until stop: dequeue,
/// propagate Stop (then exit), else `handle_msg`.
pub fn run_relay_loop(node: &dyn Node, ch: &crate::channel::Channel) {
    loop {
        match ch.dequeue_wait() {
            None => {
                if node.state().is_stop() {
                    return;
                }
                continue;
            }
            Some(msg) => {
                if msg.is_stop() {
                    node.dispatch(msg);
                    return;
                }
                node.handle_msg(msg);
                if node.state().is_stop() {
                    return;
                }
            }
        }
    }
}

/// Runs the duplex work loop on channel `ch`: consume write-requests,
/// write each to the owned fd (§4.6).
pub fn run_duplex_loop(node: &dyn Node, ch: &crate::channel::Channel) {
    loop {
        match ch.dequeue_wait() {
            None => {
                if node.state().is_stop() {
                    return;
                }
                continue;
            }
            Some(msg) => {
                if msg.is_stop() {
                    node.dispatch(msg);
                    return;
                }
                node.fd_write(msg);
                if node.state().is_stop() {
                    return;
                }
            }
        }
    }
}
