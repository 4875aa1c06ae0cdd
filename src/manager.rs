//! Graph builder (§4.5): wires channels between nodes honoring the
//! up/down validation rules, spawns worker threads per node, and drives
//! an orderly, idempotent shutdown.
//!
//! The duplex direction inversion in §4.6 needs no special casing here:
//! attaching the shared channel as `up`'s down-channel and `down`'s
//! up-channel already gives a duplex endpoint exactly the queue its own
//! work loop expects, whichever side of the connection it sits on.

use crate::channel::{Channel, DEFAULT_CAPACITY};
use crate::error::ManagerError;
use crate::node::{run_duplex_loop, run_relay_loop, Node, NodeKind};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub struct NodeManager {
    registered: Mutex<HashSet<String>>,
    channels: Mutex<Vec<Arc<Channel>>>,
    nodes: Mutex<Vec<Arc<dyn Node>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    cpu_count: usize,
    next_cpu: AtomicUsize,
}

impl NodeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(NodeManager {
            registered: Mutex::new(HashSet::new()),
            channels: Mutex::new(Vec::new()),
            nodes: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            next_cpu: AtomicUsize::new(0),
        })
    }

    /// Connects `up` to `down`. With `reuse = true`, an existing channel is
    /// reused in priority order (`up`'s first down-channel, then `down`'s
    /// first up-channel) before a new one named `"<up>:<down>"` is
    /// allocated and registered.
    pub fn connect(
        &self,
        up: &dyn Node,
        down: &dyn Node,
        reuse: bool,
    ) -> Result<Arc<Channel>, ManagerError> {
        if up.state().kind() == NodeKind::Sink {
            return Err(ManagerError::UpIsSink(up.state().name().to_string()));
        }
        if down.state().kind() == NodeKind::Source {
            return Err(ManagerError::DownIsSource(down.state().name().to_string()));
        }

        let reused = if reuse {
            up.state()
                .down_channels()
                .first()
                .cloned()
                .or_else(|| down.state().up_channels().first().cloned())
        } else {
            None
        };

        let channel = match reused {
            Some(ch) => ch,
            None => {
                let name = format!("{}:{}", up.state().name(), down.state().name());
                let ch = Arc::new(Channel::new(name, DEFAULT_CAPACITY));
                self.channels.lock().expect("poisoned").push(ch.clone());
                ch
            }
        };

        up.state().push_down_channel(channel.clone());
        down.state().push_up_channel(channel.clone());

        tracing::info!(
            up = up.state().name(),
            down = down.state().name(),
            channel = channel.name(),
            channel_id = channel.id(),
            "connected nodes"
        );

        Ok(channel)
    }

    /// Spawns `n` worker threads running `node`'s work loop. Each thread
    /// claims the next worker slot, selects its input channel (always
    /// `up_channels` — see §4.6 for why that's correct for duplex nodes
    /// too), pins itself to a CPU best-effort, then runs the relay or
    /// duplex loop depending on node kind until stop.
    pub fn run_as_threads(
        self: &Arc<Self>,
        node: Arc<dyn Node>,
        n: usize,
    ) -> Result<(), ManagerError> {
        let name = node.state().name().to_string();
        {
            let mut registered = self.registered.lock().expect("poisoned");
            if registered.contains(&name) {
                return Err(ManagerError::AlreadyRegistered(name));
            }
            if node.state().channel_count() == 0 {
                return Err(ManagerError::NoChannels(name));
            }
            if node.state().kind() == NodeKind::FullDuplex && n > 1 {
                return Err(ManagerError::DuplexFanout(name));
            }
            registered.insert(node.state().name().to_string());
        }

        self.nodes.lock().expect("poisoned").push(node.clone());

        let mut workers = self.workers.lock().expect("poisoned");
        for _ in 0..n {
            let node = node.clone();
            let manager = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("node-{}", node.state().name()))
                .spawn(move || manager.worker_entry(node))
                .map_err(|e| ManagerError::Spawn(name.clone(), e))?;
            workers.push(handle);
        }

        Ok(())
    }

    /// The per-thread entry point (§4.4 "Thread entry"): pin affinity,
    /// claim a worker slot, resolve the input channel, then loop until stop.
    fn worker_entry(&self, node: Arc<dyn Node>) {
        let cpu = self.next_cpu.fetch_add(1, Ordering::SeqCst) % self.cpu_count.max(1);
        pin_to_cpu(node.state().name(), cpu);

        let slot = node.state().next_worker_slot();
        let Some(ch) = node.state().input_channel(slot) else {
            tracing::error!(node = node.state().name(), "worker has no input channel");
            return;
        };

        tracing::info!(node = node.state().name(), slot, "worker thread started");
        match node.state().kind() {
            NodeKind::FullDuplex => run_duplex_loop(node.as_ref(), &ch),
            _ => run_relay_loop(node.as_ref(), &ch),
        }
        tracing::info!(node = node.state().name(), slot, "worker thread exiting");
    }

    /// Idempotent: sets a global stop, calls `stop()` on every registered
    /// node, joins every worker, then clears the registries.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for node in self.nodes.lock().expect("poisoned").iter() {
            node.state().stop();
        }

        let mut workers = self.workers.lock().expect("poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        self.nodes.lock().expect("poisoned").clear();
        self.channels.lock().expect("poisoned").clear();
        self.registered.lock().expect("poisoned").clear();
        tracing::info!("node manager shut down");
    }
}

/// Round-robin CPU pinning, best-effort: a failure is logged and ignored,
/// never fatal (§5 "Thread pinning").
fn pin_to_cpu(node_name: &str, cpu: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let res = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if res != 0 {
            tracing::warn!(
                node = node_name,
                cpu,
                "failed to set thread affinity: {}",
                std::io::Error::last_os_error()
            );
        } else {
            tracing::info!(node = node_name, cpu, "bound worker thread to cpu");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (node_name, cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::node::NodeState;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use std::time::Duration;

    struct Echo {
        state: NodeState,
        seen: Arc<StdAtomicUsize>,
    }

    impl Node for Echo {
        fn state(&self) -> &NodeState {
            &self.state
        }

        fn handle_msg(&self, msg: Message) {
            self.seen.fetch_add(1, StdOrdering::SeqCst);
            self.dispatch(msg);
        }
    }

    struct Sink {
        state: NodeState,
        count: Arc<StdAtomicUsize>,
    }

    impl Node for Sink {
        fn state(&self) -> &NodeState {
            &self.state
        }

        fn handle_msg(&self, _msg: Message) {
            self.count.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    #[test]
    fn connect_reuses_ups_existing_down_channel() {
        let manager = NodeManager::new();
        let a = Echo {
            state: NodeState::new("a", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };
        let b = Echo {
            state: NodeState::new("b", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };
        let c = Echo {
            state: NodeState::new("c", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };

        let ch1 = manager.connect(&a, &b, true).unwrap();
        // `a` already has a down-channel from the first connect, so the
        // second connect reuses it instead of allocating a fresh one.
        let ch2 = manager.connect(&a, &c, true).unwrap();
        assert_eq!(ch1.id(), ch2.id());
        assert_eq!(a.state().down_channels().len(), 1);
    }

    #[test]
    fn connect_without_reuse_allocates_distinct_channels() {
        let manager = NodeManager::new();
        let a = Echo {
            state: NodeState::new("a", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };
        let b = Echo {
            state: NodeState::new("b", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };
        let c = Echo {
            state: NodeState::new("c", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };

        let ch1 = manager.connect(&a, &b, true).unwrap();
        let ch2 = manager.connect(&a, &c, false).unwrap();
        assert_ne!(ch1.id(), ch2.id());
    }

    /// Regression test for the `main.rs` wiring bug this crate shipped with
    /// briefly: a node fanning out to two distinct downstreams by name (one
    /// whose dispatch partition depends on the channel's name) must pass
    /// `reuse=false` on the second connect, or the default reuse priority
    /// silently hands it the first connect's channel instead of a new one.
    #[test]
    fn reuse_false_forces_a_distinct_named_channel_for_a_second_downstream() {
        let manager = NodeManager::new();
        let up = Echo {
            state: NodeState::new("collector", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };
        let first_down = Echo {
            state: NodeState::new("encoder", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };
        let second_down = Echo {
            state: NodeState::new("UDP", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };

        let ch1 = manager.connect(&up, &first_down, true).unwrap();
        let ch2 = manager.connect(&up, &second_down, false).unwrap();

        assert_ne!(ch1.id(), ch2.id());
        assert_eq!(up.state().down_channels().len(), 2);
        assert!(ch2.name().contains("UDP"));
    }

    #[test]
    fn sink_as_upstream_is_rejected() {
        let manager = NodeManager::new();
        let sink = Sink {
            state: NodeState::new("sink", NodeKind::Sink),
            count: Arc::new(StdAtomicUsize::new(0)),
        };
        let relay = Echo {
            state: NodeState::new("relay", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        };
        let err = manager.connect(&sink, &relay, true).unwrap_err();
        assert!(matches!(err, ManagerError::UpIsSink(_)));
    }

    #[test]
    fn run_as_threads_rejects_node_with_no_channels() {
        let manager = NodeManager::new();
        let node: Arc<dyn Node> = Arc::new(Echo {
            state: NodeState::new("lonely", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        });
        let err = manager.run_as_threads(node, 1).unwrap_err();
        assert!(matches!(err, ManagerError::NoChannels(_)));
    }

    #[test]
    fn run_as_threads_rejects_duplicate_registration() {
        let manager = NodeManager::new();
        let node: Arc<dyn Node> = Arc::new(Echo {
            state: NodeState::new("dup", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        });
        node.state()
            .push_up_channel(Arc::new(Channel::new("in", 4)));
        manager.run_as_threads(node.clone(), 1).unwrap();
        let err = manager.run_as_threads(node, 1).unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRegistered(_)));
        manager.shutdown();
    }

    #[test]
    fn graph_runs_stop_propagates_and_threads_join() {
        let manager = NodeManager::new();
        let source_ch = Arc::new(Channel::new("src:relay", 8));

        let relay: Arc<dyn Node> = Arc::new(Echo {
            state: NodeState::new("relay", NodeKind::Relay),
            seen: Arc::new(StdAtomicUsize::new(0)),
        });
        let sink_count = Arc::new(StdAtomicUsize::new(0));
        let sink: Arc<dyn Node> = Arc::new(Sink {
            state: NodeState::new("sink", NodeKind::Sink),
            count: sink_count.clone(),
        });

        relay.state().push_up_channel(source_ch.clone());
        let down_ch = manager.connect(relay.as_ref(), sink.as_ref(), true).unwrap();

        manager.run_as_threads(relay.clone(), 1).unwrap();
        manager.run_as_threads(sink.clone(), 1).unwrap();

        source_ch.enqueue_wait(Message::stop());

        let start = std::time::Instant::now();
        while down_ch.empty() && start.elapsed() < Duration::from_millis(100) {
            std::thread::sleep(Duration::from_millis(5));
        }

        manager.shutdown();
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
