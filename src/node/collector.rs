//! The batching relay (§4.7): accumulates payloads per next-hop, flips
//! between coded batching and raw passthrough based on flow classification,
//! and flushes on a size threshold or a per-next-hop timer.

use crate::channel::Channel;
use crate::flow::FlowRecorder;
use crate::ip::NetworkMessage;
use crate::message::Message;
use crate::node::{Node, NodeKind, NodeState};
use crate::route::RouteTable;
use crate::timer::TimerManager;
use crate::wire::PROTOCOL_OVERHEAD;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};

pub const DEFAULT_MAX_BLOCK_SIZE: usize = 65540;
pub const DEFAULT_CODING_THRESHOLD: usize = 30000;
pub const DEFAULT_FLUSH_PERIOD_TICKS: u64 = 15;

/// Per-destination accumulation buffer (§3 "BatsBuffer"): a single *current*
/// message, lazily (re)allocated at `capacity` with protocol header room
/// already reserved.
struct BatsBuffer {
    capacity: usize,
    current: Option<Message>,
}

impl BatsBuffer {
    fn new(capacity: usize) -> Self {
        BatsBuffer {
            capacity,
            current: None,
        }
    }

    fn current(&mut self) -> Message {
        if self.current.is_none() {
            let msg = Message::new(self.capacity);
            msg.reserve_header(PROTOCOL_OVERHEAD);
            self.current = Some(msg);
        }
        self.current.clone().expect("just allocated")
    }

    fn filled(&self) -> usize {
        self.current.as_ref().map(Message::payload_len).unwrap_or(0)
    }

    /// Hands back the current buffer (if any) and clears it; the next call
    /// to `current()` allocates fresh.
    fn reset(&mut self) -> Option<Message> {
        self.current.take()
    }
}

struct PerHop {
    buffer: BatsBuffer,
    addr: std::net::SocketAddr,
}

pub const DEFAULT_DECODER_PORT: u16 = 8888;

pub struct CollectorConfig {
    pub max_block_size: usize,
    pub coding_threshold: usize,
    pub flush_period_ticks: u64,
    pub timer_resolution_ms: u64,
    pub simulate: bool,
    /// UDP port the peer's decoder listens on, used when a next-hop from
    /// the route table (or simulate mode) names a bare IP with no port.
    pub decoder_port: u16,
    /// Next-hop substituted for every destination while `simulate` is set,
    /// in place of consulting the route table.
    pub simulate_target: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            coding_threshold: DEFAULT_CODING_THRESHOLD,
            flush_period_ticks: DEFAULT_FLUSH_PERIOD_TICKS,
            timer_resolution_ms: crate::timer::DEFAULT_RESOLUTION_MS,
            simulate: false,
            decoder_port: DEFAULT_DECODER_PORT,
            simulate_target: "127.0.0.1".to_string(),
        }
    }
}

/// Resolves a route table / simulate-mode next-hop string to a socket
/// address: `"ip:port"` is used verbatim, a bare IP is combined with
/// `default_port` (the original source's hardcoded decoder port, §9).
fn resolve_dst_addr(next_hop: &str, default_port: u16) -> Option<std::net::SocketAddr> {
    if let Ok(addr) = next_hop.parse::<std::net::SocketAddr>() {
        return Some(addr);
    }
    next_hop
        .parse::<Ipv4Addr>()
        .ok()
        .map(|ip| std::net::SocketAddr::from((ip, default_port)))
}

pub struct Collector {
    state: NodeState,
    self_weak: Weak<Collector>,
    routes: RouteTable,
    flow_recorder: FlowRecorder,
    hops: Mutex<HashMap<String, Arc<Mutex<PerHop>>>>,
    config: CollectorConfig,
    timer_manager: Arc<TimerManager>,
    dispatch_partition: OnceCell<(Vec<Arc<Channel>>, Option<Arc<Channel>>)>,
}

impl Collector {
    pub fn new_arc(
        name: impl Into<String>,
        routes: RouteTable,
        flow_recorder: FlowRecorder,
        config: CollectorConfig,
        timer_manager: Arc<TimerManager>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak| Collector {
            state: NodeState::new(name, NodeKind::Relay),
            self_weak: weak.clone(),
            routes,
            flow_recorder,
            hops: Mutex::new(HashMap::new()),
            config,
            timer_manager,
            dispatch_partition: OnceCell::new(),
        })
    }

    fn resolve_next_hop(&self, parsed: Option<&NetworkMessage>) -> String {
        if self.config.simulate {
            return self.config.simulate_target.clone();
        }
        match parsed {
            Some(nm) => self
                .routes
                .longest_prefix_match(Ipv4Addr::from(nm.dst_ip)),
            None => String::new(),
        }
    }

    fn get_or_create_hop(&self, next_hop: &str) -> Option<Arc<Mutex<PerHop>>> {
        if let Some(hop) = self.hops.lock().expect("poisoned").get(next_hop) {
            return Some(hop.clone());
        }
        let addr = resolve_dst_addr(next_hop, self.config.decoder_port)?;
        let mut hops = self.hops.lock().expect("poisoned");
        Some(
            hops.entry(next_hop.to_string())
                .or_insert_with(|| {
                    let per_hop = Arc::new(Mutex::new(PerHop {
                        buffer: BatsBuffer::new(self.config.max_block_size),
                        addr,
                    }));
                    self.schedule_flush_timer(next_hop.to_string(), per_hop.clone());
                    per_hop
                })
                .clone(),
        )
    }

    fn schedule_flush_timer(&self, next_hop: String, per_hop: Arc<Mutex<PerHop>>) {
        let expires_ms = self.config.flush_period_ticks * self.config.timer_resolution_ms;
        let self_weak = self.self_weak.clone();
        let result = self.timer_manager.add_timer(
            expires_ms,
            false,
            Box::new(move |_timer| {
                if let Some(collector) = self_weak.upgrade() {
                    collector.handle_timeout_buffer(&next_hop, &per_hop);
                }
            }),
        );
        if let Err(e) = result {
            tracing::warn!(next_hop, "failed to schedule flush timer: {e}");
        }
    }

    fn handle_timeout_buffer(&self, _next_hop: &str, per_hop: &Arc<Mutex<PerHop>>) {
        let finalized = {
            let mut hop = per_hop.lock().expect("poisoned");
            if hop.buffer.filled() > 0 {
                hop.buffer.reset().map(|msg| (msg, hop.addr))
            } else {
                None
            }
        };
        if let Some((msg, addr)) = finalized {
            msg.set_needs_coded(true);
            msg.set_dst_addr(addr);
            self.dispatch(msg);
        }
    }

    fn buffering_data(&self, msg: &Message, next_hop: &str) {
        let Some(per_hop) = self.get_or_create_hop(next_hop) else {
            tracing::warn!(node = self.state.name(), next_hop, "dropping message: unresolvable next-hop address");
            return;
        };
        let payload = msg.payload_snapshot();
        let mut finalized = Vec::new();
        let addr;
        {
            let mut hop = per_hop.lock().expect("poisoned");
            addr = hop.addr;
            if hop.buffer.filled() + payload.len() > self.config.max_block_size {
                if let Some(done) = hop.buffer.reset() {
                    finalized.push(done);
                }
            }
            let current = hop.buffer.current();
            current.fill(&payload);
            if current.payload_len() > self.config.coding_threshold {
                if let Some(done) = hop.buffer.reset() {
                    finalized.push(done);
                }
            }
        }
        for m in finalized {
            m.set_needs_coded(true);
            m.set_dst_addr(addr);
            self.dispatch(m);
        }
    }

    fn force_relay_data(&self, msg: &Message, next_hop: &str) {
        let Some(per_hop) = self.get_or_create_hop(next_hop) else {
            tracing::warn!(node = self.state.name(), next_hop, "dropping message: unresolvable next-hop address");
            return;
        };
        let mut finalized: Vec<(Message, bool)> = Vec::new();
        let addr;
        {
            let mut hop = per_hop.lock().expect("poisoned");
            addr = hop.addr;
            if hop.buffer.filled() > 0 {
                if let Some(done) = hop.buffer.reset() {
                    finalized.push((done, true));
                }
            }
            let raw = hop.buffer.current();
            raw.fill(&msg.payload_snapshot());
            hop.buffer.reset();
            finalized.push((raw, false));
        }
        for (m, needs_coded) in finalized {
            m.set_needs_coded(needs_coded);
            m.set_dst_addr(addr);
            self.dispatch(m);
        }
    }

    fn dispatch_partition(&self) -> (Vec<Arc<Channel>>, Option<Arc<Channel>>) {
        self.dispatch_partition
            .get_or_init(|| {
                let mut encode_channels = Vec::new();
                let mut udp_channel = None;
                for ch in self.state.down_channels() {
                    if ch.name().contains(":UDP") {
                        udp_channel = Some(ch);
                    } else {
                        encode_channels.push(ch);
                    }
                }
                (encode_channels, udp_channel)
            })
            .clone()
    }
}

impl Node for Collector {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn handle_msg(&self, msg: Message) {
        if msg.is_stop() {
            self.dispatch(msg);
            return;
        }

        let payload = msg.payload_snapshot();
        let parsed = NetworkMessage::decode(&payload);
        let next_hop = self.resolve_next_hop(parsed.as_ref());
        if next_hop.is_empty() {
            tracing::warn!(node = self.state.name(), "dropping message: no route to destination");
            return;
        }

        let needs_coded = match &parsed {
            Some(nm) => self
                .flow_recorder
                .update(&nm.flow_key, payload.len(), self.timer_manager.current_tick()),
            None => false,
        };
        msg.set_needs_coded(needs_coded);

        if needs_coded {
            self.buffering_data(&msg, &next_hop);
        } else {
            self.force_relay_data(&msg, &next_hop);
        }
    }

    /// Coded messages round-robin across the non-`:UDP` down-channels;
    /// raw messages go directly to the channel whose name contains `:UDP`.
    fn dispatch(&self, msg: Message) {
        let (encode_channels, udp_channel) = self.dispatch_partition();

        if msg.needs_coded() {
            if encode_channels.is_empty() {
                tracing::debug!(node = self.state.name(), "dropping coded batch: no encode channels");
                return;
            }
            let idx = (msg.id() as usize) % encode_channels.len();
            if !encode_channels[idx].enqueue_wait(msg) {
                tracing::debug!(node = self.state.name(), "dropped message during shutdown");
            }
        } else if let Some(udp) = udp_channel {
            if !udp.enqueue_wait(msg) {
                tracing::debug!(node = self.state.name(), "dropped message during shutdown");
            }
        } else {
            tracing::debug!(node = self.state.name(), "dropping raw message: no udp channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ByteThresholdPolicy;

    fn make_collector(max_block_size: usize, coding_threshold: usize) -> Arc<Collector> {
        let mut routes = RouteTable::new();
        routes.add_route(Ipv4Addr::new(0, 0, 0, 0), 0, "198.51.100.1:9000");
        let flow_recorder = FlowRecorder::new(Box::new(ByteThresholdPolicy::new(0)));
        let timer_manager = TimerManager::with_config(5, 1).unwrap();
        let config = CollectorConfig {
            max_block_size,
            coding_threshold,
            flush_period_ticks: 15,
            timer_resolution_ms: 5,
            simulate: false,
            decoder_port: DEFAULT_DECODER_PORT,
            simulate_target: "127.0.0.1".to_string(),
        };
        Collector::new_arc("collector", routes, flow_recorder, config, timer_manager)
    }

    fn ipv4_udp_packet(payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; 20 + 8 + payload_len];
        buf[0] = 0x45;
        buf[9] = 17; // UDP
        buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
        buf[16..20].copy_from_slice(&[10, 0, 0, 2]);
        buf
    }

    fn data_message(payload: &[u8]) -> Message {
        let msg = Message::ipv4(payload.len() + 64);
        msg.reserve_header(0);
        msg.fill(payload);
        msg
    }

    #[test]
    fn batches_until_threshold_then_emits_one_buffer() {
        let collector = make_collector(65540, 30000);
        let encode = Arc::new(Channel::new("collector:encoder", 64));
        collector.state().push_down_channel(encode.clone());

        for _ in 0..31 {
            let payload = ipv4_udp_packet(1000 - 28);
            collector.handle_msg(data_message(&payload));
        }

        let batch = encode.try_dequeue().expect("one batch emitted");
        assert_eq!(batch.payload_len(), 31 * 1000);
        assert_eq!(
            batch.dst_addr(),
            Some("198.51.100.1:9000".parse().unwrap())
        );
        assert!(encode.try_dequeue().is_none());
    }

    #[test]
    fn raw_passthrough_flushes_pending_batch_first() {
        let mut routes = RouteTable::new();
        routes.add_route(Ipv4Addr::new(0, 0, 0, 0), 0, "198.51.100.1:9000");
        // Force the third message to classify as non-bulk (raw) by using a
        // policy that flips back below threshold is impossible with a byte
        // counter, so we exercise force_relay_data directly instead.
        let collector = make_collector(65540, 30000);
        let encode = Arc::new(Channel::new("collector:encoder", 64));
        let udp = Arc::new(Channel::new("collector:UDP", 64));
        collector.state().push_down_channel(encode.clone());
        collector.state().push_down_channel(udp.clone());

        let coded_payload = ipv4_udp_packet(1000 - 28);
        collector.buffering_data(&data_message(&coded_payload), "198.51.100.1:9000");
        collector.buffering_data(&data_message(&coded_payload), "198.51.100.1:9000");

        let raw_payload = ipv4_udp_packet(500 - 28);
        collector.force_relay_data(&data_message(&raw_payload), "198.51.100.1:9000");

        let flushed_batch = encode.try_dequeue().expect("pending batch flushed first");
        assert_eq!(flushed_batch.payload_len(), 2000);

        let raw = udp.try_dequeue().expect("raw packet forwarded");
        assert!(!raw.needs_coded());
        assert_eq!(raw.payload_len(), 500);
        assert_eq!(raw.dst_addr(), Some("198.51.100.1:9000".parse().unwrap()));
    }

    #[test]
    fn bare_ip_next_hop_combines_with_decoder_port() {
        assert_eq!(
            resolve_dst_addr("10.0.0.5", DEFAULT_DECODER_PORT),
            Some("10.0.0.5:8888".parse().unwrap())
        );
        assert_eq!(
            resolve_dst_addr("10.0.0.5:1234", DEFAULT_DECODER_PORT),
            Some("10.0.0.5:1234".parse().unwrap())
        );
        assert_eq!(resolve_dst_addr("not-an-address", DEFAULT_DECODER_PORT), None);
    }

    #[test]
    fn unresolvable_next_hop_drops_without_panicking() {
        let collector = make_collector(65540, 30000);
        let encode = Arc::new(Channel::new("collector:encoder", 64));
        collector.state().push_down_channel(encode.clone());

        collector.buffering_data(&data_message(&ipv4_udp_packet(100)), "not-an-address");
        assert!(encode.try_dequeue().is_none());
    }
}
