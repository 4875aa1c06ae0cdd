//! Process entry point (§4.10): parses arguments, loads settings, wires the
//! dataflow graph, and runs it until Ctrl-C or an internal fatal error.

use anyhow::Context;
use bats_relay::flow::{ByteThresholdPolicy, FlowRecorder};
use bats_relay::manager::NodeManager;
use bats_relay::node::codec::{DecoderNode, EncoderNode, NullDecoder, NullEncoder};
use bats_relay::node::collector::{Collector, CollectorConfig};
use bats_relay::node::tunnel::{Tunnel, TunnelConfig};
use bats_relay::node::udp::UdpNode;
use bats_relay::reactor::Reactor;
use bats_relay::route::RouteTable;
use bats_relay::settings::Settings;
use bats_relay::timer::TimerManager;
use clap::Parser;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bats-relay", about = "User-space tunnel/UDP batching relay")]
struct Cli {
    /// Path to the settings INI file.
    #[arg(long, default_value_os_t = Settings::path_default())]
    config: std::path::PathBuf,

    /// TUN device name; overrides the `tunnel.name` setting.
    #[arg(long)]
    tun_name: Option<String>,

    /// Peer `addr:port` used as the simulate-mode next-hop.
    #[arg(long)]
    peer: Option<String>,

    /// UDP port this node listens on; overrides `udp.listen_port`.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Route every packet to the peer instead of consulting the route table.
    #[arg(long)]
    simulate: bool,

    /// Increase log verbosity (can be repeated); RUST_LOG still takes
    /// precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_directive = if verbose == 0 {
        "info"
    } else if verbose == 1 {
        "debug"
    } else {
        "trace"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        tracing::error!("fatal error: {e:?}");
        return Err(e);
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let tun_name = cli
        .tun_name
        .unwrap_or_else(|| settings.get_string("tun.name", "bats0"));
    let tunnel_config = TunnelConfig {
        iface_name: tun_name,
        address: settings.get("tun.address", Ipv4Addr::new(10, 10, 0, 1)),
        netmask: settings.get("tun.netmask", Ipv4Addr::new(255, 255, 255, 0)),
        mtu: settings.get("tun.mtu", 1500usize),
    };

    let listen_port = cli
        .listen_port
        .unwrap_or_else(|| settings.get("udp.listen_port", 9000u16));

    let simulate = cli.simulate || settings.get("config.simulate", false);
    let simulate_target = cli
        .peer
        .unwrap_or_else(|| settings.get_string("config.peer", "127.0.0.1:8888"));

    let collector_config = CollectorConfig {
        max_block_size: settings.get(
            "coding.max_block_size",
            bats_relay::node::collector::DEFAULT_MAX_BLOCK_SIZE,
        ),
        coding_threshold: settings.get(
            "coding.encode_threshold",
            bats_relay::node::collector::DEFAULT_CODING_THRESHOLD,
        ),
        flush_period_ticks: settings.get(
            "coding.flush_period_ticks",
            bats_relay::node::collector::DEFAULT_FLUSH_PERIOD_TICKS,
        ),
        timer_resolution_ms: settings.get(
            "timer.resolution_ms",
            bats_relay::timer::DEFAULT_RESOLUTION_MS,
        ),
        simulate,
        decoder_port: settings.get(
            "config.decoder_port",
            bats_relay::node::collector::DEFAULT_DECODER_PORT,
        ),
        simulate_target,
    };
    let timer_resolution_ms = collector_config.timer_resolution_ms;
    let coding_threshold = collector_config.coding_threshold as u64;

    let collector_workers = settings.get("collector.workers", 1usize);
    let encoder_workers = settings.get("encoder.workers", 1usize);
    let decoder_workers = settings.get("decoder.workers", 1usize);
    let timer_workers = settings.get("timer.workers", 1usize);

    let routes = RouteTable::from_settings(&settings);
    let flow_recorder = FlowRecorder::new(Box::new(ByteThresholdPolicy::new(coding_threshold)));

    let reactor = Reactor::start().context("starting reactor")?;
    let timer_manager = TimerManager::with_config(timer_resolution_ms, timer_workers)
        .context("starting timer manager")?;
    let node_manager = NodeManager::new();

    let tunnel = Tunnel::open("tunnel", &tunnel_config).context("opening tunnel device")?;
    let udp = UdpNode::bind("UDP", listen_port).context("binding udp socket")?;
    let collector = Collector::new_arc(
        "collector",
        routes,
        flow_recorder,
        collector_config,
        timer_manager.clone(),
    );
    let encoder: Arc<EncoderNode> = Arc::new(EncoderNode::new("encoder", Box::new(NullEncoder)));
    let decoder: Arc<DecoderNode> = Arc::new(DecoderNode::new("decoder", Box::new(NullDecoder)));

    // Egress: tunnel -> collector -> {encoder, UDP} -> UDP (collector's raw
    // path and the encoder's coded output share UDP's single up-channel).
    node_manager
        .connect(tunnel.as_ref(), collector.as_ref(), true)
        .context("connecting tunnel to collector")?;
    node_manager
        .connect(collector.as_ref(), encoder.as_ref(), true)
        .context("connecting collector to encoder")?;
    // reuse=false: collector already has a down-channel (to the encoder) at
    // this point, and the default reuse priority would otherwise hand this
    // connection that same channel instead of a distinct "collector:UDP"
    // one, which the collector's dispatch partition depends on by name.
    node_manager
        .connect(collector.as_ref(), udp.as_ref(), false)
        .context("connecting collector to udp")?;
    node_manager
        .connect(encoder.as_ref(), udp.as_ref(), true)
        .context("connecting encoder to udp")?;

    // Ingress: UDP -> decoder -> tunnel.
    node_manager
        .connect(udp.as_ref(), decoder.as_ref(), true)
        .context("connecting udp to decoder")?;
    node_manager
        .connect(decoder.as_ref(), tunnel.as_ref(), true)
        .context("connecting decoder to tunnel")?;

    tunnel.register_with_reactor(&reactor);
    udp.register_with_reactor(&reactor);

    node_manager
        .run_as_threads(tunnel.clone(), 1)
        .context("starting tunnel worker")?;
    node_manager
        .run_as_threads(udp.clone(), 1)
        .context("starting udp worker")?;
    node_manager
        .run_as_threads(collector.clone(), collector_workers)
        .context("starting collector workers")?;
    node_manager
        .run_as_threads(encoder.clone(), encoder_workers)
        .context("starting encoder workers")?;
    node_manager
        .run_as_threads(decoder.clone(), decoder_workers)
        .context("starting decoder workers")?;

    tracing::info!("bats-relay running; waiting for shutdown signal");
    wait_for_shutdown_signal()?;
    tracing::info!("shutdown signal received, draining graph");

    node_manager.shutdown();
    reactor.shutdown();
    timer_manager.stop();

    tracing::info!("shutdown complete");
    Ok(())
}

fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone())
        .context("registering SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone())
        .context("registering SIGTERM handler")?;

    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}
