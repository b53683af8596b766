//! uMesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating a mesh on an in-memory medium
//! - Running a node over UDP with an interactive shell on stdin
//! - Decoding mesh headers and deriving one-time keys
//! - Running a toy ID2 authentication server

mod shell;
mod udp;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use shell::{parse_hex, to_hex, ShellCommand};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use udp::{UdpAuthLink, UdpHal};
use umesh_core::auth::id2::Id2Server;
use umesh_core::{
    keys, DeviceState, ExtAddr, Id2Credentials, MediaType, MeshConfig, MeshHeader, MeshNode, QueueAdapter,
    SimMedium, Simulator,
};

#[derive(Parser)]
#[command(name = "umesh")]
#[command(author, version, about = "uMesh self-forming mesh CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Form a network on the in-memory medium and print the result
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Simulated seconds to run
        #[arg(short, long, default_value = "120")]
        steps: u64,

        /// Seed for the node RNGs (random if omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Encrypt frames with the group key
        #[arg(long)]
        secure: bool,

        /// Only let neighbors by index hear each other
        #[arg(long)]
        chain: bool,
    },

    /// Run a node over UDP; commands are read from stdin
    Node {
        /// Local UDP port
        #[arg(short, long)]
        port: u16,

        /// Peer addresses, comma separated (host:port)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<SocketAddr>,

        /// Media type (wifi, ble, 154)
        #[arg(long, default_value = "wifi")]
        media: String,

        /// Node configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Extended address (random if omitted)
        #[arg(long)]
        mac: Option<String>,

        /// Capability bits, e.g. rx_on,leader
        #[arg(long)]
        mode: Option<String>,

        /// ID2 authentication server (host:port)
        #[arg(long)]
        auth_server: Option<SocketAddr>,

        /// Device credentials as id2:secret; enables authentication
        #[arg(long)]
        id2: Option<String>,

        /// Wait for `start` instead of starting immediately
        #[arg(long)]
        idle: bool,
    },

    /// Decode a mesh header from hex
    Decode {
        /// Frame bytes in hex
        hex: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Derive the one-time attach key for a joiner
    Keys {
        /// Joiner extended address
        #[arg(long)]
        mac: String,

        /// Attach request timestamp
        #[arg(long)]
        timestamp: u32,
    },

    /// Run the ID2 authentication server over UDP
    Id2Server {
        /// Local UDP port
        #[arg(short, long, default_value = "7788")]
        port: u16,

        /// Registered devices as id2:secret
        #[arg(short, long)]
        device: Vec<String>,

        /// Seed for challenge generation
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn parse_credentials(text: &str) -> Result<Id2Credentials> {
    let (id2, secret) = text
        .split_once(':')
        .ok_or_else(|| anyhow!("expected id2:secret, got {}", text))?;
    if id2.is_empty() {
        bail!("empty id2 in {}", text);
    }
    Ok(Id2Credentials::new(id2, secret.as_bytes()))
}

fn cmd_simulate(nodes: usize, steps: u64, seed: Option<u64>, secure: bool, chain: bool) -> Result<()> {
    if nodes == 0 {
        bail!("need at least one node");
    }
    let seed = seed.unwrap_or_else(rand::random);
    println!("=== uMesh Simulation ===");
    println!("Nodes: {}, duration: {} s, seed: {}", nodes, steps, seed);
    if secure {
        println!("Security: group key");
    }
    if chain {
        println!("Topology: chain");
    }
    println!();

    let mut sim = Simulator::new(SimMedium::new());
    for i in 0..nodes {
        let mut config = MeshConfig::default().with_seed(seed.wrapping_add(i as u64));
        if secure {
            config = config.with_sec_level(1);
        }
        sim.add_node(config);
    }
    if chain {
        for a in 0..nodes {
            for b in a + 2..nodes {
                sim.medium().cut_link(sim.mac(a), sim.mac(b));
            }
        }
    }
    sim.start_all();

    let started = Instant::now();
    for _ in 0..steps {
        sim.run_for(1_000);
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "simulation finished");

    println!(
        "{:<5} {:<24} {:<10} {:<6} {:<6} {:<24} {:<5}",
        "node", "mac", "state", "sid", "netid", "parent", "cost"
    );
    for i in 0..sim.len() {
        let node = sim.node(i);
        let parent = node.parent().map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:<5} {:<24} {:<10} {:04x}   {:04x}   {:<24} {:<5}",
            i,
            node.uuid().to_string(),
            node.state().to_string(),
            node.sid(),
            node.meshnetid(),
            parent,
            node.path_cost()
        );
    }

    let leaders: Vec<usize> = (0..sim.len())
        .filter(|&i| sim.node(i).state() == DeviceState::Leader)
        .collect();
    println!();
    println!("Leaders: {:?}", leaders);

    // Ping the leader of each network from every attached member
    let mut sent = 0;
    for i in 0..sim.len() {
        let node = sim.node(i);
        if !node.is_attached() || node.state() == DeviceState::Leader {
            continue;
        }
        let netid = node.meshnetid();
        let Some(&leader) = leaders.iter().find(|&&l| sim.node(l).meshnetid() == netid) else {
            continue;
        };
        let dest = sim.node(leader).mesh_addr();
        match sim.node_mut(i).send_data(dest, format!("ping from {}", i).as_bytes()) {
            Ok(()) => sent += 1,
            Err(e) => warn!(node = i, error = %e, "ping not sent"),
        }
    }
    if sent > 0 {
        sim.run_for(3_000);
        let delivered: usize = leaders.iter().map(|&l| sim.take_received(l).len()).sum();
        println!("Pings: {}/{} delivered", delivered, sent);
    }
    println!("Frames on the medium: {}", sim.medium().frames());
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<MeshConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
        }
        None => Ok(MeshConfig::default()),
    }
}

struct NodeOptions {
    port: u16,
    peers: Vec<SocketAddr>,
    media: String,
    config: Option<PathBuf>,
    mac: Option<String>,
    mode: Option<String>,
    auth_server: Option<SocketAddr>,
    id2: Option<String>,
    idle: bool,
}

fn cmd_node(opts: NodeOptions) -> Result<()> {
    let media: MediaType = opts.media.parse().map_err(|e| anyhow!("{}: {}", opts.media, e))?;
    let mac = match &opts.mac {
        Some(text) => text.parse::<ExtAddr>().map_err(|e| anyhow!("bad mac {}: {}", text, e))?,
        None => ExtAddr::random(),
    };
    let mut config = load_config(opts.config.as_ref())?;
    if let Some(mode) = &opts.mode {
        config = config.with_mode(shell::parse_mode(mode)?);
    }
    if let Some(id2) = &opts.id2 {
        config = config.with_auth(true).with_id2(parse_credentials(id2)?);
    }
    if opts.auth_server.is_some() {
        config = config.with_auth(true);
    }

    let socket = UdpSocket::bind(("0.0.0.0", opts.port)).with_context(|| format!("Failed to bind port {}", opts.port))?;
    socket.set_nonblocking(true)?;
    let (hal, receiver) = UdpHal::new(&socket, mac, media, opts.peers.clone())?;

    let mut node = MeshNode::new(config);
    node.add_hal(Box::new(hal)).map_err(|e| anyhow!("Failed to add radio: {}", e))?;
    let adapter = QueueAdapter::new();
    node.set_ip_adapter(Box::new(adapter.clone()));

    let auth_socket = match opts.auth_server {
        Some(server) => {
            let auth = UdpSocket::bind("0.0.0.0:0").context("Failed to bind auth socket")?;
            auth.set_nonblocking(true)?;
            node.set_auth_server_link(Box::new(UdpAuthLink::new(auth.try_clone()?, server)));
            Some(auth)
        }
        None => None,
    };

    println!("=== uMesh Node ===");
    println!("MAC:   {}", mac);
    println!("Media: {:?}", media);
    println!("Port:  {}", opts.port);
    println!("Peers: {:?}", opts.peers);
    println!("Mode:  {}", node.mode());
    println!("Type `help` for commands, Ctrl+C to exit");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    if !opts.idle {
        node.start().map_err(|e| anyhow!("Failed to start node: {}", e))?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async move {
        let socket = tokio::net::UdpSocket::from_std(socket).context("Failed to register socket")?;
        let auth_socket = auth_socket
            .map(tokio::net::UdpSocket::from_std)
            .transpose()
            .context("Failed to register auth socket")?;
        let auth_sink = node.auth_server_sink();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut tick = tokio::time::interval(Duration::from_millis(20));
        let mut buf = vec![0u8; udp::UDP_MTU + udp::LINK_PREFIX_LEN];
        let mut auth_buf = vec![0u8; 2048];
        let mut stdin_open = true;
        let started = Instant::now();

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if !receiver.handle_datagram(&buf[..len]) {
                            debug!(%from, len, "datagram ignored");
                        }
                    }
                    Err(e) => warn!(error = %e, "udp receive failed"),
                },
                reply = async {
                    match &auth_socket {
                        Some(s) => s.recv_from(&mut auth_buf).await.map(|(len, _)| len),
                        None => std::future::pending().await,
                    }
                } => match reply {
                    Ok(len) => udp::deliver_auth_reply(&auth_sink, &auth_buf[..len]),
                    Err(e) => warn!(error = %e, "auth server receive failed"),
                },
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => match ShellCommand::parse(&line) {
                        Ok(Some(cmd)) => match cmd.execute(&mut node) {
                            Ok(out) => println!("{}", out),
                            Err(e) => println!("error: {}", e),
                        },
                        Ok(None) => {}
                        Err(e) => println!("error: {}", e),
                    },
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "stdin closed");
                        stdin_open = false;
                    }
                },
                _ = tick.tick() => {}
            }

            node.poll(started.elapsed().as_millis() as u64);
            for rx in adapter.drain() {
                println!("[{}] {}", rx.src, String::from_utf8_lossy(&rx.payload));
            }
        }

        println!();
        println!("Shutting down");
        node.stop();
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_decode(hex: &str, json: bool) -> Result<()> {
    let bytes = parse_hex(hex)?;
    let (header, len) = MeshHeader::decode(&bytes).map_err(|e| anyhow!("Failed to decode header: {}", e))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&header)?);
        return Ok(());
    }
    println!("=== Mesh Header ({} bytes) ===", len);
    println!("Type:    {:?}", header.frame_type);
    println!("Hops:    {}", header.hops);
    println!("Secure:  {}", header.secure);
    println!("Source:  {}", header.src);
    println!("Dest:    {}", header.dest);
    println!("Dest2:   {:?}", header.dest2);
    if let Some(ies) = &header.ies {
        println!("IEs:     {:?}", ies);
    }
    if bytes.len() > len {
        println!("Payload: {} bytes", bytes.len() - len);
    }
    Ok(())
}

fn cmd_keys(mac: &str, timestamp: u32) -> Result<()> {
    let mac: ExtAddr = mac.parse().map_err(|e| anyhow!("bad mac {}: {}", mac, e))?;
    let key = keys::derive_one_time_key(timestamp, &mac).map_err(|e| anyhow!("Failed to derive key: {}", e))?;
    println!("{}", to_hex(key.as_bytes()));
    Ok(())
}

fn cmd_id2_server(port: u16, devices: &[String], seed: Option<u64>) -> Result<()> {
    let server = Arc::new(Mutex::new(Id2Server::new(seed)));
    {
        let mut guard = server.lock().map_err(|_| anyhow!("server lock poisoned"))?;
        for device in devices {
            guard.register(&parse_credentials(device)?);
        }
        println!("=== ID2 Server ===");
        println!("Port:    {}", port);
        println!("Devices: {}", guard.device_count());
    }

    let socket = UdpSocket::bind(("0.0.0.0", port)).with_context(|| format!("Failed to bind port {}", port))?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut buf = [0u8; 2048];
    let mut handled = 0u64;
    while running.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e).context("Failed to receive"),
        };
        let reply = match server.lock() {
            Ok(mut guard) => guard.handle_bytes(&buf[..len]),
            Err(_) => bail!("server lock poisoned"),
        };
        match reply {
            Ok(Some(reply)) => {
                socket.send_to(&reply, from).context("Failed to reply")?;
                handled += 1;
            }
            Ok(None) => debug!(%from, "nothing owed"),
            Err(e) => warn!(%from, error = %e, "malformed auth message"),
        }
    }
    println!("Handled {} requests", handled);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over -v
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Simulate {
            nodes,
            steps,
            seed,
            secure,
            chain,
        } => cmd_simulate(nodes, steps, seed, secure, chain),

        Commands::Node {
            port,
            peers,
            media,
            config,
            mac,
            mode,
            auth_server,
            id2,
            idle,
        } => cmd_node(NodeOptions {
            port,
            peers,
            media,
            config,
            mac,
            mode,
            auth_server,
            id2,
            idle,
        }),

        Commands::Decode { hex, json } => cmd_decode(&hex, json),

        Commands::Keys { mac, timestamp } => cmd_keys(&mac, timestamp),

        Commands::Id2Server { port, device, seed } => cmd_id2_server(port, &device, seed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umesh_core::{MeshAddr, Mode};

    #[test]
    fn test_parse_credentials() {
        let creds = parse_credentials("device-1:s3cret").unwrap();
        assert_eq!(&creds.id2[..8], b"device-1");
        assert_eq!(creds.secret, b"s3cret".to_vec());
        assert!(parse_credentials("nosecret").is_err());
        assert!(parse_credentials(":x").is_err());
    }

    #[test]
    fn test_decode_built_header() {
        let header = MeshHeader::new(
            umesh_core::types::FrameType::Data,
            MeshAddr::short(0x0100, 0x1000),
            MeshAddr::short(0x0100, 0),
        );
        let hex = to_hex(&header.to_bytes().unwrap());
        assert!(cmd_decode(&hex, false).is_ok());
        assert!(cmd_decode(&hex, true).is_ok());
        assert!(cmd_decode("", false).is_err());
    }

    #[test]
    fn test_mode_flag() {
        let mode = shell::parse_mode("rx_on,leader").unwrap();
        assert_eq!(mode, Mode::RX_ON.with(Mode::LEADER));
    }
}
