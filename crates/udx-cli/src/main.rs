//! UDX CLI
//!
//! Reliable, ordered byte streams over UDP from the command line.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use udx_core::node::Node;
use udx_core::{
    Completion, Event, FirewallVerdict, SocketId, StreamId, StreamStats, WriteId,
};
use udx_transport::{InterfaceAddress, InterfaceChange, InterfaceWatcher, LookupFamily, lookup};

use config::{Config, Overrides};
use progress::{TransferProgress, format_bytes, format_duration, format_speed};

/// Bytes handed to the engine per write request
const CHUNK_SIZE: usize = 64 * 1024;

/// UDX - reliable streams over UDP
#[derive(Parser)]
#[command(name = "udx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (default: <config dir>/udx/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Default TTL of outgoing datagrams
    #[arg(long, global = true)]
    ttl: Option<u32>,

    /// Upper bound for path MTU probing
    #[arg(long, global = true)]
    mtu_max: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept one stream and print what it receives
    Listen {
        /// Listen address (default from config)
        addr: Option<String>,

        /// Write received bytes to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send stdin or a file to a listener, then end the stream
    Connect {
        /// Listener as host:port
        #[arg(required = true)]
        target: String,

        /// File to send instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Local bind address (default from config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Resolve a host name to one address
    Lookup {
        /// Host name or literal address
        host: String,

        /// IPv4 only
        #[arg(short = '4', conflicts_with = "ipv6")]
        ipv4: bool,

        /// IPv6 only
        #[arg(short = '6')]
        ipv6: bool,
    },

    /// List network interface addresses
    Interfaces {
        /// Keep running and report changes
        #[arg(short, long)]
        watch: bool,

        /// Poll period in milliseconds
        #[arg(long, default_value_t = 5000)]
        interval_ms: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration, flags win over the file
    let mut config = Config::resolve(cli.config.as_deref()).with_context(|| {
        format!(
            "loading configuration from {}",
            cli.config
                .clone()
                .unwrap_or_else(Config::default_path)
                .display()
        )
    })?;
    config.merge(&Overrides {
        ttl: cli.ttl,
        mtu_max: cli.mtu_max,
        log_level: cli.verbose.then(|| "debug".to_string()),
    });

    // Initialize logging; stdout carries stream data
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Listen { addr, output } => {
            listen(addr, output, &config).await?;
        }
        Commands::Connect { target, file, bind } => {
            connect(target, file, bind, &config).await?;
        }
        Commands::Lookup { host, ipv4, ipv6 } => {
            lookup_host(host, ipv4, ipv6).await?;
        }
        Commands::Interfaces { watch, interval_ms } => {
            list_interfaces(watch, interval_ms).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Start a node with one bound socket
async fn start_node(
    config: &Config,
    bind: SocketAddr,
) -> anyhow::Result<(Node, SocketId, mpsc::UnboundedReceiver<Event>)> {
    let node = Node::new(config.udx.clone()).context("creating node")?;
    node.start().await?;
    let events = node
        .take_events()
        .await
        .context("event receiver already taken")?;
    let socket = node
        .bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    Ok((node, socket, events))
}

/// Accept one stream and copy its bytes to stdout or a file
async fn listen(addr: Option<String>, output: Option<PathBuf>, config: &Config) -> anyhow::Result<()> {
    let bind: SocketAddr = match addr {
        Some(addr) => addr
            .parse()
            .with_context(|| format!("invalid listen address: {addr}"))?,
        None => config.parse_listen_addr()?,
    };

    let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let (node, socket, mut events) = start_node(config, bind).await?;
    let local = node.local_addr(socket).await?;
    let local_id = config.network.listen_id;
    let remote_id = config.network.connect_id;

    let stream = node
        .with_engine(|udx| -> udx_core::Result<StreamId> {
            let stream = udx.stream_init(local_id)?;
            // The first packet from anywhere connects the stream to its sender
            udx.stream_set_firewall(
                stream,
                move |_: StreamId, _: SocketId, from: SocketAddr| {
                    tracing::info!("accepting stream from {}", from);
                    FirewallVerdict::Connect { remote_id }
                },
            )?;
            udx.stream_read_start(stream)?;
            udx.socket_recv_start(socket)?;
            Ok(stream)
        })
        .await?;

    eprintln!(
        "{} on {} (stream id {}, expecting peer id {})",
        style("Listening").green().bold(),
        local,
        local_id,
        remote_id
    );

    let mut received = 0u64;
    let mut outcome = Ok(());
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nShutting down...");
                break;
            }
        };
        let Some(event) = event else { break };

        match event {
            Event::Read { stream: s, data } if s == stream => {
                out.write_all(&data).await?;
                received += data.len() as u64;
            }
            Event::End { stream: s } if s == stream => {
                tracing::debug!("peer ended after {} bytes", received);
                node.with_engine(|udx| udx.stream_write_end(stream, &[]))
                    .await
                    .context("ending stream")?;
            }
            Event::Close { stream: s, reason } if s == stream => {
                if let Some(reason) = reason {
                    outcome = Err(anyhow::anyhow!("stream closed: {reason}"));
                }
                break;
            }
            Event::SocketRecv { data, from, .. } => {
                tracing::debug!(
                    "{} bytes of non-stream traffic from {}: {}",
                    data.len(),
                    from,
                    hex::encode(&data[..data.len().min(16)])
                );
            }
            other => tracing::trace!("{:?}", other),
        }
    }

    out.flush().await?;
    node.stop().await?;
    eprintln!("Received {}", format_bytes(received));
    outcome
}

/// Send a file or stdin over one stream
async fn connect(
    target: String,
    file: Option<PathBuf>,
    bind: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let bind: SocketAddr = match bind {
        Some(bind) => bind
            .parse()
            .with_context(|| format!("invalid bind address: {bind}"))?,
        None => config.parse_connect_bind()?,
    };
    let (host, port) = parse_target(&target)?;
    // An IPv6 socket reaches IPv4 peers through mapped addresses
    let family = if bind.is_ipv4() {
        LookupFamily::V4
    } else {
        LookupFamily::Any
    };
    let ip = lookup(&host, family)
        .await
        .with_context(|| format!("resolving {host}"))?;
    let peer = SocketAddr::new(ip, port);

    let (data, label) = match &file {
        Some(path) => (
            tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
            path.display().to_string(),
        ),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("reading stdin")?;
            (buf, "stdin".to_string())
        }
    };

    let (node, socket, mut events) = start_node(config, bind).await?;
    let local_id = config.network.connect_id;
    let remote_id = config.network.listen_id;

    let stream = node
        .with_engine(|udx| -> udx_core::Result<StreamId> {
            let stream = udx.stream_init(local_id)?;
            udx.stream_connect(stream, socket, remote_id, peer)?;
            udx.stream_read_start(stream)?;
            Ok(stream)
        })
        .await?;

    tracing::info!("connected to {} (peer id {})", peer, remote_id);
    let progress = TransferProgress::new(data.len() as u64, &label);

    let mut pending: HashMap<WriteId, u64> = HashMap::new();
    let mut chunks = data.chunks(CHUNK_SIZE).peekable();
    let mut blocked = false;
    let mut ended = false;
    let mut stats: Option<StreamStats> = None;
    let mut stdout = tokio::io::stdout();

    let reason = loop {
        while !blocked && !ended {
            let queued = match chunks.next() {
                Some(chunk) => {
                    let last = chunks.peek().is_none();
                    let queued = node
                        .with_engine(|udx| {
                            if last {
                                udx.stream_write_end(stream, &[chunk])
                            } else {
                                udx.stream_write(stream, &[chunk])
                            }
                        })
                        .await
                        .context("writing to stream")?;
                    pending.insert(queued.write, chunk.len() as u64);
                    ended = last;
                    queued
                }
                None => {
                    ended = true;
                    node.with_engine(|udx| udx.stream_write_end(stream, &[]))
                        .await
                        .context("ending stream")?
                }
            };
            blocked = !queued.can_continue;
        }

        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                node.with_engine(|udx| udx.stream_destroy(stream)).await?;
                ended = true;
                continue;
            }
        };
        let Some(event) = event else {
            break Some("node stopped".to_string());
        };

        match event {
            Event::WriteAck {
                stream: s,
                write,
                status,
                ..
            } if s == stream => {
                if let Some(bytes) = pending.remove(&write) {
                    if status == Completion::Completed {
                        progress.advance(bytes);
                    }
                }
                if ended && pending.is_empty() {
                    stats = node.with_engine(|udx| udx.stream_stats(stream).ok()).await;
                }
            }
            Event::Drain { stream: s } if s == stream => blocked = false,
            Event::Read { stream: s, data } if s == stream => {
                stdout.write_all(&data).await?;
            }
            Event::Close { stream: s, reason } if s == stream => {
                break reason.map(|r| r.to_string());
            }
            other => tracing::trace!("{:?}", other),
        }
    };

    stdout.flush().await?;
    node.stop().await?;

    if let Some(reason) = reason {
        progress.abandon(format!("Stream closed: {reason}"));
        anyhow::bail!("stream closed: {reason}");
    }

    progress.finish();
    let elapsed = progress.elapsed();
    eprintln!(
        "{} {} in {} ({})",
        style("Sent").green().bold(),
        format_bytes(progress.position()),
        format_duration(elapsed),
        format_speed(progress.position(), elapsed)
    );
    if let Some(stats) = stats {
        eprintln!(
            "  srtt {}ms, cwnd {}, mtu {}, {} retransmits",
            stats.srtt, stats.cwnd, stats.mtu, stats.retransmits
        );
    }
    Ok(())
}

/// Resolve a host name
async fn lookup_host(host: String, ipv4: bool, ipv6: bool) -> anyhow::Result<()> {
    let family = match (ipv4, ipv6) {
        (true, _) => LookupFamily::V4,
        (_, true) => LookupFamily::V6,
        _ => LookupFamily::Any,
    };
    let ip = lookup(&host, family)
        .await
        .with_context(|| format!("resolving {host}"))?;
    println!("{ip}");
    Ok(())
}

/// Print interface addresses, optionally following changes
async fn list_interfaces(watch: bool, interval_ms: u64) -> anyhow::Result<()> {
    let watcher = InterfaceWatcher::new().context("reading interface list")?;
    print_interfaces(&watcher.addresses());

    if !watch {
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    watcher.start(Duration::from_millis(interval_ms), tx)?;

    loop {
        tokio::select! {
            change = rx.recv() => match change {
                Some(InterfaceChange::Changed(addrs)) => {
                    println!();
                    println!("{}", style("Interfaces changed:").yellow().bold());
                    print_interfaces(&addrs);
                }
                Some(InterfaceChange::Failed(e)) => {
                    tracing::warn!("interface enumeration failed: {}", e);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.close();
    Ok(())
}

fn print_interfaces(addrs: &[InterfaceAddress]) {
    for iface in addrs {
        let scope = if iface.internal { "internal" } else { "" };
        println!("{:<16} {:<40} {}", iface.name, iface.addr, scope);
    }
}

/// Split `host:port`, accepting `[v6]:port`
fn parse_target(target: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("'{target}' missing port (expected format: host:port)"))?;

    let port: u16 = port
        .parse()
        .with_context(|| format!("'{target}' has invalid port: {port}"))?;
    if port == 0 {
        anyhow::bail!("'{}' has invalid port: 0", target);
    }

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        anyhow::bail!("'{}' has empty hostname", target);
    }

    Ok((host.to_string(), port))
}
