//! Node implementation - tokio driver around one engine
//!
//! A [`Node`] owns a [`Udx`] behind an async mutex. Each bound socket gets a
//! task that waits for readiness and hands it to the engine; a shared task
//! runs the timer while sockets are open. Events leave through an unbounded
//! channel.
//!
//! # Example
//!
//! ```no_run
//! use udx_core::node::Node;
//! use udx_core::{Event, UdxConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(UdxConfig::default())?;
//!     node.start().await?;
//!     let mut events = node.take_events().await.expect("first call");
//!
//!     let socket = node.bind("127.0.0.1:0".parse()?).await?;
//!     let stream = node.with_engine(|udx| udx.stream_init(1)).await?;
//!     node.with_engine(|udx| {
//!         udx.stream_connect(stream, socket, 2, "127.0.0.1:9000".parse().unwrap())?;
//!         udx.stream_write_end(stream, &[b"hello"])
//!     })
//!     .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if matches!(event, Event::Close { .. }) {
//!             break;
//!         }
//!     }
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

use crate::config::UdxConfig;
use crate::event::{Event, SocketId};
use crate::node::error::{NodeError, Result};
use crate::udx::Udx;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use udx_transport::{AsyncUdpTransport, Transport, TransportConfig};

/// Per-socket driver state
pub(crate) struct SocketDriver {
    /// Readiness source shared with the engine
    pub(crate) transport: AsyncUdpTransport,
    /// Wakes the socket task after API calls
    pub(crate) wake: Arc<Notify>,
    /// The socket task
    pub(crate) task: JoinHandle<()>,
}

/// Node inner state
pub(crate) struct NodeInner {
    /// The engine
    pub(crate) udx: Mutex<Udx>,
    /// Bound sockets
    pub(crate) sockets: DashMap<SocketId, SocketDriver>,
    /// Node running state
    pub(crate) running: AtomicBool,
    /// Event sink
    pub(crate) events_tx: mpsc::UnboundedSender<Event>,
    /// Event source, until a caller takes it
    pub(crate) events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    /// Wakes the timer task when the first socket opens
    pub(crate) timer_wake: Notify,
    /// The timer task
    pub(crate) timer_task: Mutex<Option<JoinHandle<()>>>,
    /// Timer period
    pub(crate) interval: Duration,
    /// Options for new sockets
    pub(crate) transport_config: TransportConfig,
}

/// UDX node
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Create a node with a fresh engine
    ///
    /// # Errors
    /// Returns `NodeError::Engine` if the configuration does not validate.
    pub fn new(config: UdxConfig) -> Result<Self> {
        Ok(Self::with_udx(Udx::new(config)?))
    }

    /// Create a node around an existing engine
    #[must_use]
    pub fn with_udx(udx: Udx) -> Self {
        let config = udx.config();
        let interval = Duration::from_millis(config.timer_interval_ms);
        let transport_config = TransportConfig {
            ttl: config.ttl,
            recv_buffer_size: config.buffer_size,
            send_buffer_size: config.buffer_size,
            dual_stack: true,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(NodeInner {
                udx: Mutex::new(udx),
                sockets: DashMap::new(),
                running: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                timer_wake: Notify::new(),
                timer_task: Mutex::new(None),
                interval,
                transport_config,
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the timer task
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` if already running.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("node already running"));
        }

        let node = self.clone();
        let task = tokio::spawn(async move {
            node.timer_loop().await;
        });
        *self.inner.timer_task.lock().await = Some(task);

        tracing::info!("node started");
        Ok(())
    }

    /// Stop every task and close the transports.
    ///
    /// Streams are not ended gracefully; the engine keeps their state.
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` if not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("node not running"));
        }

        if let Some(task) = self.inner.timer_task.lock().await.take() {
            task.abort();
        }

        let ids: Vec<SocketId> = self.inner.sockets.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, driver)) = self.inner.sockets.remove(&id) {
                driver.task.abort();
                let stats = driver.transport.stats();
                tracing::debug!(
                    "{}: sent {} packets ({} bytes), received {} packets ({} bytes)",
                    id,
                    stats.packets_sent,
                    stats.bytes_sent,
                    stats.packets_received,
                    stats.bytes_received
                );
                if let Err(e) = driver.transport.close().await {
                    tracing::warn!("{}: error closing transport: {}", id, e);
                }
            }
        }

        tracing::info!("node stopped");
        Ok(())
    }

    /// Check if the node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Take the event receiver. Only the first call gets it.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.inner.events_rx.lock().await.take()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sockets and engine access
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Bind a UDP socket and start driving it
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` before [`start`](Self::start) and
    /// `NodeError::Transport` if binding fails.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketId> {
        if !self.is_running() {
            return Err(NodeError::invalid_state("node not running"));
        }

        let transport = AsyncUdpTransport::bind(addr, &self.inner.transport_config).await?;
        let id = self
            .inner
            .udx
            .lock()
            .await
            .socket_attach(Box::new(transport.clone()))?;

        let wake = Arc::new(Notify::new());
        let node = self.clone();
        let task = {
            let transport = transport.clone();
            let wake = Arc::clone(&wake);
            tokio::spawn(async move {
                node.socket_loop(id, transport, wake).await;
            })
        };

        self.inner.sockets.insert(
            id,
            SocketDriver {
                transport,
                wake,
                task,
            },
        );
        self.inner.timer_wake.notify_one();
        Ok(id)
    }

    /// Local address of a bound socket
    ///
    /// # Errors
    /// Returns `NodeError::Engine` if the socket closed.
    pub async fn local_addr(&self, socket: SocketId) -> Result<SocketAddr> {
        Ok(self.inner.udx.lock().await.socket_local_addr(socket)?)
    }

    /// Run `f` on the engine, then deliver its events and wake the sockets
    pub async fn with_engine<R>(&self, f: impl FnOnce(&mut Udx) -> R) -> R {
        let mut udx = self.inner.udx.lock().await;
        let result = f(&mut *udx);
        self.flush(&mut udx);
        drop(udx);
        self.wake_sockets();
        result
    }

    fn flush(&self, udx: &mut Udx) {
        for event in udx.drain_events() {
            // Nobody listening is not an error
            let _ = self.inner.events_tx.send(event);
        }
    }

    fn wake_sockets(&self) {
        for entry in self.inner.sockets.iter() {
            entry.value().wake.notify_one();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Background tasks
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    async fn socket_loop(self, id: SocketId, transport: AsyncUdpTransport, wake: Arc<Notify>) {
        tracing::debug!("{}: driver started", id);

        while self.is_running() {
            let wants_write = self.inner.udx.lock().await.socket_wants_write(id);

            let (readable, writable) = tokio::select! {
                r = transport.readable() => match r {
                    Ok(()) => (true, false),
                    Err(e) => {
                        tracing::debug!("{}: readiness failed: {}", id, e);
                        break;
                    }
                },
                r = transport.writable(), if wants_write => match r {
                    Ok(()) => (false, true),
                    Err(e) => {
                        tracing::debug!("{}: readiness failed: {}", id, e);
                        break;
                    }
                },
                () = wake.notified() => (false, false),
            };

            let mut udx = self.inner.udx.lock().await;
            let result = udx.poll_socket(id, readable, writable);
            self.flush(&mut udx);
            drop(udx);

            if result.is_err() {
                break;
            }
            if readable || writable {
                self.wake_sockets();
            }
        }

        if let Some((_, driver)) = self.inner.sockets.remove(&id) {
            if let Err(e) = driver.transport.close().await {
                tracing::warn!("{}: error closing transport: {}", id, e);
            }
        }
        tracing::debug!("{}: driver stopped", id);
    }

    async fn timer_loop(self) {
        let mut interval = tokio::time::interval(self.inner.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running() {
            let active = self.inner.udx.lock().await.timer_active();
            if !active {
                self.inner.timer_wake.notified().await;
                interval.reset();
                continue;
            }

            interval.tick().await;
            self.with_engine(Udx::on_timer).await;
        }
    }
}
