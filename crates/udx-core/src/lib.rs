//! # UDX Core
//!
//! Reliable, ordered, congestion-controlled byte streams over UDP.
//!
//! This crate provides:
//! - The wire header and SACK codec
//! - Per-stream state: write queueing, packetization, acknowledgement,
//!   CUBIC congestion control, RACK and RTO loss detection and path MTU
//!   probing
//! - The [`Udx`] engine that multiplexes streams over sockets, reports
//!   everything as [`Event`]s and never blocks
//! - A tokio driver in [`node`]
//!
//! ## Example
//!
//! ```no_run
//! use udx_core::{Udx, UdxConfig};
//!
//! # fn main() -> Result<(), udx_core::Error> {
//! let mut udx = Udx::new(UdxConfig::default())?;
//! let socket = udx.socket_bind("127.0.0.1:0".parse().unwrap())?;
//! let stream = udx.stream_init(1)?;
//! udx.stream_connect(stream, socket, 2, "127.0.0.1:9000".parse().unwrap())?;
//! udx.stream_write(stream, &[b"hello"])?;
//! udx.poll_socket(socket, false, true)?;
//! for event in udx.drain_events() {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod cirbuf;
pub mod clock;
pub mod config;
pub mod congestion;
pub mod error;
pub mod event;
pub mod fifo;
pub mod header;
mod io;
pub mod mtu;
pub mod node;
pub mod packet;
pub mod rtt;
pub mod seq;
pub mod socket;
pub mod stream;
mod udx;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::UdxConfig;
pub use error::{Error, HeaderError, Result};
pub use event::{
    CloseReason, Completion, Event, Firewall, FirewallVerdict, SendId, SocketId, StreamId,
    WriteId,
};
pub use header::{Header, HeaderFlags, PacketView};
pub use stream::{EndState, Phase, StreamState, StreamStats, Teardown};
pub use udx::{Udx, WriteQueued};
