//! Async driver for the engine
//!
//! The engine in [`crate::Udx`] is sans-IO. This module runs it on tokio:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Node API                     │
//! │   bind · with_engine · take_events · stop     │
//! ├───────────────────────────────────────────────┤
//! │  socket tasks (readiness)  │  timer task      │
//! ├───────────────────────────────────────────────┤
//! │            Udx engine (Mutex)                 │
//! ├───────────────────────────────────────────────┤
//! │        AsyncUdpTransport (udx-transport)      │
//! └───────────────────────────────────────────────┘
//! ```

pub mod error;
#[allow(clippy::module_inception)]
pub mod node;

pub use error::{NodeError, Result};
pub use node::Node;
