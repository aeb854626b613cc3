//! Test fixtures

pub mod pair;
pub mod sim_net;

pub use pair::{Peer, SimPair};
pub use sim_net::{Captured, SimNetwork, SimSocket, Verdict};

use tracing_subscriber::EnvFilter;

/// Route engine logs to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
