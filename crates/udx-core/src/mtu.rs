//! Packetization-layer path MTU discovery.
//!
//! ```text
//!   first ack          probe acked, size < max
//!  BASE ───────▶ SEARCH ◀──────────────┐
//!                 │  │ └───────────────┘
//!                 │  │ probe acked at max, or max probes lost
//!                 │  ▼
//!                 │ SEARCH_COMPLETE
//!                 │ probe refused by the local stack
//!                 ▼
//!               ERROR ──── next ack ───▶ SEARCH
//! ```
//!
//! A probe is an ordinary data packet padded (after the header) up to the
//! candidate size. Loss of a probe never counts as congestion.

/// Probe state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuState {
    /// Base MTU not yet confirmed
    Base,
    /// Probing larger sizes
    Search,
    /// A probe could not be sent; the next ack resumes the search
    Error,
    /// Largest usable size found
    SearchComplete,
}

/// Per-stream MTU prober
#[derive(Debug, Clone)]
pub struct MtuProber {
    mtu: u16,
    state: MtuState,
    probe_wanted: bool,
    probe_count: u8,
    probe_size: u16,
    max: u16,
    base: u16,
    step: u16,
    max_probes: u8,
}

impl MtuProber {
    /// Prober starting at `base`, searching up to `max` in `step` increments
    #[must_use]
    pub fn new(base: u16, max: u16, step: u16, max_probes: u8) -> Self {
        Self {
            mtu: base,
            state: MtuState::Base,
            probe_wanted: false,
            probe_count: 0,
            // The first ack confirms the base size itself
            probe_size: base,
            max: max.max(base),
            base,
            step,
            max_probes,
        }
    }

    /// Confirmed MTU
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> MtuState {
        self.state
    }

    /// Upper bound of the search
    #[must_use]
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Size of the next probe
    #[must_use]
    pub fn probe_size(&self) -> u16 {
        self.probe_size
    }

    /// Probes of the current size sent without an ack
    #[must_use]
    pub fn probe_count(&self) -> u8 {
        self.probe_count
    }

    /// Size the next data packet should be padded to, if any
    #[must_use]
    pub fn wanted(&self) -> Option<u16> {
        self.probe_wanted.then_some(self.probe_size)
    }

    /// Lower the search maximum, e.g. from the link MTU
    pub fn set_max(&mut self, max: u16) {
        self.max = max.max(self.base);
    }

    /// Start over from the base size, as after a path change
    pub fn reset(&mut self, max: u16) {
        *self = Self::new(self.base, max, self.step, self.max_probes);
    }

    /// A probe left the socket
    pub fn on_probe_sent(&mut self) {
        self.probe_count = self.probe_count.saturating_add(1);
        self.probe_wanted = false;
    }

    /// A probe was taken back before it could be sent
    pub fn on_probe_unsent(&mut self) {
        self.probe_count = self.probe_count.saturating_sub(1);
        self.probe_wanted = true;
    }

    /// A packet was acknowledged; `was_probe` marks padded packets.
    ///
    /// Returns the new MTU when a probe raised it.
    pub fn on_ack(&mut self, was_probe: bool) -> Option<u16> {
        let mut raised = None;

        if self.state == MtuState::Search && self.probe_count > 0 && was_probe {
            self.probe_count = 0;
            self.mtu = self.probe_size;
            raised = Some(self.mtu);

            if self.probe_size >= self.max {
                self.state = MtuState::SearchComplete;
            } else {
                self.probe_size = self.probe_size.saturating_add(self.step).min(self.max);
                self.probe_wanted = true;
            }
        }

        if matches!(self.state, MtuState::Base | MtuState::Error) {
            self.state = MtuState::Search;
            self.probe_wanted = true;
        }

        raised
    }

    /// A probe was declared lost and its padding stripped
    pub fn on_probe_lost(&mut self) {
        if self.state != MtuState::Search {
            return;
        }
        if self.probe_count >= self.max_probes {
            self.state = MtuState::SearchComplete;
            tracing::debug!("mtu: search complete at {} after lost probes", self.mtu);
        } else {
            self.probe_wanted = true;
        }
    }

    /// The local stack refused to send a probe.
    ///
    /// Probing pauses until the next ack and then retries the same size.
    /// Refusals count towards the probe limit like losses do.
    pub fn on_send_error(&mut self) {
        if self.state != MtuState::Search {
            return;
        }

        self.probe_wanted = false;
        self.state = if self.probe_count >= self.max_probes {
            MtuState::SearchComplete
        } else {
            MtuState::Error
        };
        tracing::debug!(
            "mtu: probe of {} rejected locally ({}/{}), state={:?}",
            self.probe_size,
            self.probe_count,
            self.max_probes,
            self.state
        );
    }
}
