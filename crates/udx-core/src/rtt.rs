//! Round-trip time estimation and RACK loss-detection state.

/// Smoothed RTT estimator with RFC 6298 retransmission timeout
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: u32,
    rttvar: u32,
    rto: u32,
    min_rto: u32,
    granularity: u32,
}

impl RttEstimator {
    /// Estimator with no samples and an initial timeout of `initial_rto` ms
    #[must_use]
    pub fn new(initial_rto: u32, min_rto: u32, granularity: u32) -> Self {
        Self {
            srtt: 0,
            rttvar: 0,
            rto: initial_rto,
            min_rto,
            granularity,
        }
    }

    /// Smoothed RTT in ms (0 before the first sample)
    #[must_use]
    pub fn srtt(&self) -> u32 {
        self.srtt
    }

    /// RTT variation in ms
    #[must_use]
    pub fn rttvar(&self) -> u32 {
        self.rttvar
    }

    /// Retransmission timeout in ms
    #[must_use]
    pub fn rto(&self) -> u32 {
        self.rto
    }

    /// Fold in an unambiguous RTT sample
    pub fn sample(&mut self, rtt: u32) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            let delta = self.srtt.abs_diff(rtt);
            self.rttvar = ((3 * u64::from(self.rttvar) + u64::from(delta)) / 4) as u32;
            self.srtt = ((7 * u64::from(self.srtt) + u64::from(rtt)) / 8) as u32;
        }

        let spread = self.granularity.max(self.rttvar.saturating_mul(4));
        self.rto = self.srtt.saturating_add(spread).max(self.min_rto);
    }
}

/// `(time_sent, seq)` of `a` is later than that of `b`.
///
/// Ties on time are broken by sequence number.
#[inline]
#[must_use]
pub fn sent_after(t1: u64, seq1: u32, t2: u64, seq2: u32) -> bool {
    t1 > t2 || (t1 == t2 && crate::seq::seq_lt(seq2, seq1))
}

/// Recent-ACK loss detection state (RFC 8985)
#[derive(Debug, Clone, Default)]
pub struct Rack {
    /// Smallest RTT sample seen
    pub rtt_min: u32,
    /// RTT of the most recently delivered packet
    pub rtt: u32,
    /// Send time of the most recently sent delivered packet
    pub time_sent: u64,
    /// `seq + 1` of that packet
    pub next_seq: u32,
    /// Forward-most acknowledged `seq + 1`
    pub fack: u32,
    /// A packet was delivered out of send order
    pub reordering_seen: bool,
    /// Absolute deadline of the next loss check
    pub timeout: Option<u64>,
}

impl Rack {
    /// Reordering window in ms.
    ///
    /// Zero while no reordering was seen and the sender is either in
    /// recovery or has already collected three SACKs.
    #[must_use]
    pub fn reo_wnd(&self, in_recovery: bool, sacks: u32, srtt: u32) -> u32 {
        if !self.reordering_seen && (in_recovery || sacks >= 3) {
            return 0;
        }
        (self.rtt_min / 4).min(srtt)
    }

    /// Record delivery of `seq`, sent at `time_sent`, after `rtt` ms.
    ///
    /// `first_transmit` marks samples from packets sent exactly once.
    pub fn on_delivered(&mut self, seq: u32, time_sent: u64, rtt: u32, first_transmit: bool, inflight: bool) {
        let next = seq.wrapping_add(1);

        if crate::seq::seq_lt(self.fack, next) {
            self.fack = next;
        } else if crate::seq::seq_lt(next, self.fack) && first_transmit {
            self.reordering_seen = true;
        }

        if inflight && first_transmit && (self.rtt_min == 0 || self.rtt_min > rtt) {
            self.rtt_min = rtt;
        }

        if inflight && (first_transmit || (self.rtt_min > 0 && rtt >= self.rtt_min)) {
            self.rtt = rtt;
            if sent_after(time_sent, next, self.time_sent, self.next_seq) {
                self.time_sent = time_sent;
                self.next_seq = next;
            }
        }
    }
}
