//! CUBIC congestion control.
//!
//! Windows are counted in packets. Below `ssthresh` the window grows by the
//! number of newly acknowledged packets (slow start). Above it, growth
//! follows the cubic function of time since the last loss epoch, bounded
//! below by a TCP-friendly linear estimate, and is applied through
//! `cwnd_cnt` so a single ack never bumps the window by more than its share.
//!
//! All arithmetic is integer, mirroring the scaled constants of the
//! reference CUBIC description (C = 0.4, beta = 0.7).

/// Cubic scaling constant C, scaled by 1000 (0.4)
const CUBIC_C: u128 = 400;

/// Scale of `t^3` when `t` is in milliseconds
const CUBIC_C_SCALE: u128 = 1_000_000_000_000;

/// `C_SCALE / C`, used to derive K
const CUBE_FACTOR: f64 = 1e12 / 400.0;

/// Multiplicative decrease factor, scaled by 1024 (~0.714)
pub const BETA: u32 = 731;

/// Fixed-point unit of [`BETA`]
pub const BETA_UNIT: u32 = 1024;

/// `3 * beta / (2 - beta)` scaled by 8, for the TCP-friendly estimate
const BETA_SCALE: u32 = 8 * (BETA_UNIT + BETA) / 3 / (BETA_UNIT - BETA);

/// Smallest window after a reduction
pub const MIN_CWND: u32 = 2;

/// Per-epoch cubic state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CubicState {
    /// Time (ms) until the window returns to `origin_point`
    pub k: u32,
    /// Packets acknowledged this epoch, for the TCP-friendly estimate
    pub ack_cnt: u32,
    /// Window the cubic curve plateaus at
    pub origin_point: u32,
    /// Smallest smoothed RTT seen since the last reset
    pub delay_min: u32,
    /// Acks needed per one-packet window increase
    pub cnt: u32,
    /// Time of the last curve evaluation
    pub last_time: u64,
    /// Epoch start time, zero when no epoch is running
    pub start_time: u64,
    /// Window before the last reduction
    pub last_max_cwnd: u32,
    /// Window at the last curve evaluation
    pub last_cwnd: u32,
    /// TCP-friendly window estimate
    pub tcp_cwnd: u32,
}

/// Congestion window with CUBIC growth
#[derive(Debug, Clone)]
pub struct Congestion {
    /// Congestion window in packets
    cwnd: u32,
    /// Slow start threshold in packets
    ssthresh: u32,
    /// Fractional window credit
    cwnd_cnt: u32,
    /// Window cap
    max_cwnd: u32,
    /// Cubic epoch state
    cubic: CubicState,
}

impl Congestion {
    /// Create a controller in slow start
    #[must_use]
    pub fn new(initial_cwnd: u32, initial_ssthresh: u32, max_cwnd: u32) -> Self {
        Self {
            cwnd: initial_cwnd,
            ssthresh: initial_ssthresh,
            cwnd_cnt: 0,
            max_cwnd,
            cubic: CubicState::default(),
        }
    }

    /// Congestion window in packets
    #[must_use]
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Slow start threshold in packets
    #[must_use]
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// Cubic epoch state
    #[must_use]
    pub fn cubic(&self) -> &CubicState {
        &self.cubic
    }

    /// Grow the window for `acked` newly acknowledged packets.
    ///
    /// `limited` suppresses growth when the sender is application limited or
    /// in fast recovery. Growth is also suppressed while the smoothed RTT is
    /// more than four times the minimum seen, which indicates queue build-up.
    pub fn on_ack(&mut self, acked: u32, srtt: u32, now: u64, limited: bool) {
        let c = &mut self.cubic;

        if limited || (c.delay_min > 0 && srtt > c.delay_min.saturating_mul(4)) {
            c.start_time = 0;
            return;
        }

        if c.delay_min == 0 || c.delay_min > srtt {
            c.delay_min = srtt;
        }

        if self.cwnd < self.ssthresh {
            self.cwnd = (self.cwnd + acked).min(self.ssthresh).min(self.max_cwnd);
        } else {
            update_cubic(&mut self.cubic, self.cwnd, acked, now);
            let cnt = self.cubic.cnt;
            self.increase(cnt, acked);
        }

        tracing::trace!(
            "cwnd={} ssthresh={} cnt={} cwnd_cnt={}",
            self.cwnd,
            self.ssthresh,
            self.cubic.cnt,
            self.cwnd_cnt
        );
    }

    /// Multiplicative decrease after a loss.
    ///
    /// `reset` discards the cubic state entirely, as after a retransmission
    /// timeout. Otherwise the pre-loss window is remembered (with fast
    /// convergence when it is below the previous maximum) for the next epoch.
    pub fn reduce(&mut self, reset: bool) {
        if reset {
            self.cubic = CubicState::default();
        } else {
            let c = &mut self.cubic;
            c.start_time = 0;
            c.last_max_cwnd = if self.cwnd < c.last_max_cwnd {
                ((u64::from(self.cwnd) * u64::from(BETA_UNIT + BETA)) / u64::from(2 * BETA_UNIT))
                    as u32
            } else {
                self.cwnd
            };
        }

        let reduced = ((u64::from(self.cwnd) * u64::from(BETA)) / u64::from(BETA_UNIT)) as u32;
        self.cwnd = reduced.max(MIN_CWND);
        self.ssthresh = self.cwnd;
        self.cwnd_cnt = 0;

        tracing::debug!(
            "cwnd reduced to {} (reset={}, last_max={})",
            self.cwnd,
            reset,
            self.cubic.last_max_cwnd
        );
    }

    /// Leave fast recovery, never exceeding `ssthresh`
    pub fn end_recovery(&mut self) {
        self.cwnd = self.cwnd.min(self.ssthresh);
    }

    fn increase(&mut self, cnt: u32, acked: u32) {
        let cnt = cnt.max(1);

        if self.cwnd_cnt >= cnt {
            self.cwnd_cnt = 0;
            self.cwnd += 1;
        }

        self.cwnd_cnt += acked;

        if self.cwnd_cnt >= cnt {
            let delta = self.cwnd_cnt / cnt;
            self.cwnd_cnt -= delta * cnt;
            self.cwnd += delta;
        }

        self.cwnd = self.cwnd.min(self.max_cwnd);
    }
}

// ============================================================================
// Cubic curve
// ============================================================================

fn update_cubic(c: &mut CubicState, cwnd: u32, acked: u32, time: u64) {
    c.ack_cnt = c.ack_cnt.saturating_add(acked);

    // Evaluated at most once per few milliseconds per window size
    if c.last_cwnd == cwnd && time.saturating_sub(c.last_time) <= 3 {
        return;
    }

    if c.start_time == 0 || time != c.last_time {
        c.last_cwnd = cwnd;
        c.last_time = time;

        if c.start_time == 0 {
            c.start_time = time;
            c.ack_cnt = acked;
            c.tcp_cwnd = cwnd;

            if c.last_max_cwnd <= cwnd {
                c.k = 0;
                c.origin_point = cwnd;
            } else {
                c.k = (CUBE_FACTOR * f64::from(c.last_max_cwnd - cwnd)).cbrt() as u32;
                c.origin_point = c.last_max_cwnd;
            }
        }

        let t = (time.wrapping_sub(c.start_time) as u32).wrapping_add(c.delay_min);
        let d = u128::from(t.abs_diff(c.k));
        let delta = (CUBIC_C * d * d * d / CUBIC_C_SCALE).min(u128::from(u32::MAX)) as u32;

        let target = if t < c.k {
            c.origin_point.saturating_sub(delta)
        } else {
            c.origin_point.saturating_add(delta)
        };

        c.cnt = if target > cwnd {
            cwnd / (target - cwnd)
        } else {
            cwnd.saturating_mul(100)
        };

        if c.last_cwnd == 0 && c.cnt > 20 {
            c.cnt = 20;
        }
    }

    // TCP-friendly region
    let delta = ((BETA_SCALE * cwnd) >> 3).max(1);
    while c.ack_cnt > delta {
        c.ack_cnt -= delta;
        c.tcp_cwnd += 1;
    }

    if c.tcp_cwnd > cwnd {
        let max_cnt = cwnd / (c.tcp_cwnd - cwnd);
        if c.cnt > max_cnt {
            c.cnt = max_cnt;
        }
    }

    c.cnt = c.cnt.max(2);
}
