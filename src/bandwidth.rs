use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// BandwidthEstimator
// ---------------------------------------------------------------------------

/// Tuning knobs for the send-side bandwidth estimator.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// Floor for the estimated bitrate, bits per second.
    pub min_bitrate: u64,
    /// Ceiling for the estimated bitrate, bits per second.
    pub max_bitrate: u64,
    /// Initial estimate.
    pub start_bitrate: u64,
    /// Loss ratio above which the target ramps down.
    pub loss_threshold: f64,
    /// RTT above which the target ramps down.
    pub rtt_threshold: Duration,
    /// Multiplicative increase factor.
    pub ramp_up_factor: f64,
    /// Multiplicative decrease factor.
    pub ramp_down_factor: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_bitrate: 100_000,
            max_bitrate: 5_000_000,
            start_bitrate: 1_000_000,
            loss_threshold: 0.02,
            rtt_threshold: Duration::from_millis(300),
            ramp_up_factor: 1.08,
            ramp_down_factor: 0.85,
        }
    }
}

/// Smoothed multiplicative-increase / multiplicative-decrease estimator.
///
/// Fed cumulative `bytes_sent` / `packets_lost` counters plus the current
/// RTT; each update computes the deltas since the previous call, moves the
/// target multiplicatively, and eases the current estimate one tenth of the
/// way toward the target so a single noisy sample cannot swing the output.
pub struct BandwidthEstimator {
    config: EstimatorConfig,
    current: f64,
    target: f64,
    last_bytes: u64,
    last_lost: u64,
    last_update: Option<Instant>,
}

impl BandwidthEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let start = (config.start_bitrate as f64)
            .clamp(config.min_bitrate as f64, config.max_bitrate as f64);
        Self {
            config,
            current: start,
            target: start,
            last_bytes: 0,
            last_lost: 0,
            last_update: None,
        }
    }

    /// Feed the latest cumulative counters; returns the new estimate.
    pub fn update(&mut self, bytes_sent: u64, packets_lost: u64, rtt: Duration) -> u64 {
        self.update_at(Instant::now(), bytes_sent, packets_lost, rtt)
    }

    fn update_at(&mut self, now: Instant, bytes_sent: u64, packets_lost: u64, rtt: Duration) -> u64 {
        let elapsed = match self.last_update {
            Some(prev) => now.saturating_duration_since(prev),
            None => {
                // First sample establishes the baseline.
                self.last_update = Some(now);
                self.last_bytes = bytes_sent;
                self.last_lost = packets_lost;
                return self.current as u64;
            }
        };
        self.last_update = Some(now);

        let delta_bytes = bytes_sent.saturating_sub(self.last_bytes);
        let delta_lost = packets_lost.saturating_sub(self.last_lost);
        self.last_bytes = bytes_sent;
        self.last_lost = packets_lost;

        let loss_rate = if delta_bytes > 0 {
            delta_lost as f64 / delta_bytes as f64
        } else {
            0.0
        };
        let measured_bps = if elapsed > Duration::ZERO {
            delta_bytes as f64 * 8.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        if loss_rate > self.config.loss_threshold || rtt > self.config.rtt_threshold {
            self.target *= self.config.ramp_down_factor;
            debug!(
                loss_rate,
                rtt_ms = rtt.as_millis() as u64,
                target = self.target as u64,
                "bandwidth target ramped down"
            );
        } else if loss_rate <= self.config.loss_threshold / 2.0
            && rtt <= self.config.rtt_threshold / 2
            && measured_bps >= self.current * 0.9
        {
            self.target *= self.config.ramp_up_factor;
        }

        self.target = self
            .target
            .clamp(self.config.min_bitrate as f64, self.config.max_bitrate as f64);

        // One tenth of the gap per call keeps the estimate from oscillating.
        self.current += (self.target - self.current) / 10.0;
        self.current as u64
    }

    /// Force the estimate, bypassing smoothing (still clamped).
    pub fn set_bitrate(&mut self, bitrate: u64) {
        let clamped = (bitrate as f64)
            .clamp(self.config.min_bitrate as f64, self.config.max_bitrate as f64);
        self.current = clamped;
        self.target = clamped;
    }

    pub fn bitrate(&self) -> u64 {
        self.current as u64
    }

    pub fn target_bitrate(&self) -> u64 {
        self.target as u64
    }
}

// ---------------------------------------------------------------------------
// CongestionController
// ---------------------------------------------------------------------------

/// Edge-triggered congestion detector: raised when loss exceeds 10% or RTT
/// exceeds 500 ms, cleared when both fall back below threshold. Transitions
/// are logged once, not per sample.
pub struct CongestionController {
    loss_threshold: f64,
    rtt_threshold: Duration,
    congested: bool,
}

impl CongestionController {
    pub fn new() -> Self {
        Self {
            loss_threshold: 0.10,
            rtt_threshold: Duration::from_millis(500),
            congested: false,
        }
    }

    /// Observe a sample; returns whether the link is currently congested.
    pub fn observe(&mut self, loss_rate: f64, rtt: Duration) -> bool {
        let over = loss_rate > self.loss_threshold || rtt > self.rtt_threshold;
        let under = loss_rate <= self.loss_threshold && rtt <= self.rtt_threshold;

        if over && !self.congested {
            self.congested = true;
            warn!(
                loss_rate,
                rtt_ms = rtt.as_millis() as u64,
                "congestion detected"
            );
        } else if under && self.congested {
            self.congested = false;
            info!("congestion cleared");
        }
        self.congested
    }

    pub fn is_congested(&self) -> bool {
        self.congested
    }
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
