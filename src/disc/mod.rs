//! Dual-queue coupled AQM ([RFC 9332]) serving a Classic and an L4S band
//! over one shared byte pool, with a pending-dequeue protocol for
//! downstream links that aggregate batches before transmission.
//!
//! [RFC 9332]: https://datatracker.ietf.org/doc/html/rfc9332

use std::fmt::Debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::error::Error;
use crate::packet::{Ecn, Packet};
use crate::queue::FifoQueue;
use crate::trace::{Band, DropReason, DualPi2Stats, DualPi2Trace, NullTrace, ProbSample};

mod scheduler;

use scheduler::WdrrScheduler;

/// Per-packet framing overhead the Wi-Fi MAC adds to each aggregated
/// subframe; the pending-dequeue byte budget is expressed in framed bytes.
pub const WIFI_FRAME_OVERHEAD: usize = 38;

// Prevent a deadlock loop while draining a pending-dequeue byte budget
const MAX_PENDING_ITERATIONS: u32 = 1000;

#[cfg_attr(feature = "serde", derive(Deserialize, Serialize), serde(default))]
#[derive(Debug, Clone)]
pub struct DualPi2Config {
    /// Device MTU (bytes), used by the 2-MTU Classic drop guard
    pub mtu: u32,
    /// Shared byte limit across both internal queues
    pub queue_limit: usize,
    /// PI² proportional gain on the delay error (Hz)
    pub alpha: f64,
    /// PI² proportional gain on the delay change (Hz)
    pub beta: f64,
    /// Period of the probability update timer
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub t_update: Duration,
    /// Classic queueing-delay target
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub target: Duration,
    /// L4S marking threshold
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub min_th: Duration,
    /// L4S marking ramp width
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub range: Duration,
    /// Classic-to-L4S coupling factor
    pub k: f64,
    /// Number of L4S quantums earned per Classic quantum each round
    pub scheduling_weight: f64,
    /// WDRR base quantum (bytes)
    pub drr_quantum: u32,
    /// Force the threshold marker output to zero
    pub disable_laqm: bool,
    /// Estimate the Classic queue delay from the latency samples taken at
    /// pending-dequeue time instead of the head-of-line sojourn
    pub enable_wifi_classic_latency_estimator: bool,
    /// Byte target of the downstream aggregation buffer; required when the
    /// latency estimator is enabled
    pub agg_buffer_limit: Option<usize>,
    /// Delay before the first probability update fires
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub start_time: Duration,
}

impl Default for DualPi2Config {
    fn default() -> Self {
        Self {
            mtu: 1500,
            queue_limit: 1_562_500, // 250 ms at 50 Mbps
            alpha: 0.15,
            beta: 3.0,
            t_update: Duration::from_millis(15),
            target: Duration::from_millis(15),
            min_th: Duration::from_micros(800),
            range: Duration::from_micros(400),
            k: 2.0,
            scheduling_weight: 9.0,
            drr_quantum: 1500,
            disable_laqm: false,
            enable_wifi_classic_latency_estimator: false,
            agg_buffer_limit: None,
            start_time: Duration::ZERO,
        }
    }
}

impl DualPi2Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.mtu < 68 {
            return Err(Error::ConfigError(
                "MTU does not meet RFC 791 minimum".to_string(),
            ));
        }
        if self.queue_limit == 0 {
            return Err(Error::ConfigError(
                "Queue limit should be non-zero".to_string(),
            ));
        }
        if !(self.k > 0.0) {
            return Err(Error::ConfigError(
                "Coupling factor should be positive".to_string(),
            ));
        }
        if !(self.scheduling_weight >= 1.0) {
            return Err(Error::ConfigError(
                "Scheduling weight should be at least 1".to_string(),
            ));
        }
        if self.drr_quantum == 0 {
            return Err(Error::ConfigError(
                "DRR quantum should be non-zero".to_string(),
            ));
        }
        if self.t_update.is_zero() {
            return Err(Error::ConfigError(
                "Update period should be non-zero".to_string(),
            ));
        }
        if self.enable_wifi_classic_latency_estimator
            && self.agg_buffer_limit.map_or(true, |limit| limit == 0)
        {
            return Err(Error::ConfigError(
                "Aggregation buffer limit is not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// The DualPI2 queue discipline.
///
/// The state machine is synchronous; every operation takes the caller's
/// notion of "now" so that an event loop (or a test) owns time. The
/// [`cell`](crate::cell) wrapper drives [`Self::update_probability`] from a
/// periodic tick.
pub struct DualPi2QueueDisc<P>
where
    P: Packet,
{
    config: DualPi2Config,
    classic: FifoQueue<P>,
    l4s: FifoQueue<P>,
    classic_staging: FifoQueue<P>,
    l4s_staging: FifoQueue<P>,
    scheduler: WdrrScheduler,

    base_prob: f64,
    prev_q: Duration,
    p_c: f64,
    p_l: f64,
    p_cl: f64,
    p_c_max: f64,
    p_l_max: f64,
    classic_count: f64,
    l4s_count: f64,

    c_latency_sample: Duration,
    l_latency_sample: Duration,
    c_bytes_sample: usize,

    stats: DualPi2Stats,
    trace: Box<dyn DualPi2Trace>,
}

impl<P> Debug for DualPi2QueueDisc<P>
where
    P: Packet,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualPi2QueueDisc")
            .field("classic_backlog", &self.classic.bytes())
            .field("l4s_backlog", &self.l4s.bytes())
            .field("base_prob", &self.base_prob)
            .field("p_c", &self.p_c)
            .field("p_cl", &self.p_cl)
            .finish_non_exhaustive()
    }
}

impl<P> DualPi2QueueDisc<P>
where
    P: Packet,
{
    pub fn new(config: DualPi2Config) -> Result<Self, Error> {
        Self::with_trace(config, Box::new(NullTrace))
    }

    pub fn with_trace(config: DualPi2Config, trace: Box<dyn DualPi2Trace>) -> Result<Self, Error> {
        config.validate()?;
        debug!(?config, "New DualPi2QueueDisc");
        let scheduler = WdrrScheduler::new(config.drr_quantum, config.scheduling_weight);
        let p_c_max = (1.0 / (config.k * config.k)).min(1.0);
        Ok(Self {
            config,
            classic: FifoQueue::new(),
            l4s: FifoQueue::new(),
            classic_staging: FifoQueue::new(),
            l4s_staging: FifoQueue::new(),
            scheduler,
            base_prob: 0.0,
            prev_q: Duration::ZERO,
            p_c: 0.0,
            p_l: 0.0,
            p_cl: 0.0,
            p_c_max,
            p_l_max: 1.0,
            classic_count: 0.0,
            l4s_count: 0.0,
            c_latency_sample: Duration::ZERO,
            l_latency_sample: Duration::ZERO,
            c_bytes_sample: 0,
            stats: DualPi2Stats::default(),
            trace,
        })
    }

    pub fn config(&self) -> &DualPi2Config {
        &self.config
    }

    /// Replace the parameters while keeping queues and controller state.
    pub fn set_config(&mut self, config: DualPi2Config) -> Result<(), Error> {
        config.validate()?;
        info!(?config, "Setting queue disc config");
        self.scheduler
            .reconfigure(config.drr_quantum, config.scheduling_weight);
        self.p_c_max = (1.0 / (config.k * config.k)).min(1.0);
        self.config = config;
        Ok(())
    }

    pub fn stats(&self) -> DualPi2Stats {
        self.stats
    }

    /// Bytes held in the two live queues (staging excluded, as for the
    /// shared limit).
    pub fn backlog_bytes(&self) -> usize {
        self.classic.bytes() + self.l4s.bytes()
    }

    /// Packets held in the live and staging queues.
    pub fn backlog_packets(&self) -> usize {
        self.classic.len() + self.l4s.len() + self.classic_staging.len() + self.l4s_staging.len()
    }

    /// Packets pre-staged for an in-progress pending-dequeue batch.
    pub fn staged_packets(&self) -> usize {
        self.classic_staging.len() + self.l4s_staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog_packets() == 0
    }

    pub fn probabilities(&self) -> ProbSample {
        ProbSample {
            base_prob: self.base_prob,
            p_c: self.p_c,
            p_l: self.p_l,
            p_cl: self.p_cl,
        }
    }

    /// Accept a packet into the band selected by its ECN codepoint, or drop
    /// it when the shared byte pool is exhausted. Returns whether the packet
    /// was accepted.
    pub fn enqueue(&mut self, mut packet: P, now: Instant) -> bool {
        let size = packet.length();
        if self.backlog_bytes() + size > self.config.queue_limit {
            trace!(
                backlog = self.backlog_bytes(),
                queue_limit = self.config.queue_limit,
                "Drop packet(size: {}) when enqueue",
                size
            );
            self.stats.forced_drops += 1;
            self.trace.on_drop(DropReason::ForcedDrop, size);
            return false;
        }
        packet.set_timestamp(now);
        let band = if packet.ecn().is_l4s() {
            self.l4s.push_back(packet);
            Band::L4s
        } else {
            self.classic.push_back(packet);
            Band::Classic
        };
        trace!(
            ?band,
            size,
            backlog = self.backlog_bytes(),
            "Enqueued packet"
        );
        self.stats.enqueued_packets += 1;
        self.stats.enqueued_bytes += size as u64;
        let backlog = self.backlog_bytes();
        self.trace.on_backlog(backlog);
        true
    }

    /// PI² controller step; the caller runs this every `t_update`.
    pub fn update_probability(&mut self, now: Instant) {
        let c_q = match (
            self.config.enable_wifi_classic_latency_estimator,
            self.config.agg_buffer_limit,
        ) {
            (true, Some(agg_buffer_limit)) => {
                // Use the most recent samples taken while the aggregation
                // buffer was re-filled. The second estimate scales the
                // sampled backlog to the delay target; integer nanoseconds
                // avoid a round trip through floating point.
                let l1 = self.c_latency_sample.max(self.l_latency_sample);
                let l2 = Duration::from_nanos(
                    (self.c_bytes_sample as u64).saturating_mul(self.config.target.as_nanos() as u64)
                        / agg_buffer_limit as u64,
                );
                l1.min(l2)
            }
            _ => self
                .classic
                .front()
                .map(|packet| now - packet.get_timestamp())
                .unwrap_or_default(),
        };
        let l_q = self
            .l4s
            .front()
            .map(|packet| now - packet.get_timestamp())
            .unwrap_or_default();
        let current_q = c_q.max(l_q);

        let delay_error = current_q.as_secs_f64() - self.config.target.as_secs_f64();
        let delay_change = current_q.as_secs_f64() - self.prev_q.as_secs_f64();
        self.base_prob = (self.base_prob
            + self.config.alpha * delay_error
            + self.config.beta * delay_change)
            .clamp(0.0, 1.0);
        self.p_cl = (self.base_prob * self.config.k).min(1.0);
        self.p_c = self.base_prob * self.base_prob;
        self.prev_q = current_q;
        trace!(
            current_q = ?current_q,
            base_prob = self.base_prob,
            p_c = self.p_c,
            p_cl = self.p_cl,
            "Probability update"
        );
        let sample = self.probabilities();
        self.trace.on_prob_update(sample);
    }

    /// Threshold-and-ramp marker driven by the instantaneous L sojourn time.
    fn laqm(&self, sojourn: Duration) -> f64 {
        if self.config.disable_laqm {
            return 0.0;
        }
        if sojourn >= self.config.min_th + self.config.range {
            1.0
        } else if sojourn > self.config.min_th {
            (sojourn - self.config.min_th).as_secs_f64() / self.config.range.as_secs_f64()
        } else {
            0.0
        }
    }

    // Deterministic smoothed trigger at rate `likelihood` per call; the
    // fractional accumulator replaces a PRNG.
    fn recur(counter: &mut f64, likelihood: f64) -> bool {
        *counter += likelihood;
        if *counter > 1.0 {
            *counter -= 1.0;
            return true;
        }
        false
    }

    /// Pop from the L4S queue, applying the native and coupled marking
    /// rules, or the Classic drop probability once the coupled probability
    /// saturates. Returns the surviving packet and whether it was marked
    /// here.
    fn dequeue_l4s(&mut self, now: Instant) -> Option<(P, bool)> {
        let mut item = self.l4s.pop_front()?;
        loop {
            if self.p_cl < self.p_l_max {
                // Suppress marking while at most one packet remains queued
                let p_prime_l = if self.l4s.len() > 1 {
                    self.laqm(now - item.get_timestamp())
                } else {
                    0.0
                };
                if p_prime_l > self.p_cl {
                    debug!(p_prime_l, "Native marking probability is driving p_L");
                } else {
                    debug!(p_cl = self.p_cl, "Coupled probability is driving p_L");
                }
                self.p_l = p_prime_l.max(self.p_cl).min(1.0);
                let sample = self.probabilities();
                self.trace.on_prob_update(sample);
                let mut marked = false;
                if Self::recur(&mut self.l4s_count, self.p_l) {
                    marked = item.mark();
                    debug_assert!(marked, "the L4S queue only holds markable packets");
                    if marked {
                        self.stats.marks += 1;
                    }
                    debug!("L-queue packet is marked");
                }
                return Some((item, marked));
            }
            // Overload saturation: fall back to the Classic drop probability,
            // and mark the survivors linearly.
            if Self::recur(&mut self.l4s_count, self.p_c) {
                info!(
                    queue_bytes = self.l4s.bytes(),
                    "L4S drop due to recur function"
                );
                self.stats.unforced_l4s_drops += 1;
                self.trace
                    .on_drop(DropReason::UnforcedL4sDrop, item.length());
                item = self.l4s.pop_front()?;
                continue;
            }
            let mut marked = false;
            if Self::recur(&mut self.l4s_count, self.p_cl) {
                marked = item.mark();
                debug_assert!(marked, "the L4S queue only holds markable packets");
                if marked {
                    self.stats.marks += 1;
                }
                debug!("L-queue packet is marked");
            }
            return Some((item, marked));
        }
    }

    /// Pop from the Classic queue, dropping with the squared probability.
    fn dequeue_classic(&mut self, _now: Instant) -> Option<P> {
        let mut item = self.classic.pop_front()?;
        // Heuristic from the Linux implementation; never drop while less
        // than 2 MTU worth of bytes remains queued.
        if self.classic.bytes() < 2 * self.config.mtu as usize {
            return Some(item);
        }
        loop {
            // Overload disables ECN: beyond p_Cmax everything is dropped
            if Self::recur(&mut self.classic_count, self.p_c) || self.p_c >= self.p_c_max {
                info!(
                    queue_bytes = self.classic.bytes(),
                    "Classic drop due to recur function"
                );
                self.stats.unforced_classic_drops += 1;
                self.trace
                    .on_drop(DropReason::UnforcedClassicDrop, item.length());
                item = self.classic.pop_front()?;
                continue;
            }
            return Some(item);
        }
    }

    fn can_schedule(&self, byte_limit: usize) -> (bool, bool) {
        let classic = self
            .classic
            .front_size()
            .map_or(false, |size| size + WIFI_FRAME_OVERHEAD <= byte_limit);
        let l4s = self
            .l4s
            .front_size()
            .map_or(false, |size| size + WIFI_FRAME_OVERHEAD <= byte_limit);
        (classic, l4s)
    }

    fn schedule(&mut self, eligible: (bool, bool)) -> Option<Band> {
        self.scheduler
            .schedule(self.classic.front_size(), self.l4s.front_size(), eligible)
    }

    fn record_handoff(&mut self, band: Band, packet: &P, now: Instant) {
        let sojourn = now - packet.get_timestamp();
        trace!(?band, ?sojourn, size = packet.length(), "Dequeued packet");
        self.stats.dequeued_packets += 1;
        self.stats.dequeued_bytes += packet.length() as u64;
        self.trace.on_sojourn(band, sojourn);
        let backlog = self.backlog_bytes();
        self.trace.on_backlog(backlog);
    }

    /// Hand the next packet to the downstream: staged batches first (L
    /// before C, already marked), then whatever the scheduler and the AQM
    /// let through.
    pub fn dequeue(&mut self, now: Instant) -> Option<P> {
        if let Some(item) = self.l4s_staging.pop_front() {
            self.record_handoff(Band::L4s, &item, now);
            return Some(item);
        }
        if let Some(item) = self.classic_staging.pop_front() {
            self.record_handoff(Band::Classic, &item, now);
            return Some(item);
        }
        while !self.classic.is_empty() || !self.l4s.is_empty() {
            match self.schedule((true, true)) {
                Some(Band::L4s) => {
                    if let Some((item, _marked)) = self.dequeue_l4s(now) {
                        self.record_handoff(Band::L4s, &item, now);
                        return Some(item);
                    }
                    // A drop emptied the band; rerun the scheduler.
                }
                Some(Band::Classic) => {
                    if let Some(item) = self.dequeue_classic(now) {
                        self.record_handoff(Band::Classic, &item, now);
                        return Some(item);
                    }
                }
                None => return None,
            }
        }
        None
    }

    /// Head item the next [`Self::dequeue`] call would consider, without AQM
    /// side effects.
    pub fn peek(&self) -> Option<&P> {
        self.l4s_staging
            .front()
            .or_else(|| self.classic_staging.front())
            .or_else(|| self.l4s.front())
            .or_else(|| self.classic.front())
    }

    /// Pre-compute the batch an aggregating downstream is about to pull.
    ///
    /// `pending_bytes` is the byte budget of the next transmission in framed
    /// bytes ([`WIFI_FRAME_OVERHEAD`] per packet); `stopped` is the
    /// downstream transmit-queue state. The selected batch is staged, and
    /// marks are topped up so the batch carries at least one CE per packet
    /// left behind in the live L queue.
    pub fn pending_dequeue(&mut self, pending_bytes: usize, stopped: bool, now: Instant) {
        // Latency estimator samples are refreshed on every call, before the
        // aggregation buffer is re-filled.
        self.c_latency_sample = self
            .classic
            .front()
            .map(|packet| now - packet.get_timestamp())
            .unwrap_or_default();
        self.l_latency_sample = self
            .l4s
            .front()
            .map(|packet| now - packet.get_timestamp())
            .unwrap_or_default();
        self.c_bytes_sample = self.classic.bytes();

        if !stopped {
            debug!("Downstream queue is not stopped so no need to process the value");
            return;
        }
        let frames = self.classic.len() + self.l4s.len();
        let queue_disc_pending = self.backlog_bytes() + WIFI_FRAME_OVERHEAD * frames;
        if pending_bytes > queue_disc_pending {
            debug!(
                pending_bytes,
                queue_disc_pending, "Downstream can absorb the whole queue disc"
            );
            return;
        }
        debug!(
            pending_bytes,
            l4s_bytes = self.l4s.bytes(),
            l4s_packets = self.l4s.len(),
            classic_bytes = self.classic.bytes(),
            classic_packets = self.classic.len(),
            "State before pending-dequeue logic"
        );

        // Dequeue up to the byte budget into the staging queues, tracking
        // how many L4S packets the AQM marked on the way.
        let mut pending_bytes_left = pending_bytes;
        let mut marked_count = 0usize;
        for i in 0..=MAX_PENDING_ITERATIONS {
            assert!(i < MAX_PENDING_ITERATIONS, "pending dequeue failed to converge");
            let eligible = self.can_schedule(pending_bytes_left);
            if !eligible.0 && !eligible.1 {
                debug!(pending_bytes_left, "Cannot schedule further");
                break;
            }
            match self.schedule(eligible) {
                Some(Band::L4s) => {
                    let Some((item, marked)) = self.dequeue_l4s(now) else {
                        continue; // the AQM dropped and emptied the band
                    };
                    debug_assert!(
                        item.length() + WIFI_FRAME_OVERHEAD <= pending_bytes_left,
                        "insufficient pending bytes"
                    );
                    pending_bytes_left -= item.length() + WIFI_FRAME_OVERHEAD;
                    if marked {
                        marked_count += 1;
                    }
                    debug!(
                        size = item.length(),
                        marked, "Moved L4S packet to staging queue"
                    );
                    self.l4s_staging.push_back(item);
                }
                Some(Band::Classic) => {
                    let Some(item) = self.dequeue_classic(now) else {
                        continue;
                    };
                    debug_assert!(
                        item.length() + WIFI_FRAME_OVERHEAD <= pending_bytes_left,
                        "insufficient pending bytes"
                    );
                    pending_bytes_left -= item.length() + WIFI_FRAME_OVERHEAD;
                    debug!(size = item.length(), "Moved Classic packet to staging queue");
                    self.classic_staging.push_back(item);
                }
                None => break,
            }
        }
        debug_assert!(
            marked_count == 0 || self.p_cl > 0.0,
            "there should not be any marks if the coupling probability is zero"
        );

        // The batch must carry at least one mark per packet still held in
        // the live L queue, so the senders receive the back-pressure an
        // on-time AQM would have produced. Top up over the staged ECT(1)
        // packets; packets already CE keep their mark and do not count.
        let remaining = self.l4s.len();
        if remaining > marked_count {
            let mut pending_marks = remaining - marked_count;
            debug!(pending_marks, "Applying more marks after pending-dequeue");
            for item in self.l4s_staging.iter_mut() {
                if pending_marks == 0 {
                    break;
                }
                if item.ecn() == Ecn::Ect1 && item.mark() {
                    self.stats.marks += 1;
                    pending_marks -= 1;
                }
            }
        } else {
            debug!("No further marks needed after pending-dequeue");
        }
    }
}
