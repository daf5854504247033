//! The burst forwarding loop.
//!
//! ```text
//!   recv_burst ──► [burst buffer] ──► send_burst ──► (short?) ──► re-offer tail
//!       │                                                  │
//!    0 items                                 closed / stalled / shutdown
//!       ▼                                                  ▼
//!   idle backoff                                    reclaim tail
//! ```
//!
//! Every received item ends up either delivered or reclaimed, never both and
//! never neither, so `received == delivered + reclaimed` holds whenever the
//! loop is between bursts.

use crate::backoff::{Backoff, IdleBackoff};
use crate::shutdown::Shutdown;
use crate::transport::{BurstSink, BurstSource, Reclaim};
use ferry_config::ForwardSection;

/// Consecutive empty offers between two [`BurstSink::is_closed`] checks;
/// for a ring the check is a filesystem lookup.
const CLOSED_CHECK_STALLS: u32 = 64;

/// What to do with the part of a burst the sink did not take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainderPolicy {
    /// Re-offer the unaccepted tail until it is taken. With `max_stalls`, the
    /// tail is reclaimed after that many consecutive offers admitted nothing.
    Retry { max_stalls: Option<u32> },
    /// Reclaim the unaccepted tail right away (transmit path semantics).
    Release,
}

impl Default for RemainderPolicy {
    fn default() -> Self {
        RemainderPolicy::Retry { max_stalls: None }
    }
}

impl From<&ForwardSection> for RemainderPolicy {
    fn from(cfg: &ForwardSection) -> Self {
        RemainderPolicy::Retry {
            max_stalls: cfg.max_stalls,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Non-empty bursts received.
    pub bursts: u64,
    pub received: u64,
    pub delivered: u64,
    /// Offers that were only partly admitted (including zero).
    pub partial_retries: u64,
    pub idle_polls: u64,
    pub reclaimed: u64,
}

/// Outcome of one [`Forwarder::pump_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    Idle,
    Forwarded { received: usize, reclaimed: usize },
}

pub struct Forwarder<T, S, K, R> {
    source: S,
    sink: K,
    reclaim: R,
    burst: Vec<T>,
    backoff: Backoff,
    policy: RemainderPolicy,
    stats: ForwardStats,
    #[cfg(feature = "perf")]
    perf: ferry_perf_recorder::PerfRecorder,
}

impl<T, S, K, R> Forwarder<T, S, K, R>
where
    T: Copy + Default,
    S: BurstSource<T>,
    K: BurstSink<T>,
    R: Reclaim<T>,
{
    /// # Panics
    /// Panics if `burst_size` is zero.
    pub fn new(source: S, sink: K, reclaim: R, burst_size: usize) -> Self {
        assert!(burst_size > 0, "burst size must be non-zero");
        Self {
            source,
            sink,
            reclaim,
            burst: vec![T::default(); burst_size],
            backoff: Backoff::new(IdleBackoff::default()),
            policy: RemainderPolicy::default(),
            stats: ForwardStats::default(),
            #[cfg(feature = "perf")]
            perf: ferry_perf_recorder::PerfRecorder::new(),
        }
    }

    pub fn backoff(mut self, policy: IdleBackoff) -> Self {
        self.backoff = Backoff::new(policy);
        self
    }

    pub fn remainder(mut self, policy: RemainderPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Burst size, backoff and remainder policy from configuration.
    pub fn configured(source: S, sink: K, reclaim: R, cfg: &ForwardSection) -> Self {
        Self::new(source, sink, reclaim, cfg.burst_size)
            .backoff(IdleBackoff::from(cfg))
            .remainder(RemainderPolicy::from(cfg))
    }

    /// Pulls one burst and delivers it. Does not back off when idle.
    pub fn pump_once(&mut self, shutdown: &Shutdown) -> Pump {
        #[cfg(feature = "perf")]
        self.perf.begin(ferry_perf_recorder::PerfStage::SourceBurst);
        let n = self.source.recv_burst(&mut self.burst);
        if n == 0 {
            self.stats.idle_polls += 1;
            return Pump::Idle;
        }
        #[cfg(feature = "perf")]
        self.perf.end(ferry_perf_recorder::PerfStage::SourceBurst);
        let n = n.min(self.burst.len());
        self.stats.bursts += 1;
        self.stats.received += n as u64;

        #[cfg(feature = "perf")]
        self.perf.begin(ferry_perf_recorder::PerfStage::Forward);
        let reclaimed = self.deliver(n, shutdown);
        #[cfg(feature = "perf")]
        self.perf.end(ferry_perf_recorder::PerfStage::Forward);

        Pump::Forwarded { received: n, reclaimed }
    }

    /// Offers `burst[..n]` until it is all taken or the remainder policy
    /// gives up on the tail. Returns how many items were reclaimed.
    fn deliver(&mut self, n: usize, shutdown: &Shutdown) -> usize {
        let mut sent = 0;
        let mut stalls = 0u32;
        while sent < n {
            #[cfg(feature = "perf")]
            self.perf.begin(ferry_perf_recorder::PerfStage::SinkBurst);
            let admitted = self.sink.send_burst(&self.burst[sent..n]).min(n - sent);
            #[cfg(feature = "perf")]
            self.perf.end(ferry_perf_recorder::PerfStage::SinkBurst);

            sent += admitted;
            self.stats.delivered += admitted as u64;
            if sent == n {
                break;
            }
            self.stats.partial_retries += 1;
            tracing::trace!(admitted, remaining = n - sent, "partial admission");

            stalls = if admitted == 0 { stalls + 1 } else { 0 };
            let give_up = match self.policy {
                RemainderPolicy::Release => true,
                RemainderPolicy::Retry { max_stalls } => {
                    shutdown.is_requested()
                        || max_stalls.is_some_and(|max| stalls > max)
                        || (stalls % CLOSED_CHECK_STALLS == 1 && self.sink.is_closed())
                }
            };
            if give_up {
                return self.reclaim_tail(sent, n, stalls);
            }
            std::hint::spin_loop();
        }
        0
    }

    fn reclaim_tail(&mut self, from: usize, to: usize, stalls: u32) -> usize {
        let count = to - from;
        if self.policy != RemainderPolicy::Release {
            tracing::warn!(count, stalls, "reclaiming undeliverable items");
        }
        #[cfg(feature = "perf")]
        self.perf.begin(ferry_perf_recorder::PerfStage::Reclaim);
        self.reclaim.reclaim(&self.burst[from..to]);
        #[cfg(feature = "perf")]
        self.perf.end(ferry_perf_recorder::PerfStage::Reclaim);
        self.stats.reclaimed += count as u64;
        count
    }

    /// Polls until shutdown is requested, backing off between empty polls.
    pub fn run(&mut self, shutdown: &Shutdown) -> ForwardStats {
        while !shutdown.is_requested() {
            match self.pump_once(shutdown) {
                Pump::Idle => self.backoff.idle(),
                Pump::Forwarded { .. } => self.backoff.reset(),
            }
        }
        let s = self.stats;
        tracing::info!(
            bursts = s.bursts,
            received = s.received,
            delivered = s.delivered,
            partial_retries = s.partial_retries,
            idle_polls = s.idle_polls,
            reclaimed = s.reclaimed,
            "forwarder stopped"
        );
        #[cfg(feature = "perf")]
        self.log_perf();
        s
    }

    #[cfg(feature = "perf")]
    fn log_perf(&self) {
        for stage in ferry_perf_recorder::PerfStage::ALL {
            if let Some(sum) = self.perf.summary(stage) {
                tracing::info!(
                    stage = stage.label(),
                    count = sum.count,
                    min_ns = sum.min,
                    p50_ns = sum.p50,
                    p99_ns = sum.p99,
                    max_ns = sum.max,
                    "stage latency"
                );
            }
        }
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn reclaimer(&self) -> &R {
        &self.reclaim
    }

    #[cfg(feature = "perf")]
    pub fn perf(&self) -> &ferry_perf_recorder::PerfRecorder {
        &self.perf
    }

    /// Gives back the endpoints, e.g. to inspect a test sink.
    pub fn into_parts(self) -> (S, K, R) {
        (self.source, self.sink, self.reclaim)
    }
}
