//! Per-stage latency sampling for the forwarding hot path.
//!
//! Without the `record` feature `PerfRecorder` is zero-sized and every call
//! compiles away. With it, each stage keeps up to [`MAX_SAMPLES`] elapsed
//! nanosecond values taken from the monotonic clock; samples past that are
//! dropped, not wrapped.

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerfStage {
    /// One `recv_burst` on the source transport.
    SourceBurst = 0,
    /// One `send_burst` on the destination, including short admissions.
    SinkBurst = 1,
    /// Returning refused items to the pool.
    Reclaim = 2,
    /// A whole non-empty burst, receive to fully delivered.
    Forward = 3,
}

impl PerfStage {
    pub const ALL: [PerfStage; NUM_STAGES] = [
        PerfStage::SourceBurst,
        PerfStage::SinkBurst,
        PerfStage::Reclaim,
        PerfStage::Forward,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PerfStage::SourceBurst => "source_burst",
            PerfStage::SinkBurst => "sink_burst",
            PerfStage::Reclaim => "reclaim",
            PerfStage::Forward => "forward",
        }
    }
}

pub const NUM_STAGES: usize = 4;
pub const MAX_SAMPLES: usize = 1 << 18;

/// Order statistics over one stage's samples, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageSummary {
    pub count: usize,
    pub min: u64,
    pub p50: u64,
    pub p99: u64,
    pub max: u64,
}

impl StageSummary {
    pub fn from_samples(samples: &[u64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let at = |q: usize| sorted[(sorted.len() - 1) * q / 100];
        Some(Self {
            count: sorted.len(),
            min: sorted[0],
            p50: at(50),
            p99: at(99),
            max: sorted[sorted.len() - 1],
        })
    }
}

#[cfg(feature = "record")]
mod inner {
    use super::*;

    #[inline(always)]
    pub fn now_ns() -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: ts is a valid out pointer
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
    }

    #[derive(Default)]
    struct Stage {
        samples: Vec<u64>,
        started_at: u64,
    }

    pub struct PerfRecorder {
        stages: [Stage; NUM_STAGES],
    }

    impl PerfRecorder {
        pub fn new() -> Self {
            Self {
                stages: std::array::from_fn(|_| Stage {
                    samples: Vec::with_capacity(MAX_SAMPLES),
                    started_at: 0,
                }),
            }
        }

        #[inline(always)]
        pub fn begin(&mut self, stage: PerfStage) {
            self.stages[stage as usize].started_at = now_ns();
        }

        #[inline(always)]
        pub fn end(&mut self, stage: PerfStage) {
            let s = &mut self.stages[stage as usize];
            let elapsed = now_ns().saturating_sub(s.started_at);
            if s.samples.len() < MAX_SAMPLES {
                s.samples.push(elapsed);
            }
        }

        pub fn samples(&self, stage: PerfStage) -> &[u64] {
            &self.stages[stage as usize].samples
        }

        pub fn summary(&self, stage: PerfStage) -> Option<StageSummary> {
            StageSummary::from_samples(self.samples(stage))
        }

        pub fn reset(&mut self) {
            for s in self.stages.iter_mut() {
                s.samples.clear();
            }
        }
    }

    impl Default for PerfRecorder {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(not(feature = "record"))]
mod inner {
    use super::*;

    #[inline(always)]
    pub fn now_ns() -> u64 {
        0
    }

    #[derive(Default)]
    pub struct PerfRecorder;

    impl PerfRecorder {
        #[inline(always)]
        pub fn new() -> Self {
            Self
        }
        #[inline(always)]
        pub fn begin(&mut self, _stage: PerfStage) {}
        #[inline(always)]
        pub fn end(&mut self, _stage: PerfStage) {}
        #[inline(always)]
        pub fn samples(&self, _stage: PerfStage) -> &[u64] {
            &[]
        }
        #[inline(always)]
        pub fn summary(&self, _stage: PerfStage) -> Option<StageSummary> {
            None
        }
        #[inline(always)]
        pub fn reset(&mut self) {}
    }
}

pub use inner::{PerfRecorder, now_ns};
