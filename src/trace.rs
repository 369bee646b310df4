use std::time::Duration;

/// The two traffic classes served by the discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Classic,
    L4s,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Tail drop at the shared byte limit, reported to the enqueuer.
    ForcedDrop,
    /// AQM drop on the Classic dequeue path.
    UnforcedClassicDrop,
    /// AQM drop on the L4S dequeue path (overload regime only).
    UnforcedL4sDrop,
}

/// Snapshot of the coupled probabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbSample {
    pub base_prob: f64,
    pub p_c: f64,
    pub p_l: f64,
    pub p_cl: f64,
}

/// Observer for the discipline's trace points. All methods default to
/// no-ops; implement the ones of interest.
pub trait DualPi2Trace: Send {
    fn on_prob_update(&mut self, _sample: ProbSample) {}
    fn on_sojourn(&mut self, _band: Band, _sojourn: Duration) {}
    fn on_drop(&mut self, _reason: DropReason, _bytes: usize) {}
    fn on_backlog(&mut self, _bytes: usize) {}
}

#[derive(Debug, Default)]
pub struct NullTrace;

impl DualPi2Trace for NullTrace {}

/// Packet and byte counters, updated on every enqueue, hand-off and drop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DualPi2Stats {
    pub enqueued_packets: u64,
    pub enqueued_bytes: u64,
    pub dequeued_packets: u64,
    pub dequeued_bytes: u64,
    pub forced_drops: u64,
    pub unforced_classic_drops: u64,
    pub unforced_l4s_drops: u64,
    pub marks: u64,
}

impl DualPi2Stats {
    pub fn dropped_packets(&self) -> u64 {
        self.forced_drops + self.unforced_classic_drops + self.unforced_l4s_drops
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Recording trace used by the discipline tests.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTrace {
        pub prob_updates: Vec<ProbSample>,
        pub sojourns: Vec<(Band, Duration)>,
        pub drops: Vec<(DropReason, usize)>,
        pub backlogs: Vec<usize>,
    }

    /// Cloneable handle so a test can keep reading the records after the
    /// discipline takes ownership of the publisher.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct SharedRecordingTrace(pub Arc<Mutex<RecordingTrace>>);

    impl DualPi2Trace for SharedRecordingTrace {
        fn on_prob_update(&mut self, sample: ProbSample) {
            self.0.lock().unwrap().on_prob_update(sample);
        }

        fn on_sojourn(&mut self, band: Band, sojourn: Duration) {
            self.0.lock().unwrap().on_sojourn(band, sojourn);
        }

        fn on_drop(&mut self, reason: DropReason, bytes: usize) {
            self.0.lock().unwrap().on_drop(reason, bytes);
        }

        fn on_backlog(&mut self, bytes: usize) {
            self.0.lock().unwrap().on_backlog(bytes);
        }
    }

    impl DualPi2Trace for RecordingTrace {
        fn on_prob_update(&mut self, sample: ProbSample) {
            self.prob_updates.push(sample);
        }

        fn on_sojourn(&mut self, band: Band, sojourn: Duration) {
            self.sojourns.push((band, sojourn));
        }

        fn on_drop(&mut self, reason: DropReason, bytes: usize) {
            self.drops.push((reason, bytes));
        }

        fn on_backlog(&mut self, bytes: usize) {
            self.backlogs.push(bytes);
        }
    }
}
