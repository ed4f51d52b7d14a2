//! Builder throughput counters.

use std::time::Duration;

use serde::Serialize;

/// Cumulative counts and timings since the builder was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuilderStats {
    pub blocks_added: u64,
    pub blocks_rolled_back: u64,
    pub txs: u64,
    pub inputs: u64,
    pub add_time: Duration,
    pub rollback_time: Duration,
    /// Time spent waiting for the validation pipeline to drain.
    pub validation_time: Duration,
}

impl BuilderStats {
    pub(crate) fn record_add(
        &mut self,
        txs: usize,
        inputs: usize,
        elapsed: Duration,
        validation: Duration,
    ) {
        self.blocks_added += 1;
        self.txs += txs as u64;
        self.inputs += inputs as u64;
        self.add_time += elapsed;
        self.validation_time += validation;
    }

    pub(crate) fn record_rollback(&mut self, elapsed: Duration) {
        self.blocks_rolled_back += 1;
        self.rollback_time += elapsed;
    }

    fn rate(count: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 { count as f64 / secs } else { 0.0 }
    }

    pub fn blocks_per_sec(&self) -> f64 {
        Self::rate(self.blocks_added, self.add_time)
    }

    pub fn txs_per_sec(&self) -> f64 {
        Self::rate(self.txs, self.add_time)
    }

    pub fn inputs_per_sec(&self) -> f64 {
        Self::rate(self.inputs, self.add_time)
    }
}
