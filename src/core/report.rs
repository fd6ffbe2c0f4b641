// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Throughput and latency accounting of pipeline runs.

use super::clock::as_minutes;
use super::stage::effective_rate;
use std::time::Duration;

/// Statistics of one stage over a run.
#[derive(Clone, Debug, PartialEq)]
pub struct StageReport {
    /// Name of the stage.
    pub name: String,
    /// Number of workers of the stage.
    pub num_workers: usize,
    /// Simulated service time per item.
    pub service_time: Duration,
    /// Number of items that finished service.
    pub processed: usize,
    /// Number of items whose service panicked.
    pub failed: usize,
    /// Highest number of items that were in service at once. Never exceeds
    /// `num_workers`.
    pub peak_resident: usize,
    /// Mean simulated time an item waited for a free worker.
    pub mean_wait: Duration,
}

impl StageReport {
    /// Number of items per simulated minute this stage can sustain.
    pub fn effective_rate(&self) -> f64 {
        effective_rate(self.num_workers, self.service_time)
    }
}

/// An item that went through the whole pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion<T> {
    /// The item, handed back to the caller.
    pub item: T,
    /// Position of the item in the input of the run.
    pub seq: usize,
    /// Simulated time at which the item entered the pipeline, since the start
    /// of the run.
    pub arrived: Duration,
    /// Simulated time at which the item left the last stage, since the start
    /// of the run.
    pub finished: Duration,
}

impl<T> Completion<T> {
    /// End-to-end simulated latency of this item.
    pub fn latency(&self) -> Duration {
        self.finished.saturating_sub(self.arrived)
    }
}

/// Outcome of a pipeline run.
#[derive(Clone, Debug)]
pub struct RunReport<T> {
    /// Number of items submitted to the first stage.
    pub submitted: usize,
    /// Items that went through every stage, in completion order.
    pub completions: Vec<Completion<T>>,
    /// Items that a closed stage refused, in rejection order.
    pub rejected: Vec<T>,
    /// Items whose service panicked in some stage, in failure order. They
    /// didn't go through the remaining stages.
    pub failed: Vec<T>,
    /// Simulated wall time of the run.
    pub elapsed: Duration,
    /// Per-stage statistics, in pipeline order.
    pub stages: Vec<StageReport>,
    /// Whether the run was cancelled before every item could complete.
    pub cancelled: bool,
}

impl<T> RunReport<T> {
    /// Number of items that went through every stage.
    pub fn completed(&self) -> usize {
        self.completions.len()
    }

    /// Whether every submitted item was completed, rejected or failed.
    pub fn is_drained(&self) -> bool {
        self.completions.len() + self.rejected.len() + self.failed.len() == self.submitted
    }

    /// Completed items per simulated minute, over the whole run.
    pub fn throughput(&self) -> f64 {
        let minutes = as_minutes(self.elapsed);
        if minutes == 0.0 {
            0.0
        } else {
            self.completed() as f64 / minutes
        }
    }

    /// Mean end-to-end simulated latency of the completed items.
    pub fn mean_latency(&self) -> Duration {
        if self.completions.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.completions.iter().map(Completion::latency).sum();
        total / self.completions.len() as u32
    }

    /// Highest end-to-end simulated latency of the completed items.
    pub fn max_latency(&self) -> Duration {
        self.completions
            .iter()
            .map(Completion::latency)
            .max()
            .unwrap_or_default()
    }

    /// Returns the completed items in completion order, dropping the timings.
    pub fn into_items(self) -> Vec<T> {
        self.completions.into_iter().map(|c| c.item).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(60 * m)
    }

    fn report() -> RunReport<&'static str> {
        RunReport {
            submitted: 4,
            completions: vec![
                Completion {
                    item: "a",
                    seq: 0,
                    arrived: minutes(0),
                    finished: minutes(11),
                },
                Completion {
                    item: "b",
                    seq: 1,
                    arrived: minutes(0),
                    finished: minutes(21),
                },
            ],
            rejected: vec!["c"],
            failed: vec!["d"],
            elapsed: minutes(20),
            stages: vec![],
            cancelled: true,
        }
    }

    #[test]
    fn test_run_report_accounting() {
        let report = report();
        assert_eq!(report.completed(), 2);
        assert!(report.is_drained());
        assert_eq!(report.throughput(), 0.1);
        assert_eq!(report.mean_latency(), minutes(16));
        assert_eq!(report.max_latency(), minutes(21));
        assert_eq!(report.into_items(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_run_report() {
        let report = RunReport::<u32> {
            submitted: 0,
            completions: vec![],
            rejected: vec![],
            failed: vec![],
            elapsed: Duration::ZERO,
            stages: vec![],
            cancelled: false,
        };
        assert!(report.is_drained());
        assert_eq!(report.throughput(), 0.0);
        assert_eq!(report.mean_latency(), Duration::ZERO);
        assert_eq!(report.max_latency(), Duration::ZERO);
    }

    #[test]
    fn test_stage_report_effective_rate() {
        let report = StageReport {
            name: "Security Check".to_owned(),
            num_workers: 2,
            service_time: minutes(10),
            processed: 0,
            failed: 0,
            peak_resident: 0,
            mean_wait: Duration::ZERO,
        };
        assert_eq!(report.effective_rate(), 0.2);
    }
}
