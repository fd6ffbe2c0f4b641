// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pipeline stage: a worker pool whose jobs occupy a worker for a fixed
//! service time.

use super::clock::{as_minutes, from_minutes, Clock};
use super::report::StageReport;
use super::thread_pool::{CpuPinningPolicy, ThreadCount, WorkerPool, WorkerPoolBuilder};
use crate::error::{Error, Rejected, Result};
use crate::macros::log_error;
use crossbeam_utils::CachePadded;
use std::fmt::Display;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration of a single stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageConfig {
    /// Name of the stage, printed in transition lines and error messages.
    pub name: String,
    /// Simulated time during which an item occupies a worker.
    pub service_time: Duration,
    /// Number of workers, i.e. of items that can be in service at once.
    pub num_workers: usize,
}

impl StageConfig {
    /// Creates a stage configuration.
    pub fn new(name: impl Into<String>, service_time: Duration, num_workers: usize) -> Self {
        Self {
            name: name.into(),
            service_time,
            num_workers,
        }
    }

    /// Creates a stage configuration with a service time given in minutes.
    ///
    /// Fails on a negative or non-finite number of minutes.
    pub fn from_minutes(name: impl Into<String>, minutes: f64, num_workers: usize) -> Result<Self> {
        let name = name.into();
        let service_time = from_minutes(minutes).map_err(|_| {
            Error::invalid(
                format!("stage '{name}'"),
                format!("service time must be a non-negative number of minutes, got {minutes}"),
            )
        })?;
        Ok(Self::new(name, service_time, num_workers))
    }

    /// Checks this configuration, naming the stage by its position in errors.
    pub(crate) fn validate(&self, index: usize) -> Result<()> {
        if self.num_workers == 0 {
            return Err(Error::invalid(
                format!("stage #{index} '{}'", self.name),
                "worker count must be non-zero",
            ));
        }
        Ok(())
    }

    /// Number of items per simulated minute this stage can sustain.
    pub fn effective_rate(&self) -> f64 {
        effective_rate(self.num_workers, self.service_time)
    }
}

/// Items per simulated minute for the given number of workers and service
/// time. Infinite for a zero service time.
pub(crate) fn effective_rate(num_workers: usize, service_time: Duration) -> f64 {
    let minutes = as_minutes(service_time);
    if minutes == 0.0 {
        f64::INFINITY
    } else {
        num_workers as f64 / minutes
    }
}

/// Options of a stage that don't depend on the stage itself.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct StageOptions {
    /// Whether to print a line each time an item enters or leaves service.
    pub verbose: bool,
    /// Policy to pin the stage's workers to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// CPU of the stage's first worker, when pinning.
    pub first_cpu: usize,
}

/// State shared between a [`Stage`] and the jobs it submits.
struct StageShared {
    /// Name of the stage.
    name: String,
    /// Simulated service time per item.
    service_time: Duration,
    /// Number of workers.
    num_workers: usize,
    /// Clock used to simulate service and timestamp transitions.
    clock: Arc<Clock>,
    /// Whether to print transition lines.
    verbose: bool,
    /// Number of items currently in service.
    resident: CachePadded<AtomicUsize>,
    /// Highest number of items in service at once.
    peak_resident: CachePadded<AtomicUsize>,
    /// Number of items that finished service.
    processed: CachePadded<AtomicUsize>,
    /// Number of items whose service panicked.
    failed: CachePadded<AtomicUsize>,
    /// Sum of the simulated queueing delays, in nanoseconds.
    total_wait_nanos: CachePadded<AtomicU64>,
}

/// A stage of a pipeline, wrapping a [`WorkerPool`] and a fixed service time.
///
/// At most `num_workers` items are in service at once. Extra items wait in the
/// pool's queue, in FIFO order.
pub struct Stage {
    shared: Arc<StageShared>,
    pool: WorkerPool,
}

impl Stage {
    /// Creates a stage and spawns its workers.
    ///
    /// Fails with [`Error::InvalidConfiguration`] if the stage has zero
    /// workers.
    pub fn new(config: &StageConfig, clock: Arc<Clock>) -> Result<Self> {
        Self::with_options(0, config, clock, StageOptions::default())
    }

    /// Creates the stage at the given position of a pipeline.
    pub(crate) fn with_options(
        index: usize,
        config: &StageConfig,
        clock: Arc<Clock>,
        options: StageOptions,
    ) -> Result<Self> {
        config.validate(index)?;
        let pool = WorkerPoolBuilder {
            name: config.name.clone(),
            num_threads: ThreadCount::try_from(config.num_workers)?,
            cpu_pinning: options.cpu_pinning,
            first_cpu: options.first_cpu,
        }
        .build()?;
        Ok(Self {
            shared: Arc::new(StageShared {
                name: config.name.clone(),
                service_time: config.service_time,
                num_workers: config.num_workers,
                clock,
                verbose: options.verbose,
                resident: CachePadded::new(AtomicUsize::new(0)),
                peak_resident: CachePadded::new(AtomicUsize::new(0)),
                processed: CachePadded::new(AtomicUsize::new(0)),
                failed: CachePadded::new(AtomicUsize::new(0)),
                total_wait_nanos: CachePadded::new(AtomicU64::new(0)),
            }),
            pool,
        })
    }

    /// Returns the name of this stage.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the number of workers of this stage.
    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// Returns the simulated service time of this stage.
    pub fn service_time(&self) -> Duration {
        self.shared.service_time
    }

    /// Returns the number of items currently in service.
    pub fn resident(&self) -> usize {
        self.shared.resident.load(Ordering::SeqCst)
    }

    /// Accepts an item: once a worker is free, it occupies the worker for the
    /// service time, then `on_complete` is called with it, exactly once.
    ///
    /// If the stage is shutting down, the item is handed back in a
    /// [`Rejected`] and `on_complete` is never called. If serving the item
    /// panics, the item is dropped, see
    /// [`process_or_fail()`](Self::process_or_fail).
    pub fn process<T: Display + Send + 'static>(
        &self,
        item: T,
        on_complete: impl FnOnce(T) + Send + 'static,
    ) -> std::result::Result<(), Rejected<T>> {
        self.process_or_fail(item, on_complete, drop)
    }

    /// Like [`process()`](Self::process), but if serving the item panics
    /// (e.g. in its [`Display`] implementation), the item is handed to
    /// `on_failure` instead of `on_complete`. The worker and the resident
    /// count recover either way.
    pub fn process_or_fail<T: Display + Send + 'static>(
        &self,
        item: T,
        on_complete: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(T) + Send + 'static,
    ) -> std::result::Result<(), Rejected<T>> {
        let shared = self.shared.clone();
        let submitted = shared.clock.now();
        self.pool
            .try_submit_with(
                (item, on_complete, on_failure),
                move |(item, on_complete, on_failure)| {
                    match catch_unwind(AssertUnwindSafe(|| shared.serve(&item, submitted))) {
                        Ok(()) => on_complete(item),
                        Err(_e) => {
                            shared.failed.fetch_add(1, Ordering::SeqCst);
                            log_error!(
                                "[stage {}] Serving an item panicked: {}",
                                shared.name,
                                super::thread_pool::panic_message(&_e)
                            );
                            on_failure(item);
                        }
                    }
                },
            )
            .map_err(|(item, _, _)| Rejected(item))
    }

    /// Returns the statistics of this stage since it was created or since the
    /// last call to [`reset_stats()`](Self::reset_stats).
    pub fn report(&self) -> StageReport {
        let shared = &self.shared;
        let processed = shared.processed.load(Ordering::SeqCst);
        let total_wait_nanos = shared.total_wait_nanos.load(Ordering::SeqCst);
        StageReport {
            name: shared.name.clone(),
            num_workers: shared.num_workers,
            service_time: shared.service_time,
            processed,
            failed: shared.failed.load(Ordering::SeqCst),
            peak_resident: shared.peak_resident.load(Ordering::SeqCst),
            mean_wait: match u64::try_from(processed) {
                Ok(0) | Err(_) => Duration::ZERO,
                Ok(processed) => Duration::from_nanos(total_wait_nanos / processed),
            },
        }
    }

    /// Resets the statistics reported by [`report()`](Self::report).
    pub fn reset_stats(&self) {
        let shared = &self.shared;
        shared.peak_resident.store(0, Ordering::SeqCst);
        shared.processed.store(0, Ordering::SeqCst);
        shared.failed.store(0, Ordering::SeqCst);
        shared.total_wait_nanos.store(0, Ordering::SeqCst);
    }

    /// Refuses new items without waiting for the ones already accepted.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Returns whether this stage refuses new items.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Refuses new items and waits until every accepted item completed.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Returns the number of jobs of this stage that panicked.
    pub fn panicked_jobs(&self) -> usize {
        self.pool.panicked_jobs()
    }
}

impl StageShared {
    /// Occupies the current worker with the given item for the service time.
    fn serve<T: Display>(&self, item: &T, submitted: Instant) {
        let wait = self.clock.elapsed_simulated(submitted);
        self.total_wait_nanos.fetch_add(
            u64::try_from(wait.as_nanos()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
        // Formatted before anything is printed, so that a panicking `Display`
        // never leaves half a line.
        let label = if self.verbose {
            item.to_string()
        } else {
            String::new()
        };

        let resident = self.resident.fetch_add(1, Ordering::SeqCst) + 1;
        let _resident = ResidentGuard(&self.resident);
        self.peak_resident.fetch_max(resident, Ordering::SeqCst);
        debug_assert!(resident <= self.num_workers);

        self.print_transition("is processing", &label);
        self.clock.scaled_sleep(self.service_time);
        self.print_transition("is done processing", &label);

        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Prints a transition line if this stage is verbose.
    fn print_transition(&self, action: &str, label: &str) {
        if self.verbose {
            let minutes = as_minutes(self.clock.since_origin()) as u64;
            let line = transition_line(minutes, &self.name, action, label);
            let _ = writeln!(std::io::stdout().lock(), "{line}");
        }
    }
}

/// Releases a worker slot of the resident count, even if service panics.
struct ResidentGuard<'a>(&'a AtomicUsize);

impl Drop for ResidentGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Formats the line printed when an item enters or leaves a stage.
fn transition_line(minutes: u64, stage: &str, action: &str, item: &str) -> String {
    format!("At {minutes}min  {stage} {action} {item}")
}
