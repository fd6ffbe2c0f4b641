// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pipelines of stages with different concurrency and service times.

use super::clock::Clock;
use super::report::{Completion, RunReport};
use super::stage::{Stage, StageConfig, StageOptions};
use super::sync::{Channel, Status};
use super::thread_pool::CpuPinningPolicy;
use crate::error::{Error, Rejected, Result};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_utils::CachePadded;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A builder for [`Pipeline`].
#[derive(Clone, Debug)]
pub struct PipelineBuilder {
    /// Ordered stage definitions.
    pub stages: Vec<StageConfig>,
    /// Real-time compression divisor applied by the pipeline's clock.
    pub scale_factor: f64,
    /// Whether to print a line each time an item enters or leaves a stage.
    pub verbose: bool,
    /// Policy to pin the workers of every stage to CPUs. Stages are pinned to
    /// consecutive CPUs, in pipeline order.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            scale_factor: 1.0,
            verbose: false,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl PipelineBuilder {
    /// Validates the configuration and spawns the pipeline's threads.
    ///
    /// ```
    /// # use pipelight::{PipelineBuilder, StageConfig};
    /// let mut pipeline = PipelineBuilder {
    ///     stages: vec![
    ///         StageConfig::from_minutes("Boarding Pass Check", 1.0, 1).unwrap(),
    ///         StageConfig::from_minutes("Security Check", 10.0, 4).unwrap(),
    ///     ],
    ///     // 1 simulated minute = 1 real millisecond.
    ///     scale_factor: 60_000.0,
    ///     ..Default::default()
    /// }
    /// .build()
    /// .unwrap();
    ///
    /// let passengers = (1..=4).map(|i| format!("Person {i}")).collect::<Vec<_>>();
    /// let report = pipeline.run(passengers).unwrap();
    /// assert_eq!(report.completed(), 4);
    /// ```
    pub fn build<T: Display + Send + 'static>(&self) -> Result<Pipeline<T>> {
        Pipeline::with_builder(self)
    }
}

/// An item travelling through the pipeline.
struct Ticket<T> {
    /// Position of the item in the input of its run.
    seq: usize,
    /// The item itself.
    item: T,
    /// Simulated time at which the item entered the pipeline.
    arrived: Duration,
}

impl<T: Display> Display for Ticket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.item.fmt(f)
    }
}

/// Items that left the pipeline during the current run.
struct Sink<T> {
    completions: Vec<Completion<T>>,
    rejected: Vec<T>,
    failed: Vec<T>,
}

impl<T> Sink<T> {
    /// Number of items that left the pipeline, whether completed, rejected or
    /// failed.
    fn len(&self) -> usize {
        self.completions.len() + self.rejected.len() + self.failed.len()
    }
}

/// Everything the stages, managers and the caller of a pipeline share.
struct PipelineContext<T> {
    /// Clock of the pipeline.
    clock: Arc<Clock>,
    /// Stages, in pipeline order.
    stages: Vec<Stage>,
    /// Queue between stage `i` and stage `i + 1`, drained by manager `i`.
    boundaries: Vec<Channel<Ticket<T>>>,
    /// Items that left the pipeline during the current run.
    sink: Status<Sink<T>>,
    /// Total number of items submitted to the first stage.
    submitted: CachePadded<AtomicUsize>,
    /// Total number of items that left the last stage.
    completed: CachePadded<AtomicUsize>,
    /// Whether the pipeline was cancelled.
    cancelled: AtomicBool,
}

impl<T: Display + Send + 'static> PipelineContext<T> {
    /// Submits a ticket to the given stage, whose completion hands it off to
    /// the next boundary.
    ///
    /// Items are only logged by sequence number here: their `Display` runs on
    /// stage workers, where a panic is contained.
    fn dispatch(self: &Arc<Self>, index: usize, ticket: Ticket<T>) {
        let on_complete = self.clone();
        let on_failure = self.clone();
        let result = self.stages[index].process_or_fail(
            ticket,
            move |ticket| on_complete.hand_off(index, ticket),
            move |ticket| on_failure.fail(index, ticket),
        );
        if let Err(Rejected(ticket)) = result {
            log_warn!(
                "[pipeline] Stage '{}' is closed, rejecting item #{}",
                self.stages[index].name(),
                ticket.seq
            );
            self.reject(ticket);
        }
    }

    /// Moves a ticket that finished the given stage to the next boundary, or
    /// to the sink after the last stage.
    fn hand_off(&self, index: usize, ticket: Ticket<T>) {
        if index + 1 == self.stages.len() {
            self.complete(ticket);
            return;
        }
        log_trace!(
            "[pipeline] Handing item #{} off to boundary {index}",
            ticket.seq
        );
        if let Err(ticket) = self.boundaries[index].send(ticket) {
            log_warn!(
                "[pipeline] Boundary {index} is closed, rejecting item #{}",
                ticket.seq
            );
            self.reject(ticket);
        }
    }

    fn complete(&self, ticket: Ticket<T>) {
        let finished = self.clock.since_origin();
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(completed <= self.submitted.load(Ordering::SeqCst));
        log_trace!("[pipeline] Item #{} completed the pipeline", ticket.seq);
        self.sink.update_all(|sink| {
            sink.completions.push(Completion {
                item: ticket.item,
                seq: ticket.seq,
                arrived: ticket.arrived,
                finished,
            })
        });
    }

    fn reject(&self, ticket: Ticket<T>) {
        self.sink.update_all(|sink| sink.rejected.push(ticket.item));
    }

    /// Records an item whose service panicked in the given stage.
    fn fail(&self, _index: usize, ticket: Ticket<T>) {
        log_warn!(
            "[pipeline] Item #{} failed in stage '{}', skipping the remaining stages",
            ticket.seq,
            self.stages[_index].name()
        );
        self.sink.update_all(|sink| sink.failed.push(ticket.item));
    }

    /// Main loop of the manager of the given boundary.
    fn manage(self: Arc<Self>, boundary: usize) {
        while let Some(ticket) = self.boundaries[boundary].recv() {
            self.dispatch(boundary + 1, ticket);
        }
        log_debug!("[pipeline] Boundary {boundary} closed and drained, manager exiting");
    }
}

impl<T> PipelineContext<T> {
    /// Closes every stage, so that items not yet accepted by their next stage
    /// are rejected.
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            log_debug!("[pipeline] Cancelling...");
        }
        for stage in &self.stages {
            stage.close();
        }
    }
}

/// An ordered sequence of stages.
///
/// Items enter the first stage in input order. When an item finishes stage
/// `i`, it is pushed into the FIFO queue of boundary `i`, whose manager thread
/// submits it to stage `i + 1`. Items leaving the last stage are collected
/// and handed back in the [`RunReport`].
///
/// Because stages may have several workers, items can overtake each other.
/// Throughput is bounded by the slowest stage, see
/// [`throughput_bound()`](Self::throughput_bound).
pub struct Pipeline<T> {
    /// Stage definitions this pipeline was built from.
    configs: Vec<StageConfig>,
    /// State shared with the stages and managers.
    context: Arc<PipelineContext<T>>,
    /// Manager thread of each boundary, until joined.
    managers: Vec<Option<JoinHandle<()>>>,
}

impl<T: Display + Send + 'static> Pipeline<T> {
    /// Creates a pipeline with the given stages, a scale factor of 1 and
    /// without verbose output.
    pub fn new(stages: Vec<StageConfig>) -> Result<Self> {
        PipelineBuilder {
            stages,
            ..Default::default()
        }
        .build()
    }

    /// Creates a pipeline using the given parameters.
    fn with_builder(builder: &PipelineBuilder) -> Result<Self> {
        if builder.stages.is_empty() {
            return Err(Error::invalid("pipeline", "at least one stage is required"));
        }
        // Reject any invalid stage before spawning a single thread.
        for (index, config) in builder.stages.iter().enumerate() {
            config.validate(index)?;
        }
        let clock = Arc::new(Clock::new(builder.scale_factor)?);

        let mut stages = Vec::with_capacity(builder.stages.len());
        let mut first_cpu = 0;
        for (index, config) in builder.stages.iter().enumerate() {
            let options = StageOptions {
                verbose: builder.verbose,
                cpu_pinning: builder.cpu_pinning,
                first_cpu,
            };
            stages.push(Stage::with_options(index, config, clock.clone(), options)?);
            first_cpu += config.num_workers;
        }

        let context = Arc::new(PipelineContext {
            clock,
            boundaries: (1..stages.len()).map(|_| Channel::new()).collect(),
            stages,
            sink: Status::new(Sink {
                completions: Vec::new(),
                rejected: Vec::new(),
                failed: Vec::new(),
            }),
            submitted: CachePadded::new(AtomicUsize::new(0)),
            completed: CachePadded::new(AtomicUsize::new(0)),
            cancelled: AtomicBool::new(false),
        });

        let mut managers = Vec::with_capacity(context.boundaries.len());
        for boundary in 0..context.boundaries.len() {
            let manager_context = context.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("boundary-{boundary}"))
                .spawn(move || manager_context.manage(boundary));
            match spawned {
                Ok(handle) => managers.push(Some(handle)),
                Err(e) => {
                    log_error!("[pipeline] Failed to spawn manager #{boundary}: {e}");
                    for boundary in &context.boundaries {
                        boundary.close();
                    }
                    for handle in managers.into_iter().flatten() {
                        let _ = handle.join();
                    }
                    return Err(Error::invalid(
                        "pipeline",
                        format!("failed to spawn manager thread: {e}"),
                    ));
                }
            }
        }
        log_debug!(
            "[pipeline] Spawned {} stages and {} managers",
            context.stages.len(),
            managers.len()
        );

        Ok(Self {
            configs: builder.stages.clone(),
            context,
            managers,
        })
    }

    /// Pushes the given items through the pipeline, in input order, and waits
    /// until every one of them left it.
    ///
    /// Returns immediately with an empty report if `items` is empty. Fails
    /// with [`Error::PoolClosed`] if the pipeline was shut down or cancelled.
    ///
    /// An item whose service panics (e.g. in its `Display` implementation) is
    /// logged and handed back in [`RunReport::failed`], and the other items
    /// carry on.
    pub fn run(&mut self, items: Vec<T>) -> Result<RunReport<T>> {
        self.run_until(items, None)
    }

    /// Like [`run()`](Self::run), but cancels the pipeline if the items
    /// haven't all left it after the given simulated time.
    ///
    /// Items already accepted by a stage still complete that stage; they are
    /// then rejected by the next one. The report is flagged as cancelled.
    pub fn run_with_deadline(&mut self, items: Vec<T>, deadline: Duration) -> Result<RunReport<T>> {
        self.run_until(items, Some(deadline))
    }

    fn run_until(&mut self, items: Vec<T>, deadline: Option<Duration>) -> Result<RunReport<T>> {
        let context = &self.context;
        if context.cancelled.load(Ordering::SeqCst) || context.stages.iter().any(Stage::is_closed)
        {
            return Err(Error::PoolClosed);
        }

        for stage in &context.stages {
            stage.reset_stats();
        }
        context.clock.reset();
        let start = context.clock.now();

        let expected = items.len();
        for (seq, item) in items.into_iter().enumerate() {
            context.submitted.fetch_add(1, Ordering::SeqCst);
            let ticket = Ticket {
                seq,
                item,
                arrived: context.clock.since_origin(),
            };
            context.dispatch(0, ticket);
        }

        let is_pending = |sink: &mut Sink<T>| sink.len() < expected;
        let mut sink = match deadline {
            None => context.sink.wait_while(is_pending),
            Some(deadline) => {
                let real_deadline = start + context.clock.to_real(deadline);
                let (sink, timed_out) = context.sink.wait_while_until(real_deadline, is_pending);
                if timed_out {
                    drop(sink);
                    log_warn!("[pipeline] Deadline of {deadline:?} exceeded, cancelling");
                    context.cancel();
                    context.sink.wait_while(is_pending)
                } else {
                    sink
                }
            }
        };
        let elapsed = if expected == 0 {
            Duration::ZERO
        } else {
            context.clock.elapsed_simulated(start)
        };
        let completions = std::mem::take(&mut sink.completions);
        let rejected = std::mem::take(&mut sink.rejected);
        let failed = std::mem::take(&mut sink.failed);
        drop(sink);

        Ok(RunReport {
            submitted: expected,
            completions,
            rejected,
            failed,
            elapsed,
            stages: context.stages.iter().map(Stage::report).collect(),
            cancelled: context.cancelled.load(Ordering::SeqCst),
        })
    }
}

impl<T> Pipeline<T> {
    /// Returns the number of stages.
    pub fn num_stages(&self) -> usize {
        self.configs.len()
    }

    /// Returns the stage definitions this pipeline was built from.
    pub fn stage_configs(&self) -> &[StageConfig] {
        &self.configs
    }

    /// Returns the stages of this pipeline, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.context.stages
    }

    /// Returns the clock of this pipeline.
    pub fn clock(&self) -> &Clock {
        &self.context.clock
    }

    /// Total number of items submitted over all runs.
    pub fn submitted(&self) -> usize {
        self.context.submitted.load(Ordering::SeqCst)
    }

    /// Total number of items that went through every stage over all runs.
    pub fn completed(&self) -> usize {
        self.context.completed.load(Ordering::SeqCst)
    }

    /// Highest sustainable throughput, in items per simulated minute: the
    /// effective rate of the bottleneck stage.
    pub fn throughput_bound(&self) -> f64 {
        self.configs
            .iter()
            .map(StageConfig::effective_rate)
            .fold(f64::INFINITY, f64::min)
    }

    /// Index of the stage with the lowest effective rate (the first one on
    /// ties).
    pub fn bottleneck(&self) -> usize {
        let mut bottleneck = 0;
        for (index, config) in self.configs.iter().enumerate() {
            if config.effective_rate() < self.configs[bottleneck].effective_rate() {
                bottleneck = index;
            }
        }
        bottleneck
    }

    /// Whether every stage has the same effective rate.
    pub fn is_balanced(&self) -> bool {
        let bound = self.throughput_bound();
        self.configs.iter().all(|config| {
            let rate = config.effective_rate();
            rate == bound || (rate - bound).abs() <= 1e-9 * bound
        })
    }

    /// Returns a handle that cancels this pipeline from another thread.
    pub fn canceller(&self) -> Canceller<T> {
        Canceller {
            context: self.context.clone(),
        }
    }

    /// Drains the pipeline in stage order and joins all its threads.
    /// Idempotent.
    ///
    /// Items still in flight complete (unless the pipeline was cancelled).
    /// Subsequent runs fail with [`Error::PoolClosed`].
    pub fn shutdown(&mut self) {
        let context = &self.context;
        for (index, stage) in context.stages.iter().enumerate() {
            stage.shutdown();
            if let Some(boundary) = context.boundaries.get(index) {
                boundary.close();
            }
            if let Some(handle) = self.managers.get_mut(index).and_then(Option::take) {
                if handle.join().is_err() {
                    log_error!("[pipeline] Manager of boundary {index} panicked");
                }
            }
        }
    }
}

impl<T> Drop for Pipeline<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A handle to cancel a [`Pipeline`] from another thread.
pub struct Canceller<T> {
    context: Arc<PipelineContext<T>>,
}

impl<T> Clone for Canceller<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<T> Canceller<T> {
    /// Closes every stage of the pipeline. Items already accepted by a stage
    /// complete it, then get rejected by the next one. Idempotent.
    pub fn cancel(&self) {
        self.context.cancel();
    }

    /// Whether the pipeline was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.context.cancelled.load(Ordering::SeqCst)
    }
}
