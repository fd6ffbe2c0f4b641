// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size pool of worker threads consuming a shared FIFO job queue.

use super::sync::{Channel, Status};
use crate::error::{Error, Result};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A unit of work: a callable capturing everything it needs.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Number of threads to spawn in a worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> Result<NonZeroUsize> {
        match self {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .map_err(|e| Error::invalid("worker pool", format!("{e}"))),
            ThreadCount::Count(count) => Ok(count),
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = Error;

    fn try_from(thread_count: usize) -> Result<Self> {
        let count = NonZeroUsize::try_from(thread_count)
            .map_err(|_| Error::invalid("worker pool", "worker count must be non-zero"))?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    #[default]
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a worker pool fails.
    Always,
}

/// A builder for [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct WorkerPoolBuilder {
    /// Name of the pool, used as a prefix for worker thread names.
    pub name: String,
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Index of the CPU the first worker is pinned to (when pinning). Worker
    /// `i` is pinned to CPU `(first_cpu + i) % available_parallelism`.
    pub first_cpu: usize,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            name: "worker".to_owned(),
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
            first_cpu: 0,
        }
    }
}

impl WorkerPoolBuilder {
    /// Spawns a worker pool.
    ///
    /// ```
    /// # use pipelight::{CpuPinningPolicy, ThreadCount, WorkerPoolBuilder};
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// # use std::sync::Arc;
    /// let pool = WorkerPoolBuilder {
    ///     name: "adder".to_owned(),
    ///     num_threads: ThreadCount::try_from(2).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     first_cpu: 0,
    /// }
    /// .build()
    /// .unwrap();
    ///
    /// let counter = Arc::new(AtomicUsize::new(0));
    /// for _ in 0..10 {
    ///     let counter = counter.clone();
    ///     pool.submit(move || {
    ///         counter.fetch_add(1, Ordering::SeqCst);
    ///     })
    ///     .unwrap();
    /// }
    /// pool.shutdown();
    /// assert_eq!(counter.load(Ordering::SeqCst), 10);
    /// ```
    pub fn build(&self) -> Result<WorkerPool> {
        WorkerPool::with_builder(self)
    }
}

/// State shared between a [`WorkerPool`] handle and its worker threads.
struct Shared {
    /// Name of the pool.
    name: String,
    /// Queue of pending jobs.
    queue: Channel<Job>,
    /// Number of jobs submitted but not yet finished (queued or running).
    outstanding: Status<usize>,
    /// Number of jobs that ran to completion or panicked.
    num_executed: CachePadded<AtomicUsize>,
    /// Number of jobs that panicked.
    num_panicked: CachePadded<AtomicUsize>,
}

/// A fixed-size set of worker threads consuming a shared unbounded FIFO queue.
///
/// Jobs are dequeued in submission order, but with more than one worker they
/// may finish in any order. A job that panics is logged and counted; the
/// worker that ran it moves on to the next job.
pub struct WorkerPool {
    /// State shared with the worker threads.
    shared: Arc<Shared>,
    /// Number of worker threads spawned in this pool.
    num_threads: NonZeroUsize,
    /// Handles to the worker threads not joined yet.
    threads: Mutex<Vec<WorkerThreadHandle>>,
}

/// Handle to a worker thread in a pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns a pool of `num_threads` workers.
    ///
    /// Fails with [`Error::InvalidConfiguration`] if `num_threads` is zero.
    pub fn new(num_threads: usize) -> Result<Self> {
        WorkerPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads)?,
            ..Default::default()
        }
        .build()
    }

    /// Spawns a pool using the given parameters.
    fn with_builder(builder: &WorkerPoolBuilder) -> Result<Self> {
        let num_threads = builder.num_threads.count()?;

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match builder.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                return Err(Error::invalid(
                    format!("worker pool '{}'", builder.name),
                    "pinning threads to CPUs is not implemented on this platform",
                ));
            }
        }

        let num_cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let shared = Arc::new(Shared {
            name: builder.name.clone(),
            queue: Channel::new(),
            outstanding: Status::new(0),
            num_executed: CachePadded::new(AtomicUsize::new(0)),
            num_panicked: CachePadded::new(AtomicUsize::new(0)),
        });

        let mut threads = Vec::with_capacity(num_threads.get());
        for id in 0..num_threads.get() {
            let context = ThreadContext {
                id,
                cpu: (builder.first_cpu + id) % num_cpus,
                cpu_pinning: builder.cpu_pinning,
                shared: shared.clone(),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{id}", builder.name))
                .spawn(move || context.run());
            match spawned {
                Ok(handle) => threads.push(WorkerThreadHandle { handle }),
                Err(e) => {
                    log_error!("[pool {}] Failed to spawn worker #{id}: {e}", builder.name);
                    // Stop the workers spawned so far before reporting the error.
                    shared.queue.close();
                    for t in threads {
                        let _ = t.handle.join();
                    }
                    return Err(Error::invalid(
                        format!("worker pool '{}'", builder.name),
                        format!("failed to spawn worker thread: {e}"),
                    ));
                }
            }
        }
        log_debug!("[pool {}] Spawned {num_threads} threads", builder.name);

        Ok(Self {
            shared,
            num_threads,
            threads: Mutex::new(threads),
        })
    }

    /// Returns the number of worker threads that have been spawned in this
    /// pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }

    /// Returns the name of this pool.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueues a job and wakes up one idle worker. Never blocks.
    ///
    /// Fails with [`Error::PoolClosed`] once [`close()`](Self::close) or
    /// [`shutdown()`](Self::shutdown) has been called.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.try_submit_with(job, |job| job())
            .map_err(|_| Error::PoolClosed)
    }

    /// Enqueues a job running `run(value)`, or hands `value` back if the pool
    /// is closed.
    ///
    /// This lets callers recover whatever the job would have consumed instead
    /// of losing it with the job.
    pub fn try_submit_with<J: Send + 'static>(
        &self,
        value: J,
        run: impl FnOnce(J) + Send + 'static,
    ) -> std::result::Result<(), J> {
        // Count the job before it becomes visible to the workers, so that
        // `wait_idle()` can never observe a finished job that wasn't counted.
        *self.shared.outstanding.lock() += 1;
        let result = self
            .shared
            .queue
            .send_with(value, |value| -> Job { Box::new(move || run(value)) });
        if result.is_err() {
            self.shared.outstanding.update_all(|n| *n -= 1);
        }
        result
    }

    /// Returns the number of jobs waiting in the queue.
    pub fn pending_jobs(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns the number of jobs that finished running, including the ones
    /// that panicked.
    pub fn executed_jobs(&self) -> usize {
        self.shared.num_executed.load(Ordering::SeqCst)
    }

    /// Returns the number of jobs that panicked.
    pub fn panicked_jobs(&self) -> usize {
        self.shared.num_panicked.load(Ordering::SeqCst)
    }

    /// Returns whether this pool refuses new jobs.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Blocks until every job submitted so far has finished running.
    pub fn wait_idle(&self) {
        drop(self.shared.outstanding.wait_while(|n| *n != 0));
    }

    /// Refuses new jobs and lets the workers exit once the queue is drained,
    /// without waiting for them. Idempotent.
    pub fn close(&self) {
        if !self.shared.queue.is_closed() {
            log_debug!("[pool {}] Closing the job queue...", self.shared.name);
        }
        self.shared.queue.close();
    }

    /// Refuses new jobs, lets the workers drain the jobs already queued, and
    /// waits for every worker thread to exit. Idempotent.
    #[allow(clippy::unused_enumerate_index)]
    pub fn shutdown(&self) {
        self.close();

        // Holding the lock while joining makes concurrent callers wait for the
        // workers too.
        let mut threads = self.threads.lock().unwrap();
        if threads.is_empty() {
            return;
        }
        log_debug!("[pool {}] Joining threads in the pool...", self.shared.name);
        let current = std::thread::current().id();
        for (_i, t) in threads.drain(..).enumerate() {
            if t.handle.thread().id() == current {
                // The last owner of this pool was dropped from one of its own
                // jobs. The worker exits on its own once the queue is drained.
                log_warn!(
                    "[pool {}] Not joining thread {_i} from itself",
                    self.shared.name
                );
                continue;
            }
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!(
                    "[pool {}] Thread {_i} joined with result: {result:?}",
                    self.shared.name
                ),
                Err(_) => log_error!(
                    "[pool {}] Thread {_i} joined with result: {result:?}",
                    self.shared.name
                ),
            }
        }
        log_debug!("[pool {}] Joined threads.", self.shared.name);
    }
}

impl Drop for WorkerPool {
    /// Drains the queue and joins all the threads in the pool.
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread index.
    id: usize,
    /// CPU to pin this thread to, if pinning is requested.
    #[cfg_attr(
        any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ),
        allow(dead_code)
    )]
    cpu: usize,
    /// Policy to pin this thread to a CPU.
    #[cfg_attr(
        any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ),
        allow(dead_code)
    )]
    cpu_pinning: CpuPinningPolicy,
    /// State shared with the pool handle.
    shared: Arc<Shared>,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(&self) {
        self.pin_to_cpu();

        let _id = self.id;
        while let Some(job) = self.shared.queue.recv() {
            log_trace!("[pool {}, thread {_id}] Running a job", self.shared.name);
            // A panicking job must neither kill this worker nor leave the
            // outstanding counter behind.
            if let Err(_e) = catch_unwind(AssertUnwindSafe(job)) {
                self.shared.num_panicked.fetch_add(1, Ordering::SeqCst);
                log_error!(
                    "[pool {}, thread {_id}] A job panicked: {}",
                    self.shared.name,
                    panic_message(&_e)
                );
            }
            self.shared.num_executed.fetch_add(1, Ordering::SeqCst);
            self.shared.outstanding.update_all(|n| *n -= 1);
        }
        log_debug!(
            "[pool {}, thread {_id}] Queue closed and drained, exiting",
            self.shared.name
        );
    }

    /// Pins this thread to its CPU according to the pinning policy.
    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    fn pin_to_cpu(&self) {
        let (id, cpu) = (self.id, self.cpu);
        match self.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported | CpuPinningPolicy::Always => {
                let mut cpu_set = CpuSet::new();
                if let Err(_e) = cpu_set.set(cpu) {
                    log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
                } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                    log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
                } else {
                    log_debug!("Pinned thread #{id} to CPU #{cpu}");
                }
            }
        }
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    fn pin_to_cpu(&self) {}
}

/// Extracts a printable message from a panic payload.
#[cfg_attr(not(feature = "log"), allow(dead_code))]
pub(super) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_num_threads() {
        let pool = WorkerPool::new(4).unwrap();
        assert_eq!(pool.num_threads(), NonZeroUsize::try_from(4).unwrap());

        let pool = WorkerPoolBuilder::default().build().unwrap();
        assert_eq!(
            pool.num_threads(),
            std::thread::available_parallelism().unwrap()
        );
    }

    #[test]
    fn test_runs_all_jobs() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert_eq!(pool.executed_jobs(), 1000);
        assert_eq!(pool.pending_jobs(), 0);
    }

    #[test]
    fn test_single_worker_is_fifo() {
        let pool = WorkerPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            pool.submit(move || order.lock().unwrap().push(i)).unwrap();
        }
        pool.shutdown();
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_at_most_num_threads_jobs_run_concurrently() {
        let pool = WorkerPool::new(3).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..30 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_idle();
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "{peak} jobs ran concurrently");
        assert!(peak >= 1);
    }

    #[test]
    fn test_jobs_run_in_parallel() {
        let pool = WorkerPool::new(4).unwrap();
        let start = Instant::now();
        for _ in 0..4 {
            pool.submit(|| std::thread::sleep(Duration::from_millis(100)))
                .unwrap();
        }
        pool.wait_idle();
        // Serial execution would take 400ms.
        assert!(start.elapsed() < Duration::from_millis(350));
    }

    #[test]
    fn test_shutdown_drains_queued_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        assert!(pool.is_closed());
        assert_eq!(pool.submit(|| ()), Err(Error::PoolClosed));
        assert_eq!(pool.try_submit_with(42, |_| ()), Err(42));
        // Rejected submissions don't count as outstanding.
        pool.wait_idle();
    }

    #[test]
    fn test_submit_after_close_fails() {
        let pool = WorkerPool::new(2).unwrap();
        pool.close();
        assert_eq!(pool.submit(|| ()), Err(Error::PoolClosed));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(2).unwrap();
        pool.submit(|| ()).unwrap();
        pool.shutdown();
        pool.shutdown();
        pool.close();
        assert_eq!(pool.executed_jobs(), 1);
    }

    #[test]
    fn test_concurrent_shutdown_waits_for_workers() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }
        let other = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.shutdown())
        };
        pool.shutdown();
        assert!(done.load(Ordering::SeqCst));
        other.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_is_isolated() {
        let pool = WorkerPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                if i % 3 == 0 {
                    panic!("job {i} failed");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_idle();
        // Jobs 0, 3, 6 and 9 panicked; the single worker survived them all.
        assert_eq!(pool.panicked_jobs(), 4);
        assert_eq!(pool.executed_jobs(), 10);
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        pool.submit(|| ()).unwrap();
        pool.wait_idle();
        assert_eq!(pool.executed_jobs(), 11);
    }

    #[test]
    fn test_drop_from_own_job_does_not_deadlock() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let (sender, receiver) = std::sync::mpsc::channel();
        {
            let pool_clone = pool.clone();
            pool.submit(move || {
                // Keep the last reference alive inside the job.
                let _pool = pool_clone;
                std::thread::sleep(Duration::from_millis(20));
                sender.send(()).unwrap();
            })
            .unwrap();
        }
        drop(pool);
        receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("job didn't run");
    }

    #[test]
    fn test_cpu_pinning_if_supported() {
        let pool = WorkerPoolBuilder {
            name: "pinned".to_owned(),
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
            first_cpu: 1,
        }
        .build()
        .unwrap();
        pool.submit(|| ()).unwrap();
        pool.wait_idle();
        assert_eq!(pool.name(), "pinned");
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    fn test_cpu_pinning_always_not_supported() {
        let result = WorkerPoolBuilder {
            cpu_pinning: CpuPinningPolicy::Always,
            ..Default::default()
        }
        .build();
        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }
}
