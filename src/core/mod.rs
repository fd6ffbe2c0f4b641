// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: worker pools, stages, pipelines and the scaled clock.

mod clock;
mod pipeline;
mod report;
mod stage;
mod sync;
mod thread_pool;

pub use clock::{as_minutes, from_minutes, Clock};
pub use pipeline::{Canceller, Pipeline, PipelineBuilder};
pub use report::{Completion, RunReport, StageReport};
pub use stage::{Stage, StageConfig};
pub use thread_pool::{CpuPinningPolicy, Job, ThreadCount, WorkerPool, WorkerPoolBuilder};
