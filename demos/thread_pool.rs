// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Runs sleeping jobs on a small worker pool.

use clap::Parser;
use pipelight::{ThreadCount, WorkerPoolBuilder};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

fn main() -> pipelight::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let pool = WorkerPoolBuilder {
        name: "demo".to_owned(),
        num_threads: ThreadCount::Count(cli.num_threads),
        ..Default::default()
    }
    .build()?;

    let start = Instant::now();
    for i in 0..cli.jobs {
        let sleep = Duration::from_millis(cli.sleep_ms);
        pool.submit(move || {
            let thread = std::thread::current();
            println!(
                "[{:?}] Job {i} running on {}",
                start.elapsed(),
                thread.name().unwrap_or("?")
            );
            std::thread::sleep(sleep);
        })?;
    }
    pool.wait_idle();
    println!(
        "Ran {} jobs on {} threads in {:?}",
        pool.executed_jobs(),
        pool.num_threads(),
        start.elapsed()
    );
    pool.shutdown();
    Ok(())
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of worker threads.
    #[arg(long, default_value = "2")]
    num_threads: NonZeroUsize,

    /// Number of jobs to run.
    #[arg(long, default_value_t = 20)]
    jobs: usize,

    /// Time each job sleeps for, in milliseconds.
    #[arg(long, default_value_t = 100)]
    sleep_ms: u64,
}
