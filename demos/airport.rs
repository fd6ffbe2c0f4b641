// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to simulate passengers going through airport checks.

use clap::Parser;
use pipelight::{as_minutes, CpuPinningPolicy, PipelineBuilder, RunReport, StageConfig};
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let scenarios = if cli.sweep {
        sweep()
    } else {
        let stages = if cli.stages.is_empty() {
            default_stages(1)
        } else {
            cli.stages.clone()
        };
        vec![(cli.items, stages)]
    };

    for (num_items, stages) in scenarios {
        if let Err(e) = simulate(&cli, num_items, &stages) {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn simulate(cli: &Cli, num_items: usize, stages: &[StageArg]) -> pipelight::Result<()> {
    let configs = stages
        .iter()
        .map(|stage| StageConfig::from_minutes(stage.name.as_str(), stage.minutes, stage.workers))
        .collect::<pipelight::Result<Vec<_>>>()?;

    let mut pipeline = PipelineBuilder {
        stages: configs,
        scale_factor: cli.scale_factor,
        verbose: cli.verbose,
        cpu_pinning: if cli.pin_cpus {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
    }
    .build()?;

    let passengers = (1..=num_items).map(|i| format!("Person {i}")).collect::<Vec<_>>();
    let report = pipeline.run(passengers)?;
    println!("{}", summary(num_items, stages, &report));
    if cli.details {
        print_details(&report);
    }
    Ok(())
}

fn summary(num_items: usize, stages: &[StageArg], report: &RunReport<String>) -> String {
    let configs = stages
        .iter()
        .map(|stage| format!("{}({}min x{})", stage.name, stage.minutes, stage.workers))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Items: {num_items}  Stage configs: {configs}  Elapsed: {}min.",
        as_minutes(report.elapsed) as u64
    )
}

fn print_details(report: &RunReport<String>) {
    println!(
        "  throughput: {:.3} items/min, mean latency: {:.1}min, max latency: {:.1}min",
        report.throughput(),
        as_minutes(report.mean_latency()),
        as_minutes(report.max_latency())
    );
    for stage in &report.stages {
        println!(
            "  {}: processed {}, peak residents {}/{}, mean wait {:.1}min",
            stage.name,
            stage.processed,
            stage.peak_resident,
            stage.num_workers,
            as_minutes(stage.mean_wait)
        );
    }
}

/// Boarding pass check (1 minute on a single machine) followed by a security
/// check (10 minutes on the given number of lines).
fn default_stages(num_security_lines: usize) -> Vec<StageArg> {
    vec![
        StageArg {
            name: "Boarding Pass Check".to_owned(),
            minutes: 1.0,
            workers: 1,
        },
        StageArg {
            name: "Security Check".to_owned(),
            minutes: 10.0,
            workers: num_security_lines,
        },
    ]
}

/// Classic table of airport configurations.
fn sweep() -> Vec<(usize, Vec<StageArg>)> {
    let mut scenarios = (1..=4)
        .map(|num_security_lines| (4, default_stages(num_security_lines)))
        .collect::<Vec<_>>();
    for num_items in [10, 20, 100] {
        scenarios.push((num_items, default_stages(10)));
    }
    scenarios
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of passengers.
    #[arg(long, default_value_t = 4)]
    items: usize,

    /// Stage definition, as NAME:MINUTES:WORKERS. Repeat to define the stages
    /// in order. Default to a boarding pass check followed by a single
    /// security line.
    #[arg(long = "stage", value_parser = parse_stage)]
    stages: Vec<StageArg>,

    /// Number of simulated seconds per real second.
    #[arg(long, default_value_t = 6000.0)]
    scale_factor: f64,

    /// Whether to print a line each time a passenger enters or leaves a stage.
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Whether to run the classic table of configurations, ignoring --items
    /// and --stage.
    #[arg(long, default_value_t = false)]
    sweep: bool,

    /// Whether to print throughput, latency and per-stage statistics.
    #[arg(long, default_value_t = false)]
    details: bool,

    /// Whether to pin worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_cpus: bool,
}

/// Stage definition as given on the command line.
#[derive(Clone, Debug, PartialEq)]
struct StageArg {
    name: String,
    minutes: f64,
    workers: usize,
}

fn parse_stage(arg: &str) -> Result<StageArg, String> {
    let mut parts = arg.rsplitn(3, ':');
    let (Some(workers), Some(minutes), Some(name)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected NAME:MINUTES:WORKERS, got '{arg}'"));
    };
    Ok(StageArg {
        name: name.to_owned(),
        minutes: minutes
            .parse()
            .map_err(|e| format!("invalid minutes '{minutes}': {e}"))?,
        workers: workers
            .parse()
            .map_err(|e| format!("invalid worker count '{workers}': {e}"))?,
    })
}
