// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod core;
mod error;
mod macros;

pub use self::core::{
    as_minutes, from_minutes, Canceller, Clock, Completion, CpuPinningPolicy, Job, Pipeline,
    PipelineBuilder, RunReport, Stage, StageConfig, StageReport, ThreadCount, WorkerPool,
    WorkerPoolBuilder,
};
pub use error::{Error, Rejected, Result};

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;
    use std::time::Duration;

    /// 1 simulated minute = 1 real millisecond.
    const FAST: f64 = 60_000.0;
    /// 1 simulated minute = 10 real milliseconds.
    const MEDIUM: f64 = 6_000.0;

    macro_rules! expand_tests {
        ( $num_items:expr, ) => {};
        ( $num_items:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($num_items);
            }

            expand_tests!($num_items, $($others)*);
        };
    }

    macro_rules! item_count_tests {
        ( $mod:ident, $num_items:expr, $( $tests:tt )* ) => {
            mod $mod {
                use super::*;

                expand_tests!($num_items, $($tests)*);
            }
        };
    }

    macro_rules! all_item_count_tests {
        ( $mod:ident, $num_items:expr ) => {
            item_count_tests!(
                $mod,
                $num_items,
                test_no_lost_or_duplicated_items,
                test_single_worker_stages_preserve_order,
                test_latency_covers_service_times,
            );
        };
    }

    all_item_count_tests!(items_0, 0);
    all_item_count_tests!(items_1, 1);
    all_item_count_tests!(items_4, 4);
    all_item_count_tests!(items_100, 100);

    fn build(stages: &[(f64, usize)], scale_factor: f64) -> Pipeline<usize> {
        PipelineBuilder {
            stages: stages
                .iter()
                .enumerate()
                .map(|(i, &(minutes, workers))| {
                    StageConfig::from_minutes(format!("Stage {i}"), minutes, workers).unwrap()
                })
                .collect(),
            scale_factor,
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    fn test_no_lost_or_duplicated_items(num_items: usize) {
        let mut pipeline = build(&[(0.2, 1), (0.5, 3), (0.1, 2)], FAST);
        let report = pipeline.run((0..num_items).collect()).unwrap();

        assert_eq!(report.submitted, num_items);
        assert_eq!(report.completed(), num_items);
        assert!(report.rejected.is_empty());
        assert!(!report.cancelled);
        assert_eq!(pipeline.submitted(), num_items);
        assert_eq!(pipeline.completed(), num_items);

        let mut seqs = report.completions.iter().map(|c| c.seq).collect::<Vec<_>>();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..num_items).collect::<Vec<_>>());
        for stage in &report.stages {
            assert_eq!(stage.processed, num_items);
            assert!(stage.peak_resident <= stage.num_workers);
        }
    }

    fn test_single_worker_stages_preserve_order(num_items: usize) {
        let mut pipeline = build(&[(0.1, 1), (0.3, 1), (0.2, 1)], FAST);
        let items = pipeline.run((0..num_items).collect()).unwrap().into_items();
        assert_eq!(items, (0..num_items).collect::<Vec<_>>());
    }

    fn test_latency_covers_service_times(num_items: usize) {
        let mut pipeline = build(&[(0.5, 2), (1.0, 2)], FAST);
        let report = pipeline.run((0..num_items).collect()).unwrap();
        // Allow for the rounding of scaled durations.
        let minimum = Duration::from_secs(90) - Duration::from_millis(100);
        for completion in &report.completions {
            assert!(completion.finished >= completion.arrived);
            assert!(completion.latency() >= minimum, "{completion:?}");
        }
        if num_items == 0 {
            assert_eq!(report.elapsed, Duration::ZERO);
        } else {
            assert!(report.elapsed >= minimum);
        }
    }

    fn airport(num_items: usize, num_security_lines: usize) -> RunReport<usize> {
        let mut pipeline = build(&[(1.0, 1), (10.0, num_security_lines)], MEDIUM);
        let report = pipeline.run((0..num_items).collect()).unwrap();
        assert_eq!(report.completed(), num_items);
        report
    }

    fn assert_elapsed(report: &RunReport<usize>, expected: std::ops::Range<f64>) {
        let elapsed = as_minutes(report.elapsed);
        assert!(expected.contains(&elapsed), "took {elapsed}min");
    }

    #[test]
    fn test_unbalanced_single_security_line() {
        // The first passenger is done at 11 minutes, every next one waits for
        // the single security line: 11 + 10k.
        let report = airport(4, 1);
        assert_elapsed(&report, 40.5..46.0);
        let mut finished = report
            .completions
            .iter()
            .map(|c| as_minutes(c.finished))
            .collect::<Vec<_>>();
        finished.sort_by(f64::total_cmp);
        for (k, minutes) in finished.into_iter().enumerate() {
            let expected = 11.0 + 10.0 * k as f64;
            assert!(
                (expected - 0.5..expected + 4.0).contains(&minutes),
                "passenger {k} done at {minutes}min"
            );
        }
        assert_eq!(report.stages[1].peak_resident, 1);
    }

    #[test]
    fn test_two_security_lines() {
        let report = airport(4, 2);
        assert_elapsed(&report, 21.5..26.0);
    }

    #[test]
    fn test_four_security_lines_no_queueing() {
        let report = airport(4, 4);
        assert_elapsed(&report, 13.5..17.0);
        let wait = as_minutes(report.stages[1].mean_wait);
        assert!(wait < 0.5, "waited {wait}min at the security check");
    }

    #[test]
    fn test_balanced_pipeline() {
        let report = airport(10, 10);
        assert_elapsed(&report, 19.5..24.0);
    }

    #[test]
    fn test_throughput_converges_to_bottleneck() {
        for stages in [
            &[(1.0, 1), (10.0, 2)][..],
            &[(0.5, 1), (2.0, 3), (1.0, 2)][..],
        ] {
            // 1 simulated minute = 5 real milliseconds.
            let mut pipeline = build(stages, 12_000.0);
            let bound = pipeline.throughput_bound();
            let report = pipeline.run((0..40).collect()).unwrap();
            let throughput = report.throughput();
            assert!(
                (0.8 * bound..=1.02 * bound).contains(&throughput),
                "throughput {throughput} vs bound {bound} for {stages:?}"
            );
        }
    }

    #[test]
    fn test_random_pipelines() {
        let mut rng = ChaCha12Rng::seed_from_u64(42);
        for _ in 0..10 {
            let num_stages = rng.random_range(1..=4);
            let stages = (0..num_stages)
                .map(|_| (rng.random_range(0.0..0.5), rng.random_range(1..=4)))
                .collect::<Vec<(f64, usize)>>();
            let num_items = rng.random_range(0..30);

            let mut pipeline = build(&stages, FAST);
            let report = pipeline.run((0..num_items).collect()).unwrap();
            assert!(report.is_drained());
            assert_eq!(report.completed(), num_items, "{stages:?}");
            for stage in &report.stages {
                assert_eq!(stage.processed, num_items);
                assert!(stage.peak_resident <= stage.num_workers);
            }
        }
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(matches!(
            Pipeline::<usize>::new(vec![]),
            Err(Error::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            StageConfig::from_minutes("Security Check", -10.0, 1),
            Err(Error::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            WorkerPool::new(0),
            Err(Error::InvalidConfiguration { .. })
        ));
    }
}
