//! Property-based tests for admission control, priorities and dispatch sizing.
//!
//! # Admission
//! - `try_create_task` never lets the planned count exceed the limit
//! - Starting or dropping an unstarted task frees its slot
//!
//! # Priority
//! - Quanta are ordered by priority for any base quantum
//!
//! # Hill climbing
//! - The target stays within bounds for any sample sequence
//! - Each sample moves the target by at most one thread

use proptest::prelude::*;
use std::time::Duration;
use weft_core::native::{Decision, HillClimb};
use weft_core::{callable, Priority, Runtime, TaskError, TaskOptions, Value};

// ============================================================================
// Admission
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn planned_tasks_never_exceed_limit(limit in 1usize..6, attempts in 0usize..12, start in 0usize..6) {
        let rt = Runtime::builder().executors(1).max_planned_tasks(limit).build().unwrap();

        let mut created = Vec::new();
        for i in 0..attempts {
            match rt.try_create_task(callable(|_| Ok(vec![])), Value::from(i), TaskOptions::new()) {
                Ok(task) => created.push(task),
                Err(TaskError::CapacityExhausted(_)) => {}
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
            prop_assert!(rt.stats().planned_tasks <= limit);
        }
        prop_assert_eq!(created.len(), attempts.min(limit));
        prop_assert_eq!(rt.stats().planned_tasks, created.len());

        let start = start.min(created.len());
        for task in &created[..start] {
            rt.start(task).unwrap();
        }
        prop_assert_eq!(rt.stats().planned_tasks, created.len() - start);

        for task in &created[..start] {
            rt.await_task(task, false).unwrap();
        }
        created.clear();
        prop_assert_eq!(rt.stats().planned_tasks, 0);
        rt.shutdown();
    }
}

// ============================================================================
// Priority
// ============================================================================

proptest! {
    #[test]
    fn quanta_follow_priority(base_ms in 1u64..10_000) {
        let base = Duration::from_millis(base_ms);
        let order = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];
        for pair in order.windows(2) {
            prop_assert!(pair[0].quantum(base) < pair[1].quantum(base));
        }
        prop_assert_eq!(Priority::Normal.quantum(base), base);
    }
}

// ============================================================================
// Hill climbing
// ============================================================================

fn arb_samples() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(
        prop_oneof![
            1 => Just(0.0),
            4 => 1.0f64..100_000.0,
        ],
        1..64,
    )
}

proptest! {
    #[test]
    fn hill_climb_stays_in_bounds(min in 1usize..4, extra in 0usize..8, start in 0usize..16, samples in arb_samples()) {
        let max = min + extra;
        let mut climb = HillClimb::new(min, max, start);
        prop_assert!(climb.current() >= min && climb.current() <= max);

        for sample in samples {
            let before = climb.current();
            let decision = climb.observe(sample);
            let after = climb.current();
            prop_assert!(after >= min && after <= max);
            match decision {
                Decision::Grow => prop_assert_eq!(after, before + 1),
                Decision::Shrink => prop_assert_eq!(after + 1, before),
                Decision::Hold => prop_assert_eq!(after, before),
            }
        }
    }

    #[test]
    fn idle_samples_reach_minimum(min in 1usize..4, extra in 0usize..8, start in 0usize..16) {
        let max = min + extra;
        let mut climb = HillClimb::new(min, max, start);
        for _ in 0..=max {
            climb.observe(0.0);
        }
        prop_assert_eq!(climb.current(), min);
    }
}
