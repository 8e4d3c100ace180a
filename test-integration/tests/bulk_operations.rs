//! Vagues de commandes : parallélisme, pannes partielles, reprises.

mod common;

use common::bed;
use ocean_devkit::mock::ScriptedError;
use ocean_devkit::{fast_policy, timed_policy};
use ocean_kernel::models::{Outcome, Target, Trigger};
use std::time::{Duration, Instant};

#[tokio::test]
async fn bulk_turn_on_all_succeeds_in_parallel() {
    let bed = bed(3, 10, fast_policy(3));
    bed.adapter.set_call_delay(Duration::from_millis(100));

    let started = Instant::now();
    let report = bed
        .manager
        .turn_on(&Target::All, Trigger::Api)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.success_count, 3);
    assert_eq!(report.failure_count, 0);
    for record in report.results.values() {
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.attempts, 1);
    }
    // séquentiel ce serait >= 300 ms : la vague est bien parallèle
    assert!(
        elapsed < Duration::from_millis(500),
        "bulk wave took {elapsed:?}, expected parallel execution"
    );
}

#[tokio::test]
async fn partial_failure_never_aborts_siblings() {
    let bed = bed(3, 10, fast_policy(3));
    bed.adapter.script_unreachable("d2", 3);

    let report = bed
        .manager
        .turn_on(&Target::All, Trigger::Api)
        .await
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.success_count, 2);
    assert_eq!(report.failure_count, 1);

    let d1 = &report.results["d1"];
    assert_eq!(d1.outcome, Outcome::Success);
    assert_eq!(d1.attempts, 1);

    let d2 = &report.results["d2"];
    assert_eq!(d2.outcome, Outcome::Unreachable);
    assert_eq!(d2.attempts, 3);
    assert!(d2.error_message.is_some());

    assert_eq!(report.results["d3"].outcome, Outcome::Success);
}

#[tokio::test]
async fn retry_succeeds_on_second_attempt_after_backoff() {
    let bed = bed(1, 10, timed_policy(3, 1));
    bed.adapter.script(
        "d1",
        vec![
            Err(ScriptedError::Unreachable("connection refused".into())),
            Ok(()),
        ],
    );

    let report = bed
        .manager
        .turn_on(&Target::Device("d1".into()), Trigger::Api)
        .await
        .unwrap();

    let record = &report.results["d1"];
    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.attempts, 2);
    // un backoff de base 1 s a été observé avant la seconde tentative
    assert!(
        record.duration_ms >= 1000,
        "duration {}ms, expected >= base backoff",
        record.duration_ms
    );
}

#[tokio::test]
async fn every_record_lands_in_the_action_log() {
    let bed = bed(3, 10, fast_policy(1));
    bed.adapter.script_unreachable("d2", 1);

    bed.manager
        .turn_off(&Target::All, Trigger::Api)
        .await
        .unwrap();
    bed.action_log.flush().await;

    let today = time::OffsetDateTime::now_utc().date();
    let records = bed.action_log.query(today, None, 1).await;
    assert_eq!(records.len(), 3);
    let failures = bed
        .action_log
        .query(today, Some(Outcome::Unreachable), 1)
        .await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].device_id, "d2");
}
