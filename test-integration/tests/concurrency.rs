//! Propriétés de concurrence : sémaphore global, mutex par équipement,
//! contre-pression BUSY.

mod common;

use common::bed;
use ocean_devkit::fast_policy;
use ocean_kernel::manager::ManagerError;
use ocean_kernel::models::{Target, Trigger};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn in_flight_calls_never_exceed_semaphore_capacity() {
    let capacity = 5;
    let bed = bed(20, capacity, fast_policy(1));
    bed.adapter.set_call_delay(Duration::from_millis(50));

    let report = bed
        .manager
        .turn_on(&Target::All, Trigger::Api)
        .await
        .unwrap();

    assert_eq!(report.results.len(), 20);
    assert!(
        bed.adapter.max_in_flight() <= capacity as u32,
        "observed {} concurrent calls with capacity {capacity}",
        bed.adapter.max_in_flight()
    );
}

#[tokio::test]
async fn no_two_concurrent_calls_target_the_same_device() {
    let bed = bed(4, 10, fast_policy(1));
    bed.adapter.set_call_delay(Duration::from_millis(50));

    // deux vagues simultanées sur les mêmes équipements
    let manager = Arc::clone(&bed.manager);
    let first = tokio::spawn(async move {
        manager.turn_on(&Target::All, Trigger::Scheduled).await
    });
    let second = bed.manager.turn_off(&Target::All, Trigger::Scheduled);
    let (first, second) = tokio::join!(first, second);
    first.unwrap().unwrap();
    second.unwrap();

    assert!(
        !bed.adapter.overlap_detected(),
        "two concurrent adapter calls hit the same device id"
    );
    // chaque vague a bien touché chaque équipement une fois
    for id in ["d1", "d2", "d3", "d4"] {
        assert_eq!(bed.adapter.calls_for(id), 2);
    }
}

#[tokio::test]
async fn saturated_engine_rejects_api_waves_with_busy() {
    let bed = bed(1, 1, fast_policy(1));
    bed.adapter.set_call_delay(Duration::from_secs(3));

    let manager = Arc::clone(&bed.manager);
    let holder = tokio::spawn(async move {
        manager.turn_on(&Target::All, Trigger::Scheduled).await
    });
    // laisse la première vague prendre l'unique jeton
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = bed
        .manager
        .turn_on(&Target::All, Trigger::Api)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Busy));

    holder.await.unwrap().unwrap();
}
