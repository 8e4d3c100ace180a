//! Monitoring : anti-rebond, transitions d'état, alertes flotte.

mod common;

use ocean_devkit::{test_registry, MockProber};
use ocean_kernel::actionlog::ActionLog;
use ocean_kernel::models::{AlertLevel, DeviceStatus};
use ocean_kernel::monitor::MonitorService;
use ocean_kernel::probe::Probe;
use ocean_kernel::reports::{ReportEntry, ReportStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

struct MonitorBed {
    // garde le répertoire temporaire vivant pendant le test
    _dir: tempfile::TempDir,
    prober: Arc<MockProber>,
    reports: Arc<ReportStore>,
    monitor: MonitorService,
}

fn monitor_bed(devices: usize) -> MonitorBed {
    let dir = tempfile::tempdir().expect("tempdir");
    let prober = Arc::new(MockProber::new());
    let reports = Arc::new(ReportStore::open(dir.path().join("reports")).expect("reports"));
    let action_log = ActionLog::spawn(dir.path().join("logs")).expect("action log");
    let monitor = MonitorService::new(
        test_registry(devices),
        Arc::clone(&prober) as Arc<dyn Probe>,
        Arc::new(Semaphore::new(10)),
        action_log,
        Arc::clone(&reports),
        Duration::from_secs(60),
    );
    MonitorBed {
        _dir: dir,
        prober,
        reports,
        monitor,
    }
}

fn status_of(monitor: &MonitorService, device_id: &str) -> DeviceStatus {
    monitor
        .snapshot()
        .iter()
        .find(|s| s.device_id == device_id)
        .map(|s| s.current_status)
        .expect("device present in snapshot")
}

#[tokio::test]
async fn single_failed_probe_never_flips_a_device_offline() {
    let bed = monitor_bed(1);
    bed.prober.script("d1", vec![true, false, true]);

    let first = bed.monitor.run_cycle().await;
    assert_eq!(status_of(&bed.monitor, "d1"), DeviceStatus::Online);
    assert!(first.alert.is_none());

    // un raté isolé : toujours ONLINE, aucune alerte
    let second = bed.monitor.run_cycle().await;
    assert_eq!(status_of(&bed.monitor, "d1"), DeviceStatus::Online);
    assert!(second.alert.is_none());

    let third = bed.monitor.run_cycle().await;
    assert_eq!(status_of(&bed.monitor, "d1"), DeviceStatus::Online);
    assert!(third.alert.is_none());
}

#[tokio::test]
async fn two_consecutive_failures_flip_offline_with_warning() {
    // flotte assez large pour rester sous les seuils CRITICAL/RED_ALERT
    let bed = monitor_bed(10);
    bed.prober.script("d1", vec![true, false, false]);

    bed.monitor.run_cycle().await;
    let second = bed.monitor.run_cycle().await;
    assert_eq!(status_of(&bed.monitor, "d1"), DeviceStatus::Online);
    assert!(second.alert.is_none());

    let third = bed.monitor.run_cycle().await;
    assert_eq!(status_of(&bed.monitor, "d1"), DeviceStatus::Offline);
    let alert = third.alert.expect("warning alert expected");
    assert_eq!(alert.level, AlertLevel::Warning);
    assert_eq!(alert.device_ids, vec!["d1".to_string()]);
}

#[tokio::test]
async fn recovery_emits_info_and_resets_failures() {
    let bed = monitor_bed(1);
    bed.prober.script("d1", vec![false, false, true]);

    bed.monitor.run_cycle().await;
    bed.monitor.run_cycle().await;
    assert_eq!(status_of(&bed.monitor, "d1"), DeviceStatus::Offline);

    let third = bed.monitor.run_cycle().await;
    assert_eq!(status_of(&bed.monitor, "d1"), DeviceStatus::Online);
    let alert = third.alert.expect("recovery alert expected");
    assert_eq!(alert.level, AlertLevel::Info);

    let snapshot = bed.monitor.snapshot();
    assert_eq!(snapshot[0].consecutive_failures, 0);
}

#[tokio::test]
async fn losing_over_twenty_percent_of_fleet_raises_red_alert() {
    let bed = monitor_bed(10);
    for id in ["d1", "d2", "d3"] {
        bed.prober.script(id, vec![false, false]);
    }

    let first = bed.monitor.run_cycle().await;
    // premier raté : anti-rebond, rien ne bascule encore
    assert_eq!(first.offline, 0);
    assert!(first.alert.is_none());

    let second = bed.monitor.run_cycle().await;
    assert_eq!(second.offline, 3);
    let alert = second.alert.expect("red alert expected");
    // 3/10 = 30 % > 20 %
    assert_eq!(alert.level, AlertLevel::RedAlert);
    assert_eq!(alert.device_ids.len(), 3);

    // l'alerte et les échantillons sont dans le rapport du jour
    let today = time::OffsetDateTime::now_utc().date();
    let entries = bed.reports.load(today);
    let alerts: Vec<_> = entries
        .iter()
        .filter(|e| matches!(e, ReportEntry::Alert(_)))
        .collect();
    let samples: Vec<_> = entries
        .iter()
        .filter(|e| matches!(e, ReportEntry::Sample(_)))
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(samples.len(), 2);
}

#[tokio::test]
async fn three_offline_in_a_large_fleet_is_critical_not_red() {
    let bed = monitor_bed(20);
    for id in ["d1", "d2", "d3"] {
        bed.prober.script(id, vec![false, false]);
    }

    bed.monitor.run_cycle().await;
    let second = bed.monitor.run_cycle().await;
    assert_eq!(second.offline, 3);
    let alert = second.alert.expect("critical alert expected");
    // 3/20 = 15 % <= 20 % mais >= 3 équipements
    assert_eq!(alert.level, AlertLevel::Critical);
}
