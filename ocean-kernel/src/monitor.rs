/**
 * MONITOR - Surveillance périodique de la flotte et alertes
 *
 * RÔLE :
 * À chaque cycle, sonde tous les équipements (sous le même sémaphore global
 * que les commandes), fait évoluer l'état de santé par équipement avec
 * anti-rebond (deux probes ratés consécutifs avant ONLINE -> OFFLINE), et
 * dérive au plus un événement d'alerte par cycle, au niveau le plus haut
 * atteint :
 *   INFO      un équipement s'est rétabli
 *   WARNING   un équipement vient de passer OFFLINE
 *   CRITICAL  >= 3 équipements OFFLINE, mais <= 20 % de la flotte
 *   RED_ALERT > 20 % de la flotte OFFLINE
 *
 * L'état de santé appartient exclusivement à la tâche du monitor ; les
 * consommateurs lisent un snapshot publié en fin de cycle.
 */

use crate::actionlog::ActionLog;
use crate::models::{
    Action, ActionRecord, Alert, AlertLevel, DeviceHealthState, DeviceStatus, MonitorSample,
    Outcome,
};
use crate::probe::Probe;
use crate::registry::DeviceRegistry;
use crate::reports::ReportStore;
use crate::state::{new_state, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Seuil d'anti-rebond : probes ratés consécutifs avant passage OFFLINE.
const OFFLINE_THRESHOLD: u32 = 2;
/// Seuil CRITICAL en nombre d'équipements OFFLINE.
const CRITICAL_OFFLINE_COUNT: u32 = 3;
/// Au-delà de cette fraction OFFLINE, RED_ALERT.
const RED_ALERT_RATIO: f64 = 0.20;

/// Bilan d'un cycle, retourné pour inspection (et pour les tests).
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub online: u32,
    pub offline: u32,
    pub total: u32,
    pub recovered: Vec<String>,
    pub went_offline: Vec<String>,
    pub alert: Option<Alert>,
}

pub struct MonitorService {
    registry: Arc<DeviceRegistry>,
    prober: Arc<dyn Probe>,
    semaphore: Arc<Semaphore>,
    states: Shared<HashMap<String, DeviceHealthState>>,
    snapshot: Shared<Arc<Vec<DeviceHealthState>>>,
    action_log: ActionLog,
    reports: Arc<ReportStore>,
    interval: Duration,
}

impl MonitorService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        prober: Arc<dyn Probe>,
        semaphore: Arc<Semaphore>,
        action_log: ActionLog,
        reports: Arc<ReportStore>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            prober,
            semaphore,
            states: new_state(HashMap::new()),
            snapshot: new_state(Arc::new(Vec::new())),
            action_log,
            reports,
            interval,
        }
    }

    /// Snapshot copy-on-publish du dernier cycle.
    pub fn snapshot(&self) -> Arc<Vec<DeviceHealthState>> {
        Arc::clone(&self.snapshot.lock())
    }

    pub fn online_count(&self) -> u32 {
        self.snapshot()
            .iter()
            .filter(|s| s.current_status == DeviceStatus::Online)
            .count() as u32
    }

    /// Boucle de service : un cycle par intervalle jusqu'à l'arrêt.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_sec = self.interval.as_secs(), "monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        info!("monitor stopped");
    }

    /// Un cycle complet : probes en parallèle borné, transitions d'état,
    /// échantillon et alerte éventuelle. Publique pour les tests.
    pub async fn run_cycle(&self) -> CycleSummary {
        let devices = self.registry.all().to_vec();
        let mut handles = Vec::with_capacity(devices.len());
        for device in devices {
            let prober = Arc::clone(&self.prober);
            let semaphore = Arc::clone(&self.semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let report = prober.probe(&device).await;
                (device.id.clone(), report)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "probe task panicked"),
            }
        }

        let now = OffsetDateTime::now_utc();
        let mut recovered = Vec::new();
        let mut went_offline = Vec::new();

        {
            let mut states = self.states.lock();
            for (device_id, report) in &results {
                let state = states
                    .entry(device_id.clone())
                    .or_insert_with(|| DeviceHealthState::new(device_id.clone(), now));
                state.last_probed_at = Some(now);
                if report.reachable {
                    if state.current_status == DeviceStatus::Offline {
                        recovered.push(device_id.clone());
                    }
                    state.consecutive_failures = 0;
                    state.last_ok_at = Some(now);
                    if state.current_status != DeviceStatus::Online {
                        state.current_status = DeviceStatus::Online;
                        state.status_since = now;
                    }
                } else {
                    state.consecutive_failures += 1;
                    // anti-rebond : un raté isolé ne bascule jamais OFFLINE
                    if state.current_status != DeviceStatus::Offline
                        && state.consecutive_failures >= OFFLINE_THRESHOLD
                    {
                        state.current_status = DeviceStatus::Offline;
                        state.status_since = now;
                        went_offline.push(device_id.clone());
                    }
                }
            }
        }

        // un enregistrement PROBE par équipement sondé
        for (device_id, report) in &results {
            self.action_log.append(ActionRecord {
                timestamp: now,
                device_id: device_id.clone(),
                action: Action::Probe,
                attempts: 1,
                outcome: if report.reachable {
                    Outcome::Success
                } else {
                    Outcome::Unreachable
                },
                duration_ms: report.latency_ms,
                error_message: (!report.reachable).then(|| report.detail.clone()),
                response: report.reachable.then(|| report.detail.clone()),
                cancelled: false,
            });
        }

        let summary = {
            let states = self.states.lock();
            let total = self.registry.len() as u32;
            let offline = states
                .values()
                .filter(|s| s.current_status == DeviceStatus::Offline)
                .count() as u32;
            let online = states
                .values()
                .filter(|s| s.current_status == DeviceStatus::Online)
                .count() as u32;

            let mut published: Vec<DeviceHealthState> = states.values().cloned().collect();
            published.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            *self.snapshot.lock() = Arc::new(published);

            let alert = derive_alert(now, total, offline, &recovered, &went_offline, &states);
            CycleSummary {
                online,
                offline,
                total,
                recovered,
                went_offline,
                alert,
            }
        };

        self.reports.append_sample(&MonitorSample {
            timestamp: now,
            online: summary.online,
            offline: summary.offline,
            total: summary.total,
        });

        if let Some(alert) = &summary.alert {
            match alert.level {
                AlertLevel::Info => info!(message = %alert.message, "fleet alert"),
                AlertLevel::Warning => warn!(message = %alert.message, "fleet alert"),
                _ => error!(level = %alert.level, message = %alert.message, "fleet alert"),
            }
            self.reports.append_alert(alert);
            // l'alerte part aussi dans le journal d'actions, comme PROBE
            self.action_log.append(ActionRecord {
                timestamp: alert.timestamp,
                device_id: alert.device_ids.join(","),
                action: Action::Probe,
                attempts: 1,
                outcome: if alert.level == AlertLevel::Info {
                    Outcome::Success
                } else {
                    Outcome::Fail
                },
                duration_ms: 0,
                error_message: Some(format!("{}: {}", alert.level, alert.message)),
                response: None,
                cancelled: false,
            });
        }

        summary
    }
}

/// Au plus un événement par cycle, au niveau le plus haut déclenché.
fn derive_alert(
    now: OffsetDateTime,
    total: u32,
    offline: u32,
    recovered: &[String],
    went_offline: &[String],
    states: &HashMap<String, DeviceHealthState>,
) -> Option<Alert> {
    if total == 0 {
        return None;
    }
    let offline_ratio = f64::from(offline) / f64::from(total);
    let offline_ids = || {
        let mut ids: Vec<String> = states
            .values()
            .filter(|s| s.current_status == DeviceStatus::Offline)
            .map(|s| s.device_id.clone())
            .collect();
        ids.sort();
        ids
    };

    if offline_ratio > RED_ALERT_RATIO {
        return Some(Alert {
            timestamp: now,
            level: AlertLevel::RedAlert,
            message: format!(
                "{offline}/{total} devices offline ({:.0}% of fleet)",
                offline_ratio * 100.0
            ),
            device_ids: offline_ids(),
        });
    }
    if offline >= CRITICAL_OFFLINE_COUNT {
        return Some(Alert {
            timestamp: now,
            level: AlertLevel::Critical,
            message: format!("{offline} devices offline"),
            device_ids: offline_ids(),
        });
    }
    if !went_offline.is_empty() {
        return Some(Alert {
            timestamp: now,
            level: AlertLevel::Warning,
            message: format!("device {} is offline", went_offline.join(", ")),
            device_ids: went_offline.to_vec(),
        });
    }
    if !recovered.is_empty() {
        return Some(Alert {
            timestamp: now,
            level: AlertLevel::Info,
            message: format!("device {} recovered", recovered.join(", ")),
            device_ids: recovered.to_vec(),
        });
    }
    None
}
