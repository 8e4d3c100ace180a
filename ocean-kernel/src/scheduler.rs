/**
 * SCHEDULER - Planification cron persistante des commandes
 *
 * RÔLE :
 * Table durable de tâches (cron 5 champs évalué dans le fuseau configuré)
 * déclenchant turn_on/turn_off sur le Device Manager. L'état survit aux
 * redémarrages ; les déclenchements manqués au-delà de la période de grâce
 * ne sont pas rejoués, la prochaine occurrence future est planifiée.
 *
 * FONCTIONNEMENT :
 * - Mutations synchrones : la ligne durable est écrite avant la mise à jour
 *   en mémoire ; un échec de persistance laisse l'état inchangé
 * - Deux tâches échues au même instant partent dans l'ordre lexicographique
 *   de leur id ; chaque départ est sa propre vague via le Device Manager
 * - Une cible devenue irrésoluble produit un ActionRecord PROTOCOL_ERROR
 *   journalisé, jamais un arrêt du service
 * - Les erreurs de callback sont journalisées et ne désactivent pas la tâche
 */

use crate::actionlog::ActionLog;
use crate::manager::{DeviceManager, ManagerError};
use crate::models::{Action, ActionRecord, ExecutionReport, Outcome, ScheduledJob, Trigger};
use crate::reports::ReportStore;
use crate::schedule_store::{ScheduleStore, StoreError, StoredJob};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Période de grâce : un déclenchement en retard de moins d'une heure part
/// quand même, au-delà il est abandonné au profit de l'occurrence suivante.
const MISFIRE_GRACE_SECS: i64 = 3600;
/// Réveil de secours quand aucune tâche n'est planifiée.
const IDLE_POLL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression `{0}`: {1}")]
    InvalidCron(String, String),
    #[error("invalid action: scheduled jobs only turn devices on or off")]
    InvalidAction,
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

pub struct SchedulerService {
    store: ScheduleStore,
    tz: Tz,
    manager: Arc<DeviceManager>,
    action_log: ActionLog,
    reports: Arc<ReportStore>,
    running: AtomicBool,
}

impl SchedulerService {
    pub fn new(
        store: ScheduleStore,
        tz: Tz,
        manager: Arc<DeviceManager>,
        action_log: ActionLog,
        reports: Arc<ReportStore>,
    ) -> Self {
        Self {
            store,
            tz,
            manager,
            action_log,
            reports,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn jobs(&self) -> Vec<StoredJob> {
        self.store.list()
    }

    pub fn job(&self, id: &str) -> Option<StoredJob> {
        self.store.get(id)
    }

    /// Crée ou remplace une tâche. Valide le cron et l'action, calcule le
    /// prochain déclenchement, persiste puis commet en mémoire.
    pub fn upsert_job(&self, job: ScheduledJob) -> Result<StoredJob, SchedulerError> {
        if !matches!(job.action, Action::TurnOn | Action::TurnOff) {
            return Err(SchedulerError::InvalidAction);
        }
        let schedule = parse_cron(&job.cron_expr)?;
        let next_run = if job.enabled {
            next_occurrence(&schedule, self.tz, Utc::now())
        } else {
            None
        };
        let stored = StoredJob { job, next_run };
        self.store.upsert(stored.clone())?;
        info!(
            job_id = %stored.job.id,
            cron = %stored.job.cron_expr,
            next_run = ?stored.next_run,
            "schedule job stored"
        );
        Ok(stored)
    }

    pub fn delete_job(&self, id: &str) -> Result<(), SchedulerError> {
        if self.store.delete(id)? {
            info!(job_id = %id, "schedule job deleted");
            Ok(())
        } else {
            Err(SchedulerError::UnknownJob(id.to_string()))
        }
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<StoredJob, SchedulerError> {
        let mut stored = self
            .store
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        stored.job.enabled = enabled;
        self.upsert_job(stored.job)
    }

    /// Exécute la tâche immédiatement sans toucher à son échéance next_run.
    pub async fn trigger_now(&self, id: &str) -> Result<ExecutionReport, SchedulerError> {
        let stored = self
            .store
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        info!(job_id = %id, "schedule job triggered manually");
        Ok(self.fire(&stored.job, Trigger::Manual).await)
    }

    /// Boucle de service : recalcule les échéances au démarrage puis dort
    /// jusqu'à la prochaine, en se pliant au signal d'arrêt.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.reschedule_on_startup();
        self.running.store(true, Ordering::Relaxed);
        info!(jobs = self.store.list().len(), tz = %self.tz, "scheduler started");

        loop {
            let sleep_for = self.time_until_next_due();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {
                    self.poll_once(Utc::now()).await;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        info!("scheduler stopped");
    }

    /// Au démarrage : les échéances passées au-delà de la grâce sont
    /// abandonnées, la prochaine occurrence future est planifiée.
    fn reschedule_on_startup(&self) {
        let now = Utc::now();
        for stored in self.store.list() {
            if !stored.job.enabled {
                continue;
            }
            let stale = match stored.next_run {
                None => true,
                Some(at) => (now - at).num_seconds() > MISFIRE_GRACE_SECS,
            };
            if stale {
                if let Some(at) = stored.next_run {
                    warn!(job_id = %stored.job.id, missed = %at, "missed fire skipped, scheduling next occurrence");
                }
                let next = parse_cron(&stored.job.cron_expr)
                    .ok()
                    .and_then(|s| next_occurrence(&s, self.tz, now));
                if let Err(e) = self.store.set_next_run(&stored.job.id, next) {
                    error!(job_id = %stored.job.id, error = %e, "failed to persist recomputed next run");
                }
            }
        }
    }

    fn time_until_next_due(&self) -> std::time::Duration {
        let now = Utc::now();
        self.store
            .list()
            .into_iter()
            .filter(|s| s.job.enabled)
            .filter_map(|s| s.next_run)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(std::time::Duration::ZERO))
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL)
    }

    /// Fait partir toutes les tâches échues à l'instant donné. Publique pour
    /// permettre aux tests d'injecter l'horloge. Retourne le nombre de
    /// départs effectués.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> usize {
        let mut due: Vec<StoredJob> = self
            .store
            .list()
            .into_iter()
            .filter(|s| s.job.enabled)
            .filter(|s| s.next_run.is_some_and(|at| at <= now))
            .collect();
        // ordre lexicographique des id pour les départs simultanés
        due.sort_by(|a, b| a.job.id.cmp(&b.job.id));

        let mut fired = 0;
        for stored in due {
            let next = parse_cron(&stored.job.cron_expr)
                .ok()
                .and_then(|s| next_occurrence(&s, self.tz, now));
            // L'échéance suivante est persistée avant le départ : un crash
            // pendant la vague ne rejoue pas le déclenchement.
            if let Err(e) = self.store.set_next_run(&stored.job.id, next) {
                error!(job_id = %stored.job.id, error = %e, "failed to persist next run, fire postponed");
                continue;
            }

            let missed_beyond_grace = stored
                .next_run
                .is_some_and(|at| (now - at).num_seconds() > MISFIRE_GRACE_SECS);
            if missed_beyond_grace {
                warn!(job_id = %stored.job.id, "fire missed beyond grace period, skipped");
                continue;
            }

            self.fire(&stored.job, Trigger::Scheduled).await;
            fired += 1;
        }
        fired
    }

    /// Un départ : une vague complète via le Device Manager. Les erreurs
    /// sont journalisées et n'affectent jamais la tâche elle-même.
    async fn fire(&self, job: &ScheduledJob, trigger: Trigger) -> ExecutionReport {
        info!(job_id = %job.id, action = %job.action, target = %job.target, "schedule job firing");
        match self.manager.execute(&job.target, job.action, trigger).await {
            Ok(report) => {
                self.reports.append_execution(&report);
                report
            }
            Err(ManagerError::Validation(target)) => {
                warn!(job_id = %job.id, target = %target, "schedule target no longer resolves");
                let record = ActionRecord {
                    timestamp: OffsetDateTime::now_utc(),
                    device_id: target.clone(),
                    action: job.action,
                    attempts: 1,
                    outcome: Outcome::ProtocolError,
                    duration_ms: 0,
                    error_message: Some(format!("unresolvable schedule target: {target}")),
                    response: None,
                    cancelled: false,
                };
                self.action_log.append(record.clone());
                let now = OffsetDateTime::now_utc();
                let mut results = std::collections::BTreeMap::new();
                results.insert(target, record);
                let report = ExecutionReport {
                    started_at: now,
                    finished_at: now,
                    requested_action: job.action,
                    trigger,
                    results,
                    success_count: 0,
                    failure_count: 1,
                };
                self.reports.append_execution(&report);
                report
            }
            Err(ManagerError::Busy) => {
                // N'arrive pas pour un déclenchement planifié (pas de
                // contre-pression), mais un trigger manuel peut l'observer.
                error!(job_id = %job.id, "schedule fire rejected: engine busy");
                let now = OffsetDateTime::now_utc();
                ExecutionReport {
                    started_at: now,
                    finished_at: now,
                    requested_action: job.action,
                    trigger,
                    results: std::collections::BTreeMap::new(),
                    success_count: 0,
                    failure_count: 0,
                }
            }
        }
    }
}

/// Analyse une expression cron à 5 champs (minute heure jour mois jour-semaine).
/// La crate `cron` travaille en 6 champs, le champ secondes est épinglé à 0.
pub fn parse_cron(expr: &str) -> Result<Schedule, SchedulerError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::InvalidCron(
            expr.to_string(),
            format!("expected 5 fields, got {}", fields.len()),
        ));
    }
    let six = format!("0 {}", fields.join(" "));
    Schedule::from_str(&six)
        .map_err(|e| SchedulerError::InvalidCron(expr.to_string(), e.to_string()))
}

/// Prochaine occurrence strictement future, évaluée dans le fuseau donné
/// puis ramenée en UTC.
pub fn next_occurrence(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_cron_requires_five_fields() {
        assert!(parse_cron("0 21 * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 21 * *").is_err());
        assert!(parse_cron("0 0 21 * * *").is_err());
        assert!(parse_cron("61 21 * * *").is_err());
    }

    #[test]
    fn next_occurrence_respects_timezone() {
        let schedule = parse_cron("0 21 * * *").unwrap();
        let tz: Tz = "Asia/Vladivostok".parse().unwrap();
        // 2025-06-01 05:00 UTC = 15:00 à Vladivostok (UTC+10)
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 5, 0, 0).unwrap();
        let next = next_occurrence(&schedule, tz, after).unwrap();
        // 21:00 locale le jour même = 11:00 UTC
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn next_occurrence_is_strictly_future() {
        let schedule = parse_cron("0 21 * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 21, 0, 0).unwrap();
        let next = next_occurrence(&schedule, chrono_tz::UTC, at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 21, 0, 0).unwrap());
    }
}
