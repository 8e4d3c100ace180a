/**
 * DEVICE MANAGER - Orchestrateur des vagues de commandes
 *
 * RÔLE :
 * Résout une cible (équipement, groupe, flotte) et déploie l'action en
 * parallèle borné à travers le Retry Executor. Produit exactement un
 * ActionRecord par équipement demandé et un ExecutionReport par vague.
 *
 * CONCURRENCE :
 * - Sémaphore global de capacité C partagé avec le Monitor : plafonne le
 *   nombre total de sockets ouvertes par le kernel
 * - Mutex par équipement acquis AVANT le sémaphore : jamais deux commandes
 *   simultanées vers le même équipement
 * - Échéance globale : les équipements jamais tentés à l'échéance reçoivent
 *   TIMEOUT avec attempts=0 ; les tentatives en vol sont annulées
 * - Contre-pression : une vague d'origine API rend BUSY si le sémaphore
 *   reste saturé plus d'une seconde
 */

use crate::actionlog::ActionLog;
use crate::config::Device;
use crate::models::{
    Action, ActionRecord, ExecutionReport, Outcome, RetryPolicy, Target, Trigger,
};
use crate::protocols::AdapterSelector;
use crate::registry::DeviceRegistry;
use crate::retry::RetryExecutor;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Échéance globale par défaut d'une vague.
const DEFAULT_OVERALL_DEADLINE: Duration = Duration::from_secs(600);
/// Attente maximale d'un jeton de sémaphore avant BUSY.
const BUSY_PROBE_WINDOW: Duration = Duration::from_secs(1);
/// Fenêtre de collecte des annulations après l'échéance.
const CANCEL_DRAIN_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// La cible ne désigne aucun équipement ni groupe connu.
    #[error("unresolvable target: {0}")]
    Validation(String),
    /// Le moteur est saturé, la vague est refusée plutôt que mise en file.
    #[error("engine busy: no capacity available")]
    Busy,
}

pub struct DeviceManager {
    registry: Arc<DeviceRegistry>,
    adapters: Arc<dyn AdapterSelector>,
    executor: RetryExecutor,
    semaphore: Arc<Semaphore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    action_log: ActionLog,
    overall_deadline: Duration,
    shutdown: CancellationToken,
}

impl DeviceManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        adapters: Arc<dyn AdapterSelector>,
        policy: RetryPolicy,
        semaphore: Arc<Semaphore>,
        action_log: ActionLog,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            adapters,
            executor: RetryExecutor::new(policy),
            semaphore,
            locks: Mutex::new(HashMap::new()),
            action_log,
            overall_deadline: DEFAULT_OVERALL_DEADLINE,
            shutdown,
        }
    }

    /// Remplace l'échéance globale (raccourcie dans les tests).
    pub fn with_overall_deadline(mut self, deadline: Duration) -> Self {
        self.overall_deadline = deadline;
        self
    }

    pub async fn turn_on(
        &self,
        target: &Target,
        trigger: Trigger,
    ) -> Result<ExecutionReport, ManagerError> {
        self.execute(target, Action::TurnOn, trigger).await
    }

    pub async fn turn_off(
        &self,
        target: &Target,
        trigger: Trigger,
    ) -> Result<ExecutionReport, ManagerError> {
        self.execute(target, Action::TurnOff, trigger).await
    }

    pub async fn query(
        &self,
        target: &Target,
        trigger: Trigger,
    ) -> Result<ExecutionReport, ManagerError> {
        self.execute(target, Action::Query, trigger).await
    }

    /// Déploie l'action sur la cible résolue. Retourne toujours un rapport
    /// quand la cible résout ; les pannes individuelles n'interrompent
    /// jamais les autres équipements.
    pub async fn execute(
        &self,
        target: &Target,
        action: Action,
        trigger: Trigger,
    ) -> Result<ExecutionReport, ManagerError> {
        let devices = self
            .registry
            .resolve(target)
            .ok_or_else(|| ManagerError::Validation(target.to_string()))?;

        // Contre-pression : uniquement pour les vagues déclenchées de
        // l'extérieur, jamais pour le scheduler.
        if matches!(trigger, Trigger::Api | Trigger::Manual) {
            match tokio::time::timeout(BUSY_PROBE_WINDOW, self.semaphore.acquire()).await {
                Ok(Ok(permit)) => drop(permit),
                _ => return Err(ManagerError::Busy),
            }
        }

        let started_at = OffsetDateTime::now_utc();
        info!(target = %target, %action, devices = devices.len(), "bulk execution started");

        let fanout = self.shutdown.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<ActionRecord>();

        for device in devices.clone() {
            let lock = self.lock_for(&device.id);
            let semaphore = Arc::clone(&self.semaphore);
            let adapters = Arc::clone(&self.adapters);
            let executor = self.executor.clone();
            let token = fanout.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let acquired = tokio::select! {
                    _ = token.cancelled() => None,
                    pair = async {
                        let guard = lock.lock_owned().await;
                        let permit = semaphore.acquire_owned().await.ok()?;
                        Some((guard, permit))
                    } => pair,
                };
                let record = match acquired {
                    None => not_attempted_record(&device, action),
                    Some((_guard, _permit)) => {
                        let adapter = adapters.select(device.device_type);
                        executor.execute(adapter, &device, action, &token).await
                    }
                };
                let _ = tx.send(record);
            });
        }
        drop(tx);

        let mut results: BTreeMap<String, ActionRecord> = BTreeMap::new();
        let deadline = tokio::time::Instant::now() + self.overall_deadline;
        while results.len() < devices.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(record)) => {
                    results.insert(record.device_id.clone(), record);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(target = %target, %action, "overall deadline reached, cancelling fan-out");
                    fanout.cancel();
                    // Courte fenêtre pour collecter les annulations en vol.
                    let drain_deadline = tokio::time::Instant::now() + CANCEL_DRAIN_WINDOW;
                    while results.len() < devices.len() {
                        match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                            Ok(Some(record)) => {
                                results.insert(record.device_id.clone(), record);
                            }
                            _ => break,
                        }
                    }
                    break;
                }
            }
        }

        // Exactement une entrée par équipement demandé.
        for device in &devices {
            results
                .entry(device.id.clone())
                .or_insert_with(|| not_attempted_record(device, action));
        }
        for record in results.values() {
            self.action_log.append(record.clone());
        }

        let success_count = results.values().filter(|r| r.is_success()).count() as u32;
        let failure_count = results.len() as u32 - success_count;
        let report = ExecutionReport {
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            requested_action: action,
            trigger,
            results,
            success_count,
            failure_count,
        };
        info!(
            target = %target, %action,
            successful = report.success_count, failed = report.failure_count,
            "bulk execution complete"
        );
        Ok(report)
    }

    fn lock_for(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Enregistrement d'un équipement jamais tenté avant l'échéance.
fn not_attempted_record(device: &Device, action: Action) -> ActionRecord {
    ActionRecord {
        timestamp: OffsetDateTime::now_utc(),
        device_id: device.id.clone(),
        action,
        attempts: 0,
        outcome: Outcome::Timeout,
        duration_ms: 0,
        error_message: Some("not attempted before deadline".into()),
        response: None,
        cancelled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, OceanConfig};

    fn registry(count: usize) -> Arc<DeviceRegistry> {
        let devices: Vec<String> = (1..=count)
            .map(|i| {
                format!("  - {{ id: \"d{i}\", name: \"D{i}\", type: \"generic_tcp\", host: \"10.0.0.{i}\" }}")
            })
            .collect();
        let yaml = format!("devices:\n{}\n", devices.join("\n"));
        let mut config: OceanConfig = serde_yaml::from_str(&yaml).unwrap();
        validate(&mut config).unwrap();
        Arc::new(DeviceRegistry::from_config(&config))
    }

    #[tokio::test]
    async fn unresolvable_target_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::spawn(dir.path()).unwrap();
        let manager = DeviceManager::new(
            registry(1),
            Arc::new(crate::protocols::DefaultAdapters),
            RetryPolicy::default(),
            Arc::new(Semaphore::new(4)),
            log,
            CancellationToken::new(),
        );
        let err = manager
            .execute(&Target::Group("ghost".into()), Action::TurnOn, Trigger::Api)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));
    }

    #[tokio::test]
    async fn report_has_one_entry_per_requested_device() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::spawn(dir.path()).unwrap();
        let policy = RetryPolicy {
            max_attempts: 1,
            base_interval_sec: 0,
            backoff_multiplier: 2.0,
            per_attempt_timeout_sec: 1,
        };
        let manager = DeviceManager::new(
            registry(3),
            Arc::new(crate::protocols::DefaultAdapters),
            policy,
            Arc::new(Semaphore::new(4)),
            log,
            CancellationToken::new(),
        );
        // generic_tcp refuse le pilotage : 3 échecs PROTOCOL_ERROR, mais
        // bien 3 entrées et aucune panne croisée.
        let report = manager
            .execute(&Target::All, Action::TurnOn, Trigger::Api)
            .await
            .unwrap();
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.success_count, 0);
        assert_eq!(report.failure_count, 3);
        for record in report.results.values() {
            assert_eq!(record.outcome, Outcome::ProtocolError);
            assert_eq!(record.attempts, 1);
        }
    }
}
