/**
 * OCEAN KERNEL - Moteur de contrôle des équipements audiovisuels
 *
 * RÔLE : Pilotage et surveillance des équipements réseau d'une installation
 * (projecteurs telnet, cubes JSON-RPC, PC d'exposition, TCP générique) :
 * vagues de commandes en parallèle borné avec reprises, planification cron
 * persistante, monitoring avec anti-rebond et alertes flotte, journal
 * d'actions et rapports journaliers.
 *
 * ARCHITECTURE : Une valeur Engine possède tous les services et est passée
 * par référence aux handlers HTTP. Aucun état global caché.
 */

pub mod actionlog;
pub mod config;
pub mod http;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod probe;
pub mod protocols;
pub mod registry;
pub mod reports;
pub mod retry;
pub mod schedule_store;
pub mod scheduler;
pub mod state;

use crate::actionlog::ActionLog;
use crate::config::OceanConfig;
use crate::manager::DeviceManager;
use crate::monitor::MonitorService;
use crate::probe::HealthProber;
use crate::protocols::DefaultAdapters;
use crate::registry::DeviceRegistry;
use crate::reports::ReportStore;
use crate::schedule_store::{ScheduleStore, StoreError};
use crate::scheduler::SchedulerService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Le store du scheduler existe mais ne se relit pas (exit 3).
    #[error(transparent)]
    ScheduleStore(#[from] StoreError),
    #[error("bootstrap I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Le moteur complet, possédé par le point d'entrée du processus.
pub struct Engine {
    pub config: OceanConfig,
    pub registry: Arc<DeviceRegistry>,
    pub manager: Arc<DeviceManager>,
    pub scheduler: Arc<SchedulerService>,
    pub monitor: Arc<MonitorService>,
    pub action_log: ActionLog,
    pub reports: Arc<ReportStore>,
    pub shutdown: CancellationToken,
}

impl Engine {
    /// Assemble tous les services depuis une configuration déjà validée.
    /// Doit être appelé depuis un runtime tokio (tâches d'écriture).
    pub fn bootstrap(config: OceanConfig) -> Result<Arc<Self>, BootstrapError> {
        let registry = Arc::new(DeviceRegistry::from_config(&config));
        let shutdown = CancellationToken::new();
        let action_log = ActionLog::spawn(&config.log_dir)?;
        let reports = Arc::new(ReportStore::open(&config.report_dir)?);

        // Un seul sémaphore pour toutes les interactions réseau sortantes :
        // commandes ET probes comptent dans la même capacité.
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));

        let manager = Arc::new(DeviceManager::new(
            Arc::clone(&registry),
            Arc::new(DefaultAdapters),
            config.retry.clone(),
            Arc::clone(&semaphore),
            action_log.clone(),
            shutdown.clone(),
        ));

        let store = ScheduleStore::open(&config.schedule_db_path)?;
        // le fuseau a été validé avec la configuration
        let tz = config
            .timezone
            .parse::<chrono_tz::Tz>()
            .unwrap_or(chrono_tz::UTC);
        let scheduler = Arc::new(SchedulerService::new(
            store,
            tz,
            Arc::clone(&manager),
            action_log.clone(),
            Arc::clone(&reports),
        ));

        let monitor = Arc::new(MonitorService::new(
            Arc::clone(&registry),
            Arc::new(HealthProber::new()),
            Arc::clone(&semaphore),
            action_log.clone(),
            Arc::clone(&reports),
            Duration::from_secs(config.monitor_interval_sec),
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            manager,
            scheduler,
            monitor,
            action_log,
            reports,
            shutdown,
        }))
    }

    /// Démarre les boucles de service (scheduler, monitor).
    pub fn start_services(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(&self.scheduler).run(self.shutdown.clone()));
        tokio::spawn(Arc::clone(&self.monitor).run(self.shutdown.clone()));
    }

    /// Signal d'arrêt du processus : interrompt les attentes de backoff,
    /// les sessions adaptateur en cours et les boucles de service.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
