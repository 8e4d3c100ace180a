//! Montage commun des tests d'intégration : moteur câblé sur les mocks.

use ocean_devkit::MockAdapter;
use ocean_kernel::actionlog::ActionLog;
use ocean_kernel::manager::DeviceManager;
use ocean_kernel::models::RetryPolicy;
use ocean_kernel::protocols::AdapterSelector;
use ocean_kernel::registry::DeviceRegistry;
use ocean_kernel::reports::ReportStore;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub struct Bed {
    // garde le répertoire temporaire vivant pendant le test
    pub dir: tempfile::TempDir,
    pub adapter: Arc<MockAdapter>,
    pub registry: Arc<DeviceRegistry>,
    pub action_log: ActionLog,
    pub reports: Arc<ReportStore>,
    pub manager: Arc<DeviceManager>,
    pub shutdown: CancellationToken,
}

/// Moteur de test : `devices` équipements d1..dn, sémaphore de capacité
/// donnée, adaptateur scripté partagé.
pub fn bed(devices: usize, capacity: usize, policy: RetryPolicy) -> Bed {
    let dir = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new());
    let registry = ocean_devkit::test_registry(devices);
    let action_log = ActionLog::spawn(dir.path().join("logs")).expect("action log");
    let reports = Arc::new(ReportStore::open(dir.path().join("reports")).expect("reports"));
    let shutdown = CancellationToken::new();
    let selector: Arc<dyn AdapterSelector> = Arc::clone(&adapter) as Arc<dyn AdapterSelector>;
    let manager = Arc::new(DeviceManager::new(
        Arc::clone(&registry),
        selector,
        policy,
        Arc::new(Semaphore::new(capacity)),
        action_log.clone(),
        shutdown.clone(),
    ));
    Bed {
        dir,
        adapter,
        registry,
        action_log,
        reports,
        manager,
        shutdown,
    }
}
