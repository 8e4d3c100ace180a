/*!
Harness de test pour le kernel Ocean

Facilite l'écriture de tests d'intégration avec :
- Adaptateurs scriptés (issues programmées par équipement, délais simulés)
- Prober scripté (séquences joignable/injoignable)
- Compteurs d'instrumentation : parallélisme maximal observé,
  chevauchements par équipement
- Fixtures : équipements, registres, politiques de reprise rapides
*/

pub mod mock;

pub use mock::{MockAdapter, MockProber};

use ocean_kernel::config::{validate, Device, DeviceType, OceanConfig};
use ocean_kernel::models::RetryPolicy;
use ocean_kernel::registry::DeviceRegistry;
use std::sync::Arc;

/// Équipement generic_tcp minimal pour les tests.
pub fn test_device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Device {id}"),
        device_type: DeviceType::GenericTcp,
        host: "127.0.0.1".to_string(),
        port: Some(7992),
        group_ids: vec![],
        credentials: None,
        probe_spec: None,
    }
}

/// Registre de n équipements d1..dn.
pub fn test_registry(count: usize) -> Arc<DeviceRegistry> {
    let devices = (1..=count).map(|i| test_device(&format!("d{i}"))).collect();
    registry_from(devices)
}

/// Registre construit depuis une liste d'équipements, via la même
/// validation que la configuration réelle.
pub fn registry_from(devices: Vec<Device>) -> Arc<DeviceRegistry> {
    let mut config = OceanConfig {
        devices,
        ..OceanConfig::default()
    };
    validate(&mut config).expect("test config must validate");
    Arc::new(DeviceRegistry::from_config(&config))
}

/// Politique de reprise sans attente, pour des tests rapides.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_interval_sec: 0,
        backoff_multiplier: 2.0,
        per_attempt_timeout_sec: 5,
    }
}

/// Politique avec backoff réel (en secondes), pour vérifier les délais.
pub fn timed_policy(max_attempts: u32, base_interval_sec: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_interval_sec,
        backoff_multiplier: 2.0,
        per_attempt_timeout_sec: 5,
    }
}
