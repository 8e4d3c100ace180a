/*!
Adaptateur et prober scriptés

L'adaptateur rejoue une séquence d'issues programmée par équipement et
mesure ce que le moteur fait réellement : nombre d'appels, parallélisme
maximal observé, chevauchements interdits sur un même équipement.
*/

use async_trait::async_trait;
use ocean_kernel::config::{Device, DeviceType};
use ocean_kernel::models::PowerState;
use ocean_kernel::probe::{Probe, ProbeReport};
use ocean_kernel::protocols::{AdapterError, AdapterSelector, ProtocolAdapter};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Issue scriptée d'un appel adaptateur.
pub type ScriptedResult = Result<(), ScriptedError>;

/// Copie clonable des erreurs adaptateur, pour écrire les scripts.
#[derive(Debug, Clone)]
pub enum ScriptedError {
    Unreachable(String),
    Timeout(String),
    Protocol(String),
    Config(String),
}

impl From<&ScriptedError> for AdapterError {
    fn from(err: &ScriptedError) -> Self {
        match err {
            ScriptedError::Unreachable(m) => AdapterError::Unreachable(m.clone()),
            ScriptedError::Timeout(m) => AdapterError::Timeout(m.clone()),
            ScriptedError::Protocol(m) => AdapterError::Protocol(m.clone()),
            ScriptedError::Config(m) => AdapterError::Config(m.clone()),
        }
    }
}

#[derive(Default)]
struct Gauges {
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    overlap_detected: AtomicBool,
}

/// Adaptateur scripté : une file d'issues par équipement, issue par défaut
/// = succès. Implémente aussi AdapterSelector (même pilote pour toutes les
/// familles).
#[derive(Default)]
pub struct MockAdapter {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResult>>>,
    call_delay: Mutex<Duration>,
    calls: Mutex<HashMap<String, u32>>,
    per_device_in_flight: Mutex<HashMap<String, u32>>,
    gauges: Gauges,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programme la séquence d'issues d'un équipement.
    pub fn script(&self, device_id: &str, results: Vec<ScriptedResult>) {
        self.scripts
            .lock()
            .insert(device_id.to_string(), results.into());
    }

    /// Programme `count` échecs UNREACHABLE pour un équipement.
    pub fn script_unreachable(&self, device_id: &str, count: usize) {
        let results = (0..count)
            .map(|_| Err(ScriptedError::Unreachable("connection refused".into())))
            .collect();
        self.script(device_id, results);
    }

    /// Durée simulée de chaque appel (pour observer le parallélisme).
    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock() = delay;
    }

    pub fn calls_for(&self, device_id: &str) -> u32 {
        self.calls.lock().get(device_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    /// Parallélisme maximal observé sur la durée de vie du mock.
    pub fn max_in_flight(&self) -> u32 {
        self.gauges.max_in_flight.load(Ordering::SeqCst)
    }

    /// Vrai si deux appels ont visé le même équipement en même temps.
    pub fn overlap_detected(&self) -> bool {
        self.gauges.overlap_detected.load(Ordering::SeqCst)
    }

    fn enter(&self, device_id: &str) {
        *self.calls.lock().entry(device_id.to_string()).or_insert(0) += 1;

        let mut per_device = self.per_device_in_flight.lock();
        let counter = per_device.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
        if *counter > 1 {
            self.gauges.overlap_detected.store(true, Ordering::SeqCst);
        }
        drop(per_device);

        let current = self.gauges.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauges.max_in_flight.fetch_max(current, Ordering::SeqCst);
    }

    fn exit(&self, device_id: &str) {
        self.gauges.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(counter) = self.per_device_in_flight.lock().get_mut(device_id) {
            *counter = counter.saturating_sub(1);
        }
    }

    async fn scripted_call(&self, device: &Device) -> Result<(), AdapterError> {
        self.enter(&device.id);
        let delay = *self.call_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = match self
            .scripts
            .lock()
            .get_mut(&device.id)
            .and_then(|queue| queue.pop_front())
        {
            None => Ok(()),
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => Err(AdapterError::from(&err)),
        };
        self.exit(&device.id);
        result
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    async fn power_on(&self, device: &Device) -> Result<(), AdapterError> {
        self.scripted_call(device).await
    }

    async fn power_off(&self, device: &Device) -> Result<(), AdapterError> {
        self.scripted_call(device).await
    }

    async fn query_power(&self, device: &Device) -> Result<PowerState, AdapterError> {
        self.scripted_call(device).await.map(|_| PowerState::Unknown)
    }
}

impl AdapterSelector for MockAdapter {
    fn select(&self, _device_type: DeviceType) -> &dyn ProtocolAdapter {
        self
    }
}

/// Prober scripté : séquence joignable/injoignable par équipement,
/// joignable par défaut.
#[derive(Default)]
pub struct MockProber {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programme la séquence de joignabilité d'un équipement.
    pub fn script(&self, device_id: &str, reachable: Vec<bool>) {
        self.scripts
            .lock()
            .insert(device_id.to_string(), reachable.into());
    }
}

#[async_trait]
impl Probe for MockProber {
    async fn probe(&self, device: &Device) -> ProbeReport {
        let reachable = self
            .scripts
            .lock()
            .get_mut(&device.id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(true);
        ProbeReport {
            reachable,
            latency_ms: 1,
            detail: if reachable {
                "scripted: reachable".to_string()
            } else {
                "scripted: unreachable".to_string()
            },
        }
    }
}
