/**
 * RETRY EXECUTOR - Reprises bornées avec backoff exponentiel
 *
 * RÔLE : Enveloppe tout appel adaptateur : jusqu'à max_attempts tentatives,
 * délai base * multiplicateur^(k-2) avant la tentative k, budget de temps
 * par tentative. Les pannes sont classées et portées dans l'ActionRecord,
 * jamais propagées en erreur au-delà de ce module.
 *
 * Une erreur de protocole causée par la configuration (MAC absente, famille
 * sans pilotage) n'est jamais réessayée. Le signal d'annulation
 * court-circuite les attentes de backoff et les tentatives en cours.
 */

use crate::config::Device;
use crate::models::{Action, ActionRecord, Outcome, RetryPolicy};
use crate::protocols::{AdapterError, ProtocolAdapter};
use std::time::Instant;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Exécute l'action sur l'équipement avec reprises. Retourne toujours un
    /// ActionRecord : l'issue (succès, panne classée, annulation) y est
    /// portée, jamais levée.
    pub async fn execute(
        &self,
        adapter: &dyn ProtocolAdapter,
        device: &Device,
        action: Action,
        cancel: &CancellationToken,
    ) -> ActionRecord {
        let started = Instant::now();
        let mut last_error: Option<AdapterError> = None;

        for attempt in 1..=self.policy.max_attempts {
            if cancel.is_cancelled() {
                return self.cancelled_record(device, action, attempt - 1, &last_error, started);
            }

            let call = self.single_attempt(adapter, device, action);
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.cancelled_record(device, action, attempt, &last_error, started);
                }
                result = call => result,
            };

            match result {
                Ok(response) => {
                    debug!(device_id = %device.id, %action, attempt, "device action succeeded");
                    return ActionRecord {
                        timestamp: OffsetDateTime::now_utc(),
                        device_id: device.id.clone(),
                        action,
                        attempts: attempt,
                        outcome: Outcome::Success,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error_message: None,
                        response,
                        cancelled: false,
                    };
                }
                Err(error) => {
                    warn!(
                        device_id = %device.id, %action, attempt,
                        error = %error, "device action attempt failed"
                    );
                    let retriable = error.is_retriable();
                    last_error = Some(error);
                    if !retriable {
                        return self.failed_record(device, action, attempt, &last_error, started);
                    }
                    if attempt < self.policy.max_attempts {
                        let delay = self.policy.delay_before_attempt(attempt + 1);
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return self.cancelled_record(
                                    device, action, attempt, &last_error, started,
                                );
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.failed_record(device, action, self.policy.max_attempts, &last_error, started)
    }

    /// Une tentative sous budget de temps ; un dépassement est classé TIMEOUT.
    async fn single_attempt(
        &self,
        adapter: &dyn ProtocolAdapter,
        device: &Device,
        action: Action,
    ) -> Result<Option<String>, AdapterError> {
        let budget = self.policy.per_attempt_timeout();
        let call = async {
            match action {
                Action::TurnOn => adapter.power_on(device).await.map(|_| None),
                Action::TurnOff => adapter.power_off(device).await.map(|_| None),
                Action::Query => adapter
                    .query_power(device)
                    .await
                    .map(|state| Some(state.to_string())),
                Action::Probe => Err(AdapterError::Config(
                    "probe is not an adapter action".into(),
                )),
            }
        };
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(format!(
                "attempt exceeded {}s",
                self.policy.per_attempt_timeout_sec
            ))),
        }
    }

    fn failed_record(
        &self,
        device: &Device,
        action: Action,
        attempts: u32,
        last_error: &Option<AdapterError>,
        started: Instant,
    ) -> ActionRecord {
        let (outcome, message) = match last_error {
            Some(error) => (error.outcome(), Some(error.to_string())),
            None => (Outcome::Fail, None),
        };
        ActionRecord {
            timestamp: OffsetDateTime::now_utc(),
            device_id: device.id.clone(),
            action,
            attempts,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            error_message: message,
            response: None,
            cancelled: false,
        }
    }

    fn cancelled_record(
        &self,
        device: &Device,
        action: Action,
        attempts: u32,
        last_error: &Option<AdapterError>,
        started: Instant,
    ) -> ActionRecord {
        let mut record = self.failed_record(device, action, attempts, last_error, started);
        record.cancelled = true;
        if record.error_message.is_none() {
            record.error_message = Some("cancelled".into());
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceType;
    use crate::models::PowerState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn device() -> Device {
        Device {
            id: "d1".into(),
            name: "D1".into(),
            device_type: DeviceType::GenericTcp,
            host: "10.0.0.1".into(),
            port: None,
            group_ids: vec![],
            credentials: None,
            probe_spec: None,
        }
    }

    struct ScriptedAdapter {
        script: Mutex<VecDeque<Result<(), AdapterError>>>,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<Result<(), AdapterError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProtocolAdapter for ScriptedAdapter {
        async fn power_on(&self, _device: &Device) -> Result<(), AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn power_off(&self, device: &Device) -> Result<(), AdapterError> {
            self.power_on(device).await
        }

        async fn query_power(&self, _device: &Device) -> Result<PowerState, AdapterError> {
            Ok(PowerState::Unknown)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_interval_sec: 0,
            backoff_multiplier: 2.0,
            per_attempt_timeout_sec: 5,
        }
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let adapter = ScriptedAdapter::new(vec![
            Err(AdapterError::Unreachable("refused".into())),
            Ok(()),
        ]);
        let executor = RetryExecutor::new(fast_policy(3));
        let record = executor
            .execute(&adapter, &device(), Action::TurnOn, &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.attempts, 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_keeps_last_outcome() {
        let adapter = ScriptedAdapter::new(vec![
            Err(AdapterError::Unreachable("1".into())),
            Err(AdapterError::Unreachable("2".into())),
            Err(AdapterError::Unreachable("3".into())),
        ]);
        let executor = RetryExecutor::new(fast_policy(3));
        let record = executor
            .execute(&adapter, &device(), Action::TurnOn, &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, Outcome::Unreachable);
        assert_eq!(record.attempts, 3);
        assert!(!record.cancelled);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn config_errors_are_not_retried() {
        let adapter = ScriptedAdapter::new(vec![Err(AdapterError::Config("mac missing".into()))]);
        let executor = RetryExecutor::new(fast_policy(3));
        let record = executor
            .execute(&adapter, &device(), Action::TurnOn, &CancellationToken::new())
            .await;
        assert_eq!(record.outcome, Outcome::ProtocolError);
        assert_eq!(record.attempts, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_short_circuits_backoff() {
        let adapter = ScriptedAdapter::new(vec![
            Err(AdapterError::Unreachable("1".into())),
            Ok(()),
        ]);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_interval_sec: 3600,
            backoff_multiplier: 2.0,
            per_attempt_timeout_sec: 5,
        };
        let executor = RetryExecutor::new(policy);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let record = executor
            .execute(&adapter, &device(), Action::TurnOn, &cancel)
            .await;
        assert!(record.cancelled);
        assert_eq!(record.outcome, Outcome::Unreachable);
        // une seule tentative : l'annulation a interrompu l'attente
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }
}
