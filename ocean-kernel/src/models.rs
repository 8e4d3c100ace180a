/**
 * MODÈLES DE DONNÉES - Structures centrales du kernel Ocean
 *
 * RÔLE : Définit les structures partagées entre tous les modules.
 * Types principaux : ActionRecord (journal), ExecutionReport (bilan d'une
 * vague de commandes), DeviceHealthState (monitoring), Alert (alertes flotte).
 *
 * UTILITÉ : Cohérence des données, sérialisation JSON, typage fort.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Action demandée sur un équipement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    TurnOn,
    TurnOff,
    Query,
    Probe,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::TurnOn => write!(f, "TURN_ON"),
            Action::TurnOff => write!(f, "TURN_OFF"),
            Action::Query => write!(f, "QUERY"),
            Action::Probe => write!(f, "PROBE"),
        }
    }
}

/// Issue d'une tentative (ou d'une série de tentatives) sur un équipement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Fail,
    Timeout,
    ProtocolError,
    Unreachable,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "SUCCESS"),
            Outcome::Fail => write!(f, "FAIL"),
            Outcome::Timeout => write!(f, "TIMEOUT"),
            Outcome::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            Outcome::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// État d'alimentation rapporté par un équipement lors d'un QUERY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Origine d'une exécution (pour les rapports journaliers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
    Api,
}

/// Enregistrement append-only d'une action sur un équipement.
/// Une ligne par terminus de tentative, jamais réécrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub device_id: String,
    pub action: Action,
    pub attempts: u32,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl ActionRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Politique de reprise appliquée par le Retry Executor.
///
/// Délai avant la tentative k (k >= 2) : base * multiplicateur^(k-2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_base_interval_sec")]
    pub base_interval_sec: u64,
    #[serde(default = "RetryPolicy::default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "RetryPolicy::default_per_attempt_timeout_sec")]
    pub per_attempt_timeout_sec: u64,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_base_interval_sec() -> u64 {
        30
    }
    fn default_backoff_multiplier() -> f64 {
        2.0
    }
    fn default_per_attempt_timeout_sec() -> u64 {
        10
    }

    /// Délai à observer avant la tentative `attempt` (1-based).
    /// Aucune attente avant la première tentative.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.powi(attempt as i32 - 2);
        Duration::from_secs_f64(self.base_interval_sec as f64 * factor)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.per_attempt_timeout_sec)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_interval_sec: Self::default_base_interval_sec(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            per_attempt_timeout_sec: Self::default_per_attempt_timeout_sec(),
        }
    }
}

/// Bilan d'une vague de commandes lancée par le Device Manager.
/// Exactement une entrée dans `results` par équipement demandé.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub requested_action: Action,
    pub trigger: Trigger,
    pub results: BTreeMap<String, ActionRecord>,
    pub success_count: u32,
    pub failure_count: u32,
}

impl ExecutionReport {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 1.0;
        }
        f64::from(self.success_count) / f64::from(total)
    }
}

/// Cible d'une commande : un équipement, un groupe, ou toute la flotte.
/// Forme texte : `device:<id>`, `group:<id>`, `all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    Device(String),
    Group(String),
    All,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(id) => write!(f, "device:{id}"),
            Target::Group(id) => write!(f, "group:{id}"),
            Target::All => write!(f, "all"),
        }
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Target::All);
        }
        if let Some(id) = s.strip_prefix("device:") {
            if id.is_empty() {
                return Err("empty device id in target".into());
            }
            return Ok(Target::Device(id.to_string()));
        }
        if let Some(id) = s.strip_prefix("group:") {
            if id.is_empty() {
                return Err("empty group id in target".into());
            }
            return Ok(Target::Group(id.to_string()));
        }
        Err(format!("invalid target: {s}"))
    }
}

impl TryFrom<String> for Target {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Target> for String {
    fn from(t: Target) -> String {
        t.to_string()
    }
}

/// Statut courant d'un équipement vu par le Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

/// État de santé d'un équipement, propriété exclusive du Monitor.
/// Les consommateurs externes lisent un snapshot publié en fin de cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealthState {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_probed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_ok_at: Option<OffsetDateTime>,
    pub consecutive_failures: u32,
    pub current_status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub status_since: OffsetDateTime,
}

impl DeviceHealthState {
    pub fn new(device_id: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            last_probed_at: None,
            last_ok_at: None,
            consecutive_failures: 0,
            current_status: DeviceStatus::Unknown,
            status_since: now,
        }
    }
}

/// Niveaux d'alerte flotte, du plus bénin au plus grave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    RedAlert,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "INFO"),
            AlertLevel::Warning => write!(f, "WARNING"),
            AlertLevel::Critical => write!(f, "CRITICAL"),
            AlertLevel::RedAlert => write!(f, "RED_ALERT"),
        }
    }
}

/// Événement d'alerte émis par le Monitor (au plus un par cycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub level: AlertLevel,
    pub message: String,
    pub device_ids: Vec<String>,
}

/// Échantillon de monitoring écrit dans le rapport journalier à chaque cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSample {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub online: u32,
    pub offline: u32,
    pub total: u32,
}

/// Tâche planifiée persistante (cron 5 champs, fuseau configuré).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub cron_expr: String,
    pub action: Action,
    pub target: Target,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_follow_the_policy() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_interval_sec: 30,
            backoff_multiplier: 2.0,
            per_attempt_timeout_sec: 10,
        };
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_before_attempt(2), Duration::from_secs(30));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_secs(60));
        assert_eq!(policy.delay_before_attempt(4), Duration::from_secs(120));
    }

    #[test]
    fn target_round_trips_through_text() {
        for raw in ["device:optoma-hall", "group:projecteurs", "all"] {
            let target: Target = raw.parse().unwrap();
            assert_eq!(target.to_string(), raw);
        }
        assert!("device:".parse::<Target>().is_err());
        assert!("everything".parse::<Target>().is_err());
    }

    #[test]
    fn action_record_serializes_screaming_tags() {
        let record = ActionRecord {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            device_id: "cube-3".into(),
            action: Action::TurnOff,
            attempts: 2,
            outcome: Outcome::ProtocolError,
            duration_ms: 1234,
            error_message: Some("unexpected token".into()),
            response: None,
            cancelled: false,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"TURN_OFF\""));
        assert!(json.contains("\"PROTOCOL_ERROR\""));
        assert!(!json.contains("cancelled"));
        let back: ActionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempts, 2);
        assert!(!back.cancelled);
    }
}
