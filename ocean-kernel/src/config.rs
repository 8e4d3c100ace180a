/**
 * CONFIGURATION KERNEL - Chargement et validation des paramètres Ocean
 *
 * RÔLE :
 * Ce module gère la configuration centralisée du kernel depuis un fichier YAML.
 * Il définit les équipements, les groupes, la politique de reprise, le
 * monitoring et les chemins de persistance.
 *
 * FONCTIONNEMENT :
 * - Lecture de ocean.yaml (ou variable OCEAN_KERNEL_CONFIG)
 * - Parsing YAML -> structures typées avec serde
 * - Validation stricte : toute incohérence refuse le démarrage (exit 2).
 *   Un réseau d'équipements mal décrit ne doit jamais être piloté en aveugle.
 *
 * EXEMPLE OCEAN.YAML :
 * ```yaml
 * timezone: "Asia/Vladivostok"
 * max_concurrency: 10
 * monitor_interval_sec: 60
 * schedule_db_path: "data/schedule.json"
 * report_dir: "data/reports"
 * log_dir: "logs"
 * retry:
 *   max_attempts: 3
 *   base_interval_sec: 30
 * devices:
 *   - id: "optoma-hall-1"
 *     name: "Projecteur hall 1"
 *     type: "telnet_projector"
 *     host: "192.168.2.64"
 *     credentials: { username: "admin", password: "admin" }
 *     group_ids: ["projecteurs"]
 * groups:
 *   - id: "projecteurs"
 *     name: "Projecteurs principaux"
 *     device_ids: ["optoma-hall-1"]
 * ```
 */

use crate::models::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Familles d'équipements pilotables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    TelnetProjector,
    JsonrpcProjector,
    PcWake,
    GenericTcp,
}

impl DeviceType {
    /// Port par défaut de la famille quand l'équipement n'en déclare pas.
    pub fn default_port(self) -> u16 {
        match self {
            DeviceType::TelnetProjector => 23,
            DeviceType::JsonrpcProjector => 9090,
            DeviceType::PcWake => 9,
            DeviceType::GenericTcp => 7992,
        }
    }
}

/// Identifiants spécifiques au type : login telnet, MAC pour le réveil réseau,
/// canal d'extinction des PC d'exposition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Adresse MAC pour Wake-on-LAN (format AA:BB:CC:DD:EE:FF)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Port TCP du canal de management pour l'extinction douce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_port: Option<u16>,
}

/// Méthode de test de joignabilité utilisée par le Health Prober.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    Icmp,
    Tcp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Http {
        path: String,
    },
}

/// Un équipement du parc. Immuable après chargement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_spec: Option<ProbeSpec>,
}

impl Device {
    /// Port effectif : celui déclaré, sinon celui de la famille.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.device_type.default_port())
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.clone().unwrap_or_default()
    }
}

/// Groupe nommé d'équipements pilotés comme une unité.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub device_ids: Vec<String>,
}

/// Document de configuration complet du kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OceanConfig {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "OceanConfig::default_monitor_interval")]
    pub monitor_interval_sec: u64,
    #[serde(default = "OceanConfig::default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "OceanConfig::default_schedule_db_path")]
    pub schedule_db_path: PathBuf,
    #[serde(default = "OceanConfig::default_report_dir")]
    pub report_dir: PathBuf,
    #[serde(default = "OceanConfig::default_log_dir")]
    pub log_dir: PathBuf,
    /// Fuseau IANA utilisé pour l'évaluation des expressions cron.
    #[serde(default = "OceanConfig::default_timezone")]
    pub timezone: String,
    /// Adresse d'écoute du plan de contrôle HTTP.
    #[serde(default = "OceanConfig::default_http_addr")]
    pub http_addr: String,
}

impl OceanConfig {
    fn default_monitor_interval() -> u64 {
        60
    }
    fn default_max_concurrency() -> usize {
        10
    }
    fn default_schedule_db_path() -> PathBuf {
        PathBuf::from("data/schedule.json")
    }
    fn default_report_dir() -> PathBuf {
        PathBuf::from("data/reports")
    }
    fn default_log_dir() -> PathBuf {
        PathBuf::from("logs")
    }
    fn default_timezone() -> String {
        "UTC".to_string()
    }
    fn default_http_addr() -> String {
        "0.0.0.0:8080".to_string()
    }
}

impl Default for OceanConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            groups: Vec::new(),
            retry: RetryPolicy::default(),
            monitor_interval_sec: Self::default_monitor_interval(),
            max_concurrency: Self::default_max_concurrency(),
            schedule_db_path: Self::default_schedule_db_path(),
            report_dir: Self::default_report_dir(),
            log_dir: Self::default_log_dir(),
            timezone: Self::default_timezone(),
            http_addr: Self::default_http_addr(),
        }
    }
}

/// Erreurs de configuration, toutes fatales au démarrage.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Charge et valide le document de configuration.
pub fn load_config(path: &Path) -> Result<OceanConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    let mut config: OceanConfig = serde_yaml::from_str(&text)?;
    validate(&mut config)?;
    Ok(config)
}

/// Valide le document et réconcilie les appartenances aux groupes
/// (déclarées côté équipement et côté groupe).
pub fn validate(config: &mut OceanConfig) -> Result<(), ConfigError> {
    fn invalid(msg: impl Into<String>) -> ConfigError {
        ConfigError::Invalid(msg.into())
    }

    if config.max_concurrency == 0 {
        return Err(invalid("max_concurrency must be >= 1"));
    }
    if config.monitor_interval_sec == 0 {
        return Err(invalid("monitor_interval_sec must be >= 1"));
    }
    if config.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be >= 1"));
    }
    if config.retry.backoff_multiplier <= 0.0 {
        return Err(invalid("retry.backoff_multiplier must be > 0"));
    }
    config
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| invalid(format!("unknown IANA timezone: {}", config.timezone)))?;

    let mut device_ids = HashSet::new();
    for device in &config.devices {
        if device.id.is_empty() {
            return Err(invalid("device with empty id"));
        }
        if !device_ids.insert(device.id.clone()) {
            return Err(invalid(format!("duplicate device id: {}", device.id)));
        }
        if device.host.is_empty() {
            return Err(invalid(format!("device {}: empty host", device.id)));
        }
        if device.port == Some(0) {
            return Err(invalid(format!("device {}: port must be 1-65535", device.id)));
        }
        if device.device_type == DeviceType::TelnetProjector {
            let creds = device.credentials();
            if creds.username.is_none() || creds.password.is_none() {
                return Err(invalid(format!(
                    "device {}: telnet_projector requires credentials.username and credentials.password",
                    device.id
                )));
            }
        }
        if let Some(mac) = device.credentials.as_ref().and_then(|c| c.mac.as_deref()) {
            let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
            if hex.len() != 12 {
                return Err(invalid(format!("device {}: invalid MAC address {mac}", device.id)));
            }
        }
    }

    let mut group_ids = HashSet::new();
    for group in &config.groups {
        if group.id.is_empty() {
            return Err(invalid("group with empty id"));
        }
        if !group_ids.insert(group.id.clone()) {
            return Err(invalid(format!("duplicate group id: {}", group.id)));
        }
        let mut seen = HashSet::new();
        for device_id in &group.device_ids {
            if !device_ids.contains(device_id.as_str()) {
                return Err(invalid(format!(
                    "group {}: unknown device {device_id}",
                    group.id
                )));
            }
            if !seen.insert(device_id.clone()) {
                return Err(invalid(format!(
                    "group {}: duplicate member {device_id}",
                    group.id
                )));
            }
        }
    }
    for device in &config.devices {
        for group_id in &device.group_ids {
            if !group_ids.contains(group_id.as_str()) {
                return Err(invalid(format!(
                    "device {}: unknown group {group_id}",
                    device.id
                )));
            }
        }
    }

    reconcile_memberships(config);
    Ok(())
}

/// Fusionne les deux déclarations d'appartenance : `groups[].device_ids`
/// fait foi pour l'ordre, les appartenances déclarées côté équipement sont
/// ajoutées en fin de liste. Après réconciliation les deux vues coïncident.
fn reconcile_memberships(config: &mut OceanConfig) {
    let mut declared: HashMap<String, Vec<String>> = HashMap::new();
    for device in &config.devices {
        for group_id in &device.group_ids {
            declared
                .entry(group_id.clone())
                .or_default()
                .push(device.id.clone());
        }
    }
    for group in &mut config.groups {
        let mut members: Vec<String> = group.device_ids.clone();
        let mut seen: HashSet<String> = members.iter().cloned().collect();
        if let Some(extra) = declared.get(&group.id) {
            for device_id in extra {
                if seen.insert(device_id.clone()) {
                    members.push(device_id.clone());
                }
            }
        }
        group.device_ids = members;
    }
    // Vue inverse : chaque équipement connaît l'ensemble de ses groupes.
    let mut memberships: HashMap<String, BTreeSet<String>> = HashMap::new();
    for group in &config.groups {
        for device_id in &group.device_ids {
            memberships
                .entry(device_id.clone())
                .or_default()
                .insert(group.id.clone());
        }
    }
    for device in &mut config.devices {
        if let Some(groups) = memberships.get(&device.id) {
            device.group_ids = groups.iter().cloned().collect();
        }
    }
}
