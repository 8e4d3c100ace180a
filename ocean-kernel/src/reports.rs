/**
 * REPORT STORE - Synthèses journalières durables
 *
 * RÔLE : Un fichier par jour civil (YYYY-MM-DD.report), une ligne JSON par
 * enregistrement : rapports d'exécution planifiée, échantillons de
 * monitoring, événements d'alerte.
 *
 * FONCTIONNEMENT : Chaque écriture relit le fichier du jour, ajoute la
 * ligne, écrit un fichier temporaire puis rename (atomique). Le lecteur
 * tolère un fichier du jour partiellement écrit : il prend les
 * enregistrements entiers et ignore une ligne finale tronquée.
 */

use crate::models::{Alert, ExecutionReport, MonitorSample};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::error;

/// Un enregistrement du fichier journalier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportEntry {
    Execution(ExecutionReport),
    Sample(MonitorSample),
    Alert(Alert),
}

pub struct ReportStore {
    dir: PathBuf,
    // Les écrivains (scheduler, monitor) sérialisent leurs réécritures.
    write_lock: Mutex<()>,
}

impl ReportStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, date: Date) -> PathBuf {
        let format = format_description!("[year]-[month]-[day]");
        let day = date.format(&format).unwrap_or_else(|_| "unknown".into());
        self.dir.join(format!("{day}.report"))
    }

    pub fn append_execution(&self, report: &ExecutionReport) {
        self.append(
            report.started_at.date(),
            &ReportEntry::Execution(report.clone()),
        );
    }

    pub fn append_sample(&self, sample: &MonitorSample) {
        self.append(sample.timestamp.date(), &ReportEntry::Sample(sample.clone()));
    }

    pub fn append_alert(&self, alert: &Alert) {
        self.append(alert.timestamp.date(), &ReportEntry::Alert(alert.clone()));
    }

    /// Ajout append-then-rename ; un échec de persistance est journalisé,
    /// jamais propagé (le monitoring ne doit pas s'arrêter pour un disque).
    fn append(&self, date: Date, entry: &ReportEntry) {
        if let Err(e) = self.try_append(date, entry) {
            error!(error = %e, "report store write failed");
        }
    }

    fn try_append(&self, date: Date, entry: &ReportEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let _guard = self.write_lock.lock();
        let path = self.path_for(date);
        let mut content = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&line);
        content.push('\n');
        write_atomic(&path, content.as_bytes())
    }

    /// Enregistrements entiers d'une journée ; une ligne finale tronquée ou
    /// illisible est simplement écartée.
    pub fn load(&self, date: Date) -> Vec<ReportEntry> {
        let Ok(text) = std::fs::read_to_string(self.path_for(date)) else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|line| serde_json::from_str::<ReportEntry>(line).ok())
            .collect()
    }

    /// Alertes des N dernières heures (fenêtre limitée à 48 h de fichiers).
    pub fn alerts_since(&self, hours: u64) -> Vec<Alert> {
        let now = OffsetDateTime::now_utc();
        let horizon = now - time::Duration::hours(hours as i64);
        let mut dates = vec![now.date()];
        if let Some(previous) = now.date().previous_day() {
            dates.push(previous);
        }
        let mut alerts: Vec<Alert> = dates
            .into_iter()
            .flat_map(|date| self.load(date))
            .filter_map(|entry| match entry {
                ReportEntry::Alert(alert) if alert.timestamp >= horizon => Some(alert),
                _ => None,
            })
            .collect();
        alerts.sort_by_key(|a| a.timestamp);
        alerts
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("report.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertLevel;

    fn sample(online: u32, offline: u32) -> MonitorSample {
        MonitorSample {
            timestamp: OffsetDateTime::now_utc(),
            online,
            offline,
            total: online + offline,
        }
    }

    #[test]
    fn appends_and_reloads_whole_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let now = OffsetDateTime::now_utc();
        store.append_sample(&sample(9, 1));
        store.append_alert(&Alert {
            timestamp: now,
            level: AlertLevel::Warning,
            message: "device d2 is offline".into(),
            device_ids: vec!["d2".into()],
        });

        let entries = store.load(now.date());
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], ReportEntry::Sample(_)));
        assert!(matches!(entries[1], ReportEntry::Alert(_)));
    }

    #[test]
    fn reader_discards_trailing_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let now = OffsetDateTime::now_utc();
        store.append_sample(&sample(5, 0));
        // simulate a partially written same-day file
        let path = store.path_for(now.date());
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"kind\":\"sample\",\"timest");
        std::fs::write(&path, content).unwrap();

        let entries = store.load(now.date());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn alerts_since_filters_by_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        let now = OffsetDateTime::now_utc();
        store.append_alert(&Alert {
            timestamp: now - time::Duration::hours(30),
            level: AlertLevel::Info,
            message: "old".into(),
            device_ids: vec![],
        });
        store.append_alert(&Alert {
            timestamp: now,
            level: AlertLevel::RedAlert,
            message: "fresh".into(),
            device_ids: vec![],
        });
        let recent = store.alerts_since(24);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "fresh");
    }
}
