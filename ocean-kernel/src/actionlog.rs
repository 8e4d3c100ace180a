/**
 * JOURNAL D'ACTIONS - Puits append-only des issues d'actions équipement
 *
 * RÔLE :
 * Chaque terminus d'action (commande, probe, alerte) produit un
 * enregistrement structuré, une ligne JSON par enregistrement, dans le
 * fichier du jour de son horodatage (actions-YYYY-MM-DD.log).
 *
 * FONCTIONNEMENT :
 * - Producteur unique : tous les écrivains passent par une file mpsc,
 *   les écritures sont sérialisées FIFO par une tâche dédiée
 * - Horodatages croissants garantis à l'enfilage (égalité départagée
 *   par l'ordre d'ajout)
 * - Un échec d'écriture est journalisé au plus une fois par minute,
 *   les écritures suivantes sont quand même tentées
 * - Fenêtre glissante de 24 h en mémoire pour le taux de succès exposé
 *   par GET /health
 */

use crate::models::{ActionRecord, Outcome};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

const ERROR_LOG_THROTTLE: Duration = Duration::from_secs(60);
const SUCCESS_WINDOW: time::Duration = time::Duration::hours(24);
const PAGE_SIZE: usize = 100;

enum LogMessage {
    Record(Box<ActionRecord>),
    Flush(oneshot::Sender<()>),
}

struct OrderState {
    last_timestamp: OffsetDateTime,
    recent: VecDeque<(OffsetDateTime, bool)>,
}

struct LogInner {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<LogMessage>,
    order: Mutex<OrderState>,
}

/// Poignée clonable vers le puits de journal.
#[derive(Clone)]
pub struct ActionLog {
    inner: Arc<LogInner>,
}

impl ActionLog {
    /// Crée le répertoire de journaux et démarre la tâche d'écriture.
    pub fn spawn(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_dir = dir.clone();
        tokio::spawn(async move {
            writer_loop(writer_dir, rx).await;
        });
        Ok(Self {
            inner: Arc::new(LogInner {
                dir,
                tx,
                order: Mutex::new(OrderState {
                    last_timestamp: OffsetDateTime::UNIX_EPOCH,
                    recent: VecDeque::new(),
                }),
            }),
        })
    }

    /// Enfile un enregistrement. Les horodatages sont rendus croissants ici :
    /// l'ordre d'ajout départage les écritures quasi simultanées.
    pub fn append(&self, mut record: ActionRecord) {
        {
            let mut order = self.inner.order.lock();
            if record.timestamp < order.last_timestamp {
                record.timestamp = order.last_timestamp;
            }
            order.last_timestamp = record.timestamp;
            order
                .recent
                .push_back((record.timestamp, record.is_success()));
            let horizon = record.timestamp - SUCCESS_WINDOW;
            while let Some(&(ts, _)) = order.recent.front() {
                if ts < horizon {
                    order.recent.pop_front();
                } else {
                    break;
                }
            }
        }
        let _ = self.inner.tx.send(LogMessage::Record(Box::new(record)));
    }

    /// Attend que tout ce qui précède soit écrit sur disque.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(LogMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Fraction d'issues SUCCESS sur les dernières 24 h (1.0 si vide).
    pub fn success_rate_24h(&self) -> f64 {
        let order = self.inner.order.lock();
        let horizon = OffsetDateTime::now_utc() - SUCCESS_WINDOW;
        let mut total = 0u64;
        let mut ok = 0u64;
        for &(ts, success) in order.recent.iter() {
            if ts >= horizon {
                total += 1;
                if success {
                    ok += 1;
                }
            }
        }
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    pub fn path_for(&self, date: Date) -> PathBuf {
        self.inner.dir.join(file_name(date))
    }

    /// Lit les enregistrements d'une journée, filtre optionnel par issue,
    /// pagination 1-based. Les lignes illisibles sont ignorées : un lecteur
    /// peut suivre le fichier pendant qu'il est écrit.
    pub async fn query(
        &self,
        date: Date,
        outcome: Option<Outcome>,
        page: usize,
    ) -> Vec<ActionRecord> {
        let path = self.path_for(date);
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            return Vec::new();
        };
        let records = text
            .lines()
            .filter_map(|line| serde_json::from_str::<ActionRecord>(line).ok())
            .filter(|record| outcome.map_or(true, |o| record.outcome == o));
        let page = page.max(1);
        records
            .skip((page - 1) * PAGE_SIZE)
            .take(PAGE_SIZE)
            .collect()
    }

    /// Contenu brut du fichier d'une journée (export).
    pub async fn export(&self, date: Date) -> Option<String> {
        tokio::fs::read_to_string(self.path_for(date)).await.ok()
    }
}

fn file_name(date: Date) -> String {
    let format = format_description!("[year]-[month]-[day]");
    let day = date.format(&format).unwrap_or_else(|_| "unknown".into());
    format!("actions-{day}.log")
}

async fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<LogMessage>) {
    let mut last_error_logged: Option<Instant> = None;
    while let Some(message) = rx.recv().await {
        match message {
            LogMessage::Record(record) => {
                if let Err(e) = write_record(&dir, &record) {
                    let now = Instant::now();
                    let should_log = last_error_logged
                        .map_or(true, |at| now.duration_since(at) >= ERROR_LOG_THROTTLE);
                    if should_log {
                        error!(error = %e, "action log write failed");
                        last_error_logged = Some(now);
                    }
                }
            }
            LogMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn write_record(dir: &Path, record: &ActionRecord) -> std::io::Result<()> {
    // Le fichier cible est choisi par la date de l'horodatage de
    // l'enregistrement lui-même (écritures autour de minuit).
    let line = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let path = dir.join(file_name(record.timestamp.date()));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Action;

    fn record(device_id: &str, outcome: Outcome, timestamp: OffsetDateTime) -> ActionRecord {
        ActionRecord {
            timestamp,
            device_id: device_id.into(),
            action: Action::TurnOn,
            attempts: 1,
            outcome,
            duration_ms: 10,
            error_message: None,
            response: None,
            cancelled: false,
        }
    }

    #[tokio::test]
    async fn appends_one_line_per_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::spawn(dir.path()).unwrap();
        let now = OffsetDateTime::now_utc();
        log.append(record("d1", Outcome::Success, now));
        log.append(record("d2", Outcome::Unreachable, now));
        log.flush().await;

        let records = log.query(now.date(), None, 1).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].device_id, "d1");
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[tokio::test]
    async fn timestamps_never_regress_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::spawn(dir.path()).unwrap();
        let now = OffsetDateTime::now_utc();
        log.append(record("late", Outcome::Success, now));
        // horodatage antérieur enfilé après : clampé sur le précédent
        log.append(record("early", Outcome::Success, now - time::Duration::seconds(5)));
        log.flush().await;

        let records = log.query(now.date(), None, 1).await;
        assert_eq!(records.len(), 2);
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[tokio::test]
    async fn success_rate_counts_last_day_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::spawn(dir.path()).unwrap();
        let now = OffsetDateTime::now_utc();
        log.append(record("d1", Outcome::Success, now));
        log.append(record("d2", Outcome::Timeout, now));
        assert!((log.success_rate_24h() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn query_filters_by_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::spawn(dir.path()).unwrap();
        let now = OffsetDateTime::now_utc();
        log.append(record("d1", Outcome::Success, now));
        log.append(record("d2", Outcome::Unreachable, now));
        log.flush().await;

        let failures = log.query(now.date(), Some(Outcome::Unreachable), 1).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].device_id, "d2");
    }
}
