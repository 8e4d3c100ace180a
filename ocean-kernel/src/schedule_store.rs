/**
 * STORE DU SCHEDULER - Table durable des tâches planifiées
 *
 * RÔLE : Lignes (id -> cron, action, cible, enabled, next_run) persistées en
 * JSON avec réécriture atomique (fichier temporaire puis rename). Le fichier
 * absent au premier lancement est auto-initialisé ; un fichier illisible est
 * une erreur fatale remontée au démarrage (exit 3).
 *
 * Toute mutation écrit le disque d'abord : en cas d'échec de persistance
 * l'état en mémoire n'est pas modifié.
 */

use crate::models::ScheduledJob;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Ligne durable : la tâche plus son prochain déclenchement calculé.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    #[serde(flatten)]
    pub job: ScheduledJob,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("schedule store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schedule store unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub struct ScheduleStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, StoredJob>>,
}

impl ScheduleStore {
    /// Ouvre le store, en l'initialisant s'il n'existe pas encore.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let jobs: Vec<StoredJob> = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            write_atomic(&path, &Vec::<StoredJob>::new())?;
            Vec::new()
        };
        let cache = jobs.into_iter().map(|j| (j.job.id.clone(), j)).collect();
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    pub fn list(&self) -> Vec<StoredJob> {
        let mut jobs: Vec<StoredJob> = self.cache.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.job.id.cmp(&b.job.id));
        jobs
    }

    pub fn get(&self, id: &str) -> Option<StoredJob> {
        self.cache.lock().get(id).cloned()
    }

    /// Crée ou remplace une ligne. Disque d'abord, mémoire ensuite.
    pub fn upsert(&self, job: StoredJob) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        let mut next: HashMap<String, StoredJob> = cache.clone();
        next.insert(job.job.id.clone(), job);
        self.persist(&next)?;
        *cache = next;
        Ok(())
    }

    /// Supprime une ligne ; retourne false si l'id est inconnu.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut cache = self.cache.lock();
        if !cache.contains_key(id) {
            return Ok(false);
        }
        let mut next = cache.clone();
        next.remove(id);
        self.persist(&next)?;
        *cache = next;
        Ok(true)
    }

    pub fn set_next_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        let Some(current) = cache.get(id).cloned() else {
            return Ok(());
        };
        let mut updated = current;
        updated.next_run = next_run;
        let mut next = cache.clone();
        next.insert(id.to_string(), updated);
        self.persist(&next)?;
        *cache = next;
        Ok(())
    }

    fn persist(&self, jobs: &HashMap<String, StoredJob>) -> Result<(), StoreError> {
        let mut rows: Vec<&StoredJob> = jobs.values().collect();
        rows.sort_by(|a, b| a.job.id.cmp(&b.job.id));
        write_atomic(&self.path, &rows)
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Target};

    fn stored(id: &str) -> StoredJob {
        StoredJob {
            job: ScheduledJob {
                id: id.into(),
                cron_expr: "0 21 * * *".into(),
                action: Action::TurnOff,
                target: Target::All,
                enabled: true,
            },
            next_run: None,
        }
    }

    #[test]
    fn self_initialises_when_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("schedule.json");
        let store = ScheduleStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.list().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        {
            let store = ScheduleStore::open(&path).unwrap();
            store.upsert(stored("soir")).unwrap();
        }
        let reopened = ScheduleStore::open(&path).unwrap();
        let jobs = reopened.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.id, "soir");
        assert_eq!(jobs[0].job.cron_expr, "0 21 * * *");
    }

    #[test]
    fn corrupt_file_is_a_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ScheduleStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn delete_reports_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::open(dir.path().join("s.json")).unwrap();
        store.upsert(stored("a")).unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
    }
}
