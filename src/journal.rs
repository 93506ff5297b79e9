//! Journaux d'événements persistés
//!
//! Deux écritures distinctes de la journalisation de diagnostic: le journal
//! des alertes (`alerts/<date>.jsonl`, strictement un objet JSON par ligne,
//! tourné chaque jour) et les exports périodiques de la table des endpoints
//! (`exports/`, purgés après la durée de rétention).

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{FrelonError, Result};
use crate::models::{Alert, ConnectionSummary, EndpointKey, NetworkEndpoint, ts_ms};

/// Journal des alertes en ajout seul
pub struct AlertJournal {
    dir: PathBuf,
    /// Fichier ouvert et la date qu'il couvre
    current: Mutex<Option<(String, File)>>,
}

impl AlertJournal {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            current: Mutex::new(None),
        }
    }

    /// Ajoute une alerte au journal du jour, en rouvrant le fichier si la
    /// date a changé ou si l'écriture précédente a échoué
    pub fn append(&self, alert: &Alert) {
        let date = alert.timestamp.format("%Y-%m-%d").to_string();

        let line = match serde_json::to_string(alert) {
            Ok(json) => json,
            Err(e) => {
                error!("Alerte non sérialisable: {}", e);
                return;
            }
        };

        let mut guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Rotation quotidienne
        let needs_open = match guard.as_ref() {
            Some((open_date, _)) => open_date != &date,
            None => true,
        };
        if needs_open {
            *guard = self.open_for(&date);
        }

        if let Some((_, file)) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                error!("Erreur lors de l'écriture du journal d'alertes: {}", e);
                // Tentative de réouverture pour la prochaine alerte
                *guard = self.open_for(&date);
            }
        }
    }

    fn open_for(&self, date: &str) -> Option<(String, File)> {
        let path = self.dir.join(format!("{}.jsonl", date));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some((date.to_string(), file)),
            Err(e) => {
                error!(
                    "Erreur lors de l'ouverture du journal d'alertes {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

/// Contenu d'un export de la table des endpoints
#[derive(Debug, Serialize)]
pub struct ExportPayload {
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
    pub active_connections: HashMap<String, NetworkEndpoint>,
    pub blocked_hosts: Vec<String>,
    pub alerts: Vec<Alert>,
    pub summary: ConnectionSummary,
}

/// Écrit les instantanés de la table et purge les anciens fichiers
pub struct Exporter {
    dir: PathBuf,
    retention_days: u32,
}

impl Exporter {
    pub fn new(dir: PathBuf, retention_days: u32) -> Self {
        Self {
            dir,
            retention_days,
        }
    }

    /// Écrit l'instantané du jour et retourne son chemin. Rotation
    /// quotidienne: un fichier par date, réécrit à chaque export.
    pub fn export(
        &self,
        endpoints: &HashMap<EndpointKey, NetworkEndpoint>,
        blocked_hosts: Vec<String>,
        alerts: Vec<Alert>,
        summary: ConnectionSummary,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let payload = ExportPayload {
            timestamp: crate::models::truncate_to_millis(now),
            active_connections: endpoints
                .iter()
                .map(|(key, ep)| (key.to_string(), ep.clone()))
                .collect(),
            blocked_hosts,
            alerts,
            summary,
        };

        let path = self
            .dir
            .join(format!("export_{}.json", now.format("%Y-%m-%d")));
        let json = serde_json::to_string_pretty(&payload)?;
        std::fs::write(&path, json).map_err(|e| FrelonError::Io {
            path: path.clone(),
            source: e,
        })?;

        info!("Export écrit dans {}", path.display());
        self.prune(now);
        Ok(path)
    }

    /// Supprime les exports plus anciens que la durée de rétention
    fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(self.retention_days as i64);
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if !is_older_than(&entry.path(), cutoff) {
                continue;
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                error!(
                    "Erreur lors de la purge de l'export {}: {}",
                    entry.path().display(),
                    e
                );
            }
        }
    }
}

fn is_older_than(path: &Path, cutoff: DateTime<Utc>) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| DateTime::<Utc>::from(mtime) < cutoff)
        .unwrap_or(false)
}
