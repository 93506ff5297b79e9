//! Liste de blocage persistante
//!
//! Ensemble mutable et autoritaire des hôtes bloqués, appliqué par le
//! moniteur et persisté entre les redémarrages dans `blocklist.json`.

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FrelonError, Result};
use crate::models::truncate_to_millis;

/// Forme sur disque de la liste de blocage
#[derive(Debug, Serialize, Deserialize)]
struct BlocklistFile {
    hosts: Vec<String>,
    #[serde(with = "crate::models::ts_ms")]
    updated: DateTime<Utc>,
}

/// Ensemble des hôtes bloqués
#[derive(Debug)]
pub struct BlockList {
    hosts: HashSet<String>,
    path: PathBuf,
}

impl BlockList {
    /// Charge la liste depuis le fichier; une liste vide si le fichier
    /// n'existe pas encore
    pub fn load(path: &Path) -> Self {
        let hosts = match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<BlocklistFile>(&contents) {
                Ok(file) => {
                    info!("{} hôte(s) bloqué(s) chargé(s) depuis {}", file.hosts.len(), path.display());
                    file.hosts.into_iter().collect()
                }
                Err(e) => {
                    error!("Liste de blocage illisible ({}): {}", path.display(), e);
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        };

        Self {
            hosts,
            path: path.to_path_buf(),
        }
    }

    /// Sauvegarde la liste sur disque, triée pour des diffs stables
    pub fn save(&self) -> Result<()> {
        let mut hosts: Vec<String> = self.hosts.iter().cloned().collect();
        hosts.sort();

        let file = BlocklistFile {
            hosts,
            updated: truncate_to_millis(Utc::now()),
        };

        let json = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, json).map_err(|e| FrelonError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Bloque un hôte. Retourne vrai si l'ensemble a changé.
    pub fn block(&mut self, host: &str) -> bool {
        let inserted = self.hosts.insert(host.to_string());
        if inserted {
            info!("Hôte {} ajouté à la liste de blocage", host);
            if let Err(e) = self.save() {
                error!("Erreur lors de la sauvegarde de la liste de blocage: {}", e);
            }
        }
        inserted
    }

    /// Débloque un hôte. Retourne vrai si l'ensemble a changé.
    pub fn unblock(&mut self, host: &str) -> bool {
        let removed = self.hosts.remove(host);
        if removed {
            info!("Hôte {} retiré de la liste de blocage", host);
            if let Err(e) = self.save() {
                error!("Erreur lors de la sauvegarde de la liste de blocage: {}", e);
            }
        }
        removed
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Copie de l'ensemble, pour évaluation hors verrou
    pub fn snapshot(&self) -> HashSet<String> {
        self.hosts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn blocage_puis_deblocage_revient_a_l_etat_initial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocklist.json");

        let mut list = BlockList::load(&path);
        let before = list.snapshot();

        assert!(list.block("5.6.7.8"));
        assert!(list.contains("5.6.7.8"));
        // Re-bloquer le même hôte ne change rien
        assert!(!list.block("5.6.7.8"));

        assert!(list.unblock("5.6.7.8"));
        assert_eq!(list.snapshot(), before);
    }

    #[test]
    fn persistance_entre_rechargements() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocklist.json");

        {
            let mut list = BlockList::load(&path);
            list.block("203.0.113.5");
            list.block("198.51.100.7");
        }

        let reloaded = BlockList::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("203.0.113.5"));
        assert!(reloaded.contains("198.51.100.7"));
    }

    #[test]
    fn fichier_corrompu_donne_liste_vide() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocklist.json");
        std::fs::write(&path, "pas du json").unwrap();
        let list = BlockList::load(&path);
        assert!(list.is_empty());
    }
}
