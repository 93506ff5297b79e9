use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use log::{error, info};

use crate::cli::Cli;
use crate::error::{FrelonError, Result};

/// Chemin par défaut du fichier de configuration
pub const CONFIG_FILE: &str = "./config.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Adresse d'écoute du serveur de diffusion
    pub host: String,

    /// Port d'écoute du serveur de diffusion
    pub port: u16,

    /// Répertoire des données persistées (corpus, liste de blocage, alertes, exports)
    pub data_dir: PathBuf,

    /// Certificat TLS optionnel (la terminaison TLS est déléguée à une
    /// enveloppe externe)
    pub cert: Option<PathBuf>,

    /// Clé privée TLS optionnelle
    pub key: Option<PathBuf>,

    /// Niveau de log
    pub log_level: String,

    /// Cadence du balayage des connexions (en secondes)
    pub scan_interval: u64,

    /// Cadence de l'échantillonnage des métriques système (en secondes)
    pub metrics_interval: u64,

    /// Cadence de vérification du corpus de renseignement (en secondes)
    pub corpus_reload_interval: u64,

    /// Taille maximale d'une trame cliente (en octets)
    pub max_message_size: usize,

    /// Racines de chemins considérées légitimes pour les binaires attribués
    pub allow_roots: Vec<String>,

    /// Ports suspects ajoutés à la liste par défaut
    pub extra_suspicious_ports: Vec<u16>,

    /// Ports considérés chiffrés, en plus de la liste par défaut
    pub extra_encrypted_ports: Vec<u16>,

    /// Rétention des exports (en jours)
    pub retention_days: u32,

    /// Intervalle entre deux exports automatiques (en secondes)
    pub export_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8765,
            data_dir: PathBuf::from("./data"),
            cert: None,
            key: None,
            log_level: "info".to_string(),
            scan_interval: 2,
            metrics_interval: 1,
            corpus_reload_interval: 60,
            max_message_size: 1024 * 1024,
            allow_roots: vec![
                "/usr/bin".to_string(),
                "/usr/sbin".to_string(),
                "/usr/local/bin".to_string(),
                "/usr/lib".to_string(),
                "/bin".to_string(),
                "/sbin".to_string(),
                "/opt".to_string(),
            ],
            extra_suspicious_ports: Vec::new(),
            extra_encrypted_ports: Vec::new(),
            retention_days: 30,
            export_interval: 3600,
        }
    }
}

impl Config {
    /// Charge la configuration depuis le fichier. Si le fichier n'existe pas,
    /// la configuration par défaut est créée à cet emplacement.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let contents = fs::read_to_string(path).map_err(|e| FrelonError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config =
            serde_json::from_str(&contents).map_err(|e| FrelonError::Config {
                message: format!("fichier {} malformé: {}", path.display(), e),
            })?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans le fichier
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!(
                    "Erreur lors de la création du répertoire de configuration {:?}: {}",
                    parent, e
                );
                return Err(FrelonError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                });
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| FrelonError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Crée la configuration par défaut
    fn create_default_config(path: &Path) -> Result<()> {
        let default_config = Config::default();
        default_config.save(path)?;
        info!("Configuration par défaut créée dans {}", path.display());
        Ok(())
    }

    /// Applique les options de la ligne de commande par-dessus le fichier
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(data_dir) = &cli.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(cert) = &cli.cert {
            self.cert = Some(cert.clone());
        }
        if let Some(key) = &cli.key {
            self.key = Some(key.clone());
        }
        if cli.verbose {
            self.log_level = "debug".to_string();
        }
    }

    /// Vérifie la cohérence de la configuration. Les fichiers TLS déclarés
    /// doivent exister; cert et clé vont par paire.
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval == 0 {
            return Err(FrelonError::Config {
                message: "scan_interval doit être strictement positif".to_string(),
            });
        }
        match (&self.cert, &self.key) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(FrelonError::Config {
                    message: "cert et key doivent être fournis ensemble".to_string(),
                });
            }
            (Some(cert), Some(key)) => {
                for file in [cert, key] {
                    if !file.exists() {
                        return Err(FrelonError::Config {
                            message: format!("fichier TLS introuvable: {}", file.display()),
                        });
                    }
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    // Chemins dérivés du répertoire de données

    pub fn threat_intel_dir(&self) -> PathBuf {
        self.data_dir.join("threat_intel")
    }

    pub fn threat_db_path(&self) -> PathBuf {
        self.threat_intel_dir().join("database.json")
    }

    pub fn malicious_ips_path(&self) -> PathBuf {
        self.threat_intel_dir().join("malicious_ips.txt")
    }

    pub fn blocklist_path(&self) -> PathBuf {
        self.data_dir.join("blocklist.json")
    }

    pub fn alerts_dir(&self) -> PathBuf {
        self.data_dir.join("alerts")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    /// Crée l'arborescence des données au démarrage
    pub fn setup_directories(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.threat_intel_dir(),
            self.alerts_dir(),
            self.exports_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| FrelonError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creation_puis_rechargement() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        // Premier chargement: le fichier par défaut est créé
        let config = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.port, 8765);
        assert_eq!(config.scan_interval, 2);

        // Rechargement: mêmes valeurs
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.host, config.host);
        assert_eq!(reloaded.retention_days, 30);
    }

    #[test]
    fn fichier_malforme_rejete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ pas du json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn tls_incomplet_rejete() {
        let mut config = Config::default();
        config.cert = Some(PathBuf::from("/tmp/quelconque.crt"));
        assert!(config.validate().is_err());
    }
}
