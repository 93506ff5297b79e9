//! Corpus de renseignement sur les menaces
//!
//! Chargé depuis `threat_intel/database.json` (IPs malveillantes, motifs de
//! menace) et `threat_intel/malicious_ips.txt` (une IP ou un CIDR par ligne,
//! commentaires `#`). Un rechargement échoué conserve le corpus précédent.

use log::info;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{FrelonError, Result};
use crate::models::Severity;

/// Ports suspects par défaut (telnet, SMB, RDP, portes dérobées connues)
pub static DEFAULT_SUSPICIOUS_PORTS: Lazy<HashSet<u16>> =
    Lazy::new(|| [23, 445, 3389, 4444, 5554, 9996].into_iter().collect());

/// Un motif de menace textuel du corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatPattern {
    pub name: String,
    pub indicators: Vec<String>,
    pub severity: Severity,
}

/// Forme sur disque de `database.json`
#[derive(Debug, Default, Serialize, Deserialize)]
struct ThreatDatabaseFile {
    #[serde(default)]
    malicious_ips: Vec<String>,
    #[serde(default)]
    threat_patterns: Vec<ThreatPattern>,
}

/// Plage CIDR précalculée pour une comparaison rapide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: u128,
    mask: u128,
    is_v4: bool,
}

impl CidrRange {
    /// Analyse `adresse/préfixe`
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let addr: IpAddr = addr.trim().parse().ok()?;
        let prefix: u32 = prefix.trim().parse().ok()?;
        let (bits, is_v4) = match addr {
            IpAddr::V4(v4) => (u32::from(v4) as u128, true),
            IpAddr::V6(v6) => (u128::from(v6), false),
        };
        let width: u32 = if is_v4 { 32 } else { 128 };
        if prefix > width {
            return None;
        }
        let mask = if prefix == 0 {
            0
        } else {
            (!0u128) << (width - prefix)
        };
        // En v4 le masque est limité aux 32 bits de poids faible
        let mask = if is_v4 { mask & (u32::MAX as u128) } else { mask };
        Some(Self {
            network: bits & mask,
            mask,
            is_v4,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let (bits, is_v4) = match ip {
            IpAddr::V4(v4) => (u32::from(*v4) as u128, true),
            IpAddr::V6(v6) => (u128::from(*v6), false),
        };
        is_v4 == self.is_v4 && bits & self.mask == self.network
    }
}

/// Corpus de renseignement chargé en mémoire
#[derive(Debug, Clone, Default)]
pub struct ThreatCorpus {
    malicious_ips: HashSet<IpAddr>,
    malicious_networks: Vec<CidrRange>,
    pub threat_patterns: Vec<ThreatPattern>,
    pub suspicious_ports: HashSet<u16>,
}

impl ThreatCorpus {
    /// Corpus vide ne portant que les ports suspects par défaut et les
    /// ajouts configurés
    pub fn empty(extra_ports: &[u16]) -> Self {
        ThreatCorpus {
            suspicious_ports: DEFAULT_SUSPICIOUS_PORTS
                .iter()
                .copied()
                .chain(extra_ports.iter().copied())
                .collect(),
            ..Default::default()
        }
    }

    /// Charge le corpus depuis le disque. Les fichiers absents donnent des
    /// sections vides; un fichier malformé est une erreur.
    pub fn load(db_path: &Path, ips_path: &Path, extra_ports: &[u16]) -> Result<Self> {
        let mut corpus = Self::empty(extra_ports);

        if db_path.exists() {
            let contents = fs::read_to_string(db_path).map_err(|e| FrelonError::Corpus {
                path: db_path.to_path_buf(),
                message: e.to_string(),
            })?;
            let db: ThreatDatabaseFile =
                serde_json::from_str(&contents).map_err(|e| FrelonError::Corpus {
                    path: db_path.to_path_buf(),
                    message: e.to_string(),
                })?;
            for entry in &db.malicious_ips {
                corpus.add_ip_entry(entry);
            }
            corpus.threat_patterns = db.threat_patterns;
        }

        if ips_path.exists() {
            let contents = fs::read_to_string(ips_path).map_err(|e| FrelonError::Corpus {
                path: ips_path.to_path_buf(),
                message: e.to_string(),
            })?;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                corpus.add_ip_entry(line);
            }
        }

        info!(
            "Corpus chargé: {} IP(s), {} plage(s), {} motif(s)",
            corpus.malicious_ips.len(),
            corpus.malicious_networks.len(),
            corpus.threat_patterns.len()
        );
        Ok(corpus)
    }

    /// Ajoute une entrée IP exacte ou CIDR
    fn add_ip_entry(&mut self, entry: &str) {
        if entry.contains('/') {
            if let Some(range) = CidrRange::parse(entry) {
                self.malicious_networks.push(range);
            }
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            self.malicious_ips.insert(ip);
        }
    }

    /// Correspondance exacte ou par plage CIDR
    pub fn matches_ip(&self, ip: &IpAddr) -> bool {
        self.malicious_ips.contains(ip)
            || self.malicious_networks.iter().any(|r| r.contains(ip))
    }

    pub fn is_suspicious_port(&self, port: u16) -> bool {
        self.suspicious_ports.contains(&port)
    }
}

/// Surveille les fichiers du corpus et ne recharge que si leur mtime a changé
pub struct CorpusWatcher {
    db_path: PathBuf,
    ips_path: PathBuf,
    extra_ports: Vec<u16>,
    last_mtimes: (Option<SystemTime>, Option<SystemTime>),
}

impl CorpusWatcher {
    pub fn new(db_path: PathBuf, ips_path: PathBuf, extra_ports: Vec<u16>) -> Self {
        let last_mtimes = (mtime(&db_path), mtime(&ips_path));
        Self {
            db_path,
            ips_path,
            extra_ports,
            last_mtimes,
        }
    }

    /// `None` si rien n'a changé (aucune alerte, mêmes évaluations);
    /// sinon le résultat du rechargement.
    pub fn check(&mut self) -> Option<Result<ThreatCorpus>> {
        let current = (mtime(&self.db_path), mtime(&self.ips_path));
        if current == self.last_mtimes {
            return None;
        }
        self.last_mtimes = current;
        Some(ThreatCorpus::load(
            &self.db_path,
            &self.ips_path,
            &self.extra_ports,
        ))
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plages_cidr() {
        let range = CidrRange::parse("203.0.113.0/24").unwrap();
        assert!(range.contains(&"203.0.113.5".parse().unwrap()));
        assert!(!range.contains(&"203.0.114.5".parse().unwrap()));
        // Famille différente: jamais de correspondance
        assert!(!range.contains(&"2001:db8::1".parse().unwrap()));

        let v6 = CidrRange::parse("2001:db8::/32").unwrap();
        assert!(v6.contains(&"2001:db8::1".parse().unwrap()));
        assert!(!v6.contains(&"2001:db9::1".parse().unwrap()));

        assert!(CidrRange::parse("203.0.113.0/33").is_none());
        assert!(CidrRange::parse("pas une ip/8").is_none());
    }

    #[test]
    fn chargement_du_corpus() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("database.json");
        let ips = dir.path().join("malicious_ips.txt");

        std::fs::write(
            &db,
            r#"{
                "malicious_ips": ["203.0.113.5", "198.51.100.0/24"],
                "threat_patterns": [
                    {"name": "c2-beacon", "indicators": ["evil.example"], "severity": "HIGH"}
                ]
            }"#,
        )
        .unwrap();
        std::fs::write(&ips, "# commentaire\n192.0.2.44\n10.99.0.0/16\n\n").unwrap();

        let corpus = ThreatCorpus::load(&db, &ips, &[8081]).unwrap();
        assert!(corpus.matches_ip(&"203.0.113.5".parse().unwrap()));
        assert!(corpus.matches_ip(&"198.51.100.77".parse().unwrap()));
        assert!(corpus.matches_ip(&"192.0.2.44".parse().unwrap()));
        assert!(corpus.matches_ip(&"10.99.3.4".parse().unwrap()));
        assert!(!corpus.matches_ip(&"1.1.1.1".parse().unwrap()));
        assert_eq!(corpus.threat_patterns.len(), 1);
        // Ports par défaut plus ajouts configurés
        assert!(corpus.is_suspicious_port(4444));
        assert!(corpus.is_suspicious_port(8081));
        assert!(!corpus.is_suspicious_port(443));
    }

    #[test]
    fn fichiers_absents_corpus_vide() {
        let dir = tempdir().unwrap();
        let corpus = ThreatCorpus::load(
            &dir.path().join("absent.json"),
            &dir.path().join("absent.txt"),
            &[],
        )
        .unwrap();
        assert!(!corpus.matches_ip(&"1.1.1.1".parse().unwrap()));
        assert!(corpus.threat_patterns.is_empty());
    }

    #[test]
    fn fichier_malforme_en_erreur() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("database.json");
        std::fs::write(&db, "{ cassé").unwrap();
        let err = ThreatCorpus::load(&db, &dir.path().join("x.txt"), &[]);
        assert!(err.is_err());
    }

    #[test]
    fn rechargement_sans_changement_est_neutre() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("database.json");
        let ips = dir.path().join("malicious_ips.txt");
        std::fs::write(&db, r#"{"malicious_ips": ["203.0.113.5"]}"#).unwrap();

        let mut watcher = CorpusWatcher::new(db.clone(), ips.clone(), vec![]);
        // Aucune modification: aucun rechargement
        assert!(watcher.check().is_none());

        // Toucher le fichier avec un mtime différent force un rechargement
        let contents = std::fs::read_to_string(&db).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&db, contents + "\n").unwrap();
        match watcher.check() {
            Some(Ok(corpus)) => assert!(corpus.matches_ip(&"203.0.113.5".parse().unwrap())),
            other => panic!("rechargement attendu, obtenu {:?}", other.map(|r| r.is_ok())),
        }
    }
}
